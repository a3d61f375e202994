//! Thin MQTT client wrapper.
//!
//! `rumqttc` takes care of reconnecting; on top of it this module
//! re-subscribes after every connection, and keeps messages that could not be
//! published in a small retry queue that is flushed as soon as the broker is
//! reachable again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
};
use serde::Serialize;
use tokio::sync::mpsc::{self, Receiver, Sender};

/// Messages kept for later delivery while the broker is unreachable.
pub const RETRY_QUEUE_CAPACITY: usize = 100;

const EVENTS_CAPACITY: usize = 32;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Bounded FIFO where the oldest message makes room for the newest.
#[derive(Debug)]
pub struct RetryQueue {
    items: VecDeque<PendingMessage>,
    capacity: usize,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns the message evicted to make room, if any.
    pub fn push(&mut self, message: PendingMessage) -> Option<PendingMessage> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(message);
        evicted
    }

    pub fn pop(&mut self) -> Option<PendingMessage> {
        self.items.pop_front()
    }

    /// Puts back a message that failed again, keeping its turn.
    pub fn restore(&mut self, message: PendingMessage) {
        if self.items.len() < self.capacity {
            self.items.push_front(message);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// What to do with a message that cannot be published right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Keep it in the retry queue.
    Enqueue,
    /// Only the latest value matters; drop it.
    Discard,
}

/// Notifications from the MQTT event loop.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected,
    Message { topic: String, payload: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub client_id: String,
    pub broker_ip: String,
    pub broker_port: u16,
    pub subscribe_to: Vec<String>,
}

#[derive(Clone)]
pub struct MqttLink {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    pending: Arc<Mutex<RetryQueue>>,
}

impl MqttLink {
    /// Connects in the background. Connection events and messages received
    /// on the subscribed topics arrive through the returned receiver.
    pub fn connect(settings: MqttSettings) -> (MqttLink, Receiver<LinkEvent>) {
        info!(
            "Connecting to MQTT server {}:{}",
            settings.broker_ip, settings.broker_port
        );
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.broker_ip.clone(),
            settings.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        let (client, eventloop) = AsyncClient::new(options, 64);

        let link = MqttLink {
            client,
            connected: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(Mutex::new(RetryQueue::new(RETRY_QUEUE_CAPACITY))),
        };
        let (tx, rx) = mpsc::channel(EVENTS_CAPACITY);
        tokio::spawn(link.clone().drive(eventloop, settings.subscribe_to, tx));
        (link, rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.pending.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    /// Publishes `message` as JSON after flushing older pending messages.
    /// Returns whether it was handed to the client.
    pub fn send<T: Serialize>(&self, topic: &str, message: &T, delivery: Delivery) -> bool {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("{} | Failed to encode MQTT message: {}", topic, e);
                return false;
            }
        };
        self.flush_pending();

        if self.publish(topic, payload.clone()) {
            info!("{} | MQTT message SENT", topic);
            debug!("{}", String::from_utf8_lossy(&payload));
            return true;
        }
        match delivery {
            Delivery::Enqueue => self.enqueue(PendingMessage {
                topic: topic.to_string(),
                payload,
            }),
            Delivery::Discard => warn!("{} | MQTT message DISCARDED", topic),
        }
        false
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> bool {
        self.is_connected()
            && self
                .client
                .try_publish(topic, QoS::AtMostOnce, false, payload)
                .is_ok()
    }

    fn enqueue(&self, message: PendingMessage) {
        let Ok(mut queue) = self.pending.lock() else {
            return;
        };
        info!("{} | MQTT message ENQUEUED", message.topic);
        if let Some(dropped) = queue.push(message) {
            error!("{} | MQTT message DROPPED: FULL QUEUE", dropped.topic);
        }
    }

    /// Sends queued messages in order until one fails.
    pub fn flush_pending(&self) -> bool {
        let Ok(mut queue) = self.pending.lock() else {
            return false;
        };
        while let Some(message) = queue.pop() {
            info!("Sending enqueued message to topic: {}", message.topic);
            if !self.publish(&message.topic, message.payload.clone()) {
                queue.restore(message);
                return false;
            }
        }
        true
    }

    async fn drive(self, mut eventloop: EventLoop, subscribe_to: Vec<String>, tx: Sender<LinkEvent>) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        warn!("Failed to connect to MQTT, return code {:?}", ack.code);
                        continue;
                    }
                    info!("Connected to MQTT Broker");
                    self.connected.store(true, Ordering::SeqCst);
                    for topic in &subscribe_to {
                        info!("Subscribing to topic: {}", topic);
                        if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::ExactlyOnce) {
                            error!("Failed to subscribe to {}: {}", topic, e);
                        }
                    }
                    if tx.try_send(LinkEvent::Connected).is_err() {
                        warn!("MQTT connection event dropped");
                    }
                    if !self.flush_pending() {
                        warn!("Failed to send MQTT message queue after connecting");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let event = LinkEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if tx.try_send(event).is_err() {
                        warn!("Incoming MQTT message dropped");
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    info!("Disconnected from MQTT Broker");
                }
                Ok(_) => {}
                Err(e) => {
                    if self.connected.swap(false, Ordering::SeqCst) {
                        warn!("Disconnected from MQTT Broker: {}", e);
                    } else {
                        debug!("MQTT connection failed: {}", e);
                    }
                    if tx.is_closed() {
                        break;
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: usize) -> PendingMessage {
        PendingMessage {
            topic: format!("topic-{}", n),
            payload: vec![n as u8],
        }
    }

    #[test]
    fn test_retry_queue_drops_oldest() {
        let mut queue = RetryQueue::new(RETRY_QUEUE_CAPACITY);
        for n in 0..RETRY_QUEUE_CAPACITY {
            assert!(queue.push(message(n)).is_none());
        }
        let evicted = queue.push(message(RETRY_QUEUE_CAPACITY)).unwrap();

        assert_eq!(evicted, message(0));
        assert_eq!(queue.len(), RETRY_QUEUE_CAPACITY);
        assert_eq!(queue.pop(), Some(message(1)));
    }

    #[test]
    fn test_restore_keeps_order() {
        let mut queue = RetryQueue::new(3);
        queue.push(message(1));
        queue.push(message(2));
        let first = queue.pop().unwrap();
        queue.restore(first);

        assert_eq!(queue.pop(), Some(message(1)));
        assert_eq!(queue.pop(), Some(message(2)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        // Nothing listens on this port; the link never connects.
        let (link, _events) = MqttLink::connect(MqttSettings {
            client_id: "test".to_string(),
            broker_ip: "127.0.0.1".to_string(),
            broker_port: 1,
            subscribe_to: vec![],
        });

        let payload = serde_json::json!({"device_id": "cam-1"});
        assert!(!link.send("alerts", &payload, Delivery::Enqueue));
        assert!(!link.send("device-status", &payload, Delivery::Discard));
        assert_eq!(link.pending(), 1);

        for _ in 0..(RETRY_QUEUE_CAPACITY + 10) {
            link.send("receive-from-jetson", &payload, Delivery::Enqueue);
        }
        assert_eq!(link.pending(), RETRY_QUEUE_CAPACITY);
    }
}
