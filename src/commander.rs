//! Interactive console to watch device topics and send commands to a device.

use std::io::Write;

use log::{info, warn};
use strum::IntoEnumIterator;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::config::Configuration;
use crate::error::Result;
use crate::mqtt::{Delivery, LinkEvent, MqttLink, MqttSettings};
use crate::protocol::{ALL_TOPICS, Command, CommandMessage, TOPIC_COMMANDS};

const COMMANDER_CLIENT_ID: &str = "commander";

pub async fn run(configuration: &Configuration) -> Result<()> {
    let (Some(broker_ip), Some(device_name)) = (
        configuration.mqtt.broker_ip(),
        configuration.mqtt.device_name(),
    ) else {
        warn!("MQTT is DISABLED since MQTT_BROKER_IP or MQTT_DEVICE_NAME are not defined");
        return Ok(());
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    println!("\nAvailable topics:");
    for topic in ALL_TOPICS {
        println!("{}", topic);
    }
    let mut subscribe_to = Vec::new();
    while let Some(topic) = prompt(&mut stdin, "\nSubscribe to topic (empty to continue): ").await? {
        if topic.is_empty() {
            break;
        }
        subscribe_to.push(topic);
    }

    let (link, mut events) = MqttLink::connect(MqttSettings {
        client_id: COMMANDER_CLIENT_ID.to_string(),
        broker_ip: broker_ip.to_string(),
        broker_port: configuration.mqtt.mqtt_broker_port,
        subscribe_to,
    });
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let LinkEvent::Message { topic, payload } = event {
                println!("Message received in topic: {}", topic);
                println!("{}", String::from_utf8_lossy(&payload));
            }
        }
    });

    println!("\nAvailable commands:");
    for command in Command::iter() {
        println!("{}", command);
    }
    while let Some(command) = prompt(&mut stdin, "\nSend command to device (q to exit):\n").await? {
        if command == "q" {
            break;
        }
        if command.parse::<Command>().is_err() {
            warn!("Unknown command {}, sending anyway", command);
        }
        let message = CommandMessage {
            device_id: device_name.to_string(),
            command,
        };
        link.send(TOPIC_COMMANDS, &message, Delivery::Enqueue);
    }
    info!("Commander exiting");
    Ok(())
}

async fn prompt(lines: &mut Lines<BufReader<Stdin>>, text: &str) -> Result<Option<String>> {
    print!("{}", text);
    std::io::stdout().flush()?;
    Ok(lines.next_line().await?.map(|line| line.trim().to_string()))
}
