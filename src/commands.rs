use log::{error, info};
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};

use crate::protocol::Command;

/// Commands waiting to be processed by the supervisor loop.
pub const COMMAND_QUEUE_CAPACITY: usize = 4;

/// Producer side of the command queue. Cloned into the MQTT handler.
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<Command>,
}

pub struct CommandReceiver {
    rx: Receiver<Command>,
}

pub fn command_queue(capacity: usize) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (CommandSender { tx }, CommandReceiver { rx })
}

impl CommandSender {
    /// Enqueues a command without blocking. A full queue drops the command.
    pub fn push(&self, command: Command) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => {
                info!("Received command: {}", command);
                true
            }
            Err(TrySendError::Full(_)) => {
                error!("Command {} IGNORED. Queue is full.", command);
                false
            }
            Err(TrySendError::Closed(_)) => {
                error!("Command {} IGNORED. Queue is closed.", command);
                false
            }
        }
    }
}

impl CommandReceiver {
    pub fn try_next(&mut self) -> Option<Command> {
        self.rx.try_recv().ok()
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}
