//! MQTT topics and JSON payloads exchanged with the backend.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

pub const TOPIC_HELLO: &str = "hello";
pub const TOPIC_DEVICE_STATUS: &str = "device-status";
pub const TOPIC_STATISTICS: &str = "receive-from-jetson";
pub const TOPIC_ALERTS: &str = "alerts";
pub const TOPIC_FILES: &str = "video-files";
pub const TOPIC_COMMANDS: &str = "commands";

pub const ALL_TOPICS: [&str; 6] = [
    TOPIC_HELLO,
    TOPIC_DEVICE_STATUS,
    TOPIC_STATISTICS,
    TOPIC_ALERTS,
    TOPIC_FILES,
    TOPIC_COMMANDS,
];

/// Remote commands accepted on the `commands` topic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, EnumIter, Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Command {
    SaveFile,
    StreamingStart,
    StreamingStop,
    InferenceRestart,
    FileserverRestart,
    StatusRequest,
}

/// Payload received on the `commands` topic. The command is kept as a raw
/// string so that unknown commands can be reported instead of failing to
/// parse the whole message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandMessage {
    pub device_id: String,
    pub command: String,
}

/// People counts reported by the inference worker every statistics period.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Statistics {
    pub people_total: u32,
    pub people_with_mask: u32,
    pub people_without_mask: u32,
    /// Seconds since the UNIX epoch (UTC).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl Statistics {
    /// People whose mask status could be classified.
    pub fn visible_people(&self) -> u32 {
        self.people_with_mask + self.people_without_mask
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatisticsReport<'a> {
    pub device_id: &'a str,
    #[serde(flatten)]
    pub statistics: Statistics,
}

#[derive(Debug, Clone, Serialize)]
pub struct Hello<'a> {
    pub device_id: &'a str,
    pub description: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus<'a> {
    pub device_id: &'a str,
    pub inference_runtime: String,
    pub fileserver_runtime: String,
    pub streaming_address: String,
    pub device_address: Option<String>,
    /// `"<kept>/<total>"` over the recordings in progress.
    pub save_current_files: String,
    pub time: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileList<'a> {
    pub device_id: &'a str,
    pub file_server: String,
    pub file_list: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strum::IntoEnumIterator;

    #[test]
    fn test_command_names() {
        let names: Vec<String> = Command::iter().map(|c| c.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "save_file",
                "streaming_start",
                "streaming_stop",
                "inference_restart",
                "fileserver_restart",
                "status_request",
            ]
        );
        assert_eq!(
            "fileserver_restart".parse::<Command>().unwrap(),
            Command::FileserverRestart
        );
        assert!("reboot".parse::<Command>().is_err());
    }

    #[test]
    fn test_statistics_report_is_flat() {
        let report = StatisticsReport {
            device_id: "cam-1",
            statistics: Statistics {
                people_total: 4,
                people_with_mask: 2,
                people_without_mask: 1,
                timestamp: Some(1600000000.5),
            },
        };
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({
                "device_id": "cam-1",
                "people_total": 4,
                "people_with_mask": 2,
                "people_without_mask": 1,
                "timestamp": 1600000000.5,
            })
        );
    }

    #[test]
    fn test_command_message_parses() {
        let message: CommandMessage =
            serde_json::from_str(r#"{"device_id": "cam-1", "command": "save_file"}"#).unwrap();
        assert_eq!(message.device_id, "cam-1");
        assert_eq!(message.command.parse::<Command>().unwrap(), Command::SaveFile);
    }

    #[test]
    fn test_device_status_unknown_address_is_null() {
        let status = DeviceStatus {
            device_id: "cam-1",
            inference_runtime: "0:01:02".to_string(),
            fileserver_runtime: "N/A".to_string(),
            streaming_address: "N/A".to_string(),
            device_address: None,
            save_current_files: "1/2".to_string(),
            time: "12:00:00".to_string(),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert!(value["device_address"].is_null());
        assert_eq!(value["save_current_files"], "1/2");
    }
}
