use std::path::PathBuf;

use config::{Config, ConfigError, File, FileFormat};
use log::info;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub const DEFAULT_CONFIG_PATH: &str = "maskcam_config.ini";

/// Environment variables that take precedence over the configuration file,
/// as `(variable, section.key)` pairs.
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("MASKCAM_INPUT", "maskcam.default-input"),
    ("MASKCAM_DEVICE_ADDRESS", "maskcam.device-address"),
    ("MASKCAM_ALERT_MIN_VISIBLE_PEOPLE", "maskcam.alert-min-visible-people"),
    ("MASKCAM_ALERT_MAX_TOTAL_PEOPLE", "maskcam.alert-max-total-people"),
    ("MASKCAM_ALERT_NO_MASK_FRACTION", "maskcam.alert-no-mask-fraction"),
    ("MASKCAM_STATISTICS_PERIOD", "maskcam.statistics-period"),
    ("MASKCAM_TIMEOUT_INFERENCE_RESTART", "maskcam.timeout-inference-restart"),
    ("MASKCAM_INFERENCE_COMMAND", "maskcam.inference-command"),
    ("MASKCAM_STREAMING_START_DEFAULT", "maskcam.streaming-start-default"),
    ("MASKCAM_STREAMING_PORT", "maskcam.streaming-port"),
    ("MASKCAM_FILESERVER_ENABLED", "maskcam.fileserver-enabled"),
    ("MASKCAM_FILESERVER_FORCE_SAVE", "maskcam.fileserver-force-save"),
    ("MASKCAM_FILESERVER_VIDEO_PERIOD", "maskcam.fileserver-video-period"),
    ("MASKCAM_FILESERVER_VIDEO_DURATION", "maskcam.fileserver-video-duration"),
    ("MASKCAM_FILESERVER_HDD_DIR", "maskcam.fileserver-hdd-dir"),
    ("MQTT_BROKER_IP", "mqtt.mqtt-broker-ip"),
    ("MQTT_BROKER_PORT", "mqtt.mqtt-broker-port"),
    ("MQTT_DEVICE_NAME", "mqtt.mqtt-device-name"),
    ("MQTT_DEVICE_DESCRIPTION", "mqtt.mqtt-device-description"),
];

/// Video codec carried over RTP between the inference pipeline and the
/// streaming and file-save workers.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Codec {
    Mp4,
    H264,
    H265,
}

impl Codec {
    /// RTP `encoding-name` used in caps for this codec.
    pub fn encoding_name(self) -> &'static str {
        match self {
            Codec::Mp4 => "MP4V-ES",
            Codec::H264 => "H264",
            Codec::H265 => "H265",
        }
    }

    /// RTP depayloader and parser element names.
    pub fn depay_elements(self) -> (&'static str, &'static str) {
        match self {
            Codec::Mp4 => ("rtpmp4vdepay", "mpeg4videoparse"),
            Codec::H264 => ("rtph264depay", "h264parse"),
            Codec::H265 => ("rtph265depay", "h265parse"),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", default)]
pub struct MaskcamSection {
    pub default_input: String,
    pub device_address: String,
    pub inference_command: String,
    pub codec: Codec,
    pub streaming_clock_rate: u32,
    pub udp_port_streaming: u16,
    pub udp_ports_filesave: String,
    pub streaming_start_default: bool,
    pub streaming_port: u16,
    pub streaming_path: String,
    pub statistics_period: u64,
    pub timeout_inference_restart: u64,
    pub alert_max_total_people: u32,
    pub alert_min_visible_people: u32,
    pub alert_no_mask_fraction: f64,
    pub fileserver_enabled: bool,
    pub fileserver_port: u16,
    pub fileserver_force_save: bool,
    pub fileserver_video_period: u64,
    pub fileserver_video_duration: u64,
    pub fileserver_ram_dir: PathBuf,
    pub fileserver_hdd_dir: PathBuf,
}

impl Default for MaskcamSection {
    fn default() -> Self {
        Self {
            default_input: "v4l2:///dev/video0".to_string(),
            device_address: "0".to_string(),
            inference_command: "maskcam-inference".to_string(),
            codec: Codec::H265,
            streaming_clock_rate: 90000,
            udp_port_streaming: 5400,
            udp_ports_filesave: "5401,5402,5403,5404,5405".to_string(),
            streaming_start_default: false,
            streaming_port: 8554,
            streaming_path: "/maskcam".to_string(),
            statistics_period: 15,
            timeout_inference_restart: 0,
            alert_max_total_people: 10,
            alert_min_visible_people: 3,
            alert_no_mask_fraction: 0.25,
            fileserver_enabled: true,
            fileserver_port: 8080,
            fileserver_force_save: false,
            fileserver_video_period: 30,
            fileserver_video_duration: 40,
            fileserver_ram_dir: PathBuf::from("/dev/shm"),
            fileserver_hdd_dir: PathBuf::from("/tmp/saved_videos"),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", default)]
pub struct MqttSection {
    pub mqtt_broker_ip: String,
    pub mqtt_broker_port: u16,
    pub mqtt_device_name: String,
    pub mqtt_device_description: String,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            mqtt_broker_ip: "0".to_string(),
            mqtt_broker_port: 1883,
            mqtt_device_name: "0".to_string(),
            mqtt_device_description: "MaskCam device".to_string(),
        }
    }
}

impl MqttSection {
    pub fn broker_ip(&self) -> Option<&str> {
        configured(&self.mqtt_broker_ip)
    }

    pub fn device_name(&self) -> Option<&str> {
        configured(&self.mqtt_device_name)
    }
}

/// Empty values and `"0"` mean "not configured".
fn configured(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.is_empty() || value == "0" {
        None
    } else {
        Some(value)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Configuration {
    pub maskcam: MaskcamSection,
    pub mqtt: MqttSection,
}

/// Parses the configuration file into the `Configuration` struct,
/// applying the environment overrides listed in `ENV_OVERRIDES`.
pub fn parse_configuration(file_path: &str) -> Result<Configuration, ConfigError> {
    parse_configuration_with(file_path, |name| std::env::var(name).ok())
}

/// Same as `parse_configuration`, with an explicit lookup for overrides.
pub fn parse_configuration_with<F>(file_path: &str, lookup: F) -> Result<Configuration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut builder =
        Config::builder().add_source(File::new(file_path, FileFormat::Ini).required(false));
    for (env_var, key) in ENV_OVERRIDES {
        builder = builder.set_override_option(*key, lookup(env_var))?;
    }
    builder.build()?.try_deserialize::<Configuration>()
}

/// Logs every environment override currently in effect, to avoid confusion
/// between the file contents and the running configuration.
pub fn log_overrides() {
    for (env_var, _) in ENV_OVERRIDES {
        if let Ok(value) = std::env::var(env_var) {
            info!("Config override {}={}", env_var, value);
        }
    }
}
