use std::fs;
use std::path::Path;

use chrono::TimeDelta;

use crate::config::MaskcamSection;

pub const ADDRESS_UNKNOWN_LABEL: &str = "<device-address-not-configured>";

/// The address other hosts use to reach this device, if configured.
pub fn device_address(section: &MaskcamSection) -> Option<&str> {
    let address = section.device_address.trim();
    if address.is_empty() || address == "0" {
        None
    } else {
        Some(address)
    }
}

pub fn device_address_or_label(section: &MaskcamSection) -> &str {
    device_address(section).unwrap_or(ADDRESS_UNKNOWN_LABEL)
}

pub fn streaming_address(host: &str, rtsp_port: u16, rtsp_path: &str) -> String {
    format!("rtsp://{}:{}{}", host, rtsp_port, rtsp_path)
}

/// Formats an elapsed time as `H:MM:SS`, prefixed by days when needed.
pub fn format_elapsed(elapsed: Option<TimeDelta>) -> String {
    let Some(elapsed) = elapsed else {
        return "N/A".to_string();
    };
    let total = elapsed.num_seconds().max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    let clock = format!("{}:{:02}:{:02}", hours, minutes, seconds);
    match days {
        0 => clock,
        1 => format!("1 day, {}", clock),
        n => format!("{} days, {}", n, clock),
    }
}

/// Sorted names of the files stored in `dir`. A missing directory means no
/// file was saved yet.
pub fn list_saved_files(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}
