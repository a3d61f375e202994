use log::info;

use crate::config::MaskcamSection;
use crate::protocol::Statistics;

/// Crowd limits that turn a statistics report into an alert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    pub max_total_people: u32,
    pub min_visible_people: u32,
    pub max_no_mask_fraction: f64,
}

impl From<&MaskcamSection> for AlertThresholds {
    fn from(section: &MaskcamSection) -> Self {
        Self {
            max_total_people: section.alert_max_total_people,
            min_visible_people: section.alert_min_visible_people,
            max_no_mask_fraction: section.alert_no_mask_fraction,
        }
    }
}

impl AlertThresholds {
    /// Too many people overall, or too many of the visible ones without a
    /// mask once enough of them are visible.
    pub fn is_alert(&self, statistics: &Statistics) -> bool {
        let visible = statistics.visible_people();
        let alert = if statistics.people_total > self.max_total_people {
            true
        } else if visible > 0 && visible >= self.min_visible_people {
            let no_mask_fraction = statistics.people_without_mask as f64 / visible as f64;
            no_mask_fraction > self.max_no_mask_fraction
        } else {
            false
        };
        info!("ALERT condition: {}", alert);
        alert
    }
}
