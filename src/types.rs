//! Core event and alert types
//!
//! An `EventRecord` is one observation from the mobility-assistance client.
//! Event tags form an open but conceptually closed vocabulary grouped into
//! navigation, obstacle, and accident classes; the helpers here centralize
//! that classification so detectors and aggregation agree on it.

use crate::error::MonitorError;
use serde::{Deserialize, Serialize};

/// Obstacle-class tags: something is in the path.
pub const OBSTACLE_TAGS: [&str; 3] = ["obstacle_center", "obstacle_close", "collision_warning"];

/// Accident-class tags: any one of these fires the accident detector
/// unconditionally.
pub const ACCIDENT_TAGS: [&str; 4] = ["fall", "impact", "collision", "device_drop"];

pub fn is_clear_tag(tag: &str) -> bool {
    tag.eq_ignore_ascii_case("proceed") || tag.eq_ignore_ascii_case("clear")
}

pub fn is_stop_tag(tag: &str) -> bool {
    tag.eq_ignore_ascii_case("stop")
}

pub fn is_obstacle_tag(tag: &str) -> bool {
    OBSTACLE_TAGS.iter().any(|t| tag.eq_ignore_ascii_case(t))
}

pub fn is_accident_tag(tag: &str) -> bool {
    ACCIDENT_TAGS.iter().any(|t| tag.eq_ignore_ascii_case(t))
}

/// Veer tags carry a direction and an optional magnitude suffix
/// (e.g. `veer_left_15`), so this is a prefix match.
pub fn veer_direction(tag: &str) -> Option<VeerDirection> {
    let lower = tag.to_ascii_lowercase();
    if lower.starts_with("veer_left") {
        Some(VeerDirection::Left)
    } else if lower.starts_with("veer_right") {
        Some(VeerDirection::Right)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VeerDirection {
    Left,
    Right,
}

/// One client observation.
///
/// Timestamps are Unix seconds and are NOT guaranteed monotonic across
/// records (network reordering); consumers sort where order matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub client_id: String,
    pub session_id: String,
    pub timestamp: i64,
    pub events: Vec<String>,
    #[serde(default)]
    pub detected_classes: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub free_ahead_m: Option<f64>,
}

impl EventRecord {
    /// Reject malformed records before they reach detectors or aggregation.
    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.client_id.is_empty() {
            return Err(MonitorError::validation("empty client_id"));
        }
        if self.session_id.is_empty() {
            return Err(MonitorError::validation("empty session_id"));
        }
        if self.events.is_empty() {
            return Err(MonitorError::validation("record carries no events"));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(MonitorError::validation(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if let Some(depth) = self.free_ahead_m {
            if depth < 0.0 || !depth.is_finite() {
                return Err(MonitorError::validation(format!(
                    "free_ahead_m {} is not a non-negative distance",
                    depth
                )));
            }
        }
        Ok(())
    }

    pub fn has_clear_tag(&self) -> bool {
        self.events.iter().any(|e| is_clear_tag(e))
    }

    pub fn has_stop_tag(&self) -> bool {
        self.events.iter().any(|e| is_stop_tag(e))
    }

    pub fn has_obstacle_tag(&self) -> bool {
        self.events.iter().any(|e| is_obstacle_tag(e))
    }

    pub fn accident_tags(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter(|e| is_accident_tag(e))
            .map(|e| e.as_str())
            .collect()
    }

    /// First veer tag on the record, if any.
    pub fn veer_direction(&self) -> Option<VeerDirection> {
        self.events.iter().find_map(|e| veer_direction(e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Stuck,
    DangerSurge,
    Inactivity,
    Maneuvering,
    Accident,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Stuck => "stuck",
            AlertType::DangerSurge => "danger_surge",
            AlertType::Inactivity => "inactivity",
            AlertType::Maneuvering => "maneuvering",
            AlertType::Accident => "accident",
        }
    }

    pub fn all() -> [AlertType; 5] {
        [
            AlertType::Stuck,
            AlertType::DangerSurge,
            AlertType::Inactivity,
            AlertType::Maneuvering,
            AlertType::Accident,
        ]
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write-once record of an emitted notification intent. Persistence and
/// delivery belong to external collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: AlertType,
    pub client_id: String,
    pub timestamp: i64,
    pub rationale: String,
    pub payload: serde_json::Value,
}
