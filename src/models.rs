// models.rs
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// Canonical sort colors. Inbound labels are mapped onto this set by
/// [`crate::colors::ColorTable`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
pub enum Color {
    Red,
    Green,
    Blue,
    Yellow,
}

impl Color {
    pub const ALL: [Color; 4] = [Color::Red, Color::Green, Color::Blue, Color::Yellow];

    pub fn as_str(self) -> &'static str {
        match self {
            Color::Red => "Red",
            Color::Green => "Green",
            Color::Blue => "Blue",
            Color::Yellow => "Yellow",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub enum DeviceStatus {
    Idle,
    Running,
    Moving,
    Emergency,
    #[default]
    Unknown,
}

impl DeviceStatus {
    /// Case-insensitive label lookup (`"EMERGENCY"` and `"Emergency"` are equal).
    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim();
        [
            Self::Idle,
            Self::Running,
            Self::Moving,
            Self::Emergency,
            Self::Unknown,
        ]
        .into_iter()
        .find(|status| status.as_str().eq_ignore_ascii_case(label))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Running => "Running",
            Self::Moving => "Moving",
            Self::Emergency => "Emergency",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether a status reported by the device may replace `self`.
    ///
    /// Emergency is latched: only `Idle` (a reset) leaves it, and only once
    /// the device has confirmed the emergency (tracked by
    /// [`crate::devices::DobotState`]). `Unknown` never overwrites a known
    /// status.
    pub fn accepts_device_report(self, next: Self) -> bool {
        match (self, next) {
            (_, Self::Unknown) => false,
            (Self::Emergency, Self::Idle | Self::Emergency) => true,
            (Self::Emergency, _) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub r: f64,
    pub gripper: bool,
    pub conveyor_speed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Task {
    pub id: String,
    pub color: Color,
    pub target: String,
    /// Set while the task only exists because a viewer asked for it and the
    /// device has not acknowledged it yet.
    #[serde(default)]
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HistoryEntry {
    pub id: String,
    pub color: Color,
    pub target: String,
    pub timestamp: String,
}

/// Last known state of the arm. Always total: partial device messages are
/// merged into it field by field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct DeviceState {
    pub status: DeviceStatus,
    pub telemetry: Telemetry,
    #[schema(value_type = Object)]
    pub counters: BTreeMap<Color, u64>,
    pub queue: Vec<Task>,
    /// Most recent last.
    pub history: Vec<HistoryEntry>,
}

/// What one applied mutation changed. Whole values are carried for the
/// fields that changed; `history` only carries the appended entries, and a
/// viewer evicts from the front beyond the snapshot's `max_history`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct StateDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DeviceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Telemetry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub counters: Option<BTreeMap<Color, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<Vec<Task>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.telemetry.is_none()
            && self.counters.is_none()
            && self.queue.is_none()
            && self.history.is_empty()
    }
}

/// Point-in-time view served over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StateView {
    pub sequence: u64,
    pub state: DeviceState,
    pub transport_connected: bool,
    /// History cap; appended entries push out the oldest beyond it.
    pub max_history: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthReport {
    pub status: String,
    pub transport_connected: bool,
    pub sequence: u64,
    pub sessions: usize,
    pub pending_commands: usize,
}

/// Frames exchanged with dashboard viewers over the WebSocket channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    StateSnapshot {
        sequence: u64,
        state: DeviceState,
        transport_connected: bool,
        max_history: usize,
    },
    StateUpdate {
        sequence: u64,
        delta: StateDelta,
    },
    CommandAccepted {
        correlation_id: String,
        action: String,
    },
    CommandResult {
        correlation_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    TransportStatus {
        connected: bool,
    },
    SendCommand {
        action: String,
        #[serde(default)]
        #[schema(value_type = Object)]
        payload: serde_json::Value,
    },
    Error {
        message: String,
        code: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_are_case_insensitive() {
        assert_eq!(DeviceStatus::parse("EMERGENCY"), Some(DeviceStatus::Emergency));
        assert_eq!(DeviceStatus::parse(" running "), Some(DeviceStatus::Running));
        assert_eq!(DeviceStatus::parse("sleeping"), None);
    }

    #[test]
    fn emergency_is_left_only_through_idle() {
        let latched = DeviceStatus::Emergency;
        assert!(!latched.accepts_device_report(DeviceStatus::Running));
        assert!(!latched.accepts_device_report(DeviceStatus::Moving));
        assert!(latched.accepts_device_report(DeviceStatus::Idle));
        assert!(DeviceStatus::Running.accepts_device_report(DeviceStatus::Emergency));
        assert!(!DeviceStatus::Idle.accepts_device_report(DeviceStatus::Unknown));
    }

    #[test]
    fn ws_messages_use_snake_case_type_tags() {
        let json = serde_json::to_value(WsMessage::CommandResult {
            correlation_id: "c-1".into(),
            success: false,
            error: Some("timed out".into()),
            code: Some("command_timeout".into()),
        })
        .expect("serialize");
        assert_eq!(json["type"], "command_result");
        assert_eq!(json["correlation_id"], "c-1");

        let parsed: WsMessage =
            serde_json::from_str(r#"{"type":"send_command","action":"calibrate"}"#)
                .expect("parse send_command without payload");
        assert_eq!(
            parsed,
            WsMessage::SendCommand {
                action: "calibrate".into(),
                payload: serde_json::Value::Null,
            }
        );
    }

    #[test]
    fn empty_delta_serializes_to_empty_object() {
        let delta = StateDelta::default();
        assert!(delta.is_empty());
        assert_eq!(serde_json::to_string(&delta).expect("serialize"), "{}");
    }
}
