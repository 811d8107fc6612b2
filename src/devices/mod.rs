// devices/mod.rs
//! Decoding of inbound device payloads into typed messages.
//!
//! Raw JSON is parsed against loose wire shapes first (ids may be numbers or
//! strings, history records may say `time` or `timestamp`), then checked and
//! normalized into the typed [`DeviceMessage`] variants the relay merges.

mod dobot;

pub use dobot::DobotState;

use crate::{
    colors::ColorTable,
    config::TopicKind,
    error::AppError,
    models::{Color, DeviceStatus, HistoryEntry, Task},
    utils,
};
use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Field-wise partial telemetry; absent fields keep their last value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPatch {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub r: Option<f64>,
    pub gripper: Option<bool>,
    pub conveyor_speed: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub status: Option<DeviceStatus>,
    pub telemetry: Option<TelemetryPatch>,
    pub counters: Option<BTreeMap<Color, u64>>,
    pub queue: Option<Vec<Task>>,
    pub history: Option<Vec<HistoryEntry>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub correlation_id: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    State(StateUpdate),
    History(Vec<HistoryEntry>),
    Queue(Vec<Task>),
    Ack(Ack),
}

/// Optional fields any device payload may carry for de-duplication.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: Option<String>,
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub envelope: Envelope,
    pub message: DeviceMessage,
}

pub fn decode(kind: TopicKind, raw: &[u8], colors: &ColorTable) -> Result<Inbound, AppError> {
    let value: Value = serde_json::from_slice(raw)?;

    let envelope = match &value {
        Value::Object(_) => Envelope::deserialize(&value).map_err(AppError::from)?,
        _ => Envelope::default(),
    };

    let message = match kind {
        TopicKind::State => DeviceMessage::State(decode_state(value, colors)?),
        TopicKind::History => {
            let records: Vec<RawHistory> = one_or_many(value, "history")?;
            DeviceMessage::History(history_entries(records, colors)?)
        }
        TopicKind::Queue => {
            let records: Vec<RawTask> = one_or_many(value, "queue")?;
            DeviceMessage::Queue(tasks(records, colors)?)
        }
        TopicKind::Ack => {
            let raw: RawAck = from_value(value)?;
            DeviceMessage::Ack(Ack {
                correlation_id: raw.correlation_id,
                success: raw.success,
                error: raw.error,
            })
        }
    };

    Ok(Inbound { envelope, message })
}

fn decode_state(value: Value, colors: &ColorTable) -> Result<StateUpdate, AppError> {
    if !value.is_object() {
        return Err(AppError::Schema("state payload must be an object".into()));
    }
    let raw: RawState = from_value(value)?;

    let status = raw
        .status
        .map(|label| {
            DeviceStatus::parse(&label)
                .ok_or_else(|| AppError::Schema(format!("unknown status `{label}`")))
        })
        .transpose()?;

    let counters = raw.counters.map(|counters| {
        counters
            .into_iter()
            .filter_map(|(label, count)| match colors.normalize(&label) {
                Some(color) => Some((color, count)),
                None => {
                    warn!(%label, "Ignoring counter for unknown color");
                    None
                }
            })
            .collect::<BTreeMap<_, _>>()
    });

    let update = StateUpdate {
        status,
        telemetry: raw.telemetry,
        counters,
        queue: raw.queue.map(|records| tasks(records, colors)).transpose()?,
        history: raw
            .history
            .map(|records| history_entries(records, colors))
            .transpose()?,
    };

    if update == StateUpdate::default() {
        return Err(AppError::Schema(
            "state payload carries none of status, telemetry, counters, queue, history".into(),
        ));
    }
    Ok(update)
}

fn tasks(records: Vec<RawTask>, colors: &ColorTable) -> Result<Vec<Task>, AppError> {
    records
        .into_iter()
        .map(|record| {
            Ok(Task {
                color: color(colors, &record.color)?,
                id: record.id,
                target: record.target,
                pending: false,
            })
        })
        .collect()
}

fn history_entries(
    records: Vec<RawHistory>,
    colors: &ColorTable,
) -> Result<Vec<HistoryEntry>, AppError> {
    records
        .into_iter()
        .map(|record| {
            Ok(HistoryEntry {
                color: color(colors, &record.color)?,
                id: record.id,
                target: record.target,
                timestamp: record.timestamp.unwrap_or_else(utils::now_rfc3339),
            })
        })
        .collect()
}

fn color(colors: &ColorTable, label: &str) -> Result<Color, AppError> {
    colors
        .normalize(label)
        .ok_or_else(|| AppError::Schema(format!("unknown color `{label}`")))
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, AppError> {
    serde_json::from_value(value).map_err(|e| AppError::Schema(e.to_string()))
}

/// Accepts a bare array, a single object, or an object wrapping the array
/// under `key`.
fn one_or_many<T: DeserializeOwned>(value: Value, key: &str) -> Result<Vec<T>, AppError> {
    match value {
        Value::Array(_) => from_value(value),
        Value::Object(mut map) => match map.remove(key) {
            Some(inner @ Value::Array(_)) => from_value(inner),
            Some(_) => Err(AppError::Schema(format!("`{key}` must be an array"))),
            None => Ok(vec![from_value(Value::Object(map))?]),
        },
        _ => Err(AppError::Schema(format!("{key} payload must be an object or array"))),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawState {
    status: Option<String>,
    telemetry: Option<TelemetryPatch>,
    counters: Option<BTreeMap<String, u64>>,
    queue: Option<Vec<RawTask>>,
    history: Option<Vec<RawHistory>>,
}

#[derive(Deserialize)]
struct RawTask {
    #[serde(deserialize_with = "opaque_id")]
    id: String,
    color: String,
    target: String,
}

#[derive(Deserialize)]
struct RawHistory {
    #[serde(deserialize_with = "opaque_id")]
    id: String,
    color: String,
    target: String,
    #[serde(alias = "time")]
    timestamp: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAck {
    correlation_id: String,
    #[serde(default = "default_success")]
    success: bool,
    error: Option<String>,
}

fn default_success() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(serde_json::Number),
}

fn opaque_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(id) => id,
        RawId::Number(id) => id.to_string(),
    })
}
