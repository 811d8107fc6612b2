// commands/mod.rs
//! Viewer commands accepted by the relay.
//!
//! The set of actions is closed: every action is a [`CommandFactory`]
//! registered with `inventory`, and anything without a factory is rejected.

mod dispatch;

pub use dispatch::{CommandDispatcher, CommandOutcome, Completion, Dispatched, PendingCommand};

use crate::{colors::ColorTable, error::AppError, models::Color};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use validator::Validate;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    EmergencyStop,
    Calibrate,
    Home,
    Start,
    Stop,
    Reset,
    AddQueue { color: Color, target: String },
    ClearQueue,
    SetConveyorSpeed { speed: f64 },
}

impl Command {
    pub fn action(&self) -> &'static str {
        match self {
            Command::EmergencyStop => "emergency_stop",
            Command::Calibrate => "calibrate",
            Command::Home => "home",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Reset => "reset",
            Command::AddQueue { .. } => "add_queue",
            Command::ClearQueue => "clear_queue",
            Command::SetConveyorSpeed { .. } => "set_conveyor_speed",
        }
    }

    pub fn is_emergency(&self) -> bool {
        matches!(self, Command::EmergencyStop)
    }

    /// Payload published on the command topic.
    pub fn to_wire(&self, correlation_id: &str) -> Value {
        let mut body = Map::new();
        body.insert("action".into(), json!(self.action()));
        match self {
            Command::AddQueue { color, target } => {
                body.insert("color".into(), json!(color.as_str()));
                body.insert("target".into(), json!(target));
            }
            Command::SetConveyorSpeed { speed } => {
                body.insert("speed".into(), json!(speed));
            }
            _ => {}
        }
        body.insert("correlationId".into(), json!(correlation_id));
        Value::Object(body)
    }
}

pub trait CommandFactory: Sync {
    fn action(&self) -> &'static str;
    fn create(&self, payload: &Value, colors: &ColorTable) -> Result<Command, AppError>;
}

inventory::collect!(&'static dyn CommandFactory);

pub fn parse_command(
    action: &str,
    payload: &Value,
    colors: &ColorTable,
) -> Result<Command, AppError> {
    let factory = inventory::iter::<&'static dyn CommandFactory>
        .into_iter()
        .find(|factory| factory.action() == action)
        .ok_or_else(|| {
            AppError::InvalidCommand(format!(
                "unknown action `{action}`, expected one of: {}",
                known_actions().join(", ")
            ))
        })?;

    if !(payload.is_null() || payload.is_object()) {
        return Err(AppError::InvalidCommand(format!(
            "payload for `{action}` must be an object"
        )));
    }
    factory.create(payload, colors)
}

pub fn known_actions() -> Vec<&'static str> {
    let mut actions: Vec<&'static str> = inventory::iter::<&'static dyn CommandFactory>
        .into_iter()
        .map(|factory| factory.action())
        .collect();
    actions.sort_unstable();
    actions
}

fn payload_as<T: for<'de> Deserialize<'de> + Validate>(
    action: &str,
    payload: &Value,
) -> Result<T, AppError> {
    let parsed: T = serde_json::from_value(payload.clone())
        .map_err(|e| AppError::InvalidCommand(format!("{action}: {e}")))?;
    parsed
        .validate()
        .map_err(|e| AppError::InvalidCommand(format!("{action}: {e}")))?;
    Ok(parsed)
}

macro_rules! plain_command {
    ($factory:ident, $action:literal, $command:expr) => {
        pub struct $factory;

        impl CommandFactory for $factory {
            fn action(&self) -> &'static str {
                $action
            }

            fn create(&self, _payload: &Value, _colors: &ColorTable) -> Result<Command, AppError> {
                Ok($command)
            }
        }

        inventory::submit! {
            &$factory as &'static dyn CommandFactory
        }
    };
}

plain_command!(EmergencyStopFactory, "emergency_stop", Command::EmergencyStop);
plain_command!(CalibrateFactory, "calibrate", Command::Calibrate);
plain_command!(HomeFactory, "home", Command::Home);
plain_command!(StartFactory, "start", Command::Start);
plain_command!(StopFactory, "stop", Command::Stop);
plain_command!(ResetFactory, "reset", Command::Reset);
plain_command!(ClearQueueFactory, "clear_queue", Command::ClearQueue);

#[derive(Debug, Deserialize, Validate)]
struct AddQueuePayload {
    #[validate(length(min = 1, max = 64))]
    color: String,
    #[validate(length(min = 1, max = 64))]
    target: String,
}

pub struct AddQueueFactory;

impl CommandFactory for AddQueueFactory {
    fn action(&self) -> &'static str {
        "add_queue"
    }

    fn create(&self, payload: &Value, colors: &ColorTable) -> Result<Command, AppError> {
        let payload: AddQueuePayload = payload_as(self.action(), payload)?;
        let color = colors
            .normalize(&payload.color)
            .ok_or_else(|| AppError::InvalidCommand(format!("unknown color `{}`", payload.color)))?;
        Ok(Command::AddQueue {
            color,
            target: payload.target.trim().to_string(),
        })
    }
}

inventory::submit! {
    &AddQueueFactory as &'static dyn CommandFactory
}

#[derive(Debug, Deserialize, Validate)]
struct ConveyorSpeedPayload {
    #[validate(range(min = 0.0, max = 1000.0))]
    speed: f64,
}

pub struct SetConveyorSpeedFactory;

impl CommandFactory for SetConveyorSpeedFactory {
    fn action(&self) -> &'static str {
        "set_conveyor_speed"
    }

    fn create(&self, payload: &Value, _colors: &ColorTable) -> Result<Command, AppError> {
        let payload: ConveyorSpeedPayload = payload_as(self.action(), payload)?;
        Ok(Command::SetConveyorSpeed {
            speed: payload.speed,
        })
    }
}

inventory::submit! {
    &SetConveyorSpeedFactory as &'static dyn CommandFactory
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(action: &str, payload: Value) -> Result<Command, AppError> {
        parse_command(action, &payload, &ColorTable::default())
    }

    #[test]
    fn every_action_is_registered() {
        assert_eq!(
            known_actions(),
            vec![
                "add_queue",
                "calibrate",
                "clear_queue",
                "emergency_stop",
                "home",
                "reset",
                "set_conveyor_speed",
                "start",
                "stop",
            ]
        );
    }

    #[test]
    fn unknown_actions_are_invalid() {
        let err = parse("self_destruct", Value::Null).unwrap_err();
        assert_eq!(err.code(), "invalid_command");
        let message = err.to_string();
        assert!(message.contains("self_destruct"), "{message}");
        assert!(message.contains("emergency_stop, home"), "{message}");
    }

    #[test]
    fn add_queue_normalizes_color_and_requires_target() {
        assert_eq!(
            parse("add_queue", json!({"color": "merah", "target": " A "})).expect("valid"),
            Command::AddQueue {
                color: Color::Red,
                target: "A".into()
            }
        );

        for payload in [
            json!({"color": "Red"}),
            json!({"target": "A"}),
            json!({"color": "Red", "target": ""}),
            json!({"color": "Purple", "target": "A"}),
            Value::Null,
        ] {
            let err = parse("add_queue", payload.clone()).unwrap_err();
            assert!(matches!(err, AppError::InvalidCommand(_)), "{payload}: {err:?}");
        }
    }

    #[test]
    fn conveyor_speed_must_be_non_negative() {
        assert_eq!(
            parse("set_conveyor_speed", json!({"speed": 40})).expect("valid"),
            Command::SetConveyorSpeed { speed: 40.0 }
        );
        assert!(parse("set_conveyor_speed", json!({"speed": -1})).is_err());
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        assert!(parse("calibrate", json!("now")).is_err());
        assert!(parse("calibrate", json!({})).is_ok());
    }

    #[test]
    fn wire_format_carries_action_fields_and_correlation_id() {
        let wire = Command::AddQueue {
            color: Color::Blue,
            target: "Zone C".into(),
        }
        .to_wire("c-42");
        assert_eq!(
            wire,
            json!({"action": "add_queue", "color": "Blue", "target": "Zone C", "correlationId": "c-42"})
        );
        assert_eq!(
            Command::EmergencyStop.to_wire("c-1"),
            json!({"action": "emergency_stop", "correlationId": "c-1"})
        );
    }
}
