// simulator.rs
//! Stand-in for the sorting arm: publishes state on the telemetry topic,
//! executes commands from the command topic and acknowledges each one.

use dobot_relay::{config::Settings, models::Color};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const PUBLISH_INTERVAL: Duration = Duration::from_millis(500);
const ZONES: [&str; 3] = ["Zone A", "Zone B", "Zone C"];
const HISTORY_KEPT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Idle,
    Running,
    Moving,
    Emergency,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Idle => "Idle",
            Status::Running => "Running",
            Status::Moving => "Moving",
            Status::Emergency => "Emergency",
        }
    }
}

struct Simulator {
    rng: StdRng,
    status: Status,
    moving_ticks: u8,
    telemetry: Map<String, Value>,
    counters: [u64; 4],
    queue: Vec<(String, Color, String)>,
    history: Vec<Value>,
    next_sort: u64,
    seq: u64,
}

impl Simulator {
    /// `first_seq` should grow across restarts so the relay does not treat a
    /// restarted simulator as stale.
    fn new(rng: StdRng, first_seq: u64) -> Self {
        let mut sim = Self {
            rng,
            status: Status::Idle,
            moving_ticks: 0,
            telemetry: Map::new(),
            counters: [0; 4],
            queue: Vec::new(),
            history: Vec::new(),
            next_sort: 1,
            seq: first_seq,
        };
        sim.jitter_telemetry();
        sim.telemetry.insert("conveyorSpeed".into(), json!(sim.rng.gen_range(30..=80)));
        sim
    }

    /// Advances one publish period and returns the payload to publish.
    fn tick(&mut self) -> Value {
        match self.status {
            Status::Running => {
                self.jitter_telemetry();
                if !self.queue.is_empty() {
                    let (id, color, target) = self.queue.remove(0);
                    self.complete_sort(id, color, target);
                } else if self.rng.gen_bool(0.2) {
                    let color = *Color::ALL.choose(&mut self.rng).unwrap_or(&Color::Red);
                    let target = ZONES.choose(&mut self.rng).unwrap_or(&ZONES[0]).to_string();
                    let id = format!("sim-{}", self.next_sort);
                    self.complete_sort(id, color, target);
                }
            }
            Status::Moving => {
                self.jitter_telemetry();
                self.moving_ticks = self.moving_ticks.saturating_sub(1);
                if self.moving_ticks == 0 {
                    self.status = Status::Idle;
                }
            }
            Status::Idle | Status::Emergency => {}
        }
        self.full_state()
    }

    fn full_state(&mut self) -> Value {
        self.seq += 1;
        let counters: Map<String, Value> = Color::ALL
            .iter()
            .zip(self.counters)
            .map(|(color, count)| (color.as_str().to_lowercase(), json!(count)))
            .collect();
        let queue: Vec<Value> = self
            .queue
            .iter()
            .map(|(id, color, target)| json!({"id": id, "color": color.as_str(), "target": target}))
            .collect();
        json!({
            "messageId": format!("sim-msg-{}", self.seq),
            "seq": self.seq,
            "status": self.status.as_str(),
            "telemetry": Value::Object(self.telemetry.clone()),
            "counters": counters,
            "queue": queue,
            "history": self.history,
        })
    }

    /// Executes one command payload and returns the ack to publish, if the
    /// payload carried a correlation id.
    fn handle_command(&mut self, payload: &Value) -> Option<Value> {
        let correlation_id = payload.get("correlationId")?.as_str()?.to_string();
        let action = payload.get("action").and_then(Value::as_str).unwrap_or_default();

        let result = self.execute(action, payload);
        if let Err(reason) = &result {
            warn!(action, %correlation_id, %reason, "Rejecting command");
        }
        Some(match result {
            Ok(()) => json!({"correlationId": correlation_id, "success": true}),
            Err(reason) => {
                json!({"correlationId": correlation_id, "success": false, "error": reason})
            }
        })
    }

    fn execute(&mut self, action: &str, payload: &Value) -> Result<(), String> {
        let latched = self.status == Status::Emergency;
        match action {
            "emergency_stop" => self.status = Status::Emergency,
            "reset" => {
                self.status = Status::Idle;
                self.moving_ticks = 0;
            }
            "stop" if !latched => self.status = Status::Idle,
            "clear_queue" => self.queue.clear(),
            _ if latched => return Err("emergency stop is engaged".to_string()),
            "start" => self.status = Status::Running,
            "home" | "calibrate" => {
                self.status = Status::Moving;
                self.moving_ticks = if action == "home" { 2 } else { 4 };
            }
            "add_queue" => {
                let color = payload
                    .get("color")
                    .and_then(Value::as_str)
                    .and_then(|label| Color::ALL.into_iter().find(|c| c.as_str() == label))
                    .ok_or("unknown color")?;
                let target = payload
                    .get("target")
                    .and_then(Value::as_str)
                    .ok_or("missing target")?;
                let id = payload
                    .get("correlationId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if !self.queue.iter().any(|(queued, _, _)| *queued == id) {
                    self.queue.push((id, color, target.to_string()));
                }
            }
            "set_conveyor_speed" => {
                let speed = payload
                    .get("speed")
                    .and_then(Value::as_f64)
                    .ok_or("missing speed")?;
                self.telemetry.insert("conveyorSpeed".into(), json!(speed));
            }
            other => return Err(format!("unsupported action {other}")),
        }
        Ok(())
    }

    fn complete_sort(&mut self, id: String, color: Color, target: String) {
        let slot = Color::ALL.iter().position(|c| *c == color).unwrap_or(0);
        self.counters[slot] += 1;
        self.next_sort += 1;
        self.history.push(json!({
            "id": id,
            "color": color.as_str(),
            "target": target,
            "time": chrono::Local::now().format("%H:%M").to_string(),
        }));
        if self.history.len() > HISTORY_KEPT {
            self.history.remove(0);
        }
    }

    fn jitter_telemetry(&mut self) {
        let x = round2(self.rng.gen_range(200.0..300.0));
        let y = round2(self.rng.gen_range(-150.0..150.0));
        let z = round2(self.rng.gen_range(20.0..80.0));
        let r = round2(self.rng.gen_range(-90.0..90.0));
        let gripper = self.rng.gen_bool(0.5);
        for (key, value) in [("x", json!(x)), ("y", json!(y)), ("z", json!(z)), ("r", json!(r))] {
            self.telemetry.insert(key.into(), value);
        }
        self.telemetry.insert("gripper".into(), json!(gripper));
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::new().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    let broker = &settings.broker;
    let topics = &settings.topics;

    let mut options = MqttOptions::new(
        format!("{}-sim", broker.client_id),
        broker.host.clone(),
        broker.port,
    );
    options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    let first_seq = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
    let mut sim = Simulator::new(StdRng::from_entropy(), first_seq);
    let mut interval = tokio::time::interval(PUBLISH_INTERVAL);
    info!(host = %broker.host, port = broker.port, "Simulator starting");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let state = sim.tick();
                publish(&client, &topics.telemetry, &state);
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Simulator connected to broker");
                    let mut wanted = vec![topics.command.clone()];
                    wanted.extend(topics.state_request.clone());
                    for topic in wanted {
                        if let Err(e) = client.try_subscribe(&topic, QoS::AtLeastOnce) {
                            warn!(%topic, error = %e, "Subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish_packet))) => {
                    if Some(&publish_packet.topic) == topics.state_request.as_ref() {
                        let state = sim.full_state();
                        publish(&client, &topics.telemetry, &state);
                        continue;
                    }
                    let payload: Value = match serde_json::from_slice(&publish_packet.payload) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(error = %e, "Ignoring malformed command");
                            continue;
                        }
                    };
                    debug!(%payload, "Command received");
                    if let Some(ack) = sim.handle_command(&payload) {
                        publish(&client, &topics.ack, &ack);
                        let state = sim.full_state();
                        publish(&client, &topics.telemetry, &state);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Broker connection error, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Simulator stopping");
                return Ok(());
            }
        }
    }
}

fn publish(client: &AsyncClient, topic: &str, payload: &Value) {
    if let Err(e) = client.try_publish(topic, QoS::AtLeastOnce, false, payload.to_string()) {
        warn!(%topic, error = %e, "Publish dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> Simulator {
        Simulator::new(StdRng::seed_from_u64(7), 0)
    }

    fn command(action: &str, extra: Value) -> Value {
        let mut payload = json!({"action": action, "correlationId": format!("c-{action}")});
        if let (Some(body), Value::Object(extra)) = (payload.as_object_mut(), extra) {
            body.extend(extra);
        }
        payload
    }

    #[test]
    fn telemetry_stays_within_generator_ranges() {
        let mut sim = sim();
        sim.execute("start", &Value::Null).expect("start");
        for _ in 0..50 {
            let state = sim.tick();
            let x = state["telemetry"]["x"].as_f64().expect("x");
            let r = state["telemetry"]["r"].as_f64().expect("r");
            assert!((200.0..=300.0).contains(&x));
            assert!((-90.0..=90.0).contains(&r));
        }
    }

    #[test]
    fn queued_task_is_sorted_into_history_under_its_id() {
        let mut sim = sim();
        let ack = sim
            .handle_command(&command("add_queue", json!({"color": "Blue", "target": "Zone B"})))
            .expect("ack");
        assert_eq!(ack["success"], true);
        assert_eq!(sim.full_state()["queue"][0]["id"], "c-add_queue");

        sim.execute("start", &Value::Null).expect("start");
        let state = sim.tick();
        assert_eq!(state["queue"], json!([]));
        assert_eq!(state["history"][0]["id"], "c-add_queue");
        assert_eq!(state["counters"]["blue"], 1);
    }

    #[test]
    fn emergency_blocks_motion_until_reset() {
        let mut sim = sim();
        sim.handle_command(&command("emergency_stop", Value::Null));
        let ack = sim.handle_command(&command("start", Value::Null)).expect("ack");
        assert_eq!(ack["success"], false);
        assert_eq!(sim.full_state()["status"], "Emergency");

        sim.handle_command(&command("reset", Value::Null));
        let ack = sim.handle_command(&command("start", Value::Null)).expect("ack");
        assert_eq!(ack["success"], true);
        assert_eq!(sim.full_state()["status"], "Running");
    }

    #[test]
    fn commands_without_correlation_id_are_not_acknowledged() {
        let mut sim = sim();
        assert!(sim.handle_command(&json!({"action": "start"})).is_none());
    }

    #[test]
    fn every_state_carries_a_fresh_sequence() {
        let mut sim = sim();
        let first = sim.tick()["seq"].as_u64();
        let second = sim.full_state()["seq"].as_u64();
        assert!(second > first);
    }
}
