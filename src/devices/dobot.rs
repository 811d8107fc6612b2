// dobot.rs
use super::{DeviceMessage, StateUpdate, TelemetryPatch};
use crate::models::{DeviceState, DeviceStatus, HistoryEntry, StateDelta, Task, Telemetry};
use tracing::debug;

/// Canonical state of the arm plus the merge rules applied to it.
///
/// Every mutation returns the [`StateDelta`] it produced; an empty delta
/// means nothing changed.
#[derive(Debug, Clone)]
pub struct DobotState {
    state: DeviceState,
    max_history: usize,
    /// Whether the device itself has seen the current emergency. Until it
    /// has, an `Idle` report may predate the stop and does not reset it.
    emergency_confirmed: bool,
}

impl DobotState {
    pub fn new(max_history: usize) -> Self {
        Self {
            state: DeviceState::default(),
            max_history: max_history.max(1),
            emergency_confirmed: false,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Merges one decoded device message. Acks carry no state.
    pub fn apply(&mut self, message: DeviceMessage) -> StateDelta {
        match message {
            DeviceMessage::State(update) => self.apply_update(update),
            DeviceMessage::History(entries) => self.append_history(entries),
            DeviceMessage::Queue(tasks) => self.replace_queue(tasks),
            DeviceMessage::Ack(_) => StateDelta::default(),
        }
    }

    pub fn apply_update(&mut self, update: StateUpdate) -> StateDelta {
        let mut delta = StateDelta::default();

        if let Some(status) = update.status {
            self.merge_status(status, &mut delta);
        }

        if let Some(patch) = update.telemetry {
            let before = self.state.telemetry;
            merge_telemetry(&mut self.state.telemetry, &patch);
            if self.state.telemetry != before {
                delta.telemetry = Some(self.state.telemetry);
            }
        }

        if let Some(counters) = update.counters {
            let mut changed = false;
            for (color, count) in counters {
                if self.state.counters.insert(color, count) != Some(count) {
                    changed = true;
                }
            }
            if changed {
                delta.counters = Some(self.state.counters.clone());
            }
        }

        if let Some(queue) = update.queue {
            delta.queue = self.replace_queue(queue).queue;
        }

        if let Some(history) = update.history {
            let appended = self.append_history(history);
            delta.history = appended.history;
            if appended.queue.is_some() {
                delta.queue = appended.queue;
            }
        }

        delta
    }

    /// Appends entries whose id is not yet known, evicting the oldest entries
    /// beyond the cap. An entry whose id matches a queued task completes it.
    pub fn append_history(&mut self, entries: Vec<HistoryEntry>) -> StateDelta {
        let mut delta = StateDelta::default();
        let mut queue_changed = false;

        for entry in entries {
            if self.state.history.iter().any(|known| known.id == entry.id)
                || delta.history.iter().any(|added| added.id == entry.id)
            {
                continue;
            }
            let queued = self.state.queue.len();
            self.state.queue.retain(|task| task.id != entry.id);
            queue_changed |= self.state.queue.len() != queued;

            self.state.history.push(entry.clone());
            delta.history.push(entry);
        }

        if self.state.history.len() > self.max_history {
            let excess = self.state.history.len() - self.max_history;
            self.state.history.drain(..excess);
        }
        if delta.history.len() > self.max_history {
            let excess = delta.history.len() - self.max_history;
            delta.history.drain(..excess);
        }
        if queue_changed {
            delta.queue = Some(self.state.queue.clone());
        }
        delta
    }

    /// Replaces the queue with the device's view, keeping tentative tasks the
    /// device has not seen yet at the end.
    pub fn replace_queue(&mut self, tasks: Vec<Task>) -> StateDelta {
        let mut next = tasks;
        for task in self.state.queue.iter().filter(|task| task.pending) {
            if !next.iter().any(|reported| reported.id == task.id) {
                next.push(task.clone());
            }
        }
        self.set_queue(next)
    }

    /// Latches Emergency on the relay's side, ahead of the device.
    /// Idempotent: already being in Emergency changes nothing.
    pub fn enter_emergency(&mut self) -> StateDelta {
        let mut delta = StateDelta::default();
        if self.state.status != DeviceStatus::Emergency {
            self.state.status = DeviceStatus::Emergency;
            self.emergency_confirmed = false;
            delta.status = Some(DeviceStatus::Emergency);
        }
        delta
    }

    /// The device acknowledged the stop (or a reset), so its next `Idle`
    /// releases the latch.
    pub fn confirm_emergency(&mut self) {
        if self.state.status == DeviceStatus::Emergency {
            self.emergency_confirmed = true;
        }
    }

    pub fn add_tentative_task(&mut self, task: Task) -> StateDelta {
        if self.state.queue.iter().any(|queued| queued.id == task.id) {
            return StateDelta::default();
        }
        let mut next = self.state.queue.clone();
        next.push(Task {
            pending: true,
            ..task
        });
        self.set_queue(next)
    }

    pub fn confirm_task(&mut self, id: &str) -> StateDelta {
        let mut next = self.state.queue.clone();
        for task in next.iter_mut().filter(|task| task.id == id) {
            task.pending = false;
        }
        self.set_queue(next)
    }

    /// Drops a task that is still tentative. Confirmed tasks are left alone.
    pub fn discard_task(&mut self, id: &str) -> StateDelta {
        let mut next = self.state.queue.clone();
        next.retain(|task| !(task.pending && task.id == id));
        self.set_queue(next)
    }

    fn set_queue(&mut self, next: Vec<Task>) -> StateDelta {
        let mut delta = StateDelta::default();
        if next != self.state.queue {
            self.state.queue = next;
            delta.queue = Some(self.state.queue.clone());
        }
        delta
    }

    fn merge_status(&mut self, next: DeviceStatus, delta: &mut StateDelta) {
        let current = self.state.status;
        if next == DeviceStatus::Emergency {
            self.emergency_confirmed = true;
        }
        if current == next {
            return;
        }
        let unconfirmed_reset = current == DeviceStatus::Emergency && !self.emergency_confirmed;
        if current.accepts_device_report(next) && !unconfirmed_reset {
            self.state.status = next;
            self.emergency_confirmed = next == DeviceStatus::Emergency;
            delta.status = Some(next);
        } else {
            debug!(
                current = current.as_str(),
                reported = next.as_str(),
                "Ignoring device status transition"
            );
        }
    }
}

fn merge_telemetry(telemetry: &mut Telemetry, patch: &TelemetryPatch) {
    if let Some(x) = patch.x {
        telemetry.x = x;
    }
    if let Some(y) = patch.y {
        telemetry.y = y;
    }
    if let Some(z) = patch.z {
        telemetry.z = z;
    }
    if let Some(r) = patch.r {
        telemetry.r = r;
    }
    if let Some(gripper) = patch.gripper {
        telemetry.gripper = gripper;
    }
    if let Some(speed) = patch.conveyor_speed {
        telemetry.conveyor_speed = speed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Color;

    fn telemetry_patch(x: Option<f64>, gripper: Option<bool>) -> StateUpdate {
        StateUpdate {
            telemetry: Some(TelemetryPatch {
                x,
                gripper,
                ..TelemetryPatch::default()
            }),
            ..StateUpdate::default()
        }
    }

    fn entry(id: &str) -> HistoryEntry {
        HistoryEntry {
            id: id.to_string(),
            color: Color::Green,
            target: "Zone A".to_string(),
            timestamp: "19:40".to_string(),
        }
    }

    fn task(id: &str, pending: bool) -> Task {
        Task {
            id: id.to_string(),
            color: Color::Red,
            target: "A".to_string(),
            pending,
        }
    }

    #[test]
    fn status_only_message_leaves_telemetry_untouched() {
        let mut dobot = DobotState::new(10);
        dobot.apply_update(StateUpdate {
            status: Some(DeviceStatus::Running),
            telemetry: Some(TelemetryPatch {
                x: Some(10.0),
                y: Some(20.0),
                z: Some(5.0),
                r: Some(0.0),
                gripper: Some(true),
                conveyor_speed: Some(3.0),
            }),
            ..StateUpdate::default()
        });
        let before = dobot.state().telemetry;

        let delta = dobot.apply_update(StateUpdate {
            status: Some(DeviceStatus::Idle),
            ..StateUpdate::default()
        });

        assert_eq!(delta.status, Some(DeviceStatus::Idle));
        assert!(delta.telemetry.is_none());
        assert_eq!(dobot.state().status, DeviceStatus::Idle);
        assert_eq!(dobot.state().telemetry, before);
        assert_eq!(dobot.state().telemetry.conveyor_speed, 3.0);
    }

    #[test]
    fn partial_telemetry_keeps_latest_value_per_field() {
        let mut dobot = DobotState::new(10);
        dobot.apply_update(telemetry_patch(Some(1.0), Some(true)));
        dobot.apply_update(telemetry_patch(Some(2.0), None));
        dobot.apply_update(telemetry_patch(None, Some(false)));
        dobot.apply_update(telemetry_patch(None, None));

        let telemetry = dobot.state().telemetry;
        assert_eq!(telemetry.x, 2.0);
        assert!(!telemetry.gripper);
    }

    #[test]
    fn repeated_values_produce_empty_delta() {
        let mut dobot = DobotState::new(10);
        assert!(!dobot.apply_update(telemetry_patch(Some(1.0), None)).is_empty());
        assert!(dobot.apply_update(telemetry_patch(Some(1.0), None)).is_empty());
    }

    fn status(status: DeviceStatus) -> StateUpdate {
        StateUpdate {
            status: Some(status),
            ..StateUpdate::default()
        }
    }

    #[test]
    fn emergency_latches_until_confirmed_device_reports_idle() {
        let mut dobot = DobotState::new(10);
        assert_eq!(dobot.enter_emergency().status, Some(DeviceStatus::Emergency));
        assert!(dobot.enter_emergency().is_empty());

        assert!(dobot.apply_update(status(DeviceStatus::Running)).is_empty());
        assert!(dobot.apply_update(status(DeviceStatus::Idle)).is_empty());
        assert_eq!(dobot.state().status, DeviceStatus::Emergency);

        dobot.confirm_emergency();
        let reset = dobot.apply_update(status(DeviceStatus::Idle));
        assert_eq!(reset.status, Some(DeviceStatus::Idle));

        // The next local stop needs confirming again.
        dobot.enter_emergency();
        assert!(dobot.apply_update(status(DeviceStatus::Idle)).is_empty());
    }

    #[test]
    fn device_reported_emergency_confirms_the_latch() {
        let mut dobot = DobotState::new(10);
        dobot.enter_emergency();
        assert!(dobot.apply_update(status(DeviceStatus::Emergency)).is_empty());
        assert_eq!(
            dobot.apply_update(status(DeviceStatus::Idle)).status,
            Some(DeviceStatus::Idle)
        );

        let mut dobot = DobotState::new(10);
        dobot.apply_update(status(DeviceStatus::Emergency));
        assert_eq!(
            dobot.apply_update(status(DeviceStatus::Idle)).status,
            Some(DeviceStatus::Idle)
        );
    }

    #[test]
    fn unconfirmed_idle_still_merges_other_fields() {
        let mut dobot = DobotState::new(10);
        dobot.enter_emergency();
        let delta = dobot.apply_update(StateUpdate {
            status: Some(DeviceStatus::Idle),
            ..telemetry_patch(Some(1.0), None)
        });
        assert!(delta.status.is_none());
        assert_eq!(delta.telemetry.map(|t| t.x), Some(1.0));
        assert_eq!(dobot.state().status, DeviceStatus::Emergency);
    }

    #[test]
    fn history_is_capped_oldest_first_and_deduplicated_by_id() {
        let mut dobot = DobotState::new(3);
        dobot.append_history(vec![entry("1"), entry("2")]);
        let delta = dobot.append_history(vec![entry("2"), entry("3"), entry("4"), entry("5")]);

        let ids: Vec<&str> = dobot.state().history.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "4", "5"]);
        let appended: Vec<&str> = delta.history.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(appended, vec!["3", "4", "5"]);

        assert!(dobot.append_history(vec![entry("5")]).is_empty());
    }

    #[test]
    fn history_entry_completes_matching_queued_task() {
        let mut dobot = DobotState::new(10);
        dobot.replace_queue(vec![task("t1", false), task("t2", false)]);
        let delta = dobot.append_history(vec![entry("t1")]);
        let queue = delta.queue.expect("queue changed");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, "t2");
    }

    #[test]
    fn queue_replacement_keeps_unacknowledged_tentative_tasks() {
        let mut dobot = DobotState::new(10);
        dobot.add_tentative_task(task("c-1", false));
        dobot.replace_queue(vec![task("d-1", false)]);

        let ids: Vec<(&str, bool)> = dobot
            .state()
            .queue
            .iter()
            .map(|t| (t.id.as_str(), t.pending))
            .collect();
        assert_eq!(ids, vec![("d-1", false), ("c-1", true)]);

        dobot.replace_queue(vec![task("d-1", false), task("c-1", false)]);
        assert!(dobot.state().queue.iter().all(|t| !t.pending));
    }

    #[test]
    fn tentative_tasks_confirm_or_discard() {
        let mut dobot = DobotState::new(10);
        dobot.add_tentative_task(task("c-1", false));
        dobot.add_tentative_task(task("c-2", false));

        assert!(!dobot.confirm_task("c-1").is_empty());
        assert!(!dobot.discard_task("c-2").is_empty());
        assert!(dobot.discard_task("c-1").is_empty());

        assert_eq!(dobot.state().queue, vec![task("c-1", false)]);
    }
}
