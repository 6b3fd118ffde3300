//! Outbound command queue and duty-cycle gate.
//!
//! - `CommandQueue`: bounded FIFO; `offer` never blocks. A command whose de-duplication key
//!   matches the immediately preceding enqueued command evicts that command if it is still queued.
//! - `DutyCycleGate`: last hub health behind a mutex + condvar; waiters are woken as soon as a
//!   report drops below `MAX_DUTY_CYCLE`.
//! - `QueueConsumer`: the single worker loop. Resolution and sending are supplied by the caller.

use crate::models::cube::{HubHealth, SerialNumber};
use crate::protocol::command::CubeCommand;
use crate::utils::Shutdown;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const MAX_DUTY_CYCLE: u32 = 80;
pub const DEFAULT_CAPACITY: usize = 50;

pub type CommandId = u64;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Addressable channels of a device, as exposed to the adapter layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    SetTemp,
    Mode,
}

impl Channel {
    pub fn id(self) -> &'static str {
        match self {
            Channel::SetTemp => "set_temp",
            Channel::Mode => "mode",
        }
    }
}

/// Generic adapter-level command value.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    Temperature(f64),
    OnOff(bool),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    Cube(CubeCommand),
    Channel { channel: Channel, command: ChannelCommand },
}

#[derive(Debug, Clone)]
pub struct SendCommand {
    pub id: CommandId,
    pub serial: SerialNumber,
    pub payload: CommandPayload,
    pub description: String,
    key: String,
}

impl SendCommand {
    pub fn new(serial: SerialNumber, payload: CommandPayload, description: impl Into<String>) -> Self {
        let kind = match &payload {
            CommandPayload::Cube(c) => c.kind(),
            CommandPayload::Channel { channel, .. } => channel.id(),
        };
        SendCommand {
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
            key: format!("{}-{}", serial, kind),
            serial,
            payload,
            description: description.into(),
        }
    }

    /// De-duplication key: `{serial}-{kind}`.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    Full { capacity: usize },
    Closed,
}

impl core::fmt::Display for QueueError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            QueueError::Full { capacity } => write!(f, "command queue is full ({} commands)", capacity),
            QueueError::Closed => write!(f, "command queue is closed"),
        }
    }
}

impl std::error::Error for QueueError {}

// =====================
// Queue
// =====================

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<SendCommand>,
    last_enqueued: Option<(CommandId, String)>,
    closed: bool,
}

#[derive(Debug)]
pub struct CommandQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        CommandQueue {
            capacity,
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
        }
    }

    pub fn offer(&self, command: SendCommand) -> Result<CommandId, QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.items.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }

        let previous = state
            .last_enqueued
            .as_ref()
            .filter(|(_, key)| key == command.key())
            .map(|(id, _)| *id);
        if let Some(last_id) = previous
            && let Some(pos) = state.items.iter().position(|c| c.id == last_id)
        {
            state.items.remove(pos);
            debug!("Command {} superseded by {} ({})", last_id, command.id, command.key());
        }

        let id = command.id;
        state.last_enqueued = Some((id, command.key().to_string()));
        state.items.push_back(command);
        drop(state);
        self.available.notify_one();
        Ok(id)
    }

    /// Blocks until a command is available. `None` once the queue is closed.
    pub fn take(&self) -> Option<SendCommand> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(command) = state.items.pop_front() {
                return Some(command);
            }
            self.available.wait(&mut state);
        }
    }

    /// Returns a taken but unsent command to the head of the queue. It is dropped when a newer
    /// command with the same key has been queued since.
    pub fn requeue(&self, command: SendCommand) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if state.items.iter().any(|c| c.key() == command.key()) {
            debug!("Held command {} superseded ({})", command.id, command.key());
            return;
        }
        state.items.push_front(command);
    }

    /// Rejects further offers, discards queued commands and releases blocked takers.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let discarded = state.items.len();
        state.items.clear();
        drop(state);
        if discarded > 0 {
            info!("Discarded {} queued command(s)", discarded);
        }
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn snapshot(&self) -> Vec<SendCommand> {
        self.state.lock().items.iter().cloned().collect()
    }
}

// =====================
// Duty-cycle gate
// =====================

#[derive(Debug, Default)]
pub struct DutyCycleGate {
    health: Mutex<HubHealth>,
    cond: Condvar,
}

impl DutyCycleGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a fresh report. Returns whether it differs from the previous one.
    pub fn update(&self, health: HubHealth) -> bool {
        let mut current = self.health.lock();
        let changed = *current != health;
        *current = health;
        if health.duty_cycle < MAX_DUTY_CYCLE {
            self.cond.notify_all();
        }
        changed
    }

    pub fn health(&self) -> HubHealth {
        *self.health.lock()
    }

    pub fn has_excess_duty_cycle(&self) -> bool {
        self.health.lock().duty_cycle >= MAX_DUTY_CYCLE
    }

    /// Waits until the duty cycle is below the threshold, `timeout` elapses or `shutdown` fires.
    /// Returns whether sending is allowed now.
    pub fn wait_while_excessive(&self, timeout: Duration, shutdown: &Shutdown) -> bool {
        let deadline = Instant::now() + timeout;
        let mut health = self.health.lock();
        while health.duty_cycle >= MAX_DUTY_CYCLE && !shutdown.is_triggered() {
            if self.cond.wait_until(&mut health, deadline).timed_out() {
                break;
            }
        }
        health.duty_cycle < MAX_DUTY_CYCLE
    }

    /// Wakes every waiter so it can re-check shutdown.
    pub fn notify_all(&self) {
        let _guard = self.health.lock();
        self.cond.notify_all();
    }
}

// =====================
// Consumer
// =====================

pub struct QueueConsumer<'a> {
    pub queue: &'a CommandQueue,
    pub gate: &'a DutyCycleGate,
    pub shutdown: &'a Shutdown,
    pub command_delay: Duration,
    pub duty_cycle_wait: Duration,
}

impl QueueConsumer<'_> {
    /// Runs until the queue is closed or shutdown fires. `before_wait` runs before every
    /// duty-cycle wait (the bridge closes its socket there); `send` resolves and sends one command.
    pub fn run(&self, mut before_wait: impl FnMut(), mut send: impl FnMut(SendCommand)) {
        while self.wait_for_normal_duty_cycle(&mut before_wait) {
            let Some(command) = self.queue.take() else {
                break;
            };
            // the duty cycle may have risen while the queue was empty
            if self.gate.has_excess_duty_cycle() {
                self.queue.requeue(command);
                continue;
            }
            debug!("Sending command {} ({})", command.id, command.description);
            send(command);
            if !self.shutdown.sleep(self.command_delay) {
                break;
            }
        }
        debug!("Command queue consumer finished");
    }

    fn wait_for_normal_duty_cycle(&self, before_wait: &mut impl FnMut()) -> bool {
        while self.gate.has_excess_duty_cycle() {
            if self.shutdown.is_triggered() {
                return false;
            }
            info!(
                "Duty cycle {}% is at or above {}%; holding queued commands",
                self.gate.health().duty_cycle,
                MAX_DUTY_CYCLE
            );
            before_wait();
            self.gate.wait_while_excessive(self.duty_cycle_wait, self.shutdown);
        }
        !self.shutdown.is_triggered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cube::RfAddress;
    use std::sync::mpsc;
    use std::thread;

    fn cube(serial: &str, command: CubeCommand) -> SendCommand {
        SendCommand::new(SerialNumber::new(serial), CommandPayload::Cube(command), "test")
    }

    fn setpoint(serial: &str, value: f64) -> SendCommand {
        SendCommand::new(
            SerialNumber::new(serial),
            CommandPayload::Channel {
                channel: Channel::SetTemp,
                command: ChannelCommand::Temperature(value),
            },
            format!("set {}", value),
        )
    }

    #[test]
    fn keys_combine_serial_and_kind() {
        assert_eq!(setpoint("keq0000001", 21.0).key(), "KEQ0000001-set_temp");
        let c = cube(
            "KEQ0000001",
            CubeCommand::RequestConfiguration {
                rf_address: RfAddress::new("0a0001"),
            },
        );
        assert_eq!(c.key(), "KEQ0000001-C");
    }

    #[test]
    fn later_command_with_same_key_supersedes_unsent_one() {
        let q = CommandQueue::new(DEFAULT_CAPACITY);
        q.offer(setpoint("KEQ0000001", 20.0)).unwrap();
        let second = q.offer(setpoint("KEQ0000001", 22.0)).unwrap();
        let queued = q.snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, second);
        assert_eq!(queued[0].description, "set 22");
    }

    #[test]
    fn supersession_only_looks_at_the_previous_command() {
        let q = CommandQueue::new(DEFAULT_CAPACITY);
        q.offer(setpoint("KEQ0000001", 20.0)).unwrap();
        q.offer(setpoint("KEQ0000002", 20.0)).unwrap();
        q.offer(setpoint("KEQ0000001", 22.0)).unwrap();
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn requeued_command_goes_first_unless_superseded() {
        let q = CommandQueue::new(DEFAULT_CAPACITY);
        q.offer(setpoint("KEQ0000001", 20.0)).unwrap();
        q.offer(setpoint("KEQ0000002", 20.0)).unwrap();
        let held = q.take().unwrap();
        q.requeue(held);
        let order: Vec<String> = q.snapshot().iter().map(|c| c.key().to_string()).collect();
        assert_eq!(order, vec!["KEQ0000001-set_temp", "KEQ0000002-set_temp"]);

        let held = q.take().unwrap();
        q.offer(setpoint("KEQ0000001", 22.0)).unwrap();
        q.requeue(held);
        let queued: Vec<String> = q.snapshot().iter().map(|c| c.description.clone()).collect();
        assert_eq!(queued, vec!["set 20", "set 22"]);
        assert_eq!(q.snapshot()[0].serial, SerialNumber::new("KEQ0000002"));
    }

    #[test]
    fn full_queue_rejects_and_keeps_order() {
        let q = CommandQueue::new(DEFAULT_CAPACITY);
        let ids: Vec<CommandId> = (0..50)
            .map(|i| q.offer(setpoint(&format!("KEQ{:07}", i), 20.0)).unwrap())
            .collect();
        assert_eq!(
            q.offer(setpoint("KEQ9999999", 20.0)),
            Err(QueueError::Full { capacity: 50 })
        );
        let queued: Vec<CommandId> = q.snapshot().iter().map(|c| c.id).collect();
        assert_eq!(queued, ids);
    }

    #[test]
    fn close_releases_takers_and_rejects_offers() {
        let q = CommandQueue::new(4);
        q.offer(setpoint("KEQ0000001", 20.0)).unwrap();
        thread::scope(|s| {
            let taker = s.spawn(|| {
                let first = q.take();
                let second = q.take();
                (first.is_some(), second.is_none())
            });
            thread::sleep(Duration::from_millis(50));
            q.close();
            assert_eq!(taker.join().unwrap(), (true, true));
        });
        assert_eq!(q.offer(setpoint("KEQ0000001", 20.0)), Err(QueueError::Closed));
    }

    #[test]
    fn gate_reports_changes() {
        let gate = DutyCycleGate::new();
        let busy = HubHealth {
            duty_cycle: 85,
            free_memory_slots: 10,
        };
        assert!(gate.update(busy));
        assert!(!gate.update(busy));
        assert!(gate.has_excess_duty_cycle());
        let shutdown = Shutdown::new();
        assert!(!gate.wait_while_excessive(Duration::from_millis(20), &shutdown));
    }

    #[test]
    fn consumer_holds_commands_until_duty_cycle_drops() {
        let queue = CommandQueue::new(DEFAULT_CAPACITY);
        let gate = DutyCycleGate::new();
        let shutdown = Shutdown::new();
        gate.update(HubHealth {
            duty_cycle: 90,
            free_memory_slots: 0,
        });
        let consumer = QueueConsumer {
            queue: &queue,
            gate: &gate,
            shutdown: &shutdown,
            command_delay: Duration::from_millis(1),
            duty_cycle_wait: Duration::from_secs(60),
        };
        let (tx, rx) = mpsc::channel();
        let (wait_tx, wait_rx) = mpsc::channel();

        thread::scope(|s| {
            s.spawn(move || {
                consumer.run(
                    move || {
                        let _ = wait_tx.send(());
                    },
                    move |c| {
                        let _ = tx.send(c.id);
                    },
                )
            });

            // enqueue returns immediately while the consumer is parked
            let started = Instant::now();
            let id = queue.offer(setpoint("KEQ0000001", 21.0)).unwrap();
            assert!(started.elapsed() < Duration::from_millis(100));

            wait_rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

            gate.update(HubHealth {
                duty_cycle: 20,
                free_memory_slots: 40,
            });
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), id);

            shutdown.trigger();
            gate.notify_all();
            queue.close();
        });
    }

    fn busy(duty_cycle: u32) -> HubHealth {
        HubHealth {
            duty_cycle,
            free_memory_slots: 10,
        }
    }

    /// Runs a consumer, calls `scenario` with a receiver of `before_wait` signals, and returns
    /// the descriptions of the commands sent.
    fn sent_by_consumer(
        queue: &CommandQueue,
        gate: &DutyCycleGate,
        scenario: impl FnOnce(&mpsc::Receiver<()>),
    ) -> Vec<String> {
        let shutdown = Shutdown::new();
        let consumer = QueueConsumer {
            queue,
            gate,
            shutdown: &shutdown,
            command_delay: Duration::from_millis(1),
            duty_cycle_wait: Duration::from_secs(60),
        };
        let (tx, rx) = mpsc::channel();
        let (wait_tx, wait_rx) = mpsc::channel();
        thread::scope(|s| {
            s.spawn(move || {
                consumer.run(
                    move || {
                        let _ = wait_tx.send(());
                    },
                    move |c| {
                        let _ = tx.send(c.description);
                    },
                )
            });
            scenario(&wait_rx);
            thread::sleep(Duration::from_millis(100));
            shutdown.trigger();
            gate.notify_all();
            queue.close();
        });
        rx.try_iter().collect()
    }

    #[test]
    fn command_held_by_duty_cycle_is_superseded() {
        let queue = CommandQueue::new(DEFAULT_CAPACITY);
        let gate = DutyCycleGate::new();
        gate.update(busy(90));
        let sent = sent_by_consumer(&queue, &gate, |waiting| {
            queue.offer(setpoint("KEQ0000001", 20.0)).unwrap();
            waiting.recv_timeout(Duration::from_secs(2)).unwrap();
            queue.offer(setpoint("KEQ0000001", 22.0)).unwrap();
            gate.update(busy(10));
        });
        assert_eq!(sent, vec!["set 22"]);
    }

    #[test]
    fn duty_cycle_rising_while_idle_holds_taken_command() {
        let queue = CommandQueue::new(DEFAULT_CAPACITY);
        let gate = DutyCycleGate::new();
        let sent = sent_by_consumer(&queue, &gate, |waiting| {
            // consumer is parked on the empty queue
            thread::sleep(Duration::from_millis(50));
            gate.update(busy(90));
            queue.offer(setpoint("KEQ0000001", 20.0)).unwrap();
            waiting.recv_timeout(Duration::from_secs(2)).unwrap();
            queue.offer(setpoint("KEQ0000001", 22.0)).unwrap();
            gate.update(busy(10));
        });
        assert_eq!(sent, vec!["set 22"]);
    }

    #[test]
    fn consumer_stops_on_shutdown_while_waiting() {
        let queue = CommandQueue::new(DEFAULT_CAPACITY);
        let gate = DutyCycleGate::new();
        let shutdown = Shutdown::new();
        gate.update(HubHealth {
            duty_cycle: 100,
            free_memory_slots: 0,
        });
        queue.offer(setpoint("KEQ0000001", 21.0)).unwrap();
        let consumer = QueueConsumer {
            queue: &queue,
            gate: &gate,
            shutdown: &shutdown,
            command_delay: Duration::from_millis(1),
            duty_cycle_wait: Duration::from_secs(60),
        };
        let mut sent = 0;
        thread::scope(|s| {
            let worker = s.spawn(|| consumer.run(|| {}, |_| sent += 1));
            thread::sleep(Duration::from_millis(50));
            shutdown.trigger();
            gate.notify_all();
            queue.close();
            worker.join().unwrap();
        });
        assert_eq!(sent, 0);
    }
}
