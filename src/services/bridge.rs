//! The gateway engine for one hub.
//!
//! Owns the line session, message processor, registry, backup recorder, duty-cycle gate and
//! command queue, plus two background threads:
//! - `cube-poll`: lists devices on a steady cadence and notifies listeners.
//! - `cube-queue`: sends queued commands, paced by the duty-cycle gate.
//!
//! Lock order: session before state, backup or gate. Listeners are called with no lock held.

use crate::client::{CubeClient, CubeClientError};
use crate::config::BridgeSettings;
use crate::models::cube::{
    BridgeId, CubeInfo, Device, DeviceConfiguration, DeviceEvent, HubHealth, RoomInformation, SerialNumber,
};
use crate::protocol::command::CubeCommand;
use crate::protocol::message::{NtpMessage, UnprocessableMessage};
use crate::protocol::processor::MessageProcessor;
use crate::services::backup::{BackupRecorder, BackupSink, BackupState, FileSink};
use crate::services::dispatch::{Dispatched, dispatch, resolve};
use crate::services::queue::{
    Channel, ChannelCommand, CommandId, CommandPayload, CommandQueue, DutyCycleGate, QueueConsumer, QueueError,
    SendCommand,
};
use crate::services::realtime;
use crate::services::registry::CubeState;
use crate::utils::{Shutdown, join_with_timeout};
use chrono::{Local, Utc};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// `refresh()` is skipped when the last poll is younger than this.
pub const REFRESH_CACHE: Duration = Duration::from_secs(10);

/// Receives events of one bridge. Called from the bridge's threads, never under a bridge lock.
pub trait DeviceStatusListener: Send + Sync {
    fn on_device_event(&self, bridge: &BridgeId, event: &DeviceEvent);

    /// Only called when dropped-command reporting is enabled.
    fn on_command_dropped(&self, _bridge: &BridgeId, _command: &SendCommand, _reason: &str) {}

    fn on_hub_health(&self, _bridge: &BridgeId, _health: HubHealth) {}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Online,
    Offline { detail: String },
}

struct Session {
    client: CubeClient,
    processor: MessageProcessor,
}

struct StatusCell {
    current: ConnectionStatus,
    previous_online: bool,
}

struct Shared {
    settings: BridgeSettings,
    session: Mutex<Session>,
    state: Mutex<CubeState>,
    backup: Mutex<BackupRecorder>,
    gate: DutyCycleGate,
    queue: CommandQueue,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn DeviceStatusListener>)>>,
    next_listener: AtomicU64,
    status: Mutex<StatusCell>,
    last_refresh: Mutex<Option<Instant>>,
    shutdown: Shutdown,
}

pub struct CubeBridge {
    shared: Arc<Shared>,
    workers: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl CubeBridge {
    pub fn new(settings: BridgeSettings) -> Self {
        let shared = Shared {
            session: Mutex::new(Session {
                client: CubeClient::new(settings.session.clone()),
                processor: MessageProcessor::new(),
            }),
            state: Mutex::new(CubeState::new()),
            backup: Mutex::new(BackupRecorder::new()),
            gate: DutyCycleGate::new(),
            queue: CommandQueue::new(settings.queue_capacity),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            // offline until the first poll; a failing first poll still reports the loss
            status: Mutex::new(StatusCell {
                current: ConnectionStatus::Offline {
                    detail: "not polled yet".to_string(),
                },
                previous_online: true,
            }),
            last_refresh: Mutex::new(None),
            shutdown: Shutdown::new(),
            settings,
        };
        CubeBridge {
            shared: Arc::new(shared),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &BridgeId {
        &self.shared.settings.bridge_id
    }

    /// Spawns the poll and queue threads. A stopped bridge cannot be restarted.
    pub fn start(&self) -> Result<(), String> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Err(format!("bridge {} is already running", self.id()));
        }
        if self.shared.shutdown.is_triggered() {
            return Err(format!("bridge {} was stopped", self.id()));
        }
        let settings = &self.shared.settings;
        info!(
            "Starting bridge {} for {}:{} (refresh={}s, exclusive={}, max_requests={})",
            settings.bridge_id,
            settings.session.host,
            settings.session.port,
            settings.refresh_interval.as_secs(),
            settings.session.exclusive,
            settings.session.max_requests_per_connection
        );

        if settings.backup_on_start {
            self.backup()?;
        }
        if let Some((ntp1, ntp2)) = settings.ntp_servers.clone() {
            let _ = self.update_ntp_servers(&ntp1, &ntp2);
        }

        let poll = {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("cube-poll".to_string())
                .spawn(move || {
                    realtime::run_loop(shared.settings.refresh_interval, &shared.shutdown, || shared.refresh_data())
                })
                .map_err(|e| format!("spawning poll thread failed: {}", e))?
        };
        workers.push(("cube-poll", poll));

        let consumer = {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("cube-queue".to_string())
                .spawn(move || shared.run_queue())
                .map_err(|e| format!("spawning queue thread failed: {}", e))?
        };
        workers.push(("cube-queue", consumer));
        Ok(())
    }

    /// Stops both threads, discarding queued commands, and closes the session.
    pub fn stop(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        self.shared.shutdown.trigger();
        self.shared.gate.notify_all();
        self.shared.queue.close();
        for (name, handle) in workers {
            join_with_timeout(name, handle, self.shared.settings.join_timeout);
        }
        self.shared.session.lock().client.close();
        debug!("Bridge {} stopped", self.id());
    }

    // =====================
    // Commands
    // =====================

    pub fn queue_command(
        &self,
        serial: &SerialNumber,
        channel: Channel,
        command: ChannelCommand,
        description: impl Into<String>,
    ) -> Result<CommandId, QueueError> {
        self.shared.queue_send(SendCommand::new(
            serial.clone(),
            CommandPayload::Channel { channel, command },
            description,
        ))
    }

    pub fn queue_cube_command(
        &self,
        serial: &SerialNumber,
        command: CubeCommand,
        description: impl Into<String>,
    ) -> Result<CommandId, QueueError> {
        self.shared
            .queue_send(SendCommand::new(serial.clone(), CommandPayload::Cube(command), description))
    }

    /// Commands waiting for the queue worker, oldest first.
    pub fn pending_commands(&self) -> Vec<SendCommand> {
        self.shared.queue.snapshot()
    }

    /// Makes the hub forget a device, then rewrites names and reloads. The device leaves the
    /// registry immediately.
    pub fn send_device_delete(&self, serial: &SerialNumber) -> Result<(), String> {
        let device = self
            .get_device(serial)
            .ok_or_else(|| format!("device {} is not listed", serial))?;
        self.queue_cube_command(
            serial,
            CubeCommand::DeleteDevices {
                rf_addresses: vec![device.rf_address.clone()],
                force: true,
            },
            format!("Delete device {} from hub", serial),
        )
        .map_err(|e| e.to_string())?;
        self.shared.state.lock().remove_device(serial);
        self.send_device_and_room_name_update(&format!("Remove name entry for {}", serial))?;
        self.queue_cube_command(serial, CubeCommand::Quit, "Reload data")
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Writes the registry's room and device names back to the hub.
    pub fn send_device_and_room_name_update(&self, description: &str) -> Result<(), String> {
        let command = {
            let state = self.shared.state.lock();
            if state.devices.is_empty() {
                debug!("No devices to build a room and device name update from");
                return Ok(());
            }
            let devices: Vec<Device> = state.devices.values().cloned().collect();
            CubeCommand::metadata(&state.rooms, &devices)
        };
        self.queue_cube_command(&self.shared.cube_serial(), command, description)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    pub fn update_ntp_servers(&self, ntp_server1: &str, ntp_server2: &str) -> Result<CommandId, QueueError> {
        self.queue_cube_command(
            &self.shared.cube_serial(),
            CubeCommand::Ntp {
                servers: Some((ntp_server1.to_string(), ntp_server2.to_string())),
            },
            "Update NTP info",
        )
    }

    /// Factory-resets the hub's device table; every known device is reported removed.
    pub fn reset_cube_configuration(&self) -> Result<(), String> {
        info!("Resetting device configuration of hub {}", self.id());
        self.shared
            .send_cube_command(&CubeCommand::Reset)
            .map_err(|e| format!("reset failed: {}", e))?;
        let removed = {
            let mut state = self.shared.state.lock();
            state.cube_info = None;
            state.clear()
        };
        self.shared
            .notify(removed.into_iter().map(DeviceEvent::Removed).collect());
        Ok(())
    }

    /// Puts the hub into pairing mode and blocks until it reports (up to 80 s).
    pub fn start_inclusion(&self) -> Result<(), String> {
        if !matches!(self.status(), ConnectionStatus::Online) {
            return Err("need to be online to start inclusion mode".to_string());
        }
        info!("Starting inclusion mode on hub {}", self.id());
        let result = self
            .shared
            .send_cube_command(&CubeCommand::Inclusion)
            .map_err(|e| format!("inclusion mode failed: {}", e));
        debug!("Inclusion mode ended");
        result
    }

    // =====================
    // Registry and status
    // =====================

    pub fn get_device(&self, serial: &SerialNumber) -> Option<Device> {
        self.shared.state.lock().devices.get(serial).cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.shared.state.lock().devices.values().cloned().collect()
    }

    pub fn rooms(&self) -> Vec<RoomInformation> {
        self.shared.state.lock().rooms.clone()
    }

    pub fn configuration(&self, serial: &SerialNumber) -> Option<DeviceConfiguration> {
        self.shared.state.lock().configurations.get(serial).cloned()
    }

    pub fn cube_info(&self) -> Option<CubeInfo> {
        self.shared.state.lock().cube_info.clone()
    }

    /// NTP servers last reported by the hub.
    pub fn ntp_servers(&self) -> Option<NtpMessage> {
        self.shared.state.lock().ntp_servers.clone()
    }

    pub fn hub_health(&self) -> HubHealth {
        self.shared.gate.health()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.lock().current.clone()
    }

    pub fn backup_state(&self) -> BackupState {
        self.shared.backup.lock().state()
    }

    // =====================
    // Listeners
    // =====================

    pub fn register_listener(&self, listener: Arc<dyn DeviceStatusListener>) -> ListenerId {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.lock().push((id, listener));
        id
    }

    /// Removing a listener makes the next poll announce every device as added again.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let removed = {
            let mut listeners = self.shared.listeners.lock();
            let before = listeners.len();
            listeners.retain(|(l, _)| *l != id);
            listeners.len() != before
        };
        if removed {
            self.shared.state.lock().last_active.clear();
        }
        removed
    }

    // =====================
    // Polling and backup
    // =====================

    /// Polls unless the last poll is younger than [`REFRESH_CACHE`]. Returns whether it polled.
    pub fn refresh(&self) -> bool {
        let fresh = self
            .shared
            .last_refresh
            .lock()
            .is_some_and(|at| at.elapsed() < REFRESH_CACHE);
        if fresh {
            debug!("Skipping refresh; last poll is recent");
            return false;
        }
        self.poll_now();
        true
    }

    pub fn poll_now(&self) {
        self.shared.refresh_data();
    }

    /// Mirrors the next full refresh into `{backup_dir}/cube-backup-yyyyMMdd-HHmm.txt`.
    pub fn backup(&self) -> Result<PathBuf, String> {
        let dir = &self.shared.settings.backup_dir;
        let sink = FileSink::create(dir, Local::now())
            .map_err(|e| format!("creating backup file in {} failed: {}", dir.display(), e))?;
        let path = sink.path().to_path_buf();
        self.backup_into(Box::new(sink));
        Ok(path)
    }

    /// Like [`CubeBridge::backup`] with a caller-provided sink. Closes the session so the next
    /// exchange starts with a full greeting.
    pub fn backup_into(&self, sink: Box<dyn BackupSink>) {
        let mut session = self.shared.session.lock();
        session.client.close();
        self.shared.backup.lock().request(sink);
    }
}

impl Drop for CubeBridge {
    fn drop(&mut self) {
        if !self.workers.lock().is_empty() {
            self.stop();
        }
    }
}

impl Shared {
    /// Sends one command through the session; every line read goes through [`Shared::handle_line`].
    fn send_cube_command(&self, command: &CubeCommand) -> Result<(), CubeClientError> {
        let mut outcome = Dispatched::default();
        let result = {
            let mut session = self.session.lock();
            let Session { client, processor } = &mut *session;
            client.send(command, &mut |line| self.handle_line(line, processor, &mut outcome))
        };

        for follow_up in outcome.follow_ups {
            let _ = self.queue_send(follow_up);
        }
        self.notify(outcome.events);
        if outcome.health_changed {
            let health = self.gate.health();
            let listeners = self.listener_snapshot();
            for listener in &listeners {
                listener.on_hub_health(&self.settings.bridge_id, health);
            }
        }
        result
    }

    fn handle_line(&self, line: &str, processor: &mut MessageProcessor, outcome: &mut Dispatched) {
        trace!("Read: {}", line);
        self.backup.lock().record_line(line);

        if let Err(e) = processor.add_line(line) {
            match e {
                UnprocessableMessage::NoRoomInformation => info!("No rooms information found"),
                other => debug!("Skipping unprocessable input: {}", other),
            }
            processor.reset();
            return;
        }
        if let Some(message) = processor.pull() {
            let tag = message.tag();
            let dispatched = {
                let mut state = self.state.lock();
                dispatch(message, &mut state, &self.gate, Utc::now())
            };
            self.backup.lock().observe_message(tag);
            outcome.follow_ups.extend(dispatched.follow_ups);
            outcome.events.extend(dispatched.events);
            outcome.health_changed |= dispatched.health_changed;
        }
    }

    fn refresh_data(&self) {
        *self.last_refresh.lock() = Some(Instant::now());
        match self.send_cube_command(&CubeCommand::ListDevices) {
            Ok(()) => {
                self.set_online();
                let events = {
                    let mut state = self.state.lock();
                    let CubeState {
                        devices, last_active, ..
                    } = &mut *state;
                    let mut events = Vec::with_capacity(devices.len());
                    for device in devices.values_mut() {
                        if last_active.contains(&device.serial_number) {
                            events.push(DeviceEvent::StateChanged(device.clone()));
                        } else {
                            device.updated = true;
                            events.push(DeviceEvent::Added(device.clone()));
                            last_active.insert(device.serial_number.clone());
                        }
                        device.updated = false;
                    }
                    events
                };
                self.notify(events);
            }
            Err(e) => self.set_offline(&e.to_string()),
        }
    }

    fn set_online(&self) {
        let mut status = self.status.lock();
        if status.current != ConnectionStatus::Online {
            info!("Bridge {} is online", self.settings.bridge_id);
        }
        status.current = ConnectionStatus::Online;
        status.previous_online = true;
    }

    fn set_offline(&self, detail: &str) {
        let lost = {
            let mut status = self.status.lock();
            let lost = status.previous_online;
            status.previous_online = false;
            status.current = ConnectionStatus::Offline {
                detail: detail.to_string(),
            };
            lost
        };
        if lost {
            warn!("Bridge {} connection lost: {}", self.settings.bridge_id, detail);
            self.state.lock().last_active.clear();
        } else {
            debug!("Bridge {} still offline: {}", self.settings.bridge_id, detail);
        }
    }

    fn run_queue(&self) {
        let consumer = QueueConsumer {
            queue: &self.queue,
            gate: &self.gate,
            shutdown: &self.shutdown,
            command_delay: self.settings.command_delay,
            duty_cycle_wait: self.settings.duty_cycle_wait,
        };
        consumer.run(|| self.session.lock().client.close(), |command| self.send_queued(command));
    }

    fn send_queued(&self, command: SendCommand) {
        let resolved = {
            let mut state = self.state.lock();
            resolve(&command, &mut state)
        };
        let cube_command = match resolved {
            Ok(c) => c,
            Err(e) => {
                warn!("Dropping command {} ({}): {}", command.id, command.description, e);
                self.report_dropped(&command, &e.to_string());
                return;
            }
        };
        debug!(
            "Command {} ({}) sent to hub at {}",
            command.id, command.description, self.settings.session.host
        );
        match self.send_cube_command(&cube_command) {
            Ok(()) => trace!("Command {} completed", command.id),
            Err(e) => debug!("Error sending command {} ({}): {}", command.id, command.description, e),
        }
    }

    fn queue_send(&self, command: SendCommand) -> Result<CommandId, QueueError> {
        let reportable = self.settings.report_dropped_commands.then(|| command.clone());
        let key = command.key().to_string();
        match self.queue.offer(command) {
            Ok(id) => {
                debug!("Command queued id {} ({})", id, key);
                Ok(id)
            }
            Err(e) => {
                warn!("Dropping command {}: {}", key, e);
                if let Some(command) = reportable {
                    self.report_dropped(&command, &e.to_string());
                }
                Err(e)
            }
        }
    }

    fn report_dropped(&self, command: &SendCommand, reason: &str) {
        if !self.settings.report_dropped_commands {
            return;
        }
        for listener in &self.listener_snapshot() {
            listener.on_command_dropped(&self.settings.bridge_id, command, reason);
        }
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn DeviceStatusListener>> {
        self.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    fn notify(&self, events: Vec<DeviceEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listener_snapshot();
        for event in &events {
            for listener in &listeners {
                listener.on_device_event(&self.settings.bridge_id, event);
            }
        }
    }

    /// Serial used for commands addressed to the hub itself.
    fn cube_serial(&self) -> SerialNumber {
        self.state
            .lock()
            .cube_info
            .as_ref()
            .map(|c| c.serial_number.clone())
            .unwrap_or_else(|| SerialNumber::new(self.settings.bridge_id.0.as_str()))
    }
}
