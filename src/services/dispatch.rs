//! Routes decoded messages to the registry and hub health, and resolves adapter commands.
//!
//! Nothing here does I/O. Follow-up commands are returned for the caller to enqueue.

use crate::models::cube::{DeviceEvent, DeviceType, SerialNumber, ThermostatMode};
use crate::protocol::command::CubeCommand;
use crate::protocol::message::Message;
use crate::services::queue::{Channel, ChannelCommand, CommandPayload, DutyCycleGate, SendCommand};
use crate::services::registry::CubeState;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};

pub const DEFAULT_ON_TEMPERATURE: f64 = 30.5;
pub const DEFAULT_OFF_TEMPERATURE: f64 = 4.5;

#[derive(Debug, Default)]
pub struct Dispatched {
    pub follow_ups: Vec<SendCommand>,
    pub events: Vec<DeviceEvent>,
    /// A hello or send-status message reported different hub health.
    pub health_changed: bool,
}

pub fn dispatch(message: Message, state: &mut CubeState, gate: &DutyCycleGate, now: DateTime<Utc>) -> Dispatched {
    let mut out = Dispatched::default();
    match message {
        Message::Hello(hello) => {
            out.health_changed = gate.update(hello.health);
            debug!(
                "H: duty cycle {}%, {} free memory slots",
                hello.health.duty_cycle, hello.health.free_memory_slots
            );
            if state.cube_info.is_none() {
                info!(
                    "Hub {} (firmware {}) at RF address {}",
                    hello.serial_number, hello.firmware_version, hello.rf_address
                );
                state.cube_info = Some(hello.cube_info());
                out.follow_ups.push(SendCommand::new(
                    hello.serial_number.clone(),
                    CommandPayload::Cube(CubeCommand::Ntp { servers: None }),
                    "Request NTP info",
                ));
            }
        }
        Message::DeviceList(list) => {
            for reading in &list.readings {
                if !state.apply_reading(reading, now) {
                    debug!("L: no configuration for RF address {} yet; skipping", reading.rf_address);
                }
            }
        }
        Message::Configuration(config) => {
            let serial = config.configuration.serial_number.clone();
            debug!("C: configuration of {} ({})", serial, config.configuration.rf_address);
            if let Some(device) = state.apply_configuration(config.configuration) {
                out.events.push(DeviceEvent::ConfigUpdated(device));
            }
        }
        Message::Metadata(metadata) => {
            debug!(
                "M: {} room(s), {} device(s)",
                metadata.rooms.len(),
                metadata.devices.len()
            );
            state.apply_metadata(&metadata);
        }
        Message::NewDevice(new_device) => {
            if new_device.rf_address.is_empty() {
                debug!("N: no new device found");
            } else {
                info!(
                    "N: new {:?} {} at RF address {}",
                    new_device.device_type, new_device.serial_number, new_device.rf_address
                );
                out.follow_ups.push(SendCommand::new(
                    new_device.serial_number,
                    CommandPayload::Cube(CubeCommand::RequestConfiguration {
                        rf_address: new_device.rf_address,
                    }),
                    "Request configuration of new device",
                ));
            }
        }
        Message::SendStatus(status) => {
            out.health_changed = gate.update(status.health);
            if status.command_discarded {
                warn!(
                    "Last send command discarded by the hub (duty cycle {}%, {} free memory slots)",
                    status.health.duty_cycle, status.health.free_memory_slots
                );
            } else {
                debug!(
                    "S: duty cycle {}%, {} free memory slots",
                    status.health.duty_cycle, status.health.free_memory_slots
                );
            }
        }
        Message::Ntp(ntp) => {
            debug!("F: NTP servers {} {:?}", ntp.ntp_server1, ntp.ntp_server2);
            state.ntp_servers = Some(ntp);
        }
        Message::Ack => debug!("A: acknowledged"),
        Message::Unsupported { tag, body } => debug!("{}: message not handled ({} bytes)", tag, body.len()),
    }
    out
}

// =====================
// Command resolution
// =====================

#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionError {
    UnknownDevice(SerialNumber),
    NotAThermostat { serial: SerialNumber, device_type: DeviceType },
    UnsupportedCommand { channel: Channel, command: ChannelCommand },
}

impl core::fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ResolutionError::UnknownDevice(serial) => write!(f, "device {} is not listed", serial),
            ResolutionError::NotAThermostat { serial, device_type } => {
                write!(f, "device {} is a {:?}, not a thermostat", serial, device_type)
            }
            ResolutionError::UnsupportedCommand { channel, command } => {
                write!(f, "channel {} does not accept {:?}", channel.id(), command)
            }
        }
    }
}

impl std::error::Error for ResolutionError {}

/// Turns a queued command into the wire command to send. Mode changes are applied to the
/// registry right away so later setpoint commands carry the new mode.
pub fn resolve(command: &SendCommand, state: &mut CubeState) -> Result<CubeCommand, ResolutionError> {
    let (channel, value) = match &command.payload {
        CommandPayload::Cube(cube) => return Ok(cube.clone()),
        CommandPayload::Channel { channel, command } => (*channel, command),
    };

    let device = state
        .devices
        .get_mut(&command.serial)
        .ok_or_else(|| ResolutionError::UnknownDevice(command.serial.clone()))?;
    if !device.device_type.is_thermostat() {
        return Err(ResolutionError::NotAThermostat {
            serial: device.serial_number.clone(),
            device_type: device.device_type,
        });
    }
    let unsupported = || ResolutionError::UnsupportedCommand {
        channel,
        command: value.clone(),
    };
    let current_mode = device.mode().unwrap_or(ThermostatMode::Automatic);
    let setpoint = device.setpoint().unwrap_or(DEFAULT_OFF_TEMPERATURE);

    let (mode, temperature) = match (channel, value) {
        (Channel::SetTemp, ChannelCommand::Temperature(t)) => (current_mode, round_tenths(*t)),
        (Channel::SetTemp, ChannelCommand::OnOff(on)) => (
            current_mode,
            if *on { DEFAULT_ON_TEMPERATURE } else { DEFAULT_OFF_TEMPERATURE },
        ),
        (Channel::Mode, ChannelCommand::Text(text)) => match text.parse::<ThermostatMode>() {
            Ok(ThermostatMode::Automatic) => (ThermostatMode::Automatic, 0.0),
            Ok(mode @ (ThermostatMode::Boost | ThermostatMode::Manual)) => (mode, setpoint),
            _ => return Err(unsupported()),
        },
        _ => return Err(unsupported()),
    };

    if channel == Channel::Mode {
        device.set_mode(mode);
    }
    Ok(CubeCommand::SetTemperature {
        rf_address: device.rf_address.clone(),
        room_id: device.room_id,
        mode,
        temperature,
    })
}

/// Half-up to one decimal.
fn round_tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
