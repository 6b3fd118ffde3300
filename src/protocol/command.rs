//! Outbound commands understood by the hub.
//!
//! Each command knows its wire form, which response prefix ends the exchange, and how many
//! such responses to wait for. Commands without a terminator are fire-and-forget.

use crate::models::cube::{Device, RfAddress, RoomInformation, ThermostatMode};
use crate::protocol::message::{DeviceInformation, MetadataMessage};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use std::time::Duration;

/// Hub-side limit for one `m:` line payload.
const METADATA_CHUNK: usize = 1900;
const INCLUSION_TIMEOUT: Duration = Duration::from_secs(80);

#[derive(Debug, Clone, PartialEq)]
pub enum CubeCommand {
    /// `l:` list devices.
    ListDevices,
    /// `c:` ask for one device's configuration.
    RequestConfiguration { rf_address: RfAddress },
    /// `f:` read the NTP servers, or set them when `servers` is given.
    Ntp { servers: Option<(String, String)> },
    /// `s:` set mode and temperature of a thermostat (or of its room when `room_id != 0`).
    SetTemperature {
        rf_address: RfAddress,
        room_id: u8,
        mode: ThermostatMode,
        temperature: f64,
    },
    /// `t:` make the hub forget devices.
    DeleteDevices { rf_addresses: Vec<RfAddress>, force: bool },
    /// `m:` write room and device names. Holds the encoded payload.
    Metadata { payload: Vec<u8> },
    /// `n:` inclusion mode, waits for a new device to pair.
    Inclusion,
    /// `a:` factory reset of the hub's device configuration.
    Reset,
    /// `q:` quit; the hub closes the connection.
    Quit,
}

impl CubeCommand {
    pub fn metadata(rooms: &[RoomInformation], devices: &[Device]) -> Self {
        let message = MetadataMessage {
            rooms: rooms.to_vec(),
            devices: devices
                .iter()
                .map(|d| DeviceInformation {
                    device_type: d.device_type,
                    rf_address: d.rf_address.clone(),
                    serial_number: d.serial_number.clone(),
                    name: d.name.clone(),
                    room_id: d.room_id,
                })
                .collect(),
        };
        CubeCommand::Metadata {
            payload: message.encode(),
        }
    }

    /// Short identifier used in logs and de-duplication keys.
    pub fn kind(&self) -> &'static str {
        match self {
            CubeCommand::ListDevices => "L",
            CubeCommand::RequestConfiguration { .. } => "C",
            CubeCommand::Ntp { .. } => "F",
            CubeCommand::SetTemperature { .. } => "S",
            CubeCommand::DeleteDevices { .. } => "T",
            CubeCommand::Metadata { .. } => "M",
            CubeCommand::Inclusion => "N",
            CubeCommand::Reset => "A",
            CubeCommand::Quit => "Q",
        }
    }

    pub fn command_string(&self) -> String {
        match self {
            CubeCommand::ListDevices => "l:\r\n".to_string(),
            CubeCommand::RequestConfiguration { rf_address } => format!("c:{}\r\n", rf_address),
            CubeCommand::Ntp { servers: None } => "f:\r\n".to_string(),
            CubeCommand::Ntp {
                servers: Some((first, second)),
            } => format!("f:{},{}\r\n", first, second),
            CubeCommand::SetTemperature {
                rf_address,
                room_id,
                mode,
                temperature,
            } => {
                // 0x04 in the second byte addresses the whole room
                let mut payload = if *room_id == 0 {
                    vec![0x00, 0x00, 0x40, 0x00, 0x00, 0x00]
                } else {
                    vec![0x00, 0x04, 0x40, 0x00, 0x00, 0x00]
                };
                payload.extend_from_slice(&rf_address.to_bytes().unwrap_or_default());
                payload.push(*room_id);
                payload.push(encode_setpoint(*mode, *temperature));
                format!("s:{}\r\n", BASE64.encode(payload))
            }
            CubeCommand::DeleteDevices { rf_addresses, force } => {
                let addresses: Vec<u8> = rf_addresses.iter().filter_map(RfAddress::to_bytes).flatten().collect();
                format!(
                    "t:{:02x},{},{}\r\n",
                    addresses.len() / 3,
                    if *force { "1" } else { "0" },
                    BASE64.encode(addresses)
                )
            }
            CubeCommand::Metadata { payload } => metadata_chunks(payload)
                .iter()
                .enumerate()
                .map(|(i, chunk)| format!("m:{:02x},{}\r\n", i, chunk))
                .collect(),
            CubeCommand::Inclusion => "n:003c\r\n".to_string(),
            CubeCommand::Reset => "a:\r\n".to_string(),
            CubeCommand::Quit => "q:\r\n".to_string(),
        }
    }

    /// Prefix of the response line that ends this command's exchange.
    pub fn terminator(&self) -> Option<&'static str> {
        match self {
            CubeCommand::ListDevices => Some("L:"),
            CubeCommand::RequestConfiguration { .. } => Some("C:"),
            CubeCommand::Ntp { .. } => Some("F:"),
            CubeCommand::SetTemperature { .. } => Some("S:"),
            CubeCommand::DeleteDevices { .. } | CubeCommand::Metadata { .. } | CubeCommand::Reset => Some("A:"),
            CubeCommand::Inclusion => Some("N:"),
            CubeCommand::Quit => None,
        }
    }

    /// Number of terminator lines the hub sends back; one per `m:` line.
    pub fn expected_responses(&self) -> usize {
        match self {
            CubeCommand::Metadata { payload } => metadata_chunks(payload).len(),
            _ => usize::from(self.terminator().is_some()),
        }
    }

    /// Read timeout overriding the session default for the duration of this command.
    pub fn read_timeout(&self) -> Option<Duration> {
        match self {
            CubeCommand::Inclusion => Some(INCLUSION_TIMEOUT),
            _ => None,
        }
    }
}

/// Mode lives in the top two bits, the temperature in half degrees below it.
fn encode_setpoint(mode: ThermostatMode, temperature: f64) -> u8 {
    let half_degrees = (temperature * 2.0).clamp(0.0, 63.0) as u8;
    (mode.code() << 6) | (half_degrees & 0x3f)
}

fn metadata_chunks(payload: &[u8]) -> Vec<String> {
    let encoded = BASE64.encode(payload);
    encoded
        .as_bytes()
        .chunks(METADATA_CHUNK)
        .map(|c| String::from_utf8_lossy(c).to_string())
        .collect()
}
