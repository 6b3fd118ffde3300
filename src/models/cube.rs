//! Domain model of a MAX! Cube installation.
//!
//! Notes
//! - Identities are newtypes; serials are upper-cased and RF addresses lower-cased on
//!   construction, so equality is case-insensitive with respect to the wire.
//! - Every type is `Clone` so the bridge can hand out snapshots instead of references.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// =====================
// Identity newtypes
// =====================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerialNumber(pub String);

impl SerialNumber {
    pub fn new(raw: impl AsRef<str>) -> Self {
        SerialNumber(raw.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Three byte radio address, rendered as six lower-case hex digits.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RfAddress(pub String);

impl RfAddress {
    pub fn new(raw: impl AsRef<str>) -> Self {
        RfAddress(raw.as_ref().trim().to_ascii_lowercase())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        RfAddress(bytes.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// The wire form, or `None` when the address is not exactly six hex digits.
    pub fn to_bytes(&self) -> Option<[u8; 3]> {
        if self.0.len() != 6 {
            return None;
        }
        let mut out = [0u8; 3];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = u8::from_str_radix(self.0.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(out)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RfAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one bridge instance; every listener callback is scoped by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BridgeId(pub String);

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =====================
// Enums
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    Cube,
    HeatingThermostat,
    HeatingThermostatPlus,
    WallMountedThermostat,
    ShutterContact,
    EcoSwitch,
    Invalid,
}

impl DeviceType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => DeviceType::Cube,
            1 => DeviceType::HeatingThermostat,
            2 => DeviceType::HeatingThermostatPlus,
            3 => DeviceType::WallMountedThermostat,
            4 => DeviceType::ShutterContact,
            5 => DeviceType::EcoSwitch,
            _ => DeviceType::Invalid,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DeviceType::Cube => 0,
            DeviceType::HeatingThermostat => 1,
            DeviceType::HeatingThermostatPlus => 2,
            DeviceType::WallMountedThermostat => 3,
            DeviceType::ShutterContact => 4,
            DeviceType::EcoSwitch => 5,
            DeviceType::Invalid => 0xff,
        }
    }

    pub fn is_thermostat(self) -> bool {
        matches!(
            self,
            DeviceType::HeatingThermostat | DeviceType::HeatingThermostatPlus | DeviceType::WallMountedThermostat
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThermostatMode {
    Automatic,
    Manual,
    Vacation,
    Boost,
}

impl ThermostatMode {
    /// Decodes the two low bits of a status flag byte.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => ThermostatMode::Automatic,
            1 => ThermostatMode::Manual,
            2 => ThermostatMode::Vacation,
            _ => ThermostatMode::Boost,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ThermostatMode::Automatic => 0,
            ThermostatMode::Manual => 1,
            ThermostatMode::Vacation => 2,
            ThermostatMode::Boost => 3,
        }
    }
}

impl FromStr for ThermostatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AUTOMATIC" => Ok(ThermostatMode::Automatic),
            "MANUAL" => Ok(ThermostatMode::Manual),
            "VACATION" => Ok(ThermostatMode::Vacation),
            "BOOST" => Ok(ThermostatMode::Boost),
            other => Err(format!("unknown thermostat mode '{}'", other)),
        }
    }
}

// =====================
// Devices
// =====================

/// Type specific part of a device's reported state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceStatus {
    Thermostat {
        mode: ThermostatMode,
        /// Percent open.
        valve_position: u8,
        setpoint: f64,
        actual_temperature: Option<f64>,
    },
    ShutterContact {
        open: bool,
    },
    EcoSwitch {
        mode: ThermostatMode,
    },
    None,
}

/// Health bits shared by every device record of a device list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFlags {
    pub initialized: bool,
    pub answer: bool,
    pub error: bool,
    pub valid: bool,
    pub dst_active: bool,
    pub gateway_known: bool,
    pub panel_locked: bool,
    pub link_error: bool,
    pub battery_low: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub serial_number: SerialNumber,
    pub rf_address: RfAddress,
    pub device_type: DeviceType,
    pub name: String,
    pub room_id: u8,
    pub room_name: String,
    pub flags: DeviceFlags,
    pub status: DeviceStatus,
    /// Generic properties copied from the device's configuration.
    pub properties: BTreeMap<String, String>,
    /// Set whenever a device list changed the reported state; cleared once listeners saw it.
    pub updated: bool,
    pub actual_temperature_updated_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn from_configuration(config: &DeviceConfiguration) -> Self {
        Device {
            serial_number: config.serial_number.clone(),
            rf_address: config.rf_address.clone(),
            device_type: config.device_type,
            name: config.name.clone(),
            room_id: config.room_id,
            room_name: config.room_name.clone(),
            flags: DeviceFlags::default(),
            status: DeviceStatus::None,
            properties: config.properties.clone(),
            updated: false,
            actual_temperature_updated_at: None,
        }
    }

    pub fn mode(&self) -> Option<ThermostatMode> {
        match self.status {
            DeviceStatus::Thermostat { mode, .. } | DeviceStatus::EcoSwitch { mode } => Some(mode),
            _ => None,
        }
    }

    pub fn setpoint(&self) -> Option<f64> {
        match self.status {
            DeviceStatus::Thermostat { setpoint, .. } => Some(setpoint),
            _ => None,
        }
    }

    pub fn set_mode(&mut self, new_mode: ThermostatMode) {
        if let DeviceStatus::Thermostat { mode, .. } | DeviceStatus::EcoSwitch { mode } = &mut self.status {
            *mode = new_mode;
        }
    }
}

/// Per-device settings reported by configuration messages and room maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    pub serial_number: SerialNumber,
    pub rf_address: RfAddress,
    pub device_type: DeviceType,
    pub name: String,
    pub room_id: u8,
    pub room_name: String,
    pub firmware_version: Option<String>,
    pub comfort_temperature: Option<f64>,
    pub eco_temperature: Option<f64>,
    pub max_setpoint: Option<f64>,
    pub min_setpoint: Option<f64>,
    pub temperature_offset: Option<f64>,
    pub window_open_temperature: Option<f64>,
    /// Minutes.
    pub window_open_duration: Option<u32>,
    /// Minutes.
    pub boost_duration: Option<u32>,
    /// Percent.
    pub boost_valve_position: Option<u32>,
    /// Percent.
    pub max_valve_setting: Option<u32>,
    /// Percent.
    pub valve_offset: Option<u32>,
    pub properties: BTreeMap<String, String>,
}

impl DeviceConfiguration {
    pub fn new(serial_number: SerialNumber, rf_address: RfAddress, device_type: DeviceType) -> Self {
        DeviceConfiguration {
            serial_number,
            rf_address,
            device_type,
            name: String::new(),
            room_id: 0,
            room_name: String::new(),
            firmware_version: None,
            comfort_temperature: None,
            eco_temperature: None,
            max_setpoint: None,
            min_setpoint: None,
            temperature_offset: None,
            window_open_temperature: None,
            window_open_duration: None,
            boost_duration: None,
            boost_valve_position: None,
            max_valve_setting: None,
            valve_offset: None,
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInformation {
    pub position: u8,
    pub name: String,
    /// Address of the room's group, used when commanding a whole room.
    pub rf_address: RfAddress,
}

/// Identity of the hub itself, learnt from its first hello message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CubeInfo {
    pub serial_number: SerialNumber,
    pub rf_address: RfAddress,
    pub firmware_version: String,
    pub cube_time: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubHealth {
    /// Percent of the radio budget used recently.
    pub duty_cycle: u32,
    pub free_memory_slots: u32,
}

// =====================
// Events
// =====================

/// What listeners are told about a device. Each event carries a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "device", rename_all = "snake_case")]
pub enum DeviceEvent {
    StateChanged(Device),
    Added(Device),
    Removed(Device),
    ConfigUpdated(Device),
}

impl DeviceEvent {
    pub fn device(&self) -> &Device {
        match self {
            DeviceEvent::StateChanged(d)
            | DeviceEvent::Added(d)
            | DeviceEvent::Removed(d)
            | DeviceEvent::ConfigUpdated(d) => d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_normalise_case() {
        assert_eq!(SerialNumber::new(" keq0000001 "), SerialNumber::new("KEQ0000001"));
        assert_eq!(RfAddress::new("0A00FF").as_str(), "0a00ff");
    }

    #[test]
    fn rf_address_bytes() {
        let rf = RfAddress::from_bytes(&[0x0a, 0x00, 0x01]);
        assert_eq!(rf.as_str(), "0a0001");
        assert_eq!(rf.to_bytes(), Some([0x0a, 0x00, 0x01]));
        assert_eq!(RfAddress::new("0a00").to_bytes(), None);
        assert_eq!(RfAddress::new("zz0001").to_bytes(), None);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("boost".parse::<ThermostatMode>(), Ok(ThermostatMode::Boost));
        assert!("party".parse::<ThermostatMode>().is_err());
        assert_eq!(ThermostatMode::from_bits(0x19), ThermostatMode::Manual);
    }
}
