//! In-memory registry of one hub's devices, configurations and rooms.
//! Keyed by serial number so iteration (and therefore notification) is in serial order.

use crate::models::cube::{
    CubeInfo, Device, DeviceConfiguration, DeviceStatus, RoomInformation, SerialNumber,
};
use crate::protocol::message::{DeviceReading, MetadataMessage, NtpMessage, configuration_properties};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct CubeState {
    pub devices: BTreeMap<SerialNumber, Device>,
    pub configurations: BTreeMap<SerialNumber, DeviceConfiguration>,
    pub rooms: Vec<RoomInformation>,
    /// Serials already announced to listeners with an `Added` event.
    pub last_active: BTreeSet<SerialNumber>,
    pub cube_info: Option<CubeInfo>,
    pub ntp_servers: Option<NtpMessage>,
}

fn room_name(rooms: &[RoomInformation], room_id: u8) -> Option<String> {
    rooms.iter().find(|r| r.position == room_id).map(|r| r.name.clone())
}

fn actual_temperature(status: &DeviceStatus) -> Option<f64> {
    match status {
        DeviceStatus::Thermostat { actual_temperature, .. } => *actual_temperature,
        _ => None,
    }
}

impl CubeState {
    pub fn new() -> Self {
        Self::default()
    }


    /// Replaces the settings of one device. Name and room name are not part of a configuration
    /// message and survive from the room map. Returns the updated device when it is known and
    /// its configuration differs from the stored one.
    pub fn apply_configuration(&mut self, mut config: DeviceConfiguration) -> Option<Device> {
        let previous = self.configurations.get(&config.serial_number);
        if let Some(previous) = previous {
            config.name = previous.name.clone();
            let mut properties = previous.properties.clone();
            properties.extend(std::mem::take(&mut config.properties));
            config.properties = properties;
        }
        config.room_name = room_name(&self.rooms, config.room_id)
            .or_else(|| previous.map(|p| p.room_name.clone()))
            .unwrap_or_default();
        let changed = previous != Some(&config);

        let device = self.devices.get_mut(&config.serial_number).map(|d| {
            d.room_id = config.room_id;
            d.room_name = config.room_name.clone();
            d.properties.extend(config.properties.clone());
            d.clone()
        });
        self.configurations.insert(config.serial_number.clone(), config);
        device.filter(|_| changed)
    }

    /// Replaces the room table and refreshes names and rooms of every known configuration and device.
    pub fn apply_metadata(&mut self, metadata: &MetadataMessage) {
        self.rooms = metadata.rooms.clone();

        for info in &metadata.devices {
            let config = self
                .configurations
                .entry(info.serial_number.clone())
                .or_insert_with(|| {
                    DeviceConfiguration::new(info.serial_number.clone(), info.rf_address.clone(), info.device_type)
                });
            config.rf_address = info.rf_address.clone();
            config.device_type = info.device_type;
            config.name = info.name.clone();
            config.room_id = info.room_id;
            config.room_name = room_name(&self.rooms, info.room_id).unwrap_or_default();
            let properties = configuration_properties(config);
            config.properties.extend(properties);
        }

        let rooms = &self.rooms;
        for device in self.devices.values_mut() {
            if let Some(info) = metadata.devices.iter().find(|i| i.serial_number == device.serial_number) {
                device.name = info.name.clone();
                device.room_id = info.room_id;
            }
            if let Some(name) = room_name(rooms, device.room_id) {
                device.room_name = name;
            }
        }
    }

    /// Applies one device-list record. Returns `false` when no configuration names the address yet.
    pub fn apply_reading(&mut self, reading: &DeviceReading, now: DateTime<Utc>) -> bool {
        let Some(config) = self.configurations.values().find(|c| c.rf_address == reading.rf_address) else {
            return false;
        };
        let device = self
            .devices
            .entry(config.serial_number.clone())
            .or_insert_with(|| Device {
                updated: true,
                ..Device::from_configuration(config)
            });

        let status = reading.status_for(device.device_type);
        let previous_actual = actual_temperature(&device.status);
        let actual = actual_temperature(&status);
        if actual.is_some() && actual != previous_actual {
            device.actual_temperature_updated_at = Some(now);
        }
        if device.flags != reading.flags || device.status != status {
            device.updated = true;
        }
        device.flags = reading.flags;
        device.status = status;
        true
    }

    pub fn remove_device(&mut self, serial: &SerialNumber) -> Option<Device> {
        self.configurations.remove(serial);
        self.last_active.remove(serial);
        self.devices.remove(serial)
    }

    /// Forgets everything the hub reported; returns the devices that were known.
    pub fn clear(&mut self) -> Vec<Device> {
        let removed = std::mem::take(&mut self.devices).into_values().collect();
        self.configurations.clear();
        self.rooms.clear();
        self.last_active.clear();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cube::{DeviceType, ThermostatMode};
    use crate::protocol::message::Message;

    const GREETING: &str = include_str!("../../tests/data/cube-greeting.txt");

    fn apply(state: &mut CubeState, line: &str) {
        match Message::parse_line(line).unwrap() {
            Message::Metadata(m) => state.apply_metadata(&m),
            Message::Configuration(c) => {
                state.apply_configuration(c.configuration);
            }
            Message::DeviceList(l) => {
                for r in &l.readings {
                    state.apply_reading(r, Utc::now());
                }
            }
            _ => {}
        }
    }

    fn loaded() -> CubeState {
        let mut state = CubeState::new();
        for line in GREETING.lines().skip(1) {
            apply(&mut state, line);
        }
        state
    }

    #[test]
    fn greeting_builds_devices_with_names_and_rooms() {
        let state = loaded();
        assert_eq!(state.devices.len(), 2);
        let ht = &state.devices[&SerialNumber::new("KEQ0000001")];
        assert_eq!(ht.name, "Radiator");
        assert_eq!(ht.room_name, "Living");
        assert_eq!(ht.device_type, DeviceType::HeatingThermostat);
        assert_eq!(ht.mode(), Some(ThermostatMode::Manual));
        assert!(ht.updated);
        assert!(ht.actual_temperature_updated_at.is_some());
        assert_eq!(ht.properties.get("comfortTemp").map(String::as_str), Some("21.5"));
        let config = &state.configurations[&SerialNumber::new("KEQ0000001")];
        assert_eq!(config.name, "Radiator");
        assert_eq!(config.comfort_temperature, Some(21.5));
    }

    #[test]
    fn replaying_a_device_list_is_idempotent() {
        let mut state = loaded();
        let list = GREETING.lines().nth(4).unwrap();
        let before = state.devices.clone();
        apply(&mut state, list);
        assert_eq!(state.devices, before);
    }

    #[test]
    fn reading_without_configuration_is_skipped() {
        let mut state = CubeState::new();
        let Message::DeviceList(l) = Message::parse_line(GREETING.lines().nth(4).unwrap()).unwrap() else {
            panic!("expected device list");
        };
        assert!(!state.apply_reading(&l.readings[0], Utc::now()));
        assert!(state.devices.is_empty());
    }

    #[test]
    fn changed_reading_marks_device_updated() {
        let mut state = loaded();
        for d in state.devices.values_mut() {
            d.updated = false;
        }
        apply(&mut state, "L:CwoAAQASmSgsAAAABgoAAgASEA==");
        let ht = &state.devices[&SerialNumber::new("KEQ0000001")];
        assert!(ht.updated);
        assert!(ht.flags.battery_low);
        assert_eq!(ht.setpoint(), Some(22.0));
        let sc = &state.devices[&SerialNumber::new("KEQ0000002")];
        assert_eq!(sc.status, DeviceStatus::ShutterContact { open: false });
    }

    #[test]
    fn configuration_keeps_names_from_room_map() {
        let mut state = loaded();
        let line = GREETING.lines().nth(2).unwrap();
        let Message::Configuration(c) = Message::parse_line(line).unwrap() else {
            panic!("expected configuration");
        };
        let mut moved = c.configuration.clone();
        moved.room_id = 2;
        let device = state.apply_configuration(moved).unwrap();
        assert_eq!(device.name, "Radiator");
        assert_eq!(device.room_id, 2);
        assert_eq!(state.configurations[&SerialNumber::new("KEQ0000001")].name, "Radiator");
    }

    #[test]
    fn repeated_configuration_is_not_a_change() {
        let mut state = loaded();
        let line = GREETING.lines().nth(2).unwrap();
        let Message::Configuration(c) = Message::parse_line(line).unwrap() else {
            panic!("expected configuration");
        };
        let before = state.configurations.clone();
        assert!(state.apply_configuration(c.configuration).is_none());
        assert_eq!(state.configurations, before);
    }

    #[test]
    fn remove_and_clear() {
        let mut state = loaded();
        state.last_active.insert(SerialNumber::new("KEQ0000001"));
        let removed = state.remove_device(&SerialNumber::new("KEQ0000001")).unwrap();
        assert_eq!(removed.rf_address.as_str(), "0a0001");
        assert!(state.last_active.is_empty());
        assert!(!state.configurations.contains_key(&SerialNumber::new("KEQ0000001")));
        assert_eq!(state.clear().len(), 1);
        assert!(state.rooms.is_empty());
    }
}
