//! Typed decoding of the hub's line protocol.
//!
//! Every line starts with an upper-case type letter and a colon. Binary payloads are base64;
//! scalar fields are comma separated and mostly hexadecimal.
//!
//! | tag | meaning                  | body                                         |
//! |-----|--------------------------|----------------------------------------------|
//! | `A` | acknowledgement          | empty                                        |
//! | `C` | device configuration     | `rf,base64`                                  |
//! | `F` | NTP servers              | `ntp1[,ntp2]`                                |
//! | `H` | hub hello / health       | `serial,rf,firmware,_,_,duty,slots,date,time,...` |
//! | `L` | device list              | `base64(records)`                            |
//! | `M` | room and device metadata | `index,count,base64` (may span lines)        |
//! | `N` | new device announcement  | empty or `base64`                            |
//! | `S` | send status              | `duty,discarded,slots`                       |

use crate::models::cube::{
    CubeInfo, DeviceConfiguration, DeviceFlags, DeviceStatus, DeviceType, HubHealth, RfAddress, RoomInformation,
    SerialNumber, ThermostatMode,
};
use crate::utils::serde_enum_name;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{NaiveDate, NaiveDateTime};
use log::debug;
use std::collections::BTreeMap;
use std::fmt;

const SERIAL_LEN: usize = 10;
const METADATA_MAGIC: u8 = 0x56;
const METADATA_VERSION: u8 = 0x02;
/// Part index and count are two hex digits on the wire.
const MAX_METADATA_PARTS: usize = 0xff;

/// A line (or group of lines) that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnprocessableMessage {
    /// The line carried a known tag but its fields did not decode.
    Malformed { tag: char, reason: String },
    /// The line does not start with `X:`.
    UnrecognisedLine(String),
    /// A bare `M:`; the hub has no rooms configured.
    NoRoomInformation,
}

impl fmt::Display for UnprocessableMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnprocessableMessage::Malformed { tag, reason } => write!(f, "malformed {}: message: {}", tag, reason),
            UnprocessableMessage::UnrecognisedLine(line) => write!(f, "unrecognised line '{}'", line),
            UnprocessableMessage::NoRoomInformation => write!(f, "no room information"),
        }
    }
}

impl std::error::Error for UnprocessableMessage {}

fn malformed(tag: char, reason: impl Into<String>) -> UnprocessableMessage {
    UnprocessableMessage::Malformed {
        tag,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ack,
    Configuration(ConfigurationMessage),
    Ntp(NtpMessage),
    Hello(HelloMessage),
    DeviceList(DeviceListMessage),
    Metadata(MetadataMessage),
    NewDevice(NewDeviceMessage),
    SendStatus(SendStatusMessage),
    /// A well-formed line whose type this engine does not decode.
    Unsupported { tag: char, body: String },
}

impl Message {
    pub fn tag(&self) -> char {
        match self {
            Message::Ack => 'A',
            Message::Configuration(_) => 'C',
            Message::Ntp(_) => 'F',
            Message::Hello(_) => 'H',
            Message::DeviceList(_) => 'L',
            Message::Metadata(_) => 'M',
            Message::NewDevice(_) => 'N',
            Message::SendStatus(_) => 'S',
            Message::Unsupported { tag, .. } => *tag,
        }
    }

    /// Decodes one complete line. Multi-part `M:` messages need a
    /// [`MessageProcessor`](crate::protocol::processor::MessageProcessor).
    pub fn parse_line(line: &str) -> Result<Message, UnprocessableMessage> {
        let line = line.trim_end();
        let (tag, body) = split_tag(line).ok_or_else(|| UnprocessableMessage::UnrecognisedLine(line.to_string()))?;
        Message::parse(tag, body)
    }

    pub(crate) fn parse(tag: char, body: &str) -> Result<Message, UnprocessableMessage> {
        match tag {
            'A' => Ok(Message::Ack),
            'C' => ConfigurationMessage::parse(body).map(Message::Configuration),
            'F' => Ok(Message::Ntp(NtpMessage::parse(body))),
            'H' => HelloMessage::parse(body).map(Message::Hello),
            'L' => DeviceListMessage::parse(body).map(Message::DeviceList),
            'M' => {
                let (index, count, data) = split_metadata_header(body)?;
                if index != 0 || count != 1 {
                    return Err(malformed('M', format!("part {} of {} outside a multi-part context", index, count)));
                }
                MetadataMessage::decode_base64(data).map(Message::Metadata)
            }
            'N' => NewDeviceMessage::parse(body).map(Message::NewDevice),
            'S' => SendStatusMessage::parse(body).map(Message::SendStatus),
            other => Ok(Message::Unsupported {
                tag: other,
                body: body.to_string(),
            }),
        }
    }
}

/// Splits `X:body` into its tag and body.
pub(crate) fn split_tag(line: &str) -> Option<(char, &str)> {
    let mut chars = line.chars();
    let tag = chars.next()?;
    if !tag.is_ascii_uppercase() || chars.next()? != ':' {
        return None;
    }
    Some((tag, &line[2..]))
}

/// Splits `index,count,data` of a metadata part.
pub(crate) fn split_metadata_header(body: &str) -> Result<(usize, usize, &str), UnprocessableMessage> {
    if body.trim().is_empty() {
        return Err(UnprocessableMessage::NoRoomInformation);
    }
    let mut parts = body.splitn(3, ',');
    let index = parse_hex('M', parts.next().unwrap_or_default())? as usize;
    let count = parse_hex('M', parts.next().ok_or_else(|| malformed('M', "missing part count"))?)? as usize;
    let data = parts.next().ok_or_else(|| malformed('M', "missing payload"))?;
    if count == 0 || count > MAX_METADATA_PARTS || index >= count {
        return Err(malformed('M', format!("part {} of {}", index, count)));
    }
    Ok((index, count, data))
}

fn parse_hex(tag: char, token: &str) -> Result<u32, UnprocessableMessage> {
    u32::from_str_radix(token.trim(), 16).map_err(|_| malformed(tag, format!("'{}' is not hexadecimal", token)))
}

fn decode_base64(tag: char, data: &str) -> Result<Vec<u8>, UnprocessableMessage> {
    BASE64
        .decode(data.trim())
        .map_err(|e| malformed(tag, format!("invalid base64: {}", e)))
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_matches(char::from(0)).trim().to_string()
}

fn half_degrees(raw: u8) -> f64 {
    f64::from(raw) / 2.0
}

// =====================
// H: hello / hub health
// =====================

#[derive(Debug, Clone, PartialEq)]
pub struct HelloMessage {
    pub serial_number: SerialNumber,
    pub rf_address: RfAddress,
    pub firmware_version: String,
    pub health: HubHealth,
    pub cube_time: Option<NaiveDateTime>,
}

impl HelloMessage {
    fn parse(body: &str) -> Result<Self, UnprocessableMessage> {
        let tokens: Vec<&str> = body.split(',').collect();
        if tokens.len() < 11 {
            return Err(malformed('H', format!("expected 11 fields, got {}", tokens.len())));
        }
        let firmware = tokens[2].trim();
        let firmware_version = match (firmware.get(0..2), firmware.get(2..4)) {
            (Some(major), Some(minor)) if firmware.len() == 4 => format!("{}.{}", major, minor),
            _ => firmware.to_string(),
        };
        Ok(HelloMessage {
            serial_number: SerialNumber::new(tokens[0]),
            rf_address: RfAddress::new(tokens[1]),
            firmware_version,
            health: HubHealth {
                duty_cycle: parse_hex('H', tokens[5])?,
                free_memory_slots: parse_hex('H', tokens[6])?,
            },
            cube_time: parse_cube_time(tokens[7], tokens[8]),
        })
    }

    pub fn cube_info(&self) -> CubeInfo {
        CubeInfo {
            serial_number: self.serial_number.clone(),
            rf_address: self.rf_address.clone(),
            firmware_version: self.firmware_version.clone(),
            cube_time: self.cube_time,
        }
    }
}

/// Date is `yymmdd` and time `hhmm`, each pair a hex byte.
fn parse_cube_time(date: &str, time: &str) -> Option<NaiveDateTime> {
    let byte = |s: &str, i: usize| s.get(i * 2..i * 2 + 2).and_then(|h| u32::from_str_radix(h, 16).ok());
    let day = NaiveDate::from_ymd_opt(2000 + byte(date, 0)? as i32, byte(date, 1)?, byte(date, 2)?)?;
    day.and_hms_opt(byte(time, 0)?, byte(time, 1)?, 0)
}

// =====================
// S: send status
// =====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendStatusMessage {
    pub health: HubHealth,
    pub command_discarded: bool,
}

impl SendStatusMessage {
    fn parse(body: &str) -> Result<Self, UnprocessableMessage> {
        let tokens: Vec<&str> = body.split(',').collect();
        if tokens.len() != 3 {
            return Err(malformed('S', format!("expected 3 fields, got {}", tokens.len())));
        }
        Ok(SendStatusMessage {
            health: HubHealth {
                duty_cycle: parse_hex('S', tokens[0])?,
                free_memory_slots: parse_hex('S', tokens[2])?,
            },
            command_discarded: tokens[1].trim() == "1",
        })
    }
}

// =====================
// F: NTP servers
// =====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtpMessage {
    pub ntp_server1: String,
    pub ntp_server2: Option<String>,
}

impl NtpMessage {
    fn parse(body: &str) -> Self {
        let mut servers = body.split(',').map(str::trim);
        NtpMessage {
            ntp_server1: servers.next().unwrap_or_default().to_string(),
            ntp_server2: servers.next().filter(|s| !s.is_empty()).map(str::to_string),
        }
    }
}

// =====================
// N: new device
// =====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeviceMessage {
    pub device_type: DeviceType,
    /// Empty when the hub found nothing during inclusion.
    pub rf_address: RfAddress,
    pub serial_number: SerialNumber,
}

impl NewDeviceMessage {
    fn parse(body: &str) -> Result<Self, UnprocessableMessage> {
        if body.trim().is_empty() {
            return Ok(NewDeviceMessage {
                device_type: DeviceType::Invalid,
                rf_address: RfAddress::new(""),
                serial_number: SerialNumber::new(""),
            });
        }
        let data = decode_base64('N', body)?;
        if data.len() < 4 + SERIAL_LEN {
            return Err(malformed('N', format!("payload of {} bytes is too short", data.len())));
        }
        Ok(NewDeviceMessage {
            device_type: DeviceType::from_code(data[0]),
            rf_address: RfAddress::from_bytes(&data[1..4]),
            serial_number: SerialNumber::new(ascii_field(&data[4..4 + SERIAL_LEN])),
        })
    }
}

// =====================
// C: device configuration
// =====================

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationMessage {
    /// Name and room name are unknown to this message and left empty.
    pub configuration: DeviceConfiguration,
}

impl ConfigurationMessage {
    fn parse(body: &str) -> Result<Self, UnprocessableMessage> {
        let tokens: Vec<&str> = body.split(',').collect();
        if tokens.len() != 2 {
            return Err(malformed('C', format!("expected 2 fields, got {}", tokens.len())));
        }
        let data = decode_base64('C', tokens[1])?;
        if data.len() < 8 + SERIAL_LEN {
            return Err(malformed('C', format!("payload of {} bytes is too short", data.len())));
        }

        let device_type = DeviceType::from_code(data[4]);
        let mut c = DeviceConfiguration::new(
            SerialNumber::new(ascii_field(&data[8..8 + SERIAL_LEN])),
            RfAddress::from_bytes(&data[1..4]),
            device_type,
        );
        c.room_id = data[5];
        c.firmware_version = Some(format!("{}.{}", data[6] >> 4, data[6] & 0x0f));

        if device_type.is_thermostat() && data.len() >= 22 {
            c.comfort_temperature = Some(half_degrees(data[18]));
            c.eco_temperature = Some(half_degrees(data[19]));
            c.max_setpoint = Some(half_degrees(data[20]));
            c.min_setpoint = Some(half_degrees(data[21]));
        }
        let radiator = matches!(
            device_type,
            DeviceType::HeatingThermostat | DeviceType::HeatingThermostatPlus
        );
        if radiator && data.len() >= 29 {
            c.temperature_offset = Some(half_degrees(data[22]) - 3.5);
            c.window_open_temperature = Some(half_degrees(data[23]));
            c.window_open_duration = Some(u32::from(data[24]) * 5);
            let boost_code = u32::from(data[25] >> 5);
            c.boost_duration = Some(if boost_code == 7 { 60 } else { boost_code * 5 });
            c.boost_valve_position = Some(u32::from(data[25] & 0x1f) * 5);
            c.max_valve_setting = Some(u32::from(data[27]) * 100 / 255);
            c.valve_offset = Some(u32::from(data[28]) * 100 / 255);
        }

        c.properties = configuration_properties(&c);
        if c.rf_address.as_str() != RfAddress::new(tokens[0]).as_str() {
            debug!(
                "C: header address {} differs from payload address {}",
                tokens[0],
                c.rf_address
            );
        }
        Ok(ConfigurationMessage { configuration: c })
    }
}

/// Flattens the decoded settings into the generic property bag handed to adapters.
pub(crate) fn configuration_properties(c: &DeviceConfiguration) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    props.insert("serialNumber".to_string(), c.serial_number.to_string());
    props.insert("rfAddress".to_string(), c.rf_address.to_string());
    props.insert("roomId".to_string(), c.room_id.to_string());
    if let Some(kind) = serde_enum_name(&c.device_type) {
        props.insert("deviceType".to_string(), kind);
    }
    let mut put = |key: &str, value: Option<String>| {
        if let Some(v) = value {
            props.insert(key.to_string(), v);
        }
    };
    put("firmwareVersion", c.firmware_version.clone());
    put("comfortTemp", c.comfort_temperature.map(|v| v.to_string()));
    put("ecoTemp", c.eco_temperature.map(|v| v.to_string()));
    put("maxSetpoint", c.max_setpoint.map(|v| v.to_string()));
    put("minSetpoint", c.min_setpoint.map(|v| v.to_string()));
    put("offsetTemp", c.temperature_offset.map(|v| v.to_string()));
    put("windowOpenTemp", c.window_open_temperature.map(|v| v.to_string()));
    put("windowOpenDuration", c.window_open_duration.map(|v| v.to_string()));
    put("boostDuration", c.boost_duration.map(|v| v.to_string()));
    put("boostValvePos", c.boost_valve_position.map(|v| v.to_string()));
    put("maxValveSetting", c.max_valve_setting.map(|v| v.to_string()));
    put("valveOffset", c.valve_offset.map(|v| v.to_string()));
    props
}

// =====================
// L: device list
// =====================

/// One device record of a device list. The record does not say what kind of device it
/// describes; the type comes from the device's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReading {
    pub rf_address: RfAddress,
    pub flags: DeviceFlags,
    /// Raw second flag byte; its low bits carry mode or contact state.
    pub state_bits: u8,
    /// Type specific bytes following the flags.
    pub payload: Vec<u8>,
}

impl DeviceReading {
    pub fn status_for(&self, device_type: DeviceType) -> DeviceStatus {
        let p = &self.payload;
        match device_type {
            DeviceType::HeatingThermostat | DeviceType::HeatingThermostatPlus | DeviceType::WallMountedThermostat
                if p.len() >= 2 =>
            {
                let mode = ThermostatMode::from_bits(self.state_bits);
                let actual_raw = match device_type {
                    DeviceType::WallMountedThermostat if p.len() >= 6 => {
                        Some((u16::from(p[1] & 0x80) << 1) | u16::from(p[5]))
                    }
                    // until-date bytes replace the temperature while on vacation
                    DeviceType::HeatingThermostat | DeviceType::HeatingThermostatPlus
                        if p.len() >= 4 && mode != ThermostatMode::Vacation =>
                    {
                        Some((u16::from(p[2] & 0x01) << 8) | u16::from(p[3]))
                    }
                    _ => None,
                };
                DeviceStatus::Thermostat {
                    mode,
                    valve_position: p[0],
                    setpoint: half_degrees(p[1] & 0x7f),
                    actual_temperature: actual_raw.filter(|v| *v != 0).map(|v| f64::from(v) / 10.0),
                }
            }
            DeviceType::ShutterContact => DeviceStatus::ShutterContact {
                open: self.state_bits & 0x02 != 0,
            },
            DeviceType::EcoSwitch => DeviceStatus::EcoSwitch {
                mode: ThermostatMode::from_bits(self.state_bits),
            },
            _ => DeviceStatus::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListMessage {
    pub readings: Vec<DeviceReading>,
}

impl DeviceListMessage {
    fn parse(body: &str) -> Result<Self, UnprocessableMessage> {
        let data = decode_base64('L', body)?;
        let mut readings = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() {
            let len = usize::from(data[pos]);
            let end = pos + 1 + len;
            if len < 6 || end > data.len() {
                return Err(malformed('L', format!("record at byte {} has invalid length {}", pos, len)));
            }
            let rec = &data[pos + 1..end];
            let (f1, f2) = (rec[4], rec[5]);
            readings.push(DeviceReading {
                rf_address: RfAddress::from_bytes(&rec[0..3]),
                flags: DeviceFlags {
                    initialized: f1 & 0x02 != 0,
                    answer: f1 & 0x04 != 0,
                    error: f1 & 0x08 != 0,
                    valid: f1 & 0x10 != 0,
                    dst_active: f2 & 0x08 != 0,
                    gateway_known: f2 & 0x10 != 0,
                    panel_locked: f2 & 0x20 != 0,
                    link_error: f2 & 0x40 != 0,
                    battery_low: f2 & 0x80 != 0,
                },
                state_bits: f2,
                payload: rec[6..].to_vec(),
            });
            pos = end;
        }
        Ok(DeviceListMessage { readings })
    }
}

// =====================
// M: rooms and devices
// =====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInformation {
    pub device_type: DeviceType,
    pub rf_address: RfAddress,
    pub serial_number: SerialNumber,
    pub name: String,
    pub room_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataMessage {
    pub rooms: Vec<RoomInformation>,
    pub devices: Vec<DeviceInformation>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], UnprocessableMessage> {
        let end = self.pos + n;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| malformed('M', format!("payload ends at byte {} (needed {})", self.data.len(), end)))?;
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, UnprocessableMessage> {
        Ok(self.take(1)?[0])
    }

    fn name(&mut self) -> Result<String, UnprocessableMessage> {
        let len = usize::from(self.byte()?);
        Ok(String::from_utf8_lossy(self.take(len)?).to_string())
    }
}

impl MetadataMessage {
    pub(crate) fn decode_base64(data: &str) -> Result<Self, UnprocessableMessage> {
        MetadataMessage::decode(&decode_base64('M', data)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, UnprocessableMessage> {
        let mut c = Cursor { data, pos: 0 };
        let magic = c.byte()?;
        let version = c.byte()?;
        if magic != METADATA_MAGIC || version != METADATA_VERSION {
            return Err(malformed(
                'M',
                format!("unexpected header {:02x} {:02x}", magic, version),
            ));
        }

        let room_count = c.byte()?;
        let mut rooms = Vec::with_capacity(usize::from(room_count));
        for _ in 0..room_count {
            let position = c.byte()?;
            let name = c.name()?;
            let rf_address = RfAddress::from_bytes(c.take(3)?);
            rooms.push(RoomInformation {
                position,
                name,
                rf_address,
            });
        }

        let device_count = c.byte()?;
        let mut devices = Vec::with_capacity(usize::from(device_count));
        for _ in 0..device_count {
            let device_type = DeviceType::from_code(c.byte()?);
            let rf_address = RfAddress::from_bytes(c.take(3)?);
            let serial_number = SerialNumber::new(ascii_field(c.take(SERIAL_LEN)?));
            let name = c.name()?;
            let room_id = c.byte()?;
            devices.push(DeviceInformation {
                device_type,
                rf_address,
                serial_number,
                name,
                room_id,
            });
        }

        Ok(MetadataMessage { rooms, devices })
    }

    /// Inverse of [`MetadataMessage::decode`]; names longer than 255 bytes are truncated.
    pub fn encode(&self) -> Vec<u8> {
        fn push_name(out: &mut Vec<u8>, name: &str) {
            let bytes = &name.as_bytes()[..name.len().min(255)];
            out.push(bytes.len() as u8);
            out.extend_from_slice(bytes);
        }
        fn push_rf(out: &mut Vec<u8>, rf: &RfAddress) {
            out.extend_from_slice(&rf.to_bytes().unwrap_or_default());
        }

        let mut out = vec![METADATA_MAGIC, METADATA_VERSION, self.rooms.len().min(255) as u8];
        for room in self.rooms.iter().take(255) {
            out.push(room.position);
            push_name(&mut out, &room.name);
            push_rf(&mut out, &room.rf_address);
        }
        out.push(self.devices.len().min(255) as u8);
        for device in self.devices.iter().take(255) {
            out.push(device.device_type.code());
            push_rf(&mut out, &device.rf_address);
            let mut serial = [0u8; SERIAL_LEN];
            for (slot, b) in serial.iter_mut().zip(device.serial_number.as_str().bytes()) {
                *slot = b;
            }
            out.extend_from_slice(&serial);
            push_name(&mut out, &device.name);
            out.push(device.room_id);
        }
        out.push(0x01);
        out
    }
}
