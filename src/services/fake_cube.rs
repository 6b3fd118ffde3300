//! Simulated MAX! Cube speaking the LAN gateway protocol on a local TCP port.
//!
//! - Every connection starts with a greeting: hello, room map, configurations, device list.
//! - Answers `l:`, `c:`, `f:`, `s:`, `t:`, `m:`, `a:`, `n:` and `q:` the way a hub does.
//! - Optional seeded drift of duty cycle and room temperatures for local runs.
//! - Serves one connection at a time, like the real hardware.

use crate::models::cube::{DeviceType, HubHealth, RfAddress, RoomInformation, SerialNumber, ThermostatMode};
use crate::protocol::message::{DeviceInformation, MetadataMessage};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{Datelike, Local, Timelike};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const DEFAULT_NTP: &str = "ntp.homematic.com";

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub serial_number: SerialNumber,
    pub rf_address: RfAddress,
    pub device_type: DeviceType,
    pub name: String,
    pub room_id: u8,
    pub mode: ThermostatMode,
    pub setpoint: f64,
    /// Tenths of a degree; zero means not measured.
    pub actual_tenths: u16,
    pub valve_position: u8,
    pub open: bool,
}

impl FakeDevice {
    pub fn thermostat(serial: &str, rf: &str, name: &str, room_id: u8) -> Self {
        FakeDevice {
            serial_number: SerialNumber::new(serial),
            rf_address: RfAddress::new(rf),
            device_type: DeviceType::HeatingThermostat,
            name: name.to_string(),
            room_id,
            mode: ThermostatMode::Manual,
            setpoint: 21.0,
            actual_tenths: 205,
            valve_position: 30,
            open: false,
        }
    }

    pub fn shutter_contact(serial: &str, rf: &str, name: &str, room_id: u8) -> Self {
        FakeDevice {
            device_type: DeviceType::ShutterContact,
            mode: ThermostatMode::Automatic,
            setpoint: 0.0,
            actual_tenths: 0,
            valve_position: 0,
            open: true,
            ..FakeDevice::thermostat(serial, rf, name, room_id)
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeCubeOptions {
    pub seed: u64,
    /// Let duty cycle and temperatures wander between polls.
    pub drift: bool,
    /// Raw lines injected into every greeting right after the hello.
    pub extra_greeting_lines: Vec<String>,
}

impl Default for FakeCubeOptions {
    fn default() -> Self {
        FakeCubeOptions {
            seed: 0x0062_9100_CAFE_F00Du64,
            drift: false,
            extra_greeting_lines: Vec::new(),
        }
    }
}

enum Reply {
    Lines(Vec<String>),
    Close,
}

struct Installation {
    serial_number: SerialNumber,
    rf_address: RfAddress,
    health: HubHealth,
    ntp: (String, String),
    rooms: Vec<RoomInformation>,
    devices: Vec<FakeDevice>,
    metadata_buffer: String,
    extra_greeting_lines: Vec<String>,
    drift: bool,
    rng: SmallRng,
    requests: Vec<String>,
    connections: usize,
}

impl Installation {
    fn new(options: FakeCubeOptions) -> Self {
        Installation {
            serial_number: SerialNumber::new("KEQ0565026"),
            rf_address: RfAddress::new("0b5951"),
            health: HubHealth {
                duty_cycle: 0,
                free_memory_slots: 50,
            },
            ntp: (DEFAULT_NTP.to_string(), DEFAULT_NTP.to_string()),
            rooms: vec![RoomInformation {
                position: 1,
                name: "Living".to_string(),
                rf_address: RfAddress::new("0a0001"),
            }],
            devices: vec![
                FakeDevice::thermostat("KEQ0000001", "0a0001", "Radiator", 1),
                FakeDevice::shutter_contact("KEQ0000002", "0a0002", "Window", 1),
            ],
            metadata_buffer: String::new(),
            extra_greeting_lines: options.extra_greeting_lines,
            drift: options.drift,
            rng: SmallRng::seed_from_u64(options.seed),
            requests: Vec::new(),
            connections: 0,
        }
    }

    fn greeting(&mut self) -> Vec<String> {
        self.connections += 1;
        let mut lines = vec![self.hello_line()];
        lines.extend(self.extra_greeting_lines.iter().cloned());
        lines.push(self.metadata_line());
        lines.extend(self.devices.iter().map(configuration_line));
        lines.push(self.device_list_line());
        lines
    }

    fn answer(&mut self, request: &str) -> Reply {
        self.requests.push(request.to_string());
        let (verb, body) = request.split_once(':').unwrap_or((request, ""));
        match verb {
            "l" => {
                if self.drift {
                    self.wander();
                }
                Reply::Lines(vec![self.device_list_line()])
            }
            "c" => {
                let rf = RfAddress::new(body);
                let line = match self.devices.iter().find(|d| d.rf_address == rf) {
                    Some(d) => configuration_line(d),
                    None => self.cube_configuration_line(),
                };
                Reply::Lines(vec![line])
            }
            "f" => {
                if let Some((a, b)) = body.split_once(',') {
                    self.ntp = (a.to_string(), b.to_string());
                }
                Reply::Lines(vec![format!("F:{},{}", self.ntp.0, self.ntp.1)])
            }
            "s" => Reply::Lines(vec![self.set_temperature(body)]),
            "t" => {
                self.delete_devices(body);
                Reply::Lines(vec!["A:".to_string()])
            }
            "m" => {
                self.write_metadata(body);
                Reply::Lines(vec!["A:".to_string()])
            }
            "a" => {
                self.devices.clear();
                self.rooms.clear();
                Reply::Lines(vec!["A:".to_string()])
            }
            "n" => Reply::Lines(vec!["N:".to_string()]),
            "q" => Reply::Close,
            other => {
                debug!("Fake cube: ignoring request '{}'", other);
                Reply::Lines(Vec::new())
            }
        }
    }

    fn hello_line(&self) -> String {
        let now = Local::now();
        format!(
            "H:{},{},0113,00000000,4eed6795,{:02x},{:02x},{:02x}{:02x}{:02x},{:02x}{:02x},03,0000",
            self.serial_number,
            self.rf_address,
            self.health.duty_cycle,
            self.health.free_memory_slots,
            now.year() % 100,
            now.month(),
            now.day(),
            now.hour(),
            now.minute()
        )
    }

    fn metadata_line(&self) -> String {
        let message = MetadataMessage {
            rooms: self.rooms.clone(),
            devices: self
                .devices
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
        format!("M:00,01,{}", BASE64.encode(message.encode()))
    }

    fn cube_configuration_line(&self) -> String {
        let mut data = vec![0u8];
        data.extend(self.rf_address.to_bytes().unwrap_or_default());
        data.extend([DeviceType::Cube.code(), 0x00, 0x13, 0xff]);
        data.extend(serial_bytes(&self.serial_number));
        data[0] = (data.len() - 1) as u8;
        format!("C:{},{}", self.rf_address, BASE64.encode(&data))
    }

    fn device_list_line(&self) -> String {
        let mut data = Vec::new();
        for d in &self.devices {
            data.extend(device_record(d));
        }
        format!("L:{}", BASE64.encode(&data))
    }

    fn wander(&mut self) {
        let duty = self.health.duty_cycle as i32 + self.rng.random_range(-3..=3);
        self.health.duty_cycle = duty.clamp(0, 100) as u32;
        for d in self.devices.iter_mut().filter(|d| d.device_type.is_thermostat()) {
            let t = i32::from(d.actual_tenths) + self.rng.random_range(-2..=2);
            d.actual_tenths = t.clamp(150, 260) as u16;
            if self.rng.random_bool(0.05) {
                d.valve_position = self.rng.random_range(0..=100);
            }
        }
    }

    /// `s:` payload: 6 header bytes, RF address, room, mode/half-degree byte.
    fn set_temperature(&mut self, body: &str) -> String {
        let discarded = match BASE64.decode(body.trim()) {
            Ok(data) if data.len() >= 11 => {
                let whole_room = data[1] & 0x04 != 0;
                let rf = RfAddress::from_bytes(&data[6..9]);
                let room_id = data[9];
                let mode = ThermostatMode::from_bits(data[10] >> 6);
                let setpoint = f64::from(data[10] & 0x3f) / 2.0;
                let busy = self.health.duty_cycle >= 100;
                if !busy {
                    for d in self.devices.iter_mut().filter(|d| {
                        d.device_type.is_thermostat()
                            && (d.rf_address == rf || (whole_room && room_id != 0 && d.room_id == room_id))
                    }) {
                        d.mode = mode;
                        if setpoint > 0.0 {
                            d.setpoint = setpoint;
                        }
                    }
                    if self.drift {
                        self.health.duty_cycle = (self.health.duty_cycle + self.rng.random_range(1..=3)).min(100);
                    }
                }
                busy
            }
            _ => true,
        };
        format!(
            "S:{:02x},{},{:02x}",
            self.health.duty_cycle,
            u8::from(discarded),
            self.health.free_memory_slots
        )
    }

    /// `t:count,force,base64(addresses)`
    fn delete_devices(&mut self, body: &str) {
        let encoded = body.rsplit(',').next().unwrap_or_default();
        if let Ok(data) = BASE64.decode(encoded.trim()) {
            let doomed: Vec<RfAddress> = data.chunks_exact(3).map(RfAddress::from_bytes).collect();
            self.devices.retain(|d| !doomed.contains(&d.rf_address));
        }
    }

    /// `m:index,base64`; applied once the collected chunks decode.
    fn write_metadata(&mut self, body: &str) {
        let chunk = body.split_once(',').map(|(_, c)| c).unwrap_or(body);
        self.metadata_buffer.push_str(chunk.trim());
        let Ok(data) = BASE64.decode(&self.metadata_buffer) else {
            return;
        };
        let Ok(metadata) = MetadataMessage::decode(&data) else {
            return;
        };
        self.metadata_buffer.clear();
        self.rooms = metadata.rooms;
        for info in metadata.devices {
            if let Some(d) = self.devices.iter_mut().find(|d| d.rf_address == info.rf_address) {
                d.name = info.name;
                d.room_id = info.room_id;
            }
        }
    }
}

fn serial_bytes(serial: &SerialNumber) -> [u8; 10] {
    let mut out = [0u8; 10];
    for (slot, b) in out.iter_mut().zip(serial.as_str().bytes()) {
        *slot = b;
    }
    out
}

fn configuration_line(d: &FakeDevice) -> String {
    let mut data = vec![0u8];
    data.extend(d.rf_address.to_bytes().unwrap_or_default());
    data.extend([d.device_type.code(), d.room_id, 0x10, 0xff]);
    data.extend(serial_bytes(&d.serial_number));
    if d.device_type.is_thermostat() {
        // comfort 21.5, eco 16.5, max 30.5, min 4.5
        data.extend([43, 33, 61, 9]);
        if d.device_type != DeviceType::WallMountedThermostat {
            // offset, window temperature and duration, boost, decalcification, valve limits
            data.extend([8, 24, 3, 0x32, 0x0c, 0xff, 0x00]);
        }
    }
    data[0] = (data.len() - 1) as u8;
    format!("C:{},{}", d.rf_address, BASE64.encode(&data))
}

fn device_record(d: &FakeDevice) -> Vec<u8> {
    let mut rec = vec![0u8];
    rec.extend(d.rf_address.to_bytes().unwrap_or_default());
    // unknown byte, then flags: initialized + valid, gateway known + DST
    rec.extend([0x00, 0x12]);
    let half_degrees = (d.setpoint * 2.0).clamp(0.0, 127.0) as u8;
    match d.device_type {
        DeviceType::HeatingThermostat | DeviceType::HeatingThermostatPlus => {
            rec.push(0x18 | d.mode.code());
            rec.extend([
                d.valve_position,
                half_degrees,
                ((d.actual_tenths >> 8) & 0x01) as u8,
                (d.actual_tenths & 0xff) as u8,
                0x00,
            ]);
        }
        DeviceType::WallMountedThermostat => {
            rec.push(0x18 | d.mode.code());
            let high_bit = (((d.actual_tenths >> 8) & 0x01) as u8) << 7;
            rec.extend([0x00, half_degrees | high_bit, 0x00, 0x00, 0x00, (d.actual_tenths & 0xff) as u8]);
        }
        DeviceType::ShutterContact => rec.push(0x18 | if d.open { 0x02 } else { 0x00 }),
        _ => rec.push(0x18 | d.mode.code()),
    }
    rec[0] = (rec.len() - 1) as u8;
    rec
}

// =====================
// TCP server
// =====================

pub struct FakeCube {
    addr: SocketAddr,
    installation: Arc<Mutex<Installation>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FakeCube {
    pub fn start(bind: &str, options: FakeCubeOptions) -> io::Result<Self> {
        let listener = TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let installation = Arc::new(Mutex::new(Installation::new(options)));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let installation = Arc::clone(&installation);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("fake-cube".to_string())
                .spawn(move || accept_loop(listener, &installation, &stop))?
        };
        info!("Simulated hub listening on {}", addr);
        Ok(FakeCube {
            addr,
            installation,
            stop,
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_duty_cycle(&self, duty_cycle: u32) {
        self.installation.lock().health.duty_cycle = duty_cycle;
    }

    pub fn add_device(&self, device: FakeDevice) {
        self.installation.lock().devices.push(device);
    }

    /// Moves a device to another room; the change shows up in its next configuration line.
    pub fn set_room(&self, serial: &str, room_id: u8) {
        let serial = SerialNumber::new(serial);
        if let Some(d) = self
            .installation
            .lock()
            .devices
            .iter_mut()
            .find(|d| d.serial_number == serial)
        {
            d.room_id = room_id;
        }
    }

    pub fn device(&self, serial: &str) -> Option<FakeDevice> {
        let serial = SerialNumber::new(serial);
        self.installation
            .lock()
            .devices
            .iter()
            .find(|d| d.serial_number == serial)
            .cloned()
    }

    /// Every request line received so far, oldest first.
    pub fn requests(&self) -> Vec<String> {
        self.installation.lock().requests.clone()
    }

    pub fn connections(&self) -> usize {
        self.installation.lock().connections
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            warn!("Simulated hub thread panicked");
        }
    }
}

impl Drop for FakeCube {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, installation: &Mutex<Installation>, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("Fake cube: connection from {}", peer);
                if let Err(e) = serve_connection(stream, installation, stop) {
                    debug!("Fake cube: connection from {} ended: {}", peer, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(5)),
            Err(e) => {
                warn!("Fake cube: accept failed: {}", e);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn write_lines(stream: &mut TcpStream, lines: &[String]) -> io::Result<()> {
    for line in lines {
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\r\n")?;
    }
    stream.flush()
}

fn serve_connection(stream: TcpStream, installation: &Mutex<Installation>, stop: &AtomicBool) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_millis(50)))?;
    let mut writer = stream.try_clone()?;
    let greeting = installation.lock().greeting();
    write_lines(&mut writer, &greeting)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    while !stop.load(Ordering::SeqCst) {
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let request = line.trim_end().to_string();
                line.clear();
                let reply = installation.lock().answer(&request);
                match reply {
                    Reply::Lines(lines) => write_lines(&mut writer, &lines)?,
                    Reply::Close => break,
                }
            }
            // partial input stays in `line` until the rest arrives
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => return Err(e),
        }
    }
    let _ = writer.shutdown(std::net::Shutdown::Both);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cube::DeviceStatus;
    use crate::protocol::command::CubeCommand;
    use crate::protocol::message::Message;

    const GREETING: &str = include_str!("../../tests/data/cube-greeting.txt");

    fn lines(reply: Reply) -> Vec<String> {
        match reply {
            Reply::Lines(l) => l,
            Reply::Close => panic!("unexpected close"),
        }
    }

    #[test]
    fn greeting_matches_recorded_hub_output() {
        let mut cube = Installation::new(FakeCubeOptions::default());
        let greeting = cube.greeting();
        let recorded: Vec<&str> = GREETING.lines().collect();
        assert_eq!(greeting.len(), 5);
        // hello carries the current clock; the rest is byte-identical apart from DST flags
        assert!(greeting[0].starts_with("H:KEQ0565026,0b5951,0113,00000000,4eed6795,00,32,"));
        assert_eq!(greeting[1], recorded[1]);
        assert_eq!(greeting[2], recorded[2]);
        assert_eq!(greeting[3], recorded[3]);
        let Message::DeviceList(list) = Message::parse_line(&greeting[4]).unwrap() else {
            panic!("expected device list");
        };
        assert_eq!(list.readings.len(), 2);
        assert_eq!(
            list.readings[1].status_for(DeviceType::ShutterContact),
            DeviceStatus::ShutterContact { open: true }
        );
    }

    #[test]
    fn set_temperature_updates_room() {
        let mut cube = Installation::new(FakeCubeOptions::default());
        let cmd = CubeCommand::SetTemperature {
            rf_address: RfAddress::new("0a0001"),
            room_id: 1,
            mode: ThermostatMode::Manual,
            temperature: 22.5,
        };
        let reply = lines(cube.answer(cmd.command_string().trim_end()));
        assert_eq!(reply, vec!["S:00,0,32"]);
        assert_eq!(cube.devices[0].setpoint, 22.5);
        assert_eq!(cube.devices[0].mode, ThermostatMode::Manual);

        cube.health.duty_cycle = 100;
        assert_eq!(lines(cube.answer(cmd.command_string().trim_end())), vec!["S:64,1,32"]);
    }

    #[test]
    fn delete_rename_and_reset() {
        let mut cube = Installation::new(FakeCubeOptions::default());
        let delete = CubeCommand::DeleteDevices {
            rf_addresses: vec![RfAddress::new("0a0002")],
            force: true,
        };
        assert_eq!(lines(cube.answer(delete.command_string().trim_end())), vec!["A:"]);
        assert_eq!(cube.devices.len(), 1);

        let renamed = FakeDevice::thermostat("KEQ0000001", "0a0001", "Hall", 2);
        let rooms = vec![RoomInformation {
            position: 2,
            name: "Hall".to_string(),
            rf_address: RfAddress::new("0a0001"),
        }];
        let metadata = MetadataMessage {
            rooms,
            devices: vec![DeviceInformation {
                device_type: renamed.device_type,
                rf_address: renamed.rf_address.clone(),
                serial_number: renamed.serial_number.clone(),
                name: renamed.name.clone(),
                room_id: 2,
            }],
        };
        let wire = CubeCommand::Metadata {
            payload: metadata.encode(),
        }
        .command_string();
        for line in wire.lines() {
            assert_eq!(lines(cube.answer(line)), vec!["A:"]);
        }
        assert_eq!(cube.devices[0].name, "Hall");
        assert_eq!(cube.rooms[0].name, "Hall");

        assert_eq!(lines(cube.answer("a:")), vec!["A:"]);
        assert!(cube.devices.is_empty());
        assert!(matches!(cube.answer("q:"), Reply::Close));
    }

    #[test]
    fn ntp_and_unknown_configuration() {
        let mut cube = Installation::new(FakeCubeOptions::default());
        assert_eq!(lines(cube.answer("f:")), vec!["F:ntp.homematic.com,ntp.homematic.com"]);
        assert_eq!(lines(cube.answer("f:a.example,b.example")), vec!["F:a.example,b.example"]);
        let reply = lines(cube.answer("c:0b5951"));
        let Message::Configuration(c) = Message::parse_line(&reply[0]).unwrap() else {
            panic!("expected configuration");
        };
        assert_eq!(c.configuration.device_type, DeviceType::Cube);
        assert_eq!(cube.requests.len(), 3);
    }

    #[test]
    fn drift_is_deterministic_per_seed() {
        let options = FakeCubeOptions {
            drift: true,
            ..FakeCubeOptions::default()
        };
        let mut a = Installation::new(options.clone());
        let mut b = Installation::new(options);
        for _ in 0..10 {
            assert_eq!(lines(a.answer("l:")), lines(b.answer("l:")));
        }
        assert!(a.health.duty_cycle <= 100);
    }

    #[test]
    fn serves_over_tcp() {
        let mut fake = FakeCube::start("127.0.0.1:0", FakeCubeOptions::default()).unwrap();
        let mut stream = TcpStream::connect(fake.addr()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        for _ in 0..5 {
            line.clear();
            reader.read_line(&mut line).unwrap();
        }
        assert!(line.starts_with("L:"));
        stream.write_all(b"f:\r\n").unwrap();
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert!(line.starts_with("F:"));
        stream.write_all(b"q:\r\n").unwrap();
        line.clear();
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);
        assert_eq!(fake.requests(), vec!["f:", "q:"]);
        assert_eq!(fake.connections(), 1);
        fake.stop();
    }
}
