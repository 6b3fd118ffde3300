//! Runtime configuration from the process environment.
//! Defaults match a hub on the local network with the vendor's standard port.

use crate::client::{DEFAULT_PORT, SessionSettings};
use crate::models::cube::BridgeId;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_REFRESH_SECS: u64 = 30;
pub const DEFAULT_MAX_REQUESTS_PER_CONNECTION: u32 = 1000;
pub const DEFAULT_BACKUP_DIR: &str = "backup";

#[derive(Debug, Clone)]
pub struct Config {
    /// Hub address; ignored when the simulated hub is used.
    pub host: String,
    pub port: u16,
    /// Poll cadence of the "list devices" timer.
    pub refresh_interval: Duration,
    pub exclusive: bool,
    pub max_requests_per_connection: u32,
    pub ntp_server1: Option<String>,
    pub ntp_server2: Option<String>,
    pub backup_dir: PathBuf,
    /// Take one backup right after startup.
    pub backup_on_start: bool,
    pub report_dropped_commands: bool,
    /// Run against a simulated hub on 127.0.0.1.
    pub simulate: bool,
    pub bridge_id: BridgeId,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |key: &str| -> Result<bool, String> {
            match var(key) {
                None => Ok(false),
                Some(v) => match v.to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => Ok(true),
                    "0" | "false" | "no" | "off" => Ok(false),
                    _ => Err(format!("{} must be a boolean, got '{}'", key, v)),
                },
            }
        };

        let simulate = flag("CUBE_SIMULATE")?;
        let host = match var("CUBE_HOST") {
            Some(h) => h,
            None if simulate => "127.0.0.1".to_string(),
            None => return Err("Missing hub address: set CUBE_HOST (or CUBE_SIMULATE=true)".to_string()),
        };

        let port = match var("CUBE_PORT") {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| format!("CUBE_PORT must be a port number, got '{}'", p))?,
            None => DEFAULT_PORT,
        };

        let refresh_secs = match var("CUBE_REFRESH_INTERVAL_SECS") {
            Some(s) => s
                .parse::<u64>()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| format!("CUBE_REFRESH_INTERVAL_SECS must be a positive integer, got '{}'", s))?,
            None => DEFAULT_REFRESH_SECS,
        };

        let max_requests_per_connection = match var("CUBE_MAX_REQUESTS_PER_CONNECTION") {
            Some(s) => s
                .parse::<u32>()
                .map_err(|_| format!("CUBE_MAX_REQUESTS_PER_CONNECTION must be an integer, got '{}'", s))?,
            None => DEFAULT_MAX_REQUESTS_PER_CONNECTION,
        };

        let bridge_id = BridgeId(var("CUBE_BRIDGE_ID").unwrap_or_else(|| format!("cube-{}", host)));

        Ok(Config {
            port,
            refresh_interval: Duration::from_secs(refresh_secs),
            exclusive: flag("CUBE_EXCLUSIVE")?,
            max_requests_per_connection,
            ntp_server1: var("CUBE_NTP_SERVER1"),
            ntp_server2: var("CUBE_NTP_SERVER2"),
            backup_dir: PathBuf::from(var("CUBE_BACKUP_DIR").unwrap_or_else(|| DEFAULT_BACKUP_DIR.to_string())),
            backup_on_start: flag("CUBE_BACKUP_ON_START")?,
            report_dropped_commands: flag("CUBE_REPORT_DROPPED_COMMANDS")?,
            simulate,
            bridge_id,
            host,
        })
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        let mut session = SessionSettings::new(self.host.clone(), self.port);
        session.exclusive = self.exclusive;
        session.max_requests_per_connection = self.max_requests_per_connection;

        let mut settings = BridgeSettings::new(self.bridge_id.clone(), session);
        settings.refresh_interval = self.refresh_interval;
        settings.ntp_servers = match (&self.ntp_server1, &self.ntp_server2) {
            (None, None) => None,
            (a, b) => Some((a.clone().unwrap_or_default(), b.clone().unwrap_or_default())),
        };
        settings.backup_dir = self.backup_dir.clone();
        settings.backup_on_start = self.backup_on_start;
        settings.report_dropped_commands = self.report_dropped_commands;
        settings
    }
}

/// Everything one bridge instance needs. Timing fields default to the hub's tolerances and are
/// only shortened by tests.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub bridge_id: BridgeId,
    pub session: SessionSettings,
    pub refresh_interval: Duration,
    /// Pause after every queued command.
    pub command_delay: Duration,
    /// Upper bound of one duty-cycle wait before the gate is re-checked.
    pub duty_cycle_wait: Duration,
    pub join_timeout: Duration,
    pub queue_capacity: usize,
    /// Forwarded to the hub when set.
    pub ntp_servers: Option<(String, String)>,
    pub backup_dir: PathBuf,
    pub backup_on_start: bool,
    pub report_dropped_commands: bool,
}

impl BridgeSettings {
    pub fn new(bridge_id: BridgeId, session: SessionSettings) -> Self {
        BridgeSettings {
            bridge_id,
            session,
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_SECS),
            command_delay: Duration::from_secs(5),
            duty_cycle_wait: Duration::from_secs(60),
            join_timeout: Duration::from_secs(1),
            queue_capacity: 50,
            ntp_servers: None,
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            backup_on_start: false,
            report_dropped_commands: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = Config::from_lookup(lookup(&[("CUBE_HOST", "192.168.1.20")])).unwrap();
        assert_eq!(cfg.port, 62910);
        assert_eq!(cfg.refresh_interval, Duration::from_secs(30));
        assert!(!cfg.exclusive);
        assert_eq!(cfg.max_requests_per_connection, 1000);
        assert_eq!(cfg.bridge_id.0, "cube-192.168.1.20");
        assert_eq!(cfg.backup_dir, PathBuf::from("backup"));
        assert!(cfg.ntp_server1.is_none());
    }

    #[test]
    fn host_is_required_unless_simulating() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
        let cfg = Config::from_lookup(lookup(&[("CUBE_SIMULATE", "true")])).unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = Config::from_lookup(lookup(&[("CUBE_HOST", "h"), ("CUBE_PORT", "abc")])).unwrap_err();
        assert!(err.contains("CUBE_PORT"));
        let err = Config::from_lookup(lookup(&[("CUBE_HOST", "h"), ("CUBE_EXCLUSIVE", "maybe")])).unwrap_err();
        assert!(err.contains("CUBE_EXCLUSIVE"));
        assert!(Config::from_lookup(lookup(&[("CUBE_HOST", "h"), ("CUBE_REFRESH_INTERVAL_SECS", "0")])).is_err());
    }

    #[test]
    fn bridge_settings_carry_session_policy() {
        let cfg = Config::from_lookup(lookup(&[
            ("CUBE_HOST", "cube.local"),
            ("CUBE_EXCLUSIVE", "1"),
            ("CUBE_MAX_REQUESTS_PER_CONNECTION", "0"),
            ("CUBE_NTP_SERVER1", "ntp.homematic.com"),
        ]))
        .unwrap();
        let s = cfg.bridge_settings();
        assert!(s.session.exclusive);
        assert_eq!(s.session.max_requests_per_connection, 0);
        assert_eq!(s.session.host, "cube.local");
        assert_eq!(s.ntp_servers, Some(("ntp.homematic.com".to_string(), String::new())));
        assert_eq!(s.queue_capacity, 50);
        assert_eq!(s.command_delay, Duration::from_secs(5));
    }
}
