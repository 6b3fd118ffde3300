pub mod models {
    pub mod cube;
}

pub mod protocol {
    pub mod command;
    pub mod message;
    pub mod processor;
}

pub mod client;
pub mod config;
pub mod env_file;
pub mod utils;
pub mod services {
    pub mod backup;
    pub mod bridge;
    pub mod dispatch;
    pub mod fake_cube;
    pub mod queue;
    pub mod realtime;
    pub mod registry;
}

use crate::config::Config;
use crate::models::cube::{BridgeId, DeviceEvent, HubHealth};
use crate::services::bridge::{CubeBridge, DeviceStatusListener};
use crate::services::fake_cube::{FakeCube, FakeCubeOptions};
use crate::services::queue::SendCommand;
use log::{error, info, warn};
use std::sync::Arc;

/// Writes every bridge event to the log as one JSON object.
struct LogListener;

impl DeviceStatusListener for LogListener {
    fn on_device_event(&self, bridge: &BridgeId, event: &DeviceEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!("[{}] {}", bridge, json),
            Err(e) => warn!("[{}] event for {} not serializable: {}", bridge, event.device().serial_number, e),
        }
    }

    fn on_command_dropped(&self, bridge: &BridgeId, command: &SendCommand, reason: &str) {
        warn!("[{}] command {} ({}) dropped: {}", bridge, command.key(), command.description, reason);
    }

    fn on_hub_health(&self, bridge: &BridgeId, health: HubHealth) {
        info!(
            "[{}] duty cycle {}%, {} free memory slots",
            bridge, health.duty_cycle, health.free_memory_slots
        );
    }
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let mut cfg = Config::from_env()?;
    info!(
        "Config loaded (bridge={}, refresh_interval={}s, exclusive={}, max_requests_per_connection={}, backup_dir={}, simulate={})",
        cfg.bridge_id,
        cfg.refresh_interval.as_secs(),
        cfg.exclusive,
        cfg.max_requests_per_connection,
        cfg.backup_dir.display(),
        cfg.simulate
    );

    // 2) Optional simulated hub; kept alive until the process exits
    let _simulator = if cfg.simulate {
        let options = FakeCubeOptions {
            drift: true,
            ..FakeCubeOptions::default()
        };
        let fake =
            FakeCube::start("127.0.0.1:0", options).map_err(|e| format!("Starting simulated hub failed: {}", e))?;
        cfg.host = fake.addr().ip().to_string();
        cfg.port = fake.port();
        Some(fake)
    } else {
        None
    };

    // 3) Bridge with a logging listener
    let bridge = CubeBridge::new(cfg.bridge_settings());
    bridge.register_listener(Arc::new(LogListener));
    bridge.start()?;
    info!("Bridge {} polling {}:{}", bridge.id(), cfg.host, cfg.port);

    // 4) Background threads do the work
    loop {
        std::thread::park();
    }
}

fn main() {
    let loaded_env = match env_file::configure_env_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "cube-gateway {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
