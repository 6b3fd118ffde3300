use log::{error, warn};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Serialize a serde-backed enum into its string name (e.g. SCREAMING_SNAKE_CASE).
pub fn serde_enum_name<T: Serialize>(val: &T) -> Option<String> {
    serde_json::to_value(val).ok()?.as_str().map(|s| s.to_string())
}

/// Stop flag shared by a bridge's background threads.
///
/// Sleeping through [`Shutdown::sleep`] instead of `thread::sleep` lets `stop()` interrupt
/// the poll cadence and the inter-command delay immediately.
#[derive(Debug, Default)]
pub struct Shutdown {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps for `duration`. Returns `false` when woken by a shutdown.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cond.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        !*stopped
    }
}

/// Joins `handle`, giving up after `timeout`. A thread that is still running is left detached.
pub fn join_with_timeout(name: &str, handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("Thread {} did not stop within {:?}; detaching", name, timeout);
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        error!("Thread {} panicked", name);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cube::DeviceType;
    use std::sync::Arc;

    #[test]
    fn enum_names() {
        assert_eq!(
            serde_enum_name(&DeviceType::WallMountedThermostat).as_deref(),
            Some("WALL_MOUNTED_THERMOSTAT")
        );
    }

    #[test]
    fn shutdown_interrupts_sleep() {
        let shutdown = Arc::new(Shutdown::new());
        let sleeper = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || shutdown.sleep(Duration::from_secs(30)))
        };
        std::thread::sleep(Duration::from_millis(50));
        shutdown.trigger();
        assert!(!sleeper.join().unwrap());
        assert!(!shutdown.sleep(Duration::from_millis(1)));
    }

    #[test]
    fn sleep_runs_to_completion_without_shutdown() {
        let shutdown = Shutdown::new();
        assert!(shutdown.sleep(Duration::from_millis(5)));
    }
}
