use crate::utils::Shutdown;
use log::debug;
use std::time::{Duration, Instant};

/// Polls immediately, then every `interval` measured from the start of each poll, until
/// `shutdown` fires.
pub fn run_loop(interval: Duration, shutdown: &Shutdown, mut poll: impl FnMut()) {
    while !shutdown.is_triggered() {
        let tick_start = Instant::now();
        poll();

        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if !shutdown.sleep(interval.saturating_sub(elapsed)) {
            break;
        }
    }
    debug!("Poll loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn polls_on_cadence_until_shutdown() {
        let shutdown = Shutdown::new();
        let polls = AtomicUsize::new(0);
        thread::scope(|s| {
            let worker = s.spawn(|| {
                run_loop(Duration::from_millis(20), &shutdown, || {
                    polls.fetch_add(1, Ordering::SeqCst);
                })
            });
            thread::sleep(Duration::from_millis(110));
            shutdown.trigger();
            worker.join().unwrap();
        });
        let n = polls.load(Ordering::SeqCst);
        assert!((2..=8).contains(&n), "unexpected poll count {}", n);
    }

    #[test]
    fn triggered_shutdown_skips_polling() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut polls = 0;
        run_loop(Duration::from_millis(1), &shutdown, || polls += 1);
        assert_eq!(polls, 0);
    }
}
