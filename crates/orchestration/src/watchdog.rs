//! Health watchdog for user hooks.
//!
//! Arms when a hook starts and escalates through warn and error thresholds
//! while it runs. The watched thread communicates with the watch thread
//! only through an atomic start-time; handlers fire at most once per run.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Sentinel for "no hook running".
const IDLE: i64 = i64::MIN;

/// Polling resolution of the watch thread.
const RESOLUTION: Duration = Duration::from_millis(10);

/// Thresholds after which a stuck hook triggers the warn/error callbacks.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub soft_timeout: Duration,
    pub hard_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Healthy,
    Warned,
    Errored,
}

/// Watches hook execution time on a dedicated thread.
pub struct Watchdog {
    started_at: Arc<AtomicI64>,
    origin: Instant,
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Spawn the watch thread. `on_warn`/`on_error` receive the current run
    /// duration; they are called from the watch thread.
    pub fn spawn(
        config: WatchdogConfig,
        on_warn: impl Fn(Duration) + Send + 'static,
        on_error: impl Fn(Duration) + Send + 'static,
    ) -> Self {
        let started_at = Arc::new(AtomicI64::new(IDLE));
        let origin = Instant::now();
        let (stop_tx, stop_rx) = bounded(1);

        let watched = Arc::clone(&started_at);
        let thread = std::thread::Builder::new()
            .name("cosim-watchdog".to_string())
            .spawn(move || watch_loop(config, watched, origin, stop_rx, on_warn, on_error))
            .expect("failed to spawn watchdog thread");

        Self {
            started_at,
            origin,
            stop_tx,
            thread: Some(thread),
        }
    }

    /// Arm the watchdog: a hook is about to run.
    pub fn start(&self) {
        let nanos = self.origin.elapsed().as_nanos() as i64;
        self.started_at.store(nanos, Ordering::Release);
    }

    /// Disarm the watchdog: the hook returned.
    pub fn reset(&self) {
        self.started_at.store(IDLE, Ordering::Release);
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watch_loop(
    config: WatchdogConfig,
    started_at: Arc<AtomicI64>,
    origin: Instant,
    stop_rx: Receiver<()>,
    on_warn: impl Fn(Duration),
    on_error: impl Fn(Duration),
) {
    let mut health = Health::Healthy;
    loop {
        match stop_rx.recv_timeout(RESOLUTION) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let started = started_at.load(Ordering::Acquire);
        if started == IDLE {
            health = Health::Healthy;
            continue;
        }

        let run_duration = origin.elapsed().saturating_sub(Duration::from_nanos(started as u64));
        if run_duration <= config.soft_timeout {
            health = Health::Healthy;
        } else if run_duration <= config.hard_timeout {
            if health == Health::Healthy {
                on_warn(run_duration);
                health = Health::Warned;
            }
        } else if health != Health::Errored {
            on_error(run_duration);
            health = Health::Errored;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn quick_hooks_never_fire() {
        let warns = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&warns);
        let e = Arc::clone(&errors);
        let watchdog = Watchdog::spawn(
            WatchdogConfig {
                soft_timeout: Duration::from_millis(200),
                hard_timeout: Duration::from_millis(400),
            },
            move |_| {
                w.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            },
        );

        for _ in 0..5 {
            watchdog.start();
            std::thread::sleep(Duration::from_millis(5));
            watchdog.reset();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(warns.load(Ordering::SeqCst), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stuck_hook_escalates_warn_then_error_once() {
        let warns = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&warns);
        let e = Arc::clone(&errors);
        let watchdog = Watchdog::spawn(
            WatchdogConfig {
                soft_timeout: Duration::from_millis(30),
                hard_timeout: Duration::from_millis(80),
            },
            move |_| {
                w.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            },
        );

        watchdog.start();
        std::thread::sleep(Duration::from_millis(250));
        watchdog.reset();

        assert_eq!(warns.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
