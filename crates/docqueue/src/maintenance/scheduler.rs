//! Fixed-interval background tasks.
//!
//! Each task runs on its own thread driving a current-thread tokio runtime.
//! The loop wakes on the interval or on a manual trigger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::SpawnError;

/// Work performed on every tick.
pub trait MaintenanceTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Runs one cycle. Implementations log their own outcome.
    fn run_once(&self);
}

/// Drives a [`MaintenanceTask`] at a fixed interval.
pub struct PeriodicTask {
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    trigger: broadcast::Sender<()>,
}

impl PeriodicTask {
    pub fn new(interval: Duration) -> Self {
        let (trigger, _) = broadcast::channel(16);
        Self {
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            trigger,
        }
    }

    /// Starts the loop in a background thread. The first cycle runs one
    /// interval after start.
    pub fn start<T: MaintenanceTask>(&self, task: Arc<T>) -> Result<JoinHandle<()>, SpawnError> {
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;
        let mut trigger_rx = self.trigger.subscribe();
        let name = task.name();

        let thread_name = format!("docqueue-{}", name);
        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("Failed to start runtime for {}: {}", name, e);
                        return;
                    }
                };

                rt.block_on(async {
                    let mut interval_timer = tokio::time::interval(interval);
                    interval_timer.tick().await; // skip immediate first tick

                    loop {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        tokio::select! {
                            _ = interval_timer.tick() => {},
                            Ok(()) = trigger_rx.recv() => {
                                log::debug!("Manual {} triggered", name);
                            },
                        }

                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        task.run_once();
                    }
                });

                log::debug!("{} loop stopped", name);
            })
            .map_err(|e| SpawnError::new(thread_name, e))
    }

    /// Runs a cycle now instead of waiting for the next tick.
    pub fn trigger(&self) {
        let _ = self.trigger.send(());
    }

    /// Signals the loop to stop and wakes it.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.trigger.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter(AtomicUsize);

    impl MaintenanceTask for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn run_once(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_runs_on_interval_and_stops() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let task = PeriodicTask::new(Duration::from_millis(20));
        let handle = task.start(Arc::clone(&counter)).unwrap();

        std::thread::sleep(Duration::from_millis(150));
        task.stop();
        handle.join().expect("task thread panicked");

        assert!(counter.0.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_manual_trigger_runs_before_interval() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let task = PeriodicTask::new(Duration::from_secs(3600));
        let handle = task.start(Arc::clone(&counter)).unwrap();

        task.trigger();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.0.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "trigger was not handled");
            std::thread::sleep(Duration::from_millis(10));
        }

        task.stop();
        handle.join().expect("task thread panicked");
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_failure_surfaces_as_service_error() {
        let err = SpawnError::new(
            "docqueue-retention-sweep",
            std::io::Error::new(std::io::ErrorKind::WouldBlock, "thread limit reached"),
        );
        assert!(err.to_string().contains("docqueue-retention-sweep"));

        let err = crate::error::DocqueueError::from(err);
        assert!(matches!(err, crate::error::DocqueueError::Spawn(_)));
        assert!(!err.to_string().contains("Worker"));
    }
}
