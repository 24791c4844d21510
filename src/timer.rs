//! Periodic timer facility
//!
//! Runs a handler at a fixed period on a dedicated named thread until the
//! handler returns `false` or the timer is cancelled. The broker uses one
//! instance for its one-second watchdog tick.

use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Cancellable periodic timer.
pub struct Timer {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Timer {
    /// Start a timer invoking `handler` every `period`.
    ///
    /// The handler keeps the timer alive by returning `true`.
    pub fn every<F>(name: &str, period: Duration, mut handler: F) -> Result<Timer>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !shutdown_clone.load(Ordering::Relaxed) {
                    thread::sleep(period);
                    if shutdown_clone.load(Ordering::Relaxed) {
                        break;
                    }
                    if !handler() {
                        break;
                    }
                }
            })?;

        Ok(Timer {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Stop the timer and wait for its thread to exit.
    pub fn cancel(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
