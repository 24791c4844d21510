//! Transport detector - named listening sockets feeding the broker
//!
//! Each registered detector owns a TCP listener on a dedicated accept thread
//! and hands accepted streams to its handler. The `"ucs"` detector carries
//! the server listener and always accepts, so a replacement server can
//! connect while zero links exist; detectors under any other tag honor the
//! [`activate`] flag, which the broker flips as server connections come and
//! go.
//!
//! [`activate`]: TransportDetector::activate

use crate::error::Result;
use log::{error, info, warn};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Detector tag whose listener ignores the activation flag.
pub const UCS_TAG: &str = "ucs";

/// Invoked on the accept thread for every accepted stream.
pub type AcceptHandler = Box<dyn Fn(&str, u16, SocketAddr, TcpStream) + Send + Sync>;

/// Poll interval of the nonblocking accept loops.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

struct DetectorEntry {
    tag: String,
    thread: Option<JoinHandle<()>>,
}

/// Set of named listening sockets with a shared activation flag.
pub struct TransportDetector {
    active: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    detectors: Vec<DetectorEntry>,
}

impl TransportDetector {
    pub fn new() -> Self {
        TransportDetector {
            active: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            detectors: Vec::new(),
        }
    }

    /// Flip the detection flag consumed by gated (non-"ucs") detectors.
    pub fn activate(&self, on: bool) {
        if self.active.swap(on, Ordering::Relaxed) != on {
            info!("Transport detector {}", if on { "activated" } else { "deactivated" });
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Register a listener under `tag` and start its accept thread.
    ///
    /// Returns the bound port (useful when 0 requested an ephemeral one).
    pub fn add_detector(
        &mut self,
        tag: &str,
        address: &str,
        port: u16,
        handler: AcceptHandler,
    ) -> Result<u16> {
        let listener = TcpListener::bind((address, port))?;
        listener.set_nonblocking(true)?;
        let bound_port = listener.local_addr()?.port();
        info!("Detector [{}] listening on {}:{}", tag, address, bound_port);

        let gated = tag != UCS_TAG;
        let tag_owned = tag.to_string();
        let active = Arc::clone(&self.active);
        let shutdown = Arc::clone(&self.shutdown);

        let thread = thread::Builder::new()
            .name(format!("detector-{}", tag))
            .spawn(move || {
                accept_loop(listener, tag_owned, bound_port, gated, active, shutdown, handler);
            })?;

        self.detectors.push(DetectorEntry {
            tag: tag.to_string(),
            thread: Some(thread),
        });
        Ok(bound_port)
    }

    /// Stop every accept thread and wait for them to exit.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for entry in &mut self.detectors {
            if let Some(thread) = entry.thread.take() {
                let _ = thread.join();
            }
            info!("Detector [{}] stopped", entry.tag);
        }
        self.detectors.clear();
    }
}

impl Default for TransportDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TransportDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    tag: String,
    port: u16,
    gated: bool,
    active: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    handler: AcceptHandler,
) {
    while !shutdown.load(Ordering::Relaxed) {
        if gated && !active.load(Ordering::Relaxed) {
            thread::sleep(ACCEPT_POLL);
            continue;
        }
        match listener.accept() {
            Ok((stream, addr)) => {
                info!("Detector [{}] accepted connection from {}", tag, addr);
                handler(&tag, port, addr, stream);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                error!("Detector [{}] accept error: {}", tag, e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    if gated && active.load(Ordering::Relaxed) {
        warn!("Detector [{}] stopping while active", tag);
    }
}
