//! UCS broker - connection manager and message router
//!
//! The broker mediates between locally registered devices and remote UCS
//! servers. All broker state lives on a single worker thread (the "ucs
//! worker"). Every producer (reader threads, the transport detector's
//! accept thread, the watchdog timer, device threads, and the public API)
//! submits a [`Request`] onto one queue which the worker drains serially.
//! Because of this discipline no locks protect the connection table, the
//! device registry, or any cache.
//!
//! # Lifecycle
//!
//! [`UcsBroker::start`] wires the detector listener and the one-second
//! watchdog and spawns the worker. [`UcsBroker::stop`] (also run on drop)
//! cancels the timer, stops the accept threads, closes every stream (which
//! unblocks the readers), and joins the worker.

mod connection;
mod core;

pub use self::core::{REGISTER_PEER_TIMEOUT, WRITE_TIMEOUT};

use self::core::Core;
use crate::config::Config;
use crate::detector::{AcceptHandler, TransportDetector, UCS_TAG};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::proto::VsmMessage;
use crate::timer::Timer;
use crate::wire::IoStatus;
use crossbeam_channel::{bounded, unbounded, Sender};
use log::info;
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Work items drained by the broker worker.
pub(crate) enum Request {
    /// The detector accepted a new server stream.
    StreamAccepted {
        stream: TcpStream,
        address: SocketAddr,
    },
    /// A reader thread decoded a complete message.
    MessageReceived { stream_id: u32, message: VsmMessage },
    /// A reader thread hit a read error or framing violation.
    StreamError { stream_id: u32, status: IoStatus },
    /// Blocking device registration; the result answers the caller.
    RegisterDevice {
        device: Arc<dyn Device>,
        done: Sender<Result<()>>,
    },
    UnregisterDevice { session_id: u32 },
    /// Device-originated message, directed or broadcast.
    SendUcsMessage {
        session_id: u32,
        message: VsmMessage,
        stream_id: Option<u32>,
    },
    /// Completed device response bound for the stream its request came from.
    DeviceResponseReady { stream_id: u32, message: VsmMessage },
    /// Watchdog tick.
    Tick,
    Shutdown { done: Sender<()> },
}

/// Handle device threads use to push telemetry and responses toward servers.
///
/// Cloneable and cheap; every call is a non-blocking enqueue.
#[derive(Clone)]
pub struct Messenger {
    tx: Sender<Request>,
}

impl Messenger {
    /// Channel-backed messenger for in-crate tests.
    #[cfg(test)]
    pub(crate) fn test_pair() -> (Messenger, crossbeam_channel::Receiver<Request>) {
        let (tx, rx) = unbounded();
        (Messenger { tx }, rx)
    }

    /// Queue a message from `session_id`. With `stream_id` the message goes
    /// to one connection, otherwise to every primary connection.
    pub fn send_ucs_message(
        &self,
        session_id: u32,
        message: VsmMessage,
        stream_id: Option<u32>,
    ) -> Result<()> {
        self.tx
            .send(Request::SendUcsMessage {
                session_id,
                message,
                stream_id,
            })
            .map_err(|_| Error::WorkerGone)
    }
}

/// The running broker.
pub struct UcsBroker {
    tx: Sender<Request>,
    worker: Option<JoinHandle<()>>,
    timer: Option<Timer>,
    detector: Arc<Mutex<TransportDetector>>,
    port: u16,
}

impl UcsBroker {
    /// Start the worker, the UCS listener, and the watchdog.
    ///
    /// With `ucs.disable` set the worker still runs (so the device API keeps
    /// working) but no listener or watchdog is created: the UCS core stays
    /// dormant.
    pub fn start(config: &Config) -> Result<UcsBroker> {
        config.validate()?;

        let (tx, rx) = unbounded();
        let detector = Arc::new(Mutex::new(TransportDetector::new()));
        let mut core = Core::new(
            tx.clone(),
            config.ucs.clone(),
            config.vsm.clone(),
            Some(Arc::clone(&detector)),
        );
        let worker = thread::Builder::new()
            .name("ucs-worker".to_string())
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    if !core.handle(request) {
                        break;
                    }
                }
            })?;

        let mut timer = None;
        let mut port = 0;
        if config.ucs.disable {
            info!("UCS core disabled by configuration");
        } else {
            if config.ucs.transport_detector_on_when_diconnected {
                detector.lock().activate(true);
            }

            let accept_tx = tx.clone();
            let handler: AcceptHandler = Box::new(move |_tag, _port, address, stream| {
                let _ = accept_tx.send(Request::StreamAccepted { stream, address });
            });
            port = detector.lock().add_detector(
                UCS_TAG,
                &config.ucs.local_listening_address,
                config.ucs.local_listening_port,
                handler,
            )?;

            let tick_tx = tx.clone();
            timer = Some(Timer::every(
                "ucs-watchdog",
                Duration::from_secs(1),
                move || tick_tx.send(Request::Tick).is_ok(),
            )?);
            info!("UCS broker listening on port {}", port);
        }

        Ok(UcsBroker {
            tx,
            worker: Some(worker),
            timer,
            detector,
            port,
        })
    }

    /// Port the UCS listener is bound to; 0 when the core is disabled.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Register a device and block until the worker has cached its
    /// registration message (the device is read during this call).
    pub fn register_device(&self, device: Arc<dyn Device>) -> Result<()> {
        let (done, result) = bounded(1);
        self.tx
            .send(Request::RegisterDevice { device, done })
            .map_err(|_| Error::WorkerGone)?;
        result.recv().map_err(|_| Error::WorkerGone)?
    }

    /// Remove a device. Non-blocking; an unknown id is logged by the worker.
    pub fn unregister_device(&self, session_id: u32) -> Result<()> {
        self.tx
            .send(Request::UnregisterDevice { session_id })
            .map_err(|_| Error::WorkerGone)
    }

    /// Handle for device threads; see [`Messenger`].
    pub fn messenger(&self) -> Messenger {
        Messenger {
            tx: self.tx.clone(),
        }
    }

    /// Stop accepting, close every connection, and join the worker.
    pub fn stop(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.cancel();
        }
        self.detector.lock().stop();

        if let Some(worker) = self.worker.take() {
            let (done, finished) = bounded(1);
            if self.tx.send(Request::Shutdown { done }).is_ok() {
                let _ = finished.recv_timeout(Duration::from_secs(5));
            }
            let _ = worker.join();
        }
    }
}

impl Drop for UcsBroker {
    fn drop(&mut self) {
        self.stop();
    }
}
