//! Device trait - the seam between the broker and vehicle implementations.
//!
//! A device is a locally-attached entity (unmanned vehicle or peripheral)
//! identified by a nonzero session id. The broker mirrors each registered
//! device to every compatible UCS server and routes server-originated
//! messages back through [`Device::on_ucs_message`].
//!
//! # Threading
//!
//! All trait methods are invoked on the broker worker thread and must not
//! block: implementations move real work onto their own processing context
//! (a dedicated thread draining a channel, see `devices::sim`) and return
//! immediately. The [`ResponseHandle`] can travel into that context; the
//! reply it carries re-enters the broker and is written to the exact stream
//! the request arrived on. If that stream has meanwhile closed, the reply is
//! dropped by a no-op lookup.

use crate::proto::{DeviceResponse, Payload, RegisterDevice, StatusCode, VsmMessage};
use std::net::SocketAddr;
use std::time::Instant;

/// Snapshot of one server connection a device is visible on.
///
/// Delivered through [`Device::handle_ucs_info`] whenever the set changes:
/// after a registration is confirmed by a server, after a connection closes,
/// and after a primary election.
#[derive(Debug, Clone)]
pub struct UcsInfo {
    pub ucs_id: u32,
    pub address: SocketAddr,
    pub primary: bool,
    pub last_message: Instant,
}

/// Completion handle for a server request that requires a response.
///
/// Carries a prebuilt response (`Failed`, with `message_id` and `device_id`
/// already filled in) which the device may mutate before calling [`send`].
/// Dropping the handle without sending delivers the response as-is, so a
/// device that forgets to complete still answers the server.
///
/// [`send`]: ResponseHandle::send
pub struct ResponseHandle {
    response: Option<VsmMessage>,
    deliver: Option<Box<dyn FnOnce(VsmMessage) + Send>>,
}

impl ResponseHandle {
    pub(crate) fn new(
        response: VsmMessage,
        deliver: impl FnOnce(VsmMessage) + Send + 'static,
    ) -> Self {
        ResponseHandle {
            response: Some(response),
            deliver: Some(Box::new(deliver)),
        }
    }

    pub fn set_code(&mut self, code: StatusCode) {
        self.with_response(|r| r.code = code as i32);
    }

    pub fn set_progress(&mut self, progress: f32) {
        self.with_response(|r| r.progress = Some(progress.clamp(0.0, 1.0)));
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.with_response(|r| r.status = Some(status.into()));
    }

    /// Deliver the response to the stream the request arrived on.
    pub fn send(mut self) {
        if let (Some(response), Some(deliver)) = (self.response.take(), self.deliver.take()) {
            deliver(response);
        }
    }

    fn with_response(&mut self, f: impl FnOnce(&mut DeviceResponse)) {
        if let Some(message) = self.response.as_mut() {
            if let Some(Payload::DeviceResponse(r)) = message.payload.as_mut() {
                f(r);
            }
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if let (Some(response), Some(deliver)) = (self.response.take(), self.deliver.take()) {
            deliver(response);
        }
    }
}

/// A registrable device.
///
/// Implementations own their processing context; see the module docs for the
/// threading contract.
pub trait Device: Send + Sync {
    /// Session id, nonzero and stable for the lifetime of the device.
    fn session_id(&self) -> u32;

    /// Populate the registration payload cached and replayed by the broker.
    ///
    /// Called once, on the broker worker, while `register_device` blocks.
    fn fill_register_msg(&self, msg: &mut RegisterDevice);

    /// A server message addressed to this device.
    ///
    /// `response` is `Some` when the server requires an answer.
    fn on_ucs_message(&self, message: VsmMessage, response: Option<ResponseHandle>);

    /// The set of server connections this device is currently visible on.
    fn handle_ucs_info(&self, peers: Vec<UcsInfo>);
}
