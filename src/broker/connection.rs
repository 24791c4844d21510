//! Per-server connection record and its reader thread
//!
//! Each accepted UCS stream gets a record owned by the broker worker and a
//! dedicated reader thread owning a clone of the socket. The reader runs the
//! varint receive state machine, requesting exactly the number of bytes the
//! decoder asks for, and submits decoded messages (or the classified error
//! that ended the stream) into the worker's request queue. All record fields
//! are mutated only on the worker.

use crate::broker::Request;
use crate::proto::VsmMessage;
use crate::wire::{Decoded, IoStatus, ReadState};
use crossbeam_channel::Sender;
use log::{debug, warn};
use prost::Message;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// State of one UCS server link, keyed by stream id.
pub(crate) struct Connection {
    /// Write half; the reader thread owns its own clone.
    pub stream: TcpStream,
    pub stream_id: u32,
    /// Peer socket address, used for loopback detection during election.
    pub address: SocketAddr,
    /// Set after a successful `register_peer`.
    pub ucs_id: Option<u32>,
    /// Only primary connections receive broadcasts.
    pub primary: bool,
    /// Cleared when the peer version is below the supported minimum.
    pub is_compatible: bool,
    /// Outstanding `register_device` requests: message_id → device_id.
    pub pending_registrations: HashMap<u32, u32>,
    /// Devices this peer has confirmed.
    pub registered_devices: HashSet<u32>,
    /// Monotonic timestamp of the last inbound message, for the watchdog.
    pub last_message_time: Instant,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(stream: TcpStream, stream_id: u32, address: SocketAddr) -> Self {
        Connection {
            stream,
            stream_id,
            address,
            ucs_id: None,
            primary: false,
            is_compatible: true,
            pending_registrations: HashMap::new(),
            registered_devices: HashSet::new(),
            last_message_time: Instant::now(),
            reader: None,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.address.ip().is_loopback()
    }

    /// Start the reader thread for this connection.
    pub fn spawn_reader(&mut self, max_len: usize, tx: Sender<Request>) -> std::io::Result<()> {
        let stream = self.stream.try_clone()?;
        let stream_id = self.stream_id;
        let reader = thread::Builder::new()
            .name(format!("ucs-reader-{}", stream_id))
            .spawn(move || reader_loop(stream, stream_id, max_len, tx))?;
        self.reader = Some(reader);
        Ok(())
    }

    /// Shut the socket down and wait for the reader to exit.
    ///
    /// The shutdown unblocks the reader's pending `read_exact`, so the join
    /// completes promptly.
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// Blocking read loop: header bytes one at a time, then the exact body.
fn reader_loop(mut stream: TcpStream, stream_id: u32, max_len: usize, tx: Sender<Request>) {
    let mut state = ReadState::new(max_len);
    let mut buf = Vec::new();

    loop {
        let to_read = state.next_read_size();
        buf.resize(to_read, 0);
        if let Err(e) = stream.read_exact(&mut buf) {
            let status = IoStatus::from_error(&e);
            debug!("UCS stream {} read ended: {}", stream_id, status);
            let _ = tx.send(Request::StreamError { stream_id, status });
            return;
        }

        match state.feed(&buf) {
            Ok(Decoded::NeedMore) => {}
            Ok(Decoded::Frame(payload)) => match VsmMessage::decode(payload.as_slice()) {
                Ok(message) => {
                    if tx
                        .send(Request::MessageReceived { stream_id, message })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    warn!("UCS stream {} sent unparsable frame: {}", stream_id, e);
                    let _ = tx.send(Request::StreamError {
                        stream_id,
                        status: IoStatus::OtherFailure,
                    });
                    return;
                }
            },
            Err(e) => {
                // Oversize frame or varint overflow: fatal before any body
                // byte is consumed.
                warn!("UCS stream {} framing violation: {}", stream_id, e);
                let _ = tx.send(Request::StreamError {
                    stream_id,
                    status: IoStatus::OtherFailure,
                });
                return;
            }
        }
    }
}
