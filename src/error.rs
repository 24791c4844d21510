//! Error types for the Setu VSM broker
//!
//! # Error Recovery Strategies
//!
//! Different error types require different recovery approaches:
//!
//! ## Connection-local errors (close one connection)
//!
//! - **`FrameTooLarge`** / **`VarintOverflow`**: The peer sent a frame header
//!   that violates the protocol bound. The offending connection is closed;
//!   other server links are unaffected.
//!
//! - **`Decode`**: A frame body failed protobuf parsing. Fatal for the
//!   connection that produced it, harmless for the rest of the broker.
//!
//! - **`Io`**: Read/write error or write timeout on a server link. The link
//!   is torn down and its devices are notified; the server is expected to
//!   reconnect and receive a full state replay.
//!
//! ## Application errors (log and report to the caller)
//!
//! - **`DuplicateDevice`** / **`UnknownDevice`**: Registration misuse by the
//!   device layer. Reported back to the caller, broker state is unchanged.
//!
//! ## Configuration errors (fix and restart)
//!
//! - **`Config`**: The TOML configuration is missing or invalid.
//!
//! ## Fatal errors
//!
//! - **`WorkerGone`**: The broker worker thread is no longer draining the
//!   request queue. Only seen during shutdown races; callers should treat it
//!   as "broker stopped".

use thiserror::Error;

/// Errors that can occur in the Setu VSM broker
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Frame of {got} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { max: usize, got: usize },

    #[error("Varint length header exceeds 5 bytes")]
    VarintOverflow,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Device with session id {0} is already registered")]
    DuplicateDevice(u32),

    #[error("Unknown device session id {0}")]
    UnknownDevice(u32),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Broker worker is not running")]
    WorkerGone,
}

pub type Result<T> = std::result::Result<T, Error>;
