//! Setu - VSM broker bridging unmanned vehicles to UCS ground control
//!
//! This library implements the vehicle-side half of the UCS link: it accepts
//! TCP connections from Universal Control System servers, performs the
//! peer-identification handshake, mirrors locally registered devices and
//! their cached telemetry to every compatible server, and routes server
//! commands (and their responses) to the right device.
//!
//! The broker owns all of its state on a single worker thread fed by a
//! request queue; see the [`broker`] module for the concurrency model.

pub mod broker;
pub mod config;
pub mod detector;
pub mod device;
pub mod devices;
pub mod error;
pub mod proto;
pub mod timer;
pub mod wire;

// Re-export commonly used types
pub use broker::{Messenger, UcsBroker};
pub use config::Config;
pub use device::{Device, ResponseHandle, UcsInfo};
pub use error::{Error, Result};
