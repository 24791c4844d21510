//! Device implementations
//!
//! The broker itself only knows the [`Device`](crate::device::Device) trait;
//! concrete vehicles live here. `sim` provides a hardware-free vehicle so
//! the daemon is operational (and testable) without real aircraft attached.

pub mod sim;

pub use sim::SimVehicle;
