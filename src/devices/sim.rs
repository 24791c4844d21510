//! Simulated vehicle for hardware-free operation
//!
//! A `SimVehicle` owns a worker thread that plays the role of a real
//! autopilot link: it emits telemetry (position, heading, battery) at a
//! configured period, executes server commands, and keeps its command
//! availability in sync with its armed state. All [`Device`] trait calls
//! arrive on the broker worker and are forwarded into the vehicle's own
//! context through a channel, so the broker is never blocked by a device.

use crate::broker::Messenger;
use crate::config::DeviceConfig;
use crate::device::{Device, ResponseHandle, UcsInfo};
use crate::error::Result;
use crate::proto::{
    field_value, CommandAvailability, CommandSpec, DeviceStatus, FieldValue, Payload,
    RegisterDevice, StatusCode, TelemetryField, TelemetrySpec, VsmMessage,
};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// Telemetry field ids advertised in the registration message.
const FIELD_LATITUDE: u32 = 1;
const FIELD_LONGITUDE: u32 = 2;
const FIELD_HEADING: u32 = 3;
const FIELD_BATTERY: u32 = 4;

// Command ids advertised in the registration message.
const CMD_ARM: u32 = 1;
const CMD_DISARM: u32 = 2;
const CMD_RETURN_HOME: u32 = 3;

enum SimRequest {
    UcsMessage {
        message: VsmMessage,
        response: Option<ResponseHandle>,
    },
    UcsInfo(Vec<UcsInfo>),
    Shutdown,
}

/// A simulated unmanned vehicle.
pub struct SimVehicle {
    session_id: u32,
    name: String,
    model: Option<String>,
    tx: Sender<SimRequest>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SimVehicle {
    /// Spawn the vehicle's worker thread.
    pub fn spawn(config: &DeviceConfig, messenger: Messenger) -> Result<Arc<SimVehicle>> {
        let (tx, rx) = unbounded();
        let mut state = SimState {
            session_id: config.session_id,
            name: config.name.clone(),
            messenger,
            armed: false,
            latitude: 55.7558,
            longitude: 37.6173,
            heading: 0.0,
            battery: 100.0,
        };
        let period = Duration::from_millis(config.telemetry_period_ms.max(10));

        let worker = thread::Builder::new()
            .name(format!("sim-vehicle-{}", config.session_id))
            .spawn(move || loop {
                match rx.recv_timeout(period) {
                    Ok(SimRequest::UcsMessage { message, response }) => {
                        state.handle_message(message, response);
                    }
                    Ok(SimRequest::UcsInfo(peers)) => {
                        info!(
                            "Vehicle {} visible on {} UCS connection(s)",
                            state.session_id,
                            peers.len()
                        );
                    }
                    Ok(SimRequest::Shutdown) => break,
                    Err(RecvTimeoutError::Timeout) => state.emit_telemetry(),
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Arc::new(SimVehicle {
            session_id: config.session_id,
            name: config.name.clone(),
            model: config.model.clone(),
            tx,
            worker: parking_lot::Mutex::new(Some(worker)),
        }))
    }

    /// Stop the worker thread.
    pub fn stop(&self) {
        let _ = self.tx.send(SimRequest::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SimVehicle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Device for SimVehicle {
    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn fill_register_msg(&self, msg: &mut RegisterDevice) {
        msg.name = self.name.clone();
        msg.model = self.model.clone();
        msg.telemetry = vec![
            telemetry_spec(FIELD_LATITUDE, "latitude", "degrees"),
            telemetry_spec(FIELD_LONGITUDE, "longitude", "degrees"),
            telemetry_spec(FIELD_HEADING, "heading", "degrees"),
            telemetry_spec(FIELD_BATTERY, "battery", "percent"),
        ];
        msg.commands = vec![
            CommandSpec {
                command_id: CMD_ARM,
                name: "arm".to_string(),
            },
            CommandSpec {
                command_id: CMD_DISARM,
                name: "disarm".to_string(),
            },
            CommandSpec {
                command_id: CMD_RETURN_HOME,
                name: "return_home".to_string(),
            },
        ];
    }

    fn on_ucs_message(&self, message: VsmMessage, response: Option<ResponseHandle>) {
        // The ResponseHandle answers Failed by itself if the worker is gone.
        let _ = self.tx.send(SimRequest::UcsMessage { message, response });
    }

    fn handle_ucs_info(&self, peers: Vec<UcsInfo>) {
        let _ = self.tx.send(SimRequest::UcsInfo(peers));
    }
}

fn telemetry_spec(field_id: u32, name: &str, semantic: &str) -> TelemetrySpec {
    TelemetrySpec {
        field_id,
        name: name.to_string(),
        semantic: Some(semantic.to_string()),
    }
}

fn double_field(field_id: u32, value: f64) -> TelemetryField {
    TelemetryField {
        field_id,
        value: Some(FieldValue {
            kind: Some(field_value::Kind::DoubleValue(value)),
        }),
    }
}

/// State owned by the vehicle worker thread.
struct SimState {
    session_id: u32,
    name: String,
    messenger: Messenger,
    armed: bool,
    latitude: f64,
    longitude: f64,
    heading: f64,
    battery: f64,
}

impl SimState {
    fn handle_message(&mut self, message: VsmMessage, response: Option<ResponseHandle>) {
        let command = match &message.payload {
            Some(Payload::DeviceCommand(command)) => command.clone(),
            _ => {
                debug!(
                    "Vehicle {} ignoring {} message",
                    self.session_id,
                    message.payload_name()
                );
                return;
            }
        };

        let (code, status) = match command.command_id {
            CMD_ARM => {
                self.armed = true;
                (StatusCode::Ok, "armed")
            }
            CMD_DISARM => {
                self.armed = false;
                (StatusCode::Ok, "disarmed")
            }
            CMD_RETURN_HOME => {
                if self.armed {
                    (StatusCode::Ok, "returning home")
                } else {
                    (StatusCode::Failed, "not armed")
                }
            }
            other => {
                warn!("Vehicle {} got unknown command {}", self.session_id, other);
                (StatusCode::InvalidCommand, "unknown command")
            }
        };
        info!(
            "Vehicle {} ({}) command {}: {}",
            self.session_id, self.name, command.command_id, status
        );

        if let Some(mut response) = response {
            response.set_code(code);
            response.set_status(status);
            response.send();
        }
        self.publish_availability();
    }

    /// Push the availability matching the current armed state.
    fn publish_availability(&self) {
        let availability = vec![
            CommandAvailability {
                command_id: CMD_ARM,
                is_available: true,
                is_enabled: !self.armed,
            },
            CommandAvailability {
                command_id: CMD_DISARM,
                is_available: true,
                is_enabled: self.armed,
            },
            CommandAvailability {
                command_id: CMD_RETURN_HOME,
                is_available: true,
                is_enabled: self.armed,
            },
        ];
        self.send_status(DeviceStatus {
            telemetry: Vec::new(),
            availability,
        });
    }

    fn emit_telemetry(&mut self) {
        if self.armed {
            // Fly a slow circle.
            self.heading = (self.heading + 5.0) % 360.0;
            self.latitude += 0.00002 * self.heading.to_radians().cos();
            self.longitude += 0.00002 * self.heading.to_radians().sin();
            self.battery = (self.battery - 0.05).max(0.0);
        }
        self.send_status(DeviceStatus {
            telemetry: vec![
                double_field(FIELD_LATITUDE, self.latitude),
                double_field(FIELD_LONGITUDE, self.longitude),
                double_field(FIELD_HEADING, self.heading),
                double_field(FIELD_BATTERY, self.battery),
            ],
            availability: Vec::new(),
        });
    }

    fn send_status(&self, status: DeviceStatus) {
        let message = VsmMessage {
            device_id: 0,
            message_id: None,
            response_required: false,
            payload: Some(Payload::DeviceStatus(status)),
        };
        if self
            .messenger
            .send_ucs_message(self.session_id, message, None)
            .is_err()
        {
            debug!("Vehicle {} broker is gone", self.session_id);
        }
    }
}
