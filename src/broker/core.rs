//! Broker worker state: handshake, routing, broadcast, election, watchdog
//!
//! Everything in [`Core`] is owned by the single worker thread; requests
//! arrive serially through the queue drained in `broker::mod`, so no locks
//! protect any of this state. Connection and device tables are ordered maps
//! keyed by monotonically assigned ids, which keeps every scan (duplicate
//! detection, primary election, broadcast) deterministic in accept order.

use crate::broker::connection::Connection;
use crate::broker::Request;
use crate::config::{UcsConfig, VsmConfig};
use crate::detector::TransportDetector;
use crate::device::{Device, ResponseHandle, UcsInfo};
use crate::error::{Error, Result};
use crate::proto::{
    self, CommandAvailability, DeviceStatus, Payload, RegisterDevice, RegisterPeer, StatusCode,
    TelemetryField, UnregisterDevice, VsmMessage,
};
use crate::wire::{encode_frame, IoStatus};
use crossbeam_channel::Sender;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A write that does not complete within this bound is treated as a dropped
/// connection.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long an accepted connection may stay silent before its handshake.
pub const REGISTER_PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// One registered device: handle, cached registration, and the state replayed
/// to late-joining servers.
struct DeviceRecord {
    handle: Arc<dyn Device>,
    registration_message: VsmMessage,
    telemetry_cache: BTreeMap<u32, TelemetryField>,
    availability_cache: BTreeMap<u32, CommandAvailability>,
}

/// Worker-owned broker state.
pub(crate) struct Core {
    tx: Sender<Request>,
    ucs: UcsConfig,
    vsm: VsmConfig,
    detector: Option<Arc<Mutex<TransportDetector>>>,
    connections: BTreeMap<u32, Connection>,
    devices: BTreeMap<u32, DeviceRecord>,
    next_stream_id: u32,
    next_message_id: u32,
}

impl Core {
    pub fn new(
        tx: Sender<Request>,
        ucs: UcsConfig,
        vsm: VsmConfig,
        detector: Option<Arc<Mutex<TransportDetector>>>,
    ) -> Self {
        Core {
            tx,
            ucs,
            vsm,
            detector,
            connections: BTreeMap::new(),
            devices: BTreeMap::new(),
            next_stream_id: 0,
            next_message_id: 0,
        }
    }

    /// Process one request. Returns `false` once a shutdown request has been
    /// handled and the worker should exit.
    pub fn handle(&mut self, request: Request) -> bool {
        match request {
            Request::StreamAccepted { stream, address } => {
                self.on_stream_accepted(stream, address);
            }
            Request::MessageReceived { stream_id, message } => {
                self.on_message(stream_id, message);
            }
            Request::StreamError { stream_id, status } => {
                self.on_stream_error(stream_id, status);
            }
            Request::RegisterDevice { device, done } => {
                let result = self.on_register_device(device);
                let _ = done.send(result);
            }
            Request::UnregisterDevice { session_id } => {
                if let Err(e) = self.on_unregister_device(session_id) {
                    warn!("Unregister failed: {}", e);
                }
            }
            Request::SendUcsMessage {
                session_id,
                message,
                stream_id,
            } => {
                self.on_send_ucs_message(session_id, message, stream_id);
            }
            Request::DeviceResponseReady { stream_id, message } => {
                // A meanwhile-closed stream makes this a no-op lookup.
                self.send(stream_id, message);
            }
            Request::Tick => {
                self.on_tick();
            }
            Request::Shutdown { done } => {
                self.shutdown();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    // === Connection manager ===

    fn on_stream_accepted(&mut self, stream: TcpStream, address: SocketAddr) {
        if let Err(e) = stream.set_write_timeout(Some(WRITE_TIMEOUT)) {
            warn!("Rejecting connection from {}: {}", address, e);
            return;
        }

        self.next_stream_id += 1;
        let stream_id = self.next_stream_id;
        let mut connection = Connection::new(stream, stream_id, address);
        if let Err(e) = connection.spawn_reader(self.ucs.max_message_len, self.tx.clone()) {
            warn!("Rejecting connection from {}: {}", address, e);
            return;
        }
        info!("UCS connection accepted [{}] as stream {}", address, stream_id);
        self.connections.insert(stream_id, connection);

        // Both sides open with register_peer.
        let hello = VsmMessage::our_register_peer(self.vsm.peer_id, &self.vsm.name);
        self.send(stream_id, hello);
    }

    fn on_stream_error(&mut self, stream_id: u32, status: IoStatus) {
        if !self.connections.contains_key(&stream_id) {
            return;
        }
        warn!(
            "UCS connection closed (stream {}, {}), {} devices registered",
            stream_id,
            status,
            self.devices.len()
        );
        self.close_connection(stream_id);
    }

    // === Router (inbound dispatch) ===

    fn on_message(&mut self, stream_id: u32, message: VsmMessage) {
        let peered = match self.connections.get_mut(&stream_id) {
            None => return,
            Some(connection) => {
                connection.last_message_time = Instant::now();
                connection.ucs_id.is_some()
            }
        };

        match (peered, message.register_peer().cloned()) {
            (false, Some(reg)) => self.handle_register_peer(stream_id, reg),
            (false, None) => {
                warn!(
                    "Dropping {} received on stream {} before register_peer",
                    message.payload_name(),
                    stream_id
                );
            }
            (true, Some(_)) => {
                warn!(
                    "Duplicate register_peer on stream {}, closing connection",
                    stream_id
                );
                self.close_connection(stream_id);
            }
            (true, None) => self.route_message(stream_id, message),
        }
    }

    /// Peer handshake: identity checks, duplicate-link election, version
    /// compatibility, and registration replay.
    fn handle_register_peer(&mut self, stream_id: u32, reg: RegisterPeer) {
        if let Some(peer_type) = reg.peer_type {
            if peer_type != proto::PeerType::Server as i32 {
                warn!(
                    "Peer on stream {} has unsupported type {}, closing connection",
                    stream_id, peer_type
                );
                self.close_connection(stream_id);
                return;
            }
        }

        let new_peer = reg.peer_id;
        let incoming_loopback = match self.connections.get(&stream_id) {
            None => return,
            Some(connection) => connection.is_loopback(),
        };

        // Scan for an existing link to the same server, first match wins.
        let mut duplicate = false;
        let mut transfer_from: Option<u32> = None;
        for (id, existing) in &self.connections {
            if *id == stream_id || existing.ucs_id != Some(new_peer) {
                continue;
            }
            duplicate = true;
            if (!existing.is_loopback() || incoming_loopback) && existing.primary {
                transfer_from = Some(*id);
            }
            break;
        }

        if duplicate {
            if let Some(from) = transfer_from {
                if let Some(existing) = self.connections.get_mut(&from) {
                    existing.primary = false;
                }
                if let Some(connection) = self.connections.get_mut(&stream_id) {
                    connection.primary = true;
                }
                info!(
                    "UCS {} primary moved from stream {} to stream {}",
                    new_peer, from, stream_id
                );
            }
        } else {
            if let Some(connection) = self.connections.get_mut(&stream_id) {
                connection.primary = true;
            }
            self.set_detector_active(true);
        }

        let compatible = proto::version_supported(reg.version_major, reg.version_minor);
        if let Some(connection) = self.connections.get_mut(&stream_id) {
            connection.ucs_id = Some(new_peer);
            connection.last_message_time = Instant::now();
            connection.is_compatible = compatible;
        }
        info!(
            "UCS {} ({}) peered on stream {} at version {}.{}{}",
            new_peer,
            reg.name.as_deref().unwrap_or("unnamed"),
            stream_id,
            reg.version_major,
            reg.version_minor,
            if compatible { "" } else { " (incompatible)" }
        );
        if !compatible {
            warn!(
                "UCS {} version {}.{} is below supported {}.{}; dropping all sends to it",
                new_peer,
                reg.version_major,
                reg.version_minor,
                proto::SUPPORTED_VERSION_MAJOR,
                proto::SUPPORTED_VERSION_MINOR
            );
        }

        // Late-joining servers get the full device roster.
        let registrations: Vec<VsmMessage> = self
            .devices
            .values()
            .map(|record| record.registration_message.clone())
            .collect();
        for registration in registrations {
            self.send(stream_id, registration);
        }
    }

    fn route_message(&mut self, stream_id: u32, message: VsmMessage) {
        if message.device_response().is_some() {
            if let Some(message_id) = message.message_id {
                let pending = self
                    .connections
                    .get(&stream_id)
                    .and_then(|c| c.pending_registrations.get(&message_id).copied());
                if let Some(device_id) = pending {
                    self.handle_registration_response(stream_id, message_id, device_id, &message);
                    return;
                }
            }
        }
        self.on_ucs_message(stream_id, message);
    }

    /// A server's verdict on one of our `register_device` requests.
    fn handle_registration_response(
        &mut self,
        stream_id: u32,
        message_id: u32,
        device_id: u32,
        message: &VsmMessage,
    ) {
        let response = match message.device_response() {
            Some(r) => r,
            None => return,
        };

        if response.code == StatusCode::InProgress as i32 {
            debug!(
                "Registration of device {} in progress on stream {} ({:.0}%)",
                device_id,
                stream_id,
                response.progress.unwrap_or(0.0) * 100.0
            );
            return;
        }

        if let Some(connection) = self.connections.get_mut(&stream_id) {
            connection.pending_registrations.remove(&message_id);
        }

        if response.code != StatusCode::Ok as i32 {
            warn!(
                "UCS rejected registration of device {} on stream {}: code {} ({})",
                device_id,
                stream_id,
                response.code,
                response.status.as_deref().unwrap_or("no detail")
            );
            return;
        }

        if !self.devices.contains_key(&device_id) {
            // Device unregistered while the ack was in flight.
            debug!(
                "Registration ack for device {} arrived after its removal",
                device_id
            );
            return;
        }

        if let Some(connection) = self.connections.get_mut(&stream_id) {
            connection.registered_devices.insert(device_id);
        }
        info!(
            "Device {} registered on UCS stream {}",
            device_id, stream_id
        );
        self.notify_device_peers(device_id);
        self.replay_device_state(stream_id, device_id);
    }

    /// Replay cached telemetry and command availability to a server that just
    /// confirmed a device.
    fn replay_device_state(&mut self, stream_id: u32, device_id: u32) {
        let status = match self.devices.get(&device_id) {
            None => return,
            Some(record) => {
                let telemetry: Vec<TelemetryField> = record
                    .telemetry_cache
                    .values()
                    .filter(|field| !field.value.as_ref().is_some_and(|v| v.is_na()))
                    .cloned()
                    .collect();
                let availability: Vec<CommandAvailability> =
                    record.availability_cache.values().cloned().collect();
                if telemetry.is_empty() && availability.is_empty() {
                    return;
                }
                DeviceStatus {
                    telemetry,
                    availability,
                }
            }
        };
        let message = VsmMessage {
            device_id,
            message_id: None,
            response_required: false,
            payload: Some(Payload::DeviceStatus(status)),
        };
        self.send(stream_id, message);
    }

    /// Generic inbound path: route by device id.
    fn on_ucs_message(&mut self, stream_id: u32, message: VsmMessage) {
        if message.device_id == 0 {
            if message.response_required {
                let response = VsmMessage::response_to(&message, StatusCode::Ok);
                self.send(stream_id, response);
            } else {
                trace!(
                    "Ignoring {} addressed to the peer itself on stream {}",
                    message.payload_name(),
                    stream_id
                );
            }
            return;
        }

        let handle = match self.devices.get(&message.device_id) {
            Some(record) => Arc::clone(&record.handle),
            None => {
                if message.response_required {
                    let response = VsmMessage::response_to(&message, StatusCode::InvalidSessionId);
                    self.send(stream_id, response);
                } else {
                    warn!(
                        "Dropping {} for unknown device {} on stream {}",
                        message.payload_name(),
                        message.device_id,
                        stream_id
                    );
                }
                return;
            }
        };

        let response = if message.response_required {
            // Capture the stream id, never the connection: a late completion
            // on a closed stream must degrade to a no-op lookup.
            let template = VsmMessage::response_to(&message, StatusCode::Failed);
            let tx = self.tx.clone();
            Some(ResponseHandle::new(template, move |reply| {
                let _ = tx.send(Request::DeviceResponseReady { stream_id, message: reply });
            }))
        } else {
            None
        };
        handle.on_ucs_message(message, response);
    }

    // === Broadcaster (outbound) ===

    /// Directed send with registration gating. Closing the connection on
    /// write failure or timeout is part of this call.
    pub(crate) fn send(&mut self, stream_id: u32, mut message: VsmMessage) {
        let (peered, compatible, device_registered) = match self.connections.get(&stream_id) {
            None => return,
            Some(connection) => (
                connection.ucs_id.is_some(),
                connection.is_compatible,
                connection.registered_devices.contains(&message.device_id),
            ),
        };

        let is_register_peer = matches!(message.payload, Some(Payload::RegisterPeer(_)));
        if !peered && !is_register_peer {
            error!(
                "Refusing to send {} on unpeered stream {}",
                message.payload_name(),
                stream_id
            );
            return;
        }
        if !compatible {
            return;
        }

        let mut pending_insert = None;
        if message.is_register_device() {
            message.response_required = true;
            let message_id = self.alloc_message_id();
            message.message_id = Some(message_id);
            pending_insert = Some((message_id, message.device_id));
        } else if message.device_id != 0 && !device_registered {
            if message.is_unregister_device() {
                if let Some(connection) = self.connections.get_mut(&stream_id) {
                    let device_id = message.device_id;
                    connection
                        .pending_registrations
                        .retain(|_, did| *did != device_id);
                }
            } else {
                return;
            }
        }

        if message.response_required && message.message_id.is_none() {
            message.message_id = Some(self.alloc_message_id());
        }
        debug_assert!(!message.response_required || message.message_id != Some(0));

        let frame = encode_frame(&message);
        let failed = match self.connections.get_mut(&stream_id) {
            None => return,
            Some(connection) => {
                if let Some((message_id, device_id)) = pending_insert {
                    connection
                        .pending_registrations
                        .insert(message_id, device_id);
                }
                match connection.stream.write_all(&frame) {
                    Ok(()) => {
                        trace!(
                            "Sent {} ({} bytes) on stream {}",
                            message.payload_name(),
                            frame.len(),
                            stream_id
                        );
                        false
                    }
                    Err(e) => {
                        warn!(
                            "Write on stream {} failed ({}), closing connection",
                            stream_id,
                            IoStatus::from_error(&e)
                        );
                        true
                    }
                }
            }
        };
        if failed {
            self.close_connection(stream_id);
        }
    }

    /// Send to every primary connection. Iterates a snapshot of ids because
    /// a failed send removes its connection.
    pub(crate) fn broadcast(&mut self, message: &VsmMessage) {
        let targets: Vec<u32> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.primary)
            .map(|(id, _)| *id)
            .collect();
        for stream_id in targets {
            self.send(stream_id, message.clone());
        }
    }

    fn alloc_message_id(&mut self) -> u32 {
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        self.next_message_id
    }

    // === Device registry ===

    fn on_register_device(&mut self, device: Arc<dyn Device>) -> Result<()> {
        let device_id = device.session_id();
        if device_id == 0 {
            return Err(Error::Protocol(
                "device session id 0 is reserved for the peer itself".to_string(),
            ));
        }
        if self.devices.contains_key(&device_id) {
            return Err(Error::DuplicateDevice(device_id));
        }

        let mut payload = RegisterDevice::default();
        device.fill_register_msg(&mut payload);
        let registration_message = VsmMessage {
            device_id,
            message_id: None,
            response_required: false,
            payload: Some(Payload::RegisterDevice(payload)),
        };

        self.devices.insert(
            device_id,
            DeviceRecord {
                handle: device,
                registration_message: registration_message.clone(),
                telemetry_cache: BTreeMap::new(),
                availability_cache: BTreeMap::new(),
            },
        );

        if self.connections.is_empty() {
            warn!(
                "Device {} registered, but no UCS servers are connected",
                device_id
            );
        } else {
            self.broadcast(&registration_message);
        }
        Ok(())
    }

    fn on_unregister_device(&mut self, device_id: u32) -> Result<()> {
        if self.devices.remove(&device_id).is_none() {
            return Err(Error::UnknownDevice(device_id));
        }
        info!("Device {} unregistered", device_id);

        let message = VsmMessage {
            device_id,
            message_id: None,
            response_required: false,
            payload: Some(Payload::UnregisterDevice(UnregisterDevice {})),
        };
        self.broadcast(&message);

        for connection in self.connections.values_mut() {
            connection.registered_devices.remove(&device_id);
            connection
                .pending_registrations
                .retain(|_, did| *did != device_id);
        }
        Ok(())
    }

    /// Device-originated traffic: merge state caches, then send or broadcast.
    fn on_send_ucs_message(
        &mut self,
        session_id: u32,
        mut message: VsmMessage,
        stream_id: Option<u32>,
    ) {
        // The device may be gone by the time this queued request runs.
        let record = match self.devices.get_mut(&session_id) {
            Some(record) => record,
            None => {
                debug!("Dropping message from unregistered device {}", session_id);
                return;
            }
        };

        if let Some(Payload::DeviceStatus(status)) = &message.payload {
            for field in &status.telemetry {
                record.telemetry_cache.insert(field.field_id, field.clone());
            }
            for availability in &status.availability {
                record
                    .availability_cache
                    .insert(availability.command_id, availability.clone());
            }
        }

        message.device_id = session_id;
        match stream_id {
            Some(stream_id) => self.send(stream_id, message),
            None => self.broadcast(&message),
        }
    }

    // === Close path and primary election ===

    fn close_connection(&mut self, stream_id: u32) {
        let mut connection = match self.connections.remove(&stream_id) {
            None => return,
            Some(connection) => connection,
        };
        let was_primary = connection.primary;
        let ucs_id = connection.ucs_id;
        let known_devices: Vec<u32> = connection.registered_devices.iter().copied().collect();
        info!(
            "Closing UCS connection [{}] (stream {})",
            connection.address, stream_id
        );
        connection.close();

        if was_primary {
            if let Some(ucs_id) = ucs_id {
                self.promote_replacement(ucs_id);
            }
        }

        for device_id in known_devices {
            self.notify_device_peers(device_id);
        }

        if self.connections.is_empty() && !self.ucs.transport_detector_on_when_diconnected {
            self.set_detector_active(false);
        }
    }

    /// Promote one surviving link to the same server: prefer loopback,
    /// otherwise the first in accept order.
    fn promote_replacement(&mut self, ucs_id: u32) {
        let candidates: Vec<u32> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.ucs_id == Some(ucs_id))
            .map(|(id, _)| *id)
            .collect();
        let chosen = candidates
            .iter()
            .find(|id| {
                self.connections
                    .get(id)
                    .is_some_and(|connection| connection.is_loopback())
            })
            .or(candidates.first())
            .copied();
        if let Some(stream_id) = chosen {
            if let Some(connection) = self.connections.get_mut(&stream_id) {
                connection.primary = true;
            }
            info!("UCS {} primary promoted to stream {}", ucs_id, stream_id);
        }
    }

    /// Tell a device which server connections it is currently visible on.
    /// The handler runs on the device's own context.
    fn notify_device_peers(&self, device_id: u32) {
        let record = match self.devices.get(&device_id) {
            Some(record) => record,
            None => return,
        };
        let peers: Vec<UcsInfo> = self
            .connections
            .values()
            .filter(|connection| connection.registered_devices.contains(&device_id))
            .map(|connection| UcsInfo {
                ucs_id: connection.ucs_id.unwrap_or(0),
                address: connection.address,
                primary: connection.primary,
                last_message: connection.last_message_time,
            })
            .collect();
        record.handle.handle_ucs_info(peers);
    }

    // === Watchdog ===

    fn on_tick(&mut self) {
        let now = Instant::now();
        let keep_alive = Duration::from_secs(self.ucs.keep_alive_timeout);
        let ids: Vec<u32> = self.connections.keys().copied().collect();

        for stream_id in ids {
            let (peered, idle) = match self.connections.get(&stream_id) {
                None => continue,
                Some(connection) => (
                    connection.ucs_id.is_some(),
                    now.saturating_duration_since(connection.last_message_time),
                ),
            };

            if peered {
                if self.ucs.keep_alive_timeout == 0 {
                    continue;
                }
                if idle > keep_alive {
                    warn!(
                        "UCS stream {} idle for {:.1}s, closing connection",
                        stream_id,
                        idle.as_secs_f32()
                    );
                    self.close_connection(stream_id);
                } else {
                    self.send(stream_id, VsmMessage::ping());
                }
            } else if idle > REGISTER_PEER_TIMEOUT {
                warn!(
                    "Stream {} sent no register_peer within {:?}, closing connection",
                    stream_id, REGISTER_PEER_TIMEOUT
                );
                self.close_connection(stream_id);
            }
        }
    }

    // === Shutdown ===

    fn shutdown(&mut self) {
        let ids: Vec<u32> = self.connections.keys().copied().collect();
        for stream_id in ids {
            if let Some(mut connection) = self.connections.remove(&stream_id) {
                connection.close();
            }
        }
        self.devices.clear();
        info!("UCS broker worker stopped");
    }

    fn set_detector_active(&self, on: bool) {
        if let Some(detector) = &self.detector {
            detector.lock().activate(on);
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        use std::collections::HashMap;
        let mut primaries: HashMap<u32, u32> = HashMap::new();
        for connection in self.connections.values() {
            if connection.primary {
                if let Some(ucs_id) = connection.ucs_id {
                    *primaries.entry(ucs_id).or_insert(0) += 1;
                }
            }
            for device_id in &connection.registered_devices {
                assert!(
                    self.devices.contains_key(device_id),
                    "connection knows unregistered device {}",
                    device_id
                );
            }
        }
        for (ucs_id, count) in primaries {
            assert!(count <= 1, "UCS {} has {} primary connections", ucs_id, count);
        }
    }
}
