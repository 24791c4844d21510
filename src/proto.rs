//! UCS wire messages
//!
//! Every frame exchanged with a UCS server carries exactly one [`VsmMessage`]
//! encoded as protobuf. The messages are defined directly with `prost` derive
//! macros (explicit field tags, no codegen step), so the wire layout is fixed
//! by this file.
//!
//! # Envelope
//!
//! - `device_id = 0` addresses the peer itself (handshake, pings).
//! - `message_id` is present on any message that requires a response and on
//!   every response.
//! - The payload is a oneof; a message with no payload is a valid no-op.

/// Version advertised in our `register_peer` and the minimum accepted from
/// servers. Peers below `{SUPPORTED_VERSION_MAJOR, SUPPORTED_VERSION_MINOR}`
/// are marked incompatible and receive nothing further.
pub const SUPPORTED_VERSION_MAJOR: u32 = 1;
pub const SUPPORTED_VERSION_MINOR: u32 = 2;

/// Build identifier reported in `register_peer`.
pub const VERSION_BUILD: &str = env!("CARGO_PKG_VERSION");

/// Returns true when a peer at `major.minor` meets the supported minimum.
pub fn version_supported(major: u32, minor: u32) -> bool {
    (major, minor) >= (SUPPORTED_VERSION_MAJOR, SUPPORTED_VERSION_MINOR)
}

/// Peer kinds exchanged during the handshake. Unknown values are refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PeerType {
    Server = 0,
    Vsm = 1,
}

/// Response codes carried by [`DeviceResponse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    InProgress = 1,
    Failed = 2,
    InvalidSessionId = 3,
    InvalidCommand = 4,
}

/// Marker values for telemetry fields that carry no usable reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MetaValue {
    Na = 0,
}

/// The single message envelope framed on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VsmMessage {
    /// Zero means "addressed to the peer itself"; otherwise a device session.
    #[prost(uint32, tag = "1")]
    pub device_id: u32,

    /// Correlates requests with responses.
    #[prost(uint32, optional, tag = "2")]
    pub message_id: Option<u32>,

    #[prost(bool, tag = "3")]
    pub response_required: bool,

    #[prost(oneof = "Payload", tags = "4, 5, 6, 7, 8, 9")]
    pub payload: Option<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "4")]
    RegisterPeer(RegisterPeer),
    #[prost(message, tag = "5")]
    RegisterDevice(RegisterDevice),
    #[prost(message, tag = "6")]
    UnregisterDevice(UnregisterDevice),
    #[prost(message, tag = "7")]
    DeviceCommand(DeviceCommand),
    #[prost(message, tag = "8")]
    DeviceResponse(DeviceResponse),
    #[prost(message, tag = "9")]
    DeviceStatus(DeviceStatus),
}

impl Payload {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Payload::RegisterPeer(_) => "register_peer",
            Payload::RegisterDevice(_) => "register_device",
            Payload::UnregisterDevice(_) => "unregister_device",
            Payload::DeviceCommand(_) => "device_command",
            Payload::DeviceResponse(_) => "device_response",
            Payload::DeviceStatus(_) => "device_status",
        }
    }
}

/// First message each side sends after the TCP connect.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterPeer {
    #[prost(uint32, tag = "1")]
    pub peer_id: u32,

    /// Absent is accepted from servers that predate the field.
    #[prost(enumeration = "PeerType", optional, tag = "2")]
    pub peer_type: Option<i32>,

    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,

    #[prost(uint32, tag = "4")]
    pub version_major: u32,

    #[prost(uint32, tag = "5")]
    pub version_minor: u32,

    #[prost(string, optional, tag = "6")]
    pub version_build: Option<String>,
}

/// Declares a telemetry field a device will report.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TelemetrySpec {
    #[prost(uint32, tag = "1")]
    pub field_id: u32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, optional, tag = "3")]
    pub semantic: Option<String>,
}

/// Declares a command a device accepts.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandSpec {
    #[prost(uint32, tag = "1")]
    pub command_id: u32,
    #[prost(string, tag = "2")]
    pub name: String,
}

/// Device registration payload, cached by the broker and replayed verbatim
/// to every server that connects later.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterDevice {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, optional, tag = "2")]
    pub model: Option<String>,
    #[prost(message, repeated, tag = "3")]
    pub telemetry: Vec<TelemetrySpec>,
    #[prost(message, repeated, tag = "4")]
    pub commands: Vec<CommandSpec>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnregisterDevice {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandParam {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// Server-originated command for a device.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceCommand {
    #[prost(uint32, tag = "1")]
    pub command_id: u32,
    #[prost(message, repeated, tag = "2")]
    pub params: Vec<CommandParam>,
}

/// Outcome of a request. `InProgress` responses may arrive repeatedly before
/// a terminal code.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceResponse {
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub code: i32,

    /// Completion fraction in [0, 1], meaningful with `InProgress`.
    #[prost(float, optional, tag = "2")]
    pub progress: Option<f32>,

    #[prost(string, optional, tag = "3")]
    pub status: Option<String>,
}

/// A single telemetry value keyed by field id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TelemetryField {
    #[prost(uint32, tag = "1")]
    pub field_id: u32,
    #[prost(message, optional, tag = "2")]
    pub value: Option<FieldValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FieldValue {
    #[prost(oneof = "field_value::Kind", tags = "1, 2, 3, 4, 5")]
    pub kind: Option<field_value::Kind>,
}

pub mod field_value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(int64, tag = "1")]
        IntValue(i64),
        #[prost(double, tag = "2")]
        DoubleValue(f64),
        #[prost(bool, tag = "3")]
        BoolValue(bool),
        #[prost(string, tag = "4")]
        StringValue(String),
        #[prost(enumeration = "super::MetaValue", tag = "5")]
        MetaValue(i32),
    }
}

impl FieldValue {
    /// True when the value is the `Na` marker rather than a real reading.
    pub fn is_na(&self) -> bool {
        matches!(
            self.kind,
            Some(field_value::Kind::MetaValue(v)) if v == MetaValue::Na as i32
        )
    }
}

/// Availability of one command on a device.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandAvailability {
    #[prost(uint32, tag = "1")]
    pub command_id: u32,
    #[prost(bool, tag = "2")]
    pub is_available: bool,
    #[prost(bool, tag = "3")]
    pub is_enabled: bool,
}

/// Telemetry snapshot and command availability for one device.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceStatus {
    #[prost(message, repeated, tag = "1")]
    pub telemetry: Vec<TelemetryField>,
    #[prost(message, repeated, tag = "2")]
    pub availability: Vec<CommandAvailability>,
}

impl VsmMessage {
    /// Our half of the handshake: sent on every freshly accepted connection.
    pub fn our_register_peer(peer_id: u32, name: &str) -> Self {
        VsmMessage {
            device_id: 0,
            message_id: None,
            response_required: false,
            payload: Some(Payload::RegisterPeer(RegisterPeer {
                peer_id,
                peer_type: Some(PeerType::Vsm as i32),
                name: Some(name.to_string()),
                version_major: SUPPORTED_VERSION_MAJOR,
                version_minor: SUPPORTED_VERSION_MINOR,
                version_build: Some(VERSION_BUILD.to_string()),
            })),
        }
    }

    /// Keepalive probe. The broadcaster assigns the message id.
    pub fn ping() -> Self {
        VsmMessage {
            device_id: 0,
            message_id: None,
            response_required: true,
            payload: None,
        }
    }

    /// Response template for an inbound request: echoes `message_id` and
    /// `device_id`, carries the given code.
    pub fn response_to(request: &VsmMessage, code: StatusCode) -> Self {
        VsmMessage {
            device_id: request.device_id,
            message_id: request.message_id,
            response_required: false,
            payload: Some(Payload::DeviceResponse(DeviceResponse {
                code: code as i32,
                progress: None,
                status: None,
            })),
        }
    }

    pub fn device_response(&self) -> Option<&DeviceResponse> {
        match &self.payload {
            Some(Payload::DeviceResponse(r)) => Some(r),
            _ => None,
        }
    }

    pub fn register_peer(&self) -> Option<&RegisterPeer> {
        match &self.payload {
            Some(Payload::RegisterPeer(r)) => Some(r),
            _ => None,
        }
    }

    pub fn is_register_device(&self) -> bool {
        matches!(self.payload, Some(Payload::RegisterDevice(_)))
    }

    pub fn is_unregister_device(&self) -> bool {
        matches!(self.payload, Some(Payload::UnregisterDevice(_)))
    }

    /// Payload name for log lines; "empty" for payload-less no-ops.
    pub fn payload_name(&self) -> &'static str {
        self.payload.as_ref().map_or("empty", |p| p.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_version_boundaries() {
        assert!(version_supported(
            SUPPORTED_VERSION_MAJOR,
            SUPPORTED_VERSION_MINOR
        ));
        assert!(version_supported(
            SUPPORTED_VERSION_MAJOR,
            SUPPORTED_VERSION_MINOR + 1
        ));
        assert!(version_supported(SUPPORTED_VERSION_MAJOR + 1, 0));
        assert!(!version_supported(
            SUPPORTED_VERSION_MAJOR,
            SUPPORTED_VERSION_MINOR - 1
        ));
        assert!(!version_supported(
            SUPPORTED_VERSION_MAJOR - 1,
            SUPPORTED_VERSION_MINOR
        ));
        assert!(!version_supported(SUPPORTED_VERSION_MAJOR - 1, u32::MAX));
    }

    #[test]
    fn test_envelope_round_trip() {
        let msg = VsmMessage {
            device_id: 42,
            message_id: Some(7),
            response_required: true,
            payload: Some(Payload::DeviceCommand(DeviceCommand {
                command_id: 3,
                params: vec![CommandParam {
                    name: "altitude".to_string(),
                    value: "120.5".to_string(),
                }],
            })),
        };
        let bytes = msg.encode_to_vec();
        let back = VsmMessage::decode(bytes.as_slice()).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn test_empty_payload_is_valid() {
        // An empty byte buffer decodes to an all-default envelope.
        let msg = VsmMessage::decode(&[][..]).unwrap();
        assert_eq!(msg.device_id, 0);
        assert_eq!(msg.message_id, None);
        assert!(!msg.response_required);
        assert!(msg.payload.is_none());
        assert_eq!(msg.payload_name(), "empty");
    }

    #[test]
    fn test_response_template_echoes_request() {
        let mut request = VsmMessage::ping();
        request.message_id = Some(99);
        request.device_id = 42;
        let response = VsmMessage::response_to(&request, StatusCode::Failed);
        assert_eq!(response.message_id, Some(99));
        assert_eq!(response.device_id, 42);
        assert!(!response.response_required);
        assert_eq!(
            response.device_response().unwrap().code,
            StatusCode::Failed as i32
        );
    }

    #[test]
    fn test_na_marker() {
        let na = FieldValue {
            kind: Some(field_value::Kind::MetaValue(MetaValue::Na as i32)),
        };
        assert!(na.is_na());
        let real = FieldValue {
            kind: Some(field_value::Kind::DoubleValue(55.1)),
        };
        assert!(!real.is_na());
    }
}
