//! Integration tests for the UCS link.
//!
//! Each test starts a broker on an ephemeral loopback port and speaks the
//! wire protocol to it the way a UCS server would: varint-framed protobuf
//! messages over TCP, `register_peer` first.

use prost::Message;
use setu_vsm::config::{Config, UcsConfig};
use setu_vsm::proto::{
    field_value, DeviceCommand, DeviceResponse, DeviceStatus, FieldValue, Payload, PeerType,
    RegisterDevice, RegisterPeer, StatusCode, TelemetryField, VsmMessage,
};
use setu_vsm::wire::{encode_frame, Decoded, ReadState, DEFAULT_MAX_MESSAGE_LEN};
use setu_vsm::{Device, ResponseHandle, UcsBroker, UcsInfo};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimal in-process vehicle: answers every command with `Ok`.
struct TestDevice {
    session_id: u32,
}

impl Device for TestDevice {
    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn fill_register_msg(&self, msg: &mut RegisterDevice) {
        msg.name = format!("test-device-{}", self.session_id);
        msg.model = Some("TestDevice".to_string());
    }

    fn on_ucs_message(&self, _message: VsmMessage, response: Option<ResponseHandle>) {
        if let Some(mut response) = response {
            response.set_code(StatusCode::Ok);
            response.send();
        }
    }

    fn handle_ucs_info(&self, _peers: Vec<UcsInfo>) {}
}

/// Test-side UCS server speaking the broker's wire protocol.
struct UcsClient {
    stream: TcpStream,
}

impl UcsClient {
    fn connect(port: u16) -> UcsClient {
        let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to broker");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        UcsClient { stream }
    }

    fn send(&mut self, message: &VsmMessage) {
        self.stream.write_all(&encode_frame(message)).unwrap();
    }

    fn recv(&mut self) -> std::io::Result<VsmMessage> {
        let mut state = ReadState::new(DEFAULT_MAX_MESSAGE_LEN);
        let mut buf = Vec::new();
        loop {
            buf.resize(state.next_read_size(), 0);
            self.stream.read_exact(&mut buf)?;
            match state.feed(&buf).expect("well-formed frame from broker") {
                Decoded::NeedMore => {}
                Decoded::Frame(payload) => {
                    return Ok(VsmMessage::decode(payload.as_slice())
                        .expect("parsable message from broker"))
                }
            }
        }
    }

    /// Receive messages until one matches, skipping keepalive pings and
    /// other interleaved traffic.
    fn recv_until(&mut self, mut matches: impl FnMut(&VsmMessage) -> bool) -> VsmMessage {
        loop {
            let message = self.recv().expect("broker closed the connection");
            if matches(&message) {
                return message;
            }
        }
    }

    /// Send our `register_peer` and wait for the broker's.
    fn handshake(&mut self, peer_id: u32) -> VsmMessage {
        self.send(&register_peer_message(peer_id));
        self.recv_until(|m| m.register_peer().is_some())
    }
}

fn register_peer_message(peer_id: u32) -> VsmMessage {
    VsmMessage {
        device_id: 0,
        message_id: None,
        response_required: false,
        payload: Some(Payload::RegisterPeer(RegisterPeer {
            peer_id,
            peer_type: Some(PeerType::Server as i32),
            name: Some("test-ucs".to_string()),
            version_major: 1,
            version_minor: 2,
            version_build: Some("0".to_string()),
        })),
    }
}

fn ok_response(message_id: u32) -> VsmMessage {
    VsmMessage {
        device_id: 0,
        message_id: Some(message_id),
        response_required: false,
        payload: Some(Payload::DeviceResponse(DeviceResponse {
            code: StatusCode::Ok as i32,
            progress: None,
            status: None,
        })),
    }
}

fn start_broker(keep_alive_timeout: u64) -> UcsBroker {
    let config = Config {
        ucs: UcsConfig {
            local_listening_address: "127.0.0.1".to_string(),
            local_listening_port: 0,
            keep_alive_timeout,
            ..UcsConfig::default()
        },
        ..Config::default()
    };
    UcsBroker::start(&config).expect("broker starts")
}

#[test]
fn test_handshake_identifies_vsm_and_replays_registrations() {
    let broker = start_broker(0);
    broker
        .register_device(Arc::new(TestDevice { session_id: 42 }))
        .unwrap();

    let mut client = UcsClient::connect(broker.local_port());
    let started = Instant::now();
    let hello = client.handshake(0xAAAA);
    let peer = hello.register_peer().unwrap();
    assert_eq!(peer.peer_type, Some(PeerType::Vsm as i32));
    assert_eq!(peer.version_major, 1);
    assert_eq!(peer.version_minor, 2);
    assert!(peer.name.is_some());

    // The cached registration follows the handshake.
    let registration = client.recv_until(|m| m.is_register_device());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(registration.device_id, 42);
    assert!(registration.response_required);
    let message_id = registration.message_id.unwrap();
    assert_ne!(message_id, 0);
    match registration.payload {
        Some(Payload::RegisterDevice(reg)) => {
            assert_eq!(reg.name, "test-device-42");
        }
        _ => unreachable!(),
    }
}

#[test]
fn test_device_registration_and_late_server_receives_cached_state() {
    let broker = start_broker(0);
    let messenger = broker.messenger();

    let mut first = UcsClient::connect(broker.local_port());
    first.handshake(0xA001);

    // Local registration reaches the already-connected server.
    broker
        .register_device(Arc::new(TestDevice { session_id: 42 }))
        .unwrap();
    let registration = first.recv_until(|m| m.is_register_device());
    assert_eq!(registration.device_id, 42);
    first.send(&ok_response(registration.message_id.unwrap()));

    // The device publishes telemetry which the broker caches.
    messenger
        .send_ucs_message(
            42,
            VsmMessage {
                device_id: 0,
                message_id: None,
                response_required: false,
                payload: Some(Payload::DeviceStatus(DeviceStatus {
                    telemetry: vec![TelemetryField {
                        field_id: 1,
                        value: Some(FieldValue {
                            kind: Some(field_value::Kind::DoubleValue(55.75)),
                        }),
                    }],
                    availability: Vec::new(),
                })),
            },
            None,
        )
        .unwrap();

    // A second server connecting later gets the registration and, after
    // confirming it, the cached telemetry.
    let mut second = UcsClient::connect(broker.local_port());
    second.handshake(0xA002);
    let replayed = second.recv_until(|m| m.is_register_device());
    assert_eq!(replayed.device_id, 42);
    second.send(&ok_response(replayed.message_id.unwrap()));

    let status = second.recv_until(|m| matches!(m.payload, Some(Payload::DeviceStatus(_))));
    assert_eq!(status.device_id, 42);
    match status.payload {
        Some(Payload::DeviceStatus(status)) => {
            assert_eq!(status.telemetry.len(), 1);
            assert_eq!(status.telemetry[0].field_id, 1);
        }
        _ => unreachable!(),
    }
}

#[test]
fn test_command_response_arrives_on_requesting_stream() {
    let broker = start_broker(0);
    broker
        .register_device(Arc::new(TestDevice { session_id: 42 }))
        .unwrap();

    let mut client = UcsClient::connect(broker.local_port());
    client.handshake(0xA001);
    let registration = client.recv_until(|m| m.is_register_device());
    client.send(&ok_response(registration.message_id.unwrap()));

    client.send(&VsmMessage {
        device_id: 42,
        message_id: Some(9),
        response_required: true,
        payload: Some(Payload::DeviceCommand(DeviceCommand {
            command_id: 1,
            params: Vec::new(),
        })),
    });
    let reply = client.recv_until(|m| m.device_response().is_some() && m.message_id == Some(9));
    assert_eq!(reply.device_id, 42);
    assert_eq!(reply.device_response().unwrap().code, StatusCode::Ok as i32);
}

#[test]
fn test_unknown_device_command_yields_invalid_session_id() {
    let broker = start_broker(0);
    let mut client = UcsClient::connect(broker.local_port());
    client.handshake(0xA001);

    client.send(&VsmMessage {
        device_id: 99,
        message_id: Some(4),
        response_required: true,
        payload: Some(Payload::DeviceCommand(DeviceCommand::default())),
    });
    let reply = client.recv_until(|m| m.message_id == Some(4));
    assert_eq!(
        reply.device_response().unwrap().code,
        StatusCode::InvalidSessionId as i32
    );
}

#[test]
fn test_keepalive_pings_then_idle_timeout_closes() {
    let broker = start_broker(3);
    let mut client = UcsClient::connect(broker.local_port());
    client.handshake(0xA001);

    // Pings (device_id = 0, response_required) arrive roughly every second.
    let started = Instant::now();
    let ping = client.recv_until(|m| m.device_id == 0 && m.response_required);
    assert!(ping.message_id.is_some());
    assert_ne!(ping.message_id, Some(0));
    assert!(started.elapsed() < Duration::from_secs(3));

    // Staying silent past keep_alive_timeout gets the link closed: reads end
    // with EOF once the broker drops us.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match client.recv() {
            Ok(_) => {
                assert!(Instant::now() < deadline, "broker never closed idle link");
            }
            Err(_) => break,
        }
    }
    assert!(
        started.elapsed() >= Duration::from_secs(3),
        "closed before the idle timeout"
    );
}

#[test]
fn test_oversize_frame_closes_connection_and_keeps_devices() {
    let broker = start_broker(0);
    broker
        .register_device(Arc::new(TestDevice { session_id: 42 }))
        .unwrap();

    let mut client = UcsClient::connect(broker.local_port());
    client.handshake(0xA001);
    let registration = client.recv_until(|m| m.is_register_device());
    client.send(&ok_response(registration.message_id.unwrap()));

    // Varint header decoding past the payload bound: fatal.
    let mut header = Vec::new();
    setu_vsm::wire::encode_varint(DEFAULT_MAX_MESSAGE_LEN as u32 + 1, &mut header);
    client.stream.write_all(&header).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match client.recv() {
            Ok(_) => assert!(Instant::now() < deadline, "connection not closed"),
            Err(_) => break,
        }
    }

    // The device set is unchanged: a fresh server still gets the roster.
    let mut second = UcsClient::connect(broker.local_port());
    second.handshake(0xA002);
    let replayed = second.recv_until(|m| m.is_register_device());
    assert_eq!(replayed.device_id, 42);
}

#[test]
fn test_register_then_unregister_reaches_server_in_order() {
    let broker = start_broker(0);
    let mut client = UcsClient::connect(broker.local_port());
    client.handshake(0xA001);

    broker
        .register_device(Arc::new(TestDevice { session_id: 42 }))
        .unwrap();
    let registration = client.recv_until(|m| m.is_register_device());
    assert_eq!(registration.device_id, 42);

    broker.unregister_device(42).unwrap();
    let unregister = client.recv_until(|m| m.is_unregister_device());
    assert_eq!(unregister.device_id, 42);
}
