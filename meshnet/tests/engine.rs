//! End-to-end scenarios driving a full `Engine` over `LoopbackTransport`, exercising the whole
//! stack from the outside rather than unit-testing individual pieces.

use meshnet::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn server(max_players: u32) -> Engine<LoopbackTransport> {
    let config = EngineConfig {
        max_players,
        message_side: MessageSide::Server,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(Role::Server, config, LoopbackTransport::new(), meshnet::logging::discard()).unwrap();
    engine
        .start(std::net::SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)), 0))
        .unwrap();
    engine
}

fn frame_bytes(message_type: meshnet::frame::MessageType, key: u16, payload: &[u8]) -> Vec<u8> {
    let header = meshnet::frame::FrameHeader {
        metadata: meshnet::frame::Metadata::new(message_type, 0),
        key,
    };
    let mut buf = Vec::new();
    meshnet::frame::write_frame(&mut buf, header, payload).unwrap();
    buf
}

#[test]
fn default_message_round_trip_delivers_decoded_int() {
    let mut engine = server(8);
    let uid = engine.transport_mut().simulate_connect();
    engine.tick(Duration::from_millis(0));

    let seen = Arc::new(Mutex::new(None));
    let seen2 = seen.clone();
    engine.dispatcher().register_default(
        0x0042,
        MessageSide::Server,
        0,
        Box::new(move |_, _, _, payload| {
            let mut cursor = std::io::Cursor::new(payload);
            let decoded: i32 = <i32 as meshnet::codec::Deserialize>::deserialize(&mut cursor)?;
            *seen2.lock().unwrap() = Some(decoded);
            Ok(())
        }),
    );

    let frame = frame_bytes(meshnet::frame::MessageType::Default, 0x0042, &13i32.to_le_bytes());
    engine.transport_mut().simulate_data(uid, frame);
    engine.tick(Duration::from_millis(0));

    assert_eq!(*seen.lock().unwrap(), Some(13));
}

#[test]
fn event_with_extra_bytes_is_not_delivered_to_the_event_handler() {
    // Events carry no payload; splicing extra bytes in before the trailer makes this
    // indistinguishable from a default-type frame with an unrelated payload, so an event handler
    // registered for the same key must never see it.
    let mut engine = server(8);
    let uid = engine.transport_mut().simulate_connect();
    engine.tick(Duration::from_millis(0));

    let hit = Arc::new(Mutex::new(false));
    let hit2 = hit.clone();
    engine.dispatcher().register_event(
        9,
        MessageSide::Server,
        0,
        Box::new(move |_, _| {
            *hit2.lock().unwrap() = true;
        }),
    );

    let mut malformed = frame_bytes(meshnet::frame::MessageType::Event, 9, &[]);
    let trailer_start = malformed.len() - 4;
    malformed.splice(trailer_start..trailer_start, [0xFF, 0xFF]);
    engine.transport_mut().simulate_data(uid, malformed);
    engine.tick(Duration::from_millis(0));

    assert!(!*hit.lock().unwrap());
}

#[test]
fn control_message_sets_permission_bit() {
    let mut engine = server(8);
    let uid = engine.transport_mut().simulate_connect();
    engine.tick(Duration::from_millis(0));

    engine
        .dispatcher()
        .register_control(3, MessageSide::Server, 0, 0, Box::new(|_, _, _| true))
        .unwrap();

    let frame = frame_bytes(meshnet::frame::MessageType::Control, 3, &[]);
    engine.transport_mut().simulate_data(uid, frame);
    engine.tick(Duration::from_millis(0));

    assert!(engine.directory().lookup(uid).unwrap().permissions.test_bit(3));
}

#[test]
fn permission_gate_blocks_handler_until_flag_granted() {
    let mut engine = server(8);
    let uid = engine.transport_mut().simulate_connect();
    engine.tick(Duration::from_millis(0));

    engine
        .dispatcher()
        .register_control(5, MessageSide::Server, 0, 0x0001, Box::new(|_, _, _| true))
        .unwrap();

    let frame = frame_bytes(meshnet::frame::MessageType::Control, 5, &[]);
    engine.transport_mut().simulate_data(uid, frame.clone());
    engine.tick(Duration::from_millis(0));
    assert!(
        !engine.directory().lookup(uid).unwrap().permissions.test_bit(5),
        "control handler should have been gated by required_flags"
    );

    engine.directory().lookup(uid).unwrap().permissions.set_bit(0);
    engine.transport_mut().simulate_data(uid, frame);
    engine.tick(Duration::from_millis(0));
    assert!(engine.directory().lookup(uid).unwrap().permissions.test_bit(5));
}

#[test]
fn send_pipeline_disconnect_outcome_drops_connection_on_next_tick() {
    let mut engine = server(8);
    let uid = engine.transport_mut().simulate_connect();
    engine.tick(Duration::from_millis(0));
    assert!(engine.directory().lookup(uid).is_some());

    engine
        .pipelines_mut()
        .server_to_client_send
        .push(Box::new(|_| StepOutcome::DisconnectClient));

    let outcome = engine.send_to_client(
        uid,
        PipelineKind::Reliable,
        meshnet::frame::Metadata::new(meshnet::frame::MessageType::Default, 0),
        0x0001,
        &[1, 2, 3],
    );
    assert_eq!(outcome, meshnet::sender::SendOutcome::Disconnected);
    assert!(engine.directory().lookup(uid).is_some(), "disconnect is queued, not immediate");

    engine.tick(Duration::from_millis(0));
    assert!(engine.directory().lookup(uid).is_none());
}

#[test]
fn max_players_cap_rejects_third_connection() {
    let mut engine = server(2);

    let a = engine.transport_mut().simulate_connect();
    let b = engine.transport_mut().simulate_connect();
    let report = engine.tick(Duration::from_millis(0));
    assert_eq!(report.connected.len(), 2);
    assert!(engine.directory().lookup(a).is_some());
    assert!(engine.directory().lookup(b).is_some());

    let c = engine.transport_mut().simulate_connect();
    let report = engine.tick(Duration::from_millis(0));

    assert_eq!(report.rejected_over_capacity, 1);
    assert!(engine.directory().lookup(c).is_none());
}
