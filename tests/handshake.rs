mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use common::{Ev, FakeSfu, ReadOutcome, Recorder, SfuFrame};
use native_voice::{ConnectionState, VoiceSession};

fn session_with(url: String, recorder: Arc<Recorder>) -> VoiceSession {
    let mut builder = VoiceSession::builder(url);
    builder
        .room("room-1".to_string())
        .user("alice".to_string())
        .auth("secret-token".to_string())
        .connect_timeout(Duration::from_secs(2))
        .reconnect_backoff(Duration::from_millis(30), Duration::from_millis(200))
        .observer(recorder);
    builder.build()
}

#[test]
fn happy_handshake_connects_and_heartbeats() {
    let sfu = FakeSfu::bind();
    let recorder = Recorder::new();
    let session = session_with(sfu.url(), Arc::clone(&recorder));
    let expected_session_id = session.session_id().to_string();

    let server = thread::spawn(move || {
        let mut conn = sfu.accept();
        let identify = conn.handshake(12345, 200);
        // Ack heartbeats and log their arrival until the client hangs up.
        let started = Instant::now();
        let mut beats = Vec::new();
        loop {
            match conn.read_frame() {
                ReadOutcome::Frame(SfuFrame::Json(msg)) if msg["op"] == 3 => {
                    assert!(msg["d"]["nonce"].is_u64());
                    beats.push(started.elapsed());
                    conn.send_op(6, json!({}));
                }
                ReadOutcome::Closed => break,
                _ => {}
            }
            if started.elapsed() > Duration::from_secs(5) {
                break;
            }
        }
        (identify, beats)
    });

    session.connect();
    assert!(session.wait_for_state(ConnectionState::Connected, Duration::from_secs(3)));
    assert!(recorder.has(&Ev::Connected));
    assert!(recorder.has(&Ev::State(ConnectionState::Connecting)));
    assert!(recorder.has(&Ev::State(ConnectionState::Connected)));

    // Let a few 200ms heartbeat periods elapse.
    thread::sleep(Duration::from_millis(700));
    assert!(!f64::is_nan(session.latency()));
    session.disconnect();

    let (identify, beats) = server.join().unwrap();
    assert_eq!(identify["room_id"], "room-1");
    assert_eq!(identify["user_id"], "alice");
    assert_eq!(identify["token"], "secret-token");
    assert_eq!(identify["session_id"], expected_session_id.as_str());

    assert!(beats.len() >= 2, "expected heartbeats, saw {:?}", beats);
    for pair in beats.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap > Duration::from_millis(120) && gap < Duration::from_millis(600),
            "heartbeat cadence off: {:?}",
            gap
        );
    }

    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(recorder.has(&Ev::Disconnected));
    // The disconnect was intentional; no reconnect was attempted.
    assert!(recorder.reconnect_attempts().is_empty());
}

#[test]
fn unknown_opcodes_and_bad_schemas_are_swallowed() {
    let sfu = FakeSfu::bind();
    let recorder = Recorder::new();
    let session = session_with(sfu.url(), Arc::clone(&recorder));

    let server = thread::spawn(move || {
        let mut conn = sfu.accept();
        conn.handshake(12345, 60_000);
        conn.send_op(99, json!({ "whatever": true }));
        // A Ready whose payload does not match its schema.
        conn.send_raw(r#"{"op":2,"d":{"ssrc":"not-a-number"}}"#);
        conn.send_raw("this is not json");
        // Keep the transport alive until the client leaves.
        let started = Instant::now();
        loop {
            match conn.read_frame() {
                ReadOutcome::Closed => break,
                _ => {}
            }
            if started.elapsed() > Duration::from_secs(5) {
                break;
            }
        }
    });

    session.connect();
    assert!(session.wait_for_state(ConnectionState::Connected, Duration::from_secs(3)));
    thread::sleep(Duration::from_millis(300));

    // Still connected; the garbage was counted, not fatal.
    assert_eq!(session.state(), ConnectionState::Connected);
    let stats = session.stats();
    assert_eq!(stats.unknown_opcodes, 1);
    assert_eq!(stats.schema_drops, 2);

    session.disconnect();
    server.join().unwrap();
}

#[test]
fn initial_connect_failure_is_terminal() {
    // A listener that never completes the websocket accept: the
    // handshake times out instead of completing.
    let sfu = FakeSfu::bind();
    let recorder = Recorder::new();
    let session = session_with(sfu.url(), Arc::clone(&recorder));
    session.connect();

    assert!(recorder.wait_until(
        |events| events.iter().any(|ev| matches!(ev, Ev::Disconnected)),
        Duration::from_secs(5),
    ));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    // A failed first connect never enters the reconnect loop.
    assert!(recorder.reconnect_attempts().is_empty());
    assert!(recorder
        .snapshot()
        .iter()
        .any(|ev| matches!(ev, Ev::Error(_))));

    // The session is not reusable; this is a warning no-op.
    session.connect();
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[test]
fn connect_twice_is_a_noop() {
    let sfu = FakeSfu::bind();
    let recorder = Recorder::new();
    let session = session_with(sfu.url(), Arc::clone(&recorder));

    let server = thread::spawn(move || {
        let mut conn = sfu.accept();
        conn.handshake(7, 60_000);
        let started = Instant::now();
        loop {
            match conn.read_frame() {
                ReadOutcome::Closed => break,
                _ => {}
            }
            if started.elapsed() > Duration::from_secs(5) {
                break;
            }
        }
    });

    session.connect();
    session.connect();
    assert!(session.wait_for_state(ConnectionState::Connected, Duration::from_secs(3)));

    // Exactly one connection was made and one Connected emitted.
    let connected = recorder
        .snapshot()
        .iter()
        .filter(|ev| matches!(ev, Ev::Connected))
        .count();
    assert_eq!(connected, 1);

    session.disconnect();
    server.join().unwrap();
}
