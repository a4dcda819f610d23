#![allow(dead_code)]

//! A scripted in-process SFU plus observer/sink/source test doubles.

use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tungstenite::error::Error as TungError;
use tungstenite::{Message, WebSocket};

use native_voice::payloads::EncryptionMode;
use native_voice::crypto::{RtpHeader, SessionKeys};
use native_voice::{
    AudioSink, CaptureSource, ConnectionState, SpeakingFlags, VoiceError, VoiceObserver,
};

pub const TEST_KEY: [u8; 32] = [42u8; 32];

pub fn test_keys() -> SessionKeys {
    SessionKeys::from_raw(EncryptionMode::XSalsa20Poly1305, &TEST_KEY)
}

pub struct FakeSfu {
    listener: TcpListener,
    port: u16,
}

impl FakeSfu {
    pub fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Blocks until the client connects, then completes the websocket
    /// handshake.
    pub fn accept(&self) -> SfuConn {
        let (stream, _) = self.listener.accept().expect("accept voice client");
        let ws = tungstenite::accept(stream).expect("websocket accept");
        ws.get_ref()
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        SfuConn { ws }
    }
}

pub enum SfuFrame {
    Json(Value),
    Binary(Vec<u8>),
}

pub enum ReadOutcome {
    Frame(SfuFrame),
    Idle,
    Closed,
}

pub struct SfuConn {
    ws: WebSocket<TcpStream>,
}

impl SfuConn {
    pub fn read_frame(&mut self) -> ReadOutcome {
        match self.ws.read_message() {
            Ok(Message::Text(text)) => {
                ReadOutcome::Frame(SfuFrame::Json(serde_json::from_str(&text).unwrap()))
            }
            Ok(Message::Binary(frame)) => ReadOutcome::Frame(SfuFrame::Binary(frame)),
            Ok(Message::Close(_)) => ReadOutcome::Closed,
            Ok(_) => ReadOutcome::Idle,
            Err(TungError::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                ReadOutcome::Idle
            }
            Err(_) => ReadOutcome::Closed,
        }
    }

    /// Reads until a text frame with the given opcode arrives, skipping
    /// binary frames. Panics on close or timeout.
    pub fn expect_op(&mut self, op: u8, timeout: Duration) -> Value {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match self.read_frame() {
                ReadOutcome::Frame(SfuFrame::Json(msg)) => {
                    if msg["op"] == op {
                        return msg["d"].clone();
                    }
                }
                ReadOutcome::Frame(SfuFrame::Binary(_)) | ReadOutcome::Idle => {}
                ReadOutcome::Closed => panic!("connection closed while waiting for op {}", op),
            }
        }
        panic!("timed out waiting for op {}", op);
    }

    /// Reads until a binary frame arrives, acking any heartbeats seen on
    /// the way.
    pub fn expect_binary(&mut self, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match self.read_frame() {
                ReadOutcome::Frame(SfuFrame::Binary(frame)) => return frame,
                ReadOutcome::Frame(SfuFrame::Json(msg)) => {
                    if msg["op"] == 3 {
                        self.send_op(6, json!({}));
                    }
                }
                ReadOutcome::Idle => {}
                ReadOutcome::Closed => panic!("connection closed while waiting for media"),
            }
        }
        panic!("timed out waiting for a binary frame");
    }

    pub fn send_op(&mut self, op: u8, d: Value) {
        let msg = json!({ "op": op, "d": d });
        self.ws
            .write_message(Message::Text(msg.to_string()))
            .expect("sfu send");
    }

    pub fn send_raw(&mut self, text: &str) {
        self.ws
            .write_message(Message::Text(text.to_string()))
            .expect("sfu send raw");
    }

    pub fn send_binary(&mut self, frame: Vec<u8>) {
        self.ws
            .write_message(Message::Binary(frame))
            .expect("sfu send binary");
    }

    /// Runs the server half of the connect flow: Identify in, Ready out,
    /// SelectProtocol in, SessionDescribe out. Returns the Identify
    /// payload.
    pub fn handshake(&mut self, ssrc: u32, heartbeat_ms: u64) -> Value {
        let identify = self.expect_op(0, Duration::from_secs(5));
        self.send_op(
            2,
            json!({
                "ssrc": ssrc,
                "ip": "127.0.0.1",
                "port": 0,
                "modes": ["xsalsa20_poly1305"],
                "heartbeat_interval": heartbeat_ms,
            }),
        );
        let select = self.expect_op(1, Duration::from_secs(5));
        assert_eq!(select["data"]["mode"], "xsalsa20_poly1305");
        self.send_op(
            4,
            json!({
                "mode": "xsalsa20_poly1305",
                "secret_key": base64::encode(&TEST_KEY),
                "audio_codec": "opus",
            }),
        );
        identify
    }

    pub fn announce_user(&mut self, user_id: &str, ssrc: u32) {
        self.send_op(7, json!({ "user_id": user_id, "ssrc": ssrc }));
    }

    /// Builds one sealed media frame under the shared test key.
    pub fn sealed_packet(sequence: u16, timestamp: u32, ssrc: u32, opus: &[u8]) -> Vec<u8> {
        let header = RtpHeader {
            sequence,
            timestamp,
            ssrc,
        };
        test_keys().seal(&header, opus).unwrap()
    }
}

/// Every observer callback, recorded in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Ev {
    State(ConnectionState),
    Connected,
    Disconnected,
    Reconnecting(u32, u32),
    Join(String, u32),
    Leave(String),
    Speaking(String, u32, u8),
    Error(String),
}

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Ev>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: Ev) {
        self.events.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<Ev> {
        self.events.lock().unwrap().clone()
    }

    pub fn wait_until<F>(&self, predicate: F, timeout: Duration) -> bool
    where
        F: Fn(&[Ev]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.snapshot()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn reconnect_attempts(&self) -> Vec<(u32, u32)> {
        self.snapshot()
            .iter()
            .filter_map(|ev| match ev {
                Ev::Reconnecting(attempt, max) => Some((*attempt, *max)),
                _ => None,
            })
            .collect()
    }

    pub fn has(&self, wanted: &Ev) -> bool {
        self.snapshot().iter().any(|ev| ev == wanted)
    }
}

impl VoiceObserver for Recorder {
    fn on_state_change(&self, state: ConnectionState) {
        self.push(Ev::State(state));
    }

    fn on_connected(&self) {
        self.push(Ev::Connected);
    }

    fn on_disconnected(&self) {
        self.push(Ev::Disconnected);
    }

    fn on_reconnecting(&self, attempt: u32, max_attempts: u32) {
        self.push(Ev::Reconnecting(attempt, max_attempts));
    }

    fn on_user_join(&self, user_id: &str, ssrc: u32) {
        self.push(Ev::Join(user_id.to_string(), ssrc));
    }

    fn on_user_leave(&self, user_id: &str) {
        self.push(Ev::Leave(user_id.to_string()));
    }

    fn on_user_speaking(&self, user_id: &str, ssrc: u32, flags: SpeakingFlags) {
        self.push(Ev::Speaking(user_id.to_string(), ssrc, flags.bits()));
    }

    fn on_error(&self, error: &VoiceError) {
        self.push(Ev::Error(error.to_string()));
    }
}

/// Records (ssrc, samples) for every frame the session plays out.
pub struct CollectSink {
    frames: Arc<Mutex<Vec<(u32, usize)>>>,
}

impl CollectSink {
    pub fn new() -> (Box<Self>, Arc<Mutex<Vec<(u32, usize)>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(Self {
                frames: Arc::clone(&frames),
            }),
            frames,
        )
    }

    pub fn count_for(frames: &Arc<Mutex<Vec<(u32, usize)>>>, ssrc: u32) -> usize {
        frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(tag, _)| *tag == ssrc)
            .count()
    }
}

impl AudioSink for CollectSink {
    fn play(&mut self, ssrc: u32, frame: &[i16]) {
        self.frames.lock().unwrap().push((ssrc, frame.len()));
    }
}

/// Produces near-real-time blocks of a quiet tone, then ends.
pub struct ToneSource {
    blocks_left: usize,
    block_len: usize,
    pace: Duration,
    phase: f32,
}

impl ToneSource {
    pub fn new(blocks: usize, block_len: usize) -> Self {
        Self {
            blocks_left: blocks,
            block_len,
            pace: Duration::from_millis(10),
            phase: 0.0,
        }
    }
}

impl CaptureSource for ToneSource {
    fn read_block(&mut self, buffer: &mut [f32]) -> Option<usize> {
        if self.blocks_left == 0 {
            return None;
        }
        self.blocks_left -= 1;
        std::thread::sleep(self.pace);
        let len = self.block_len.min(buffer.len());
        for sample in buffer[..len].iter_mut() {
            self.phase += 0.02;
            *sample = self.phase.sin() * 0.1;
        }
        Some(len)
    }
}

/// Produces blocks forever; stops only when the session gates capture
/// off.
pub struct EndlessSource;

impl CaptureSource for EndlessSource {
    fn read_block(&mut self, buffer: &mut [f32]) -> Option<usize> {
        std::thread::sleep(Duration::from_millis(10));
        let len = 512.min(buffer.len());
        for sample in buffer[..len].iter_mut() {
            *sample = 0.01;
        }
        Some(len)
    }
}
