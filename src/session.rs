use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::audio::{CaptureSource, SAMPLES_PER_FRAME};
use crate::crypto::{RtpHeader, SessionKeys};
use crate::error::{custom_error, VoiceError};
use crate::jitter::JitterConfig;
use crate::payloads::{IdentifyInfo, SpeakingFlags, UserJoin, UserLeave};
use crate::pipeline::AudioPipeline;
use crate::playback::{AudioSink, NullSink, PlayoutSchedule, ReceiveStream, TICK};
use crate::protocol::{parse_ws_url, Endpoint, SignalingConnection, SignalingEvent};
use crate::state::{ConnectionState, StateCell};

/// How long one signaling read blocks before the event loop gets control
/// back to drain commands and check heartbeats.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Capture blocks are re-chunked by the pipeline, so the exact size only
/// affects latency; this matches the usual script-processor block.
const CAPTURE_BLOCK: usize = 1024;

const LATENCY_WINDOW: usize = 20;

fn code_can_be_handled(code: u16) -> bool {
    // Non-resumable close codes are:
    // 1000 - normal closure
    // 4014 - voice room deleted
    // 4015 - voice server crash
    code != 1000 && code != 4014 && code != 4015
}

/// Everything the session reports outward. The surrounding application
/// never reaches past these callbacks into the pipeline or the buffers.
/// Callbacks run on the session's internal threads and must not block.
pub trait VoiceObserver: Send + Sync {
    fn on_state_change(&self, _state: ConnectionState) {}
    fn on_connected(&self) {}
    /// Final: the session will make no further attempts.
    fn on_disconnected(&self) {}
    fn on_reconnecting(&self, _attempt: u32, _max_attempts: u32) {}
    fn on_user_join(&self, _user_id: &str, _ssrc: u32) {}
    fn on_user_leave(&self, _user_id: &str) {}
    fn on_user_speaking(&self, _user_id: &str, _ssrc: u32, _flags: SpeakingFlags) {}
    fn on_error(&self, _error: &VoiceError) {}
}

struct NullObserver;

impl VoiceObserver for NullObserver {}

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub ws_url: String,
    pub room_id: String,
    pub user_id: String,
    pub token: String,
    /// Whether the denoiser stage starts enabled.
    pub denoise: bool,
    pub max_reconnect_attempts: u32,
    /// Base of the exponential backoff; attempt n waits
    /// `min(base << (n - 1), cap)`.
    pub reconnect_backoff: Duration,
    pub reconnect_backoff_cap: Duration,
    pub connect_timeout: Duration,
    pub jitter: JitterConfig,
}

impl VoiceConfig {
    pub fn new(ws_url: String, room_id: String, user_id: String, token: String) -> Self {
        Self {
            ws_url,
            room_id,
            user_id,
            token,
            denoise: true,
            max_reconnect_attempts: 5,
            reconnect_backoff: Duration::from_secs(1),
            reconnect_backoff_cap: Duration::from_secs(16),
            connect_timeout: Duration::from_secs(10),
            jitter: JitterConfig::default(),
        }
    }
}

/// One other user in the room.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: String,
    pub ssrc: u32,
    pub speaking: SpeakingFlags,
}

/// Counters for the faults the session swallows by design, plus basic
/// traffic accounting.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VoiceStats {
    pub auth_failures: u64,
    pub malformed_packets: u64,
    pub late_packets: u64,
    pub plc_frames: u64,
    pub silence_frames: u64,
    pub decode_errors: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub unknown_opcodes: u64,
    pub schema_drops: u64,
}

#[derive(Default)]
pub(crate) struct StatsCell {
    pub auth_failures: AtomicU64,
    pub malformed_packets: AtomicU64,
    pub late_packets: AtomicU64,
    pub plc_frames: AtomicU64,
    pub silence_frames: AtomicU64,
    pub decode_errors: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub unknown_opcodes: AtomicU64,
    pub schema_drops: AtomicU64,
}

impl StatsCell {
    fn snapshot(&self) -> VoiceStats {
        VoiceStats {
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            late_packets: self.late_packets.load(Ordering::Relaxed),
            plc_frames: self.plc_frames.load(Ordering::Relaxed),
            silence_frames: self.silence_frames.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            unknown_opcodes: self.unknown_opcodes.load(Ordering::Relaxed),
            schema_drops: self.schema_drops.load(Ordering::Relaxed),
        }
    }
}

/// Participant bookkeeping, indexed both ways. Every ssrc in `by_ssrc`
/// maps to exactly one entry in `by_user`.
#[derive(Default)]
struct Roster {
    by_user: HashMap<String, Participant>,
    by_ssrc: HashMap<u32, String>,
}

impl Roster {
    /// Returns the previous ssrc if the user was already present.
    fn insert(&mut self, user_id: String, ssrc: u32) -> Option<u32> {
        let previous = self.by_user.get(&user_id).map(|p| p.ssrc);
        if let Some(old) = previous {
            self.by_ssrc.remove(&old);
        }
        self.by_ssrc.insert(ssrc, user_id.clone());
        self.by_user.insert(
            user_id.clone(),
            Participant {
                user_id,
                ssrc,
                speaking: SpeakingFlags::off(),
            },
        );
        previous
    }

    fn remove(&mut self, user_id: &str) -> Option<Participant> {
        let participant = self.by_user.remove(user_id)?;
        self.by_ssrc.remove(&participant.ssrc);
        Some(participant)
    }

    fn set_speaking(&mut self, user_id: &str, flags: SpeakingFlags) -> Option<Participant> {
        let participant = self.by_user.get_mut(user_id)?;
        participant.speaking = flags;
        Some(participant.clone())
    }

    fn by_ssrc(&self, ssrc: u32) -> Option<Participant> {
        self.by_ssrc
            .get(&ssrc)
            .and_then(|user| self.by_user.get(user))
            .cloned()
    }

    fn participants(&self) -> Vec<Participant> {
        self.by_user.values().cloned().collect()
    }

    fn clear(&mut self) {
        self.by_user.clear();
        self.by_ssrc.clear();
    }
}

enum Command {
    Audio(Vec<u8>),
    Speaking(SpeakingFlags),
    Disconnect,
}

pub(crate) struct Shared {
    config: VoiceConfig,
    session_id: String,
    state: StateCell,
    observer: Arc<dyn VoiceObserver>,
    sink: Mutex<Box<dyn AudioSink>>,
    roster: Mutex<Roster>,
    streams: Mutex<HashMap<u32, ReceiveStream>>,
    pub(crate) stats: Arc<StatsCell>,
    recent_acks: Mutex<VecDeque<f64>>,
    intentional: AtomicBool,
    done: AtomicBool,
    speaking_gate: Arc<AtomicBool>,
    was_speaking: AtomicBool,
    denoise: Arc<AtomicBool>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        if self.state.set(next) != next {
            self.observer.on_state_change(next);
        }
    }
}

pub struct VoiceSessionBuilder {
    config: VoiceConfig,
    observer: Option<Arc<dyn VoiceObserver>>,
    sink: Option<Box<dyn AudioSink>>,
}

impl VoiceSessionBuilder {
    pub fn new(ws_url: String) -> Self {
        Self {
            config: VoiceConfig::new(ws_url, String::new(), String::new(), String::new()),
            observer: None,
            sink: None,
        }
    }

    pub fn room(&mut self, room_id: String) -> &mut Self {
        self.config.room_id = room_id;
        self
    }

    pub fn user(&mut self, user_id: String) -> &mut Self {
        self.config.user_id = user_id;
        self
    }

    pub fn auth(&mut self, token: String) -> &mut Self {
        self.config.token = token;
        self
    }

    pub fn denoise(&mut self, enabled: bool) -> &mut Self {
        self.config.denoise = enabled;
        self
    }

    pub fn max_reconnect_attempts(&mut self, attempts: u32) -> &mut Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    pub fn reconnect_backoff(&mut self, base: Duration, cap: Duration) -> &mut Self {
        self.config.reconnect_backoff = base;
        self.config.reconnect_backoff_cap = cap;
        self
    }

    pub fn connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn jitter(&mut self, config: JitterConfig) -> &mut Self {
        self.config.jitter = config;
        self
    }

    pub fn observer(&mut self, observer: Arc<dyn VoiceObserver>) -> &mut Self {
        self.observer = Some(observer);
        self
    }

    pub fn sink(&mut self, sink: Box<dyn AudioSink>) -> &mut Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> VoiceSession {
        let (cmd_tx, cmd_rx) = bounded(512);
        let denoise = self.config.denoise;
        let shared = Arc::new(Shared {
            session_id: Uuid::new_v4().to_string(),
            state: StateCell::default(),
            observer: self.observer.unwrap_or_else(|| Arc::new(NullObserver)),
            sink: Mutex::new(self.sink.unwrap_or_else(|| Box::new(NullSink))),
            roster: Mutex::new(Roster::default()),
            streams: Mutex::new(HashMap::new()),
            stats: Arc::new(StatsCell::default()),
            recent_acks: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            intentional: AtomicBool::new(false),
            done: AtomicBool::new(false),
            speaking_gate: Arc::new(AtomicBool::new(false)),
            was_speaking: AtomicBool::new(false),
            denoise: Arc::new(AtomicBool::new(denoise)),
            config: self.config,
        });
        VoiceSession {
            shared,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            supervisor: Mutex::new(None),
            playback: Mutex::new(None),
            capture: Mutex::new(None),
        }
    }
}

/// A session-oriented participant in one SFU voice room.
///
/// The session is a single logical actor: a supervisor thread owns the
/// signaling connection and serializes every state mutation, a playback
/// thread drives the 20ms playout tick, and an optional capture thread
/// feeds the send pipeline through a non-blocking queue. One instance
/// maps to one call; after `disconnect` it is not reusable.
pub struct VoiceSession {
    shared: Arc<Shared>,
    cmd_tx: Sender<Command>,
    cmd_rx: Mutex<Option<Receiver<Command>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    playback: Mutex<Option<JoinHandle<()>>>,
    capture: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceSession {
    pub fn builder(ws_url: String) -> VoiceSessionBuilder {
        VoiceSessionBuilder::new(ws_url)
    }

    /// The random id generated at construction and sent verbatim in every
    /// Identify, including across reconnects.
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Blocks until the session reaches `state` or the timeout expires.
    pub fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        self.shared.state.wait_for(state, timeout)
    }

    pub fn stats(&self) -> VoiceStats {
        self.shared.stats.snapshot()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.shared.roster.lock().participants()
    }

    pub fn participant_by_ssrc(&self, ssrc: u32) -> Option<Participant> {
        self.shared.roster.lock().by_ssrc(ssrc)
    }

    /// Round-trip time of the most recent heartbeat, in seconds. NaN
    /// before the first ack.
    pub fn latency(&self) -> f64 {
        *self.shared.recent_acks.lock().back().unwrap_or(&f64::NAN)
    }

    pub fn average_latency(&self) -> f64 {
        let acks = self.shared.recent_acks.lock();
        if acks.is_empty() {
            f64::NAN
        } else {
            acks.iter().sum::<f64>() / acks.len() as f64
        }
    }

    /// Toggles the denoiser stage without rebuilding the pipeline.
    pub fn set_denoise(&self, enabled: bool) {
        self.shared.denoise.store(enabled, Ordering::Relaxed);
    }

    /// Starts the supervisor. Connecting twice, or after `disconnect`,
    /// is a no-op with a warning.
    pub fn connect(&self) {
        if self.shared.intentional.load(Ordering::SeqCst) {
            warn!("connect() on a torn-down session is a no-op");
            return;
        }
        let cmd_rx = match self.cmd_rx.lock().take() {
            Some(rx) => rx,
            None => {
                warn!("connect() while already running is a no-op");
                return;
            }
        };
        let shared = Arc::clone(&self.shared);
        *self.supervisor.lock() = Some(thread::spawn(move || run_supervisor(shared, cmd_rx)));
        let shared = Arc::clone(&self.shared);
        *self.playback.lock() = Some(thread::spawn(move || run_playback(shared)));
    }

    /// Tears the session down: cancels any in-flight backoff, closes the
    /// transport, stops capture and playback, and releases buffers and
    /// keys. Idempotent, and terminal for this instance.
    pub fn disconnect(&self) {
        if self.shared.intentional.swap(true, Ordering::SeqCst) {
            debug!("disconnect() repeated; session already torn down");
        }
        // Capture is gated off before anything else so no audio flows
        // past this point.
        self.shared.speaking_gate.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.try_send(Command::Disconnect);
        self.join_all();
        self.shared.done.store(true, Ordering::SeqCst);
    }

    fn join_all(&self) {
        let current = thread::current().id();
        if let Some(handle) = self.capture.lock().take() {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        if let Some(handle) = self.supervisor.lock().take() {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        if let Some(handle) = self.playback.lock().take() {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }

    /// Takes exclusive ownership of the microphone and starts the send
    /// pipeline. A codec or device failure is reported through
    /// `on_error`; the session stays connected so the caller can still
    /// hear others and retry.
    pub fn start_speaking(&self, source: Box<dyn CaptureSource>) {
        let mut slot = self.capture.lock();
        if self.shared.speaking_gate.load(Ordering::SeqCst) {
            warn!("start_speaking() while already speaking is a no-op");
            return;
        }
        if let Some(old) = slot.take() {
            let _ = old.join();
        }

        let pipeline = match AudioPipeline::new(Arc::clone(&self.shared.denoise)) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!("could not start capture: {}", e);
                self.shared.observer.on_error(&e);
                return;
            }
        };

        self.shared.speaking_gate.store(true, Ordering::SeqCst);
        self.shared.was_speaking.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Speaking(SpeakingFlags::microphone()));

        let shared = Arc::clone(&self.shared);
        let cmd_tx = self.cmd_tx.clone();
        *slot = Some(thread::spawn(move || {
            capture_loop(shared, pipeline, source, cmd_tx)
        }));
    }

    /// Gates the capture stream off, then tells the room. Nothing is
    /// encoded or sent between the two steps.
    pub fn stop_speaking(&self) {
        if !self.shared.speaking_gate.swap(false, Ordering::SeqCst) {
            warn!("stop_speaking() while not speaking is a no-op");
            return;
        }
        self.shared.was_speaking.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Speaking(SpeakingFlags::off()));
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn capture_loop(
    shared: Arc<Shared>,
    mut pipeline: AudioPipeline,
    mut source: Box<dyn CaptureSource>,
    cmd_tx: Sender<Command>,
) {
    let mut block = [0f32; CAPTURE_BLOCK];
    let source_ended = loop {
        if !shared.speaking_gate.load(Ordering::SeqCst) {
            break false;
        }
        match source.read_block(&mut block) {
            Some(0) => continue,
            Some(read) => {
                // The gate may have closed while the read blocked.
                if !shared.speaking_gate.load(Ordering::SeqCst) {
                    break false;
                }
                let read = read.min(block.len());
                for packet in pipeline.process(&block[..read]) {
                    // Never block on signaling; a full queue just means
                    // this packet is lost.
                    if cmd_tx.try_send(Command::Audio(packet)).is_err() {
                        trace!("outbound audio queue full, dropping packet");
                    }
                }
            }
            None => break true,
        }
    };

    if source_ended {
        // The source ran dry on its own: drain the pipeline tail, then
        // un-announce. A mute instead discards the tail, because nothing
        // may flow after the gate closes.
        for packet in pipeline.flush() {
            let _ = cmd_tx.try_send(Command::Audio(packet));
        }
        shared.speaking_gate.store(false, Ordering::SeqCst);
        shared.was_speaking.store(false, Ordering::SeqCst);
        let _ = cmd_tx.send(Command::Speaking(SpeakingFlags::off()));
    }
    debug!("capture loop finished");
}

struct Link {
    conn: SignalingConnection,
    ssrc: u32,
    heartbeat_interval: Duration,
    keys: SessionKeys,
}

enum Exit {
    Intentional,
    Transport(VoiceError),
    Terminal(VoiceError),
}

pub(crate) fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.checked_mul(1u32 << shift).unwrap_or(cap).min(cap)
}

fn is_handshake_violation(error: &VoiceError) -> bool {
    matches!(
        error,
        VoiceError::UnsupportedMode(_) | VoiceError::BadSecretKey
    )
}

fn run_supervisor(shared: Arc<Shared>, cmd_rx: Receiver<Command>) {
    let max_attempts = shared.config.max_reconnect_attempts;
    let endpoint = match parse_ws_url(&shared.config.ws_url) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("invalid signaling url: {}", e);
            shared.observer.on_error(&e);
            finalize(&shared);
            return;
        }
    };

    let mut attempt: u32 = 0;
    let mut ever_connected = false;
    loop {
        if shared.intentional.load(Ordering::SeqCst) {
            break;
        }
        shared.set_state(ConnectionState::Connecting);
        match establish(&shared, &endpoint, &cmd_rx) {
            Ok(mut link) => {
                attempt = 0;
                ever_connected = true;
                info!(ssrc = link.ssrc, "voice session connected");
                shared.set_state(ConnectionState::Connected);
                shared.observer.on_connected();
                if shared.was_speaking.load(Ordering::SeqCst) {
                    // The room forgot us while we were away; re-assert
                    // the last speaking state before audio resumes.
                    if let Err(e) = link
                        .conn
                        .speaking(SpeakingFlags::microphone(), link.ssrc)
                    {
                        debug!("could not re-assert speaking state: {}", e);
                    }
                }
                let exit = run_connected(&shared, &mut link, &cmd_rx);
                clear_call_state(&shared);
                match exit {
                    Exit::Intentional => break,
                    Exit::Terminal(e) => {
                        error!("terminal session error: {}", e);
                        shared.observer.on_error(&e);
                        break;
                    }
                    Exit::Transport(e) => {
                        debug!("transport lost: {}", e);
                    }
                }
            }
            Err(e) => {
                if is_handshake_violation(&e) {
                    error!("handshake violation: {}", e);
                    shared.observer.on_error(&e);
                    break;
                }
                if !ever_connected {
                    error!("could not establish voice session: {}", e);
                    shared.observer.on_error(&e);
                    break;
                }
                debug!(attempt, "reconnect attempt failed: {}", e);
            }
        }
        if shared.intentional.load(Ordering::SeqCst) {
            break;
        }
        attempt += 1;
        if attempt > max_attempts {
            let e = VoiceError::ReconnectExhausted(max_attempts);
            warn!("{}", e);
            shared.observer.on_error(&e);
            break;
        }
        shared.set_state(ConnectionState::Reconnecting);
        shared.observer.on_reconnecting(attempt, max_attempts);
        let delay = backoff_delay(
            attempt,
            shared.config.reconnect_backoff,
            shared.config.reconnect_backoff_cap,
        );
        debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before reconnect");
        if !backoff_wait(&shared, &cmd_rx, delay) {
            break;
        }
    }
    finalize(&shared);
}

/// Sleeps out the backoff while staying responsive to `disconnect`.
/// Returns false if the session should stop retrying.
fn backoff_wait(shared: &Arc<Shared>, cmd_rx: &Receiver<Command>, delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if shared.intentional.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        match cmd_rx.recv_timeout(deadline - now) {
            Ok(Command::Disconnect) => return false,
            // Nothing can be delivered while the transport is down;
            // speaking intent is already tracked in `was_speaking`.
            Ok(Command::Speaking(_)) | Ok(Command::Audio(_)) => {}
            Err(RecvTimeoutError::Timeout) => return true,
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
}

/// Opens the transport and runs the handshake to the first
/// SessionDescribe: Identify out, Ready in (pick a mode, SelectProtocol
/// out), SessionDescribe in (keys installed).
fn establish(
    shared: &Arc<Shared>,
    endpoint: &Endpoint,
    cmd_rx: &Receiver<Command>,
) -> Result<Link, VoiceError> {
    let config = &shared.config;
    let mut conn = SignalingConnection::open(
        endpoint,
        config.connect_timeout,
        POLL_INTERVAL,
        Arc::clone(&shared.stats),
    )?;
    conn.identify(IdentifyInfo {
        room_id: config.room_id.clone(),
        user_id: config.user_id.clone(),
        session_id: shared.session_id.clone(),
        token: config.token.clone(),
    })?;

    let deadline = Instant::now() + config.connect_timeout;
    let mut ready: Option<(u32, Duration)> = None;
    let mut last_beat = Instant::now();
    loop {
        if shared.intentional.load(Ordering::SeqCst) {
            return Err(custom_error("disconnected during handshake"));
        }
        if Instant::now() >= deadline {
            return Err(VoiceError::HandshakeTimeout(config.connect_timeout));
        }
        // Heartbeats start with Ready, not with the first SessionDescribe.
        if let Some((_, interval)) = ready {
            if last_beat.elapsed() >= interval {
                conn.heartbeat(rand::random::<u64>())?;
                last_beat = Instant::now();
            }
        }
        // Stay responsive to disconnect; audio queued before the keys
        // exist is stale and dropped.
        loop {
            match cmd_rx.try_recv() {
                Ok(Command::Disconnect) => {
                    return Err(custom_error("disconnected during handshake"))
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        match conn.poll()? {
            Some(SignalingEvent::Ready(ready_payload)) => {
                let mode = ready_payload.best_encryption_mode()?;
                conn.select_protocol(mode)?;
                ready = Some((
                    ready_payload.ssrc,
                    Duration::from_millis(ready_payload.heartbeat_interval),
                ));
                last_beat = Instant::now();
            }
            Some(SignalingEvent::SessionDescribe(describe)) => {
                let keys = SessionKeys::new(&describe.mode, &describe.secret_key)?;
                let (ssrc, heartbeat_interval) =
                    ready.ok_or_else(|| custom_error("session described before ready"))?;
                return Ok(Link {
                    conn,
                    ssrc,
                    heartbeat_interval,
                    keys,
                });
            }
            Some(SignalingEvent::UserJoin(join)) => handle_user_join(shared, join),
            Some(SignalingEvent::UserLeave(leave)) => handle_user_leave(shared, leave),
            Some(other) => trace!("ignoring {:?} during handshake", other),
            None => {}
        }
    }
}

fn run_connected(shared: &Arc<Shared>, link: &mut Link, cmd_rx: &Receiver<Command>) -> Exit {
    let mut sequence: u16 = 0;
    let mut timestamp: u32 = 0;
    let mut last_beat = Instant::now();
    let mut last_ack = Instant::now();
    let mut missed_heartbeats: u32 = 0;
    // Tracks the speaking state as announced on the wire; audio behind a
    // Speaking(off) in the queue is discarded so nothing flows after the
    // mute notification.
    let mut speaking_live = shared.was_speaking.load(Ordering::SeqCst);

    loop {
        if shared.intentional.load(Ordering::SeqCst) {
            let _ = link.conn.client_disconnect();
            let _ = link.conn.close(1000);
            return Exit::Intentional;
        }

        // Drain commands before the next blocking read so capture never
        // waits on the socket.
        loop {
            match cmd_rx.try_recv() {
                Ok(Command::Audio(opus)) => {
                    if !speaking_live {
                        trace!("discarding audio queued behind a mute");
                        continue;
                    }
                    let header = RtpHeader {
                        sequence,
                        timestamp,
                        ssrc: link.ssrc,
                    };
                    match link.keys.seal(&header, &opus) {
                        Ok(wire) => {
                            if let Err(e) = link.conn.send_media(wire) {
                                return Exit::Transport(e);
                            }
                            sequence = sequence.wrapping_add(1);
                            timestamp = timestamp.wrapping_add(SAMPLES_PER_FRAME as u32);
                            shared.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => warn!("could not seal outbound packet: {}", e),
                    }
                }
                Ok(Command::Speaking(flags)) => {
                    speaking_live = !flags.is_off();
                    if let Err(e) = link.conn.speaking(flags, link.ssrc) {
                        return Exit::Transport(e);
                    }
                }
                Ok(Command::Disconnect) => {
                    let _ = link.conn.client_disconnect();
                    let _ = link.conn.close(1000);
                    return Exit::Intentional;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    let _ = link.conn.close(1000);
                    return Exit::Intentional;
                }
            }
        }

        if last_beat.elapsed() >= link.heartbeat_interval {
            if last_ack.elapsed() > link.heartbeat_interval.mul_f64(1.5) {
                missed_heartbeats += 1;
                warn!(missed_heartbeats, "heartbeat ack overdue");
                if missed_heartbeats >= 2 {
                    let _ = link.conn.close(1002);
                    return Exit::Transport(VoiceError::HeartbeatLost);
                }
            }
            let nonce = rand::random::<u64>();
            if let Err(e) = link.conn.heartbeat(nonce) {
                return Exit::Transport(e);
            }
            last_beat = Instant::now();
        }

        match link.conn.poll() {
            Ok(Some(event)) => handle_event(
                shared,
                link,
                event,
                &mut last_ack,
                &mut missed_heartbeats,
                last_beat,
            ),
            Ok(None) => {}
            Err(VoiceError::Closed(code)) if !code_can_be_handled(code) => {
                return Exit::Terminal(VoiceError::Closed(code));
            }
            Err(e) => return Exit::Transport(e),
        }
    }
}

fn handle_event(
    shared: &Arc<Shared>,
    link: &mut Link,
    event: SignalingEvent,
    last_ack: &mut Instant,
    missed_heartbeats: &mut u32,
    last_beat: Instant,
) {
    match event {
        SignalingEvent::HeartbeatAck => {
            *last_ack = Instant::now();
            *missed_heartbeats = 0;
            let mut acks = shared.recent_acks.lock();
            if acks.len() == LATENCY_WINDOW {
                acks.pop_front();
            }
            acks.push_back(last_beat.elapsed().as_secs_f64());
        }
        SignalingEvent::SessionDescribe(describe) => {
            // The server may re-key at any time; the new keys replace the
            // old ones wholesale.
            match SessionKeys::new(&describe.mode, &describe.secret_key) {
                Ok(keys) => link.keys = keys,
                Err(e) => warn!("ignoring invalid session description: {}", e),
            }
        }
        SignalingEvent::Ready(_) => debug!("ignoring ready outside handshake"),
        SignalingEvent::Resumed => debug!("resume acknowledged by server"),
        SignalingEvent::UserJoin(join) => handle_user_join(shared, join),
        SignalingEvent::UserLeave(leave) => handle_user_leave(shared, leave),
        SignalingEvent::UserSpeaking(speaking) => {
            let updated = shared
                .roster
                .lock()
                .set_speaking(&speaking.user_id, speaking.speaking);
            match updated {
                Some(participant) => shared.observer.on_user_speaking(
                    &participant.user_id,
                    speaking.ssrc,
                    speaking.speaking,
                ),
                None => debug!(user_id = %speaking.user_id, "speaking event for unknown user"),
            }
        }
        SignalingEvent::Media(frame) => handle_media(shared, link, frame),
    }
}

fn handle_media(shared: &Arc<Shared>, link: &Link, frame: Vec<u8>) {
    match link.keys.open(&frame) {
        Ok((header, payload)) => {
            shared
                .stats
                .packets_received
                .fetch_add(1, Ordering::Relaxed);
            let mut streams = shared.streams.lock();
            match streams.get_mut(&header.ssrc) {
                Some(stream) => {
                    stream.push(header.sequence, header.timestamp, payload, &shared.stats)
                }
                None => debug!(ssrc = header.ssrc, "dropping packet for unknown source"),
            }
        }
        Err(VoiceError::MalformedPacket) => {
            shared
                .stats
                .malformed_packets
                .fetch_add(1, Ordering::Relaxed);
            warn!("dropping malformed media frame");
        }
        Err(_) => {
            shared.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
            warn!("dropping media frame that failed authentication");
        }
    }
}

fn handle_user_join(shared: &Arc<Shared>, join: UserJoin) {
    match ReceiveStream::new(shared.config.jitter.clone()) {
        Ok(stream) => {
            shared.streams.lock().insert(join.ssrc, stream);
        }
        Err(e) => {
            error!("could not set up decoder for {}: {}", join.user_id, e);
            shared.observer.on_error(&e);
        }
    }
    let previous_ssrc = shared.roster.lock().insert(join.user_id.clone(), join.ssrc);
    if let Some(old) = previous_ssrc {
        if old != join.ssrc {
            shared.streams.lock().remove(&old);
        }
    }
    info!(user_id = %join.user_id, ssrc = join.ssrc, "user joined");
    shared.observer.on_user_join(&join.user_id, join.ssrc);
}

fn handle_user_leave(shared: &Arc<Shared>, leave: UserLeave) {
    let removed = shared.roster.lock().remove(&leave.user_id);
    match removed {
        Some(participant) => {
            shared.streams.lock().remove(&participant.ssrc);
            info!(user_id = %leave.user_id, "user left");
            shared.observer.on_user_leave(&leave.user_id);
        }
        None => debug!(user_id = %leave.user_id, "leave for unknown user"),
    }
}

/// Dropped out of Connected: the ssrc index and the per-source buffers
/// belong to the old transport and are rebuilt from fresh UserJoin
/// events.
fn clear_call_state(shared: &Arc<Shared>) {
    shared.roster.lock().clear();
    shared.streams.lock().clear();
    shared.recent_acks.lock().clear();
}

fn finalize(shared: &Arc<Shared>) {
    shared.speaking_gate.store(false, Ordering::SeqCst);
    clear_call_state(shared);
    shared.done.store(true, Ordering::SeqCst);
    shared.set_state(ConnectionState::Disconnected);
    shared.observer.on_disconnected();
}

/// The 20ms playout tick: poll every jitter buffer once and hand decoded
/// frames to the sink, keeping per-source schedule clocks honest.
fn run_playback(shared: Arc<Shared>) {
    let mut schedule = PlayoutSchedule::new();
    let mut next_tick = Instant::now();
    while !shared.done.load(Ordering::SeqCst) {
        next_tick += TICK;
        if shared.state.get() == ConnectionState::Connected {
            let mut frames: Vec<(u32, Vec<i16>)> = Vec::new();
            let mut live: Vec<u32> = Vec::new();
            {
                let mut streams = shared.streams.lock();
                for (&ssrc, stream) in streams.iter_mut() {
                    live.push(ssrc);
                    if let Some(frame) = stream.tick(&shared.stats) {
                        frames.push((ssrc, frame));
                    }
                }
            }
            schedule.prune(&live);
            if !frames.is_empty() {
                let mut sink = shared.sink.lock();
                for (ssrc, frame) in frames {
                    let _start = schedule.frame_start(ssrc);
                    sink.play(ssrc, &frame);
                }
            }
        } else {
            schedule.clear();
        }
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            // We fell behind (a long sink call, a suspended laptop);
            // rebase rather than tick in a burst.
            next_tick = now;
        }
    }
    debug!("playback loop finished");
}
