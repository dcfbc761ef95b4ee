//! Session engine
//!
//! [`Engine`] owns the identity, the modem, the FEC codec and at most one
//! [`Session`]. It is driven inline from the audio thread:
//!
//! - outbound: `feed_mic_frame` / `send_data` seal, protect, frame and
//!   modulate into the TX queue; `generate_outgoing_frame` plays it out
//! - inbound: `poll_handshake` / `handle_incoming_frame` demodulate, deframe,
//!   correct, open and dispatch by content type
//!
//! Per-frame failures never interrupt the pipeline. They are counted and
//! reported as `frame_lost` events.

use std::fmt;

use crossbeam_channel::Receiver;
use log::{debug, info, warn};

use crate::buffer::{FrameRing, TxQueue};
use crate::codec::{RawPcmCodec, VoiceCodec};
use crate::config::{ConfigUpdate, EngineConfig};
use crate::crypto::{parse_peer_key, ChaChaPolyCipher, FrameCipher, Identity, TrafficKeys, PUBLIC_KEY_SIZE};
use crate::error::{Result, TunnelError};
use crate::event::{CallOrigin, Event, EventQueue};
use crate::fec::FecCodec;
use crate::framing::{kind_byte, open_frame, Frame, FrameDecoder, FrameEncoder, FrameKind};
use crate::fsk::{DemodEvent, FskModem};
use crate::handshake::{Accepted, Initiator, Responder};
use crate::stats::{EngineStats, StatsHandle};
use crate::{COUNTER_SIZE, HANGUP_REPEATS, MAX_PAYLOAD_SIZE, TAG_SIZE};

/// Silence between consecutive outbound frames, in symbols
pub const IDLE_GUARD_SYMBOLS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Responder: waits for the client's first handshake message
    Server,
    /// Initiator
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Normal,
    /// The peer hung up before `stop`
    Hangup,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Idle,
    Handshaking(Role),
    Established,
    Stopping,
    Terminated(TerminationReason),
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Handshaking(role) => write!(f, "Handshaking({:?})", role),
            EngineState::Terminated(reason) => write!(f, "Terminated({:?})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

/// First plaintext byte of a sealed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ContentType {
    Voice = 0,
    Hangup = 1,
    Data = 2,
}

impl ContentType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ContentType::Voice),
            1 => Some(ContentType::Hangup),
            2 => Some(ContentType::Data),
            _ => None,
        }
    }
}

enum PendingHandshake {
    Client(Initiator),
    Server(Responder),
}

/// One call with one peer. Secrets are wiped when it is dropped.
struct Session {
    role: Role,
    handshake: Option<PendingHandshake>,
    keys: Option<TrafficKeys>,
    send_counter: u64,
    /// Highest counter accepted from the peer
    recv_counter: Option<u64>,
    hangup_sent: bool,
    remote_hangup_seen: bool,
    tx: TxQueue,
    speaker: FrameRing<Vec<i16>>,
    data: FrameRing<Vec<u8>>,
    deframer: FrameDecoder,
    /// Microphone samples short of a full codec frame
    mic_pending: Vec<i16>,
    /// Server: the accepted first message and our reply, for re-sending
    exchange: Option<(Vec<u8>, Vec<u8>)>,
    /// Inbound audio seen while handshaking, in samples
    handshake_samples: u64,
    /// Inbound audio seen since the client's TX queue went idle
    retransmit_samples: u64,
}

impl Session {
    fn new(role: Role, handshake: PendingHandshake, config: &EngineConfig, guard_samples: usize) -> Self {
        Self {
            role,
            handshake: Some(handshake),
            keys: None,
            send_counter: 0,
            recv_counter: None,
            hangup_sent: false,
            remote_hangup_seen: false,
            tx: TxQueue::new(config.tx_queue_frames, guard_samples),
            speaker: FrameRing::new(config.rx_queue_frames),
            data: FrameRing::new(config.rx_queue_frames),
            deframer: FrameDecoder::new(),
            mic_pending: Vec::new(),
            exchange: None,
            handshake_samples: 0,
            retransmit_samples: 0,
        }
    }

    fn rx_drops(&self) -> u64 {
        self.speaker.dropped() + self.data.dropped()
    }
}

/// Encrypted audio tunnel endpoint
pub struct Engine {
    state: EngineState,
    config: EngineConfig,
    identity: Option<Identity>,
    session: Option<Session>,
    modem: FskModem,
    fec: FecCodec,
    cipher: Box<dyn FrameCipher>,
    codec: Box<dyn VoiceCodec>,
    events: EventQueue,
    stats: StatsHandle,
    termination_reason: Option<String>,
    remote_hangup_pending: bool,
    frames_sent: u64,
    frames_received: u64,
    frames_lost: u64,
    handshake_retransmits: u64,
    /// Counters of rings and queues that have been torn down
    retired_tx_drops: u64,
    retired_rx_drops: u64,
    retired_events_dropped: u64,
}

impl Engine {
    /// Engine with default configuration, ChaCha20-Poly1305 and raw PCM voice.
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        Self::with_collaborators(config, Box::new(ChaChaPolyCipher), Box::new(RawPcmCodec::new()))
    }

    /// Engine using the supplied AEAD and voice codec.
    pub fn with_collaborators(
        config: EngineConfig,
        cipher: Box<dyn FrameCipher>,
        mut codec: Box<dyn VoiceCodec>,
    ) -> Result<Self> {
        config.validate()?;
        let modem = FskModem::new(config.modem_config())?;
        codec.set_mode(config.codec_mode)?;

        let engine = Self {
            state: EngineState::Uninitialized,
            events: EventQueue::new(config.event_queue_len),
            config,
            identity: None,
            session: None,
            modem,
            fec: FecCodec::new(),
            cipher,
            codec,
            stats: StatsHandle::new(),
            termination_reason: None,
            remote_hangup_pending: false,
            frames_sent: 0,
            frames_received: 0,
            frames_lost: 0,
            handshake_retransmits: 0,
            retired_tx_drops: 0,
            retired_rx_drops: 0,
            retired_events_dropped: 0,
        };
        engine.publish_stats();
        Ok(engine)
    }

    // ----- control surface -------------------------------------------------

    /// Load the identity from a 32-byte seed. Tears down any session first.
    pub fn initialize(&mut self, seed: &[u8]) -> Result<()> {
        let identity = Identity::from_seed(seed)?;

        if self.retire_session().is_some() {
            info!("initialize: discarding active session");
        }
        if self.events.capacity() != self.config.event_queue_len {
            self.retired_events_dropped += self.events.dropped();
            self.events = EventQueue::new(self.config.event_queue_len);
        }
        self.modem.reset();
        self.identity = Some(identity);
        self.termination_reason = None;
        self.remote_hangup_pending = false;
        self.state = EngineState::Idle;
        info!("engine initialized");
        self.publish_stats();
        Ok(())
    }

    /// Leave `Terminated`, keeping the identity.
    pub fn reset(&mut self) -> Result<()> {
        self.require("reset", matches!(self.state, EngineState::Terminated(_)))?;
        self.termination_reason = None;
        self.remote_hangup_pending = false;
        self.state = if self.identity.is_some() {
            EngineState::Idle
        } else {
            EngineState::Uninitialized
        };
        self.publish_stats();
        Ok(())
    }

    pub fn start_server(&mut self, peer_key: &[u8]) -> Result<()> {
        self.start(Role::Server, peer_key)
    }

    pub fn start_client(&mut self, peer_key: &[u8]) -> Result<()> {
        self.start(Role::Client, peer_key)
    }

    fn start(&mut self, role: Role, peer_key: &[u8]) -> Result<()> {
        let operation = match role {
            Role::Server => "start_server",
            Role::Client => "start_client",
        };
        self.require(operation, self.state == EngineState::Idle)?;
        let peer_key = parse_peer_key(peer_key)?;
        let identity = self.identity.as_ref().ok_or_else(|| TunnelError::SessionState {
            operation,
            state: self.state.to_string(),
        })?;

        let handshake = match role {
            Role::Client => PendingHandshake::Client(Initiator::new(identity, &peer_key, self.cipher.as_ref())?),
            Role::Server => PendingHandshake::Server(Responder::new(peer_key)),
        };

        self.modem.reset();
        self.remote_hangup_pending = false;
        self.session = Some(Session::new(role, handshake, &self.config, self.guard_samples()));
        self.state = EngineState::Handshaking(role);
        self.events.push(Event::HandshakeStarted);
        info!("handshake started as {:?}", role);

        if role == Role::Client {
            if let Some(message) = self.client_message() {
                self.queue_frame(FrameKind::Handshake, &message)?;
            }
        }
        self.publish_stats();
        Ok(())
    }

    /// Advance the handshake with inbound audio. Never blocks.
    ///
    /// Returns the handshake error when the handshake fails; the engine is
    /// then `Terminated(Error)`.
    pub fn poll_handshake(&mut self, pcm: &[i16]) -> Result<()> {
        self.require("poll_handshake", matches!(self.state, EngineState::Handshaking(_)))?;
        let result = self.drive_handshake(pcm);
        self.publish_stats();
        result
    }

    fn drive_handshake(&mut self, pcm: &[i16]) -> Result<()> {
        self.ingest(pcm)?;

        let EngineState::Handshaking(role) = self.state else {
            return Ok(());
        };

        let timeout = self.config.ms_to_samples(self.config.handshake_timeout_ms);
        let retransmit_after = self.config.ms_to_samples(self.config.handshake_retransmit_ms);
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        session.handshake_samples += pcm.len() as u64;
        if session.handshake_samples >= timeout {
            let reason = format!("timed out after {} ms", self.config.handshake_timeout_ms);
            return self.fail_handshake(TunnelError::Handshake(reason));
        }

        if role == Role::Client {
            let due = if session.tx.is_idle() {
                session.retransmit_samples += pcm.len() as u64;
                session.retransmit_samples >= retransmit_after
            } else {
                session.retransmit_samples = 0;
                false
            };
            if due {
                session.retransmit_samples = 0;
                if let Some(message) = self.client_message() {
                    self.handshake_retransmits += 1;
                    debug!("retransmitting handshake message 1 ({})", self.handshake_retransmits);
                    self.queue_frame(FrameKind::Handshake, &message)?;
                }
            }
        }
        Ok(())
    }

    /// Encode, seal and queue microphone audio.
    ///
    /// Samples short of a codec frame are kept for the next call.
    pub fn feed_mic_frame(&mut self, pcm: &[i16]) -> Result<()> {
        self.require("feed_mic_frame", self.state == EngineState::Established)?;
        let result = self.encode_voice(pcm);
        self.publish_stats();
        result
    }

    fn encode_voice(&mut self, pcm: &[i16]) -> Result<()> {
        let frame_samples = self.codec.frame_samples().max(1);
        let chunks: Vec<Vec<i16>> = match self.session.as_mut() {
            Some(session) => {
                session.mic_pending.extend_from_slice(pcm);
                let mut chunks = Vec::new();
                while session.mic_pending.len() >= frame_samples {
                    chunks.push(session.mic_pending.drain(..frame_samples).collect());
                }
                chunks
            }
            None => return Ok(()),
        };

        for chunk in chunks {
            let payload = self.codec.encode(&chunk)?;
            if payload.len() > MAX_PAYLOAD_SIZE {
                return Err(TunnelError::Codec(format!(
                    "encoded frame of {} bytes exceeds {}",
                    payload.len(),
                    MAX_PAYLOAD_SIZE
                )));
            }
            self.send_sealed(ContentType::Voice, &payload)?;
        }
        Ok(())
    }

    /// Demodulate and dispatch inbound audio of an established session.
    pub fn handle_incoming_frame(&mut self, pcm: &[i16]) -> Result<()> {
        self.require("handle_incoming_frame", self.state == EngineState::Established)?;
        let result = self.ingest(pcm);
        self.publish_stats();
        result
    }

    /// Queue an opaque payload of at most `MAX_PAYLOAD_SIZE` bytes.
    pub fn send_data(&mut self, payload: &[u8]) -> Result<()> {
        self.require("send_data", self.state == EngineState::Established)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::Frame(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        let result = self.send_sealed(ContentType::Data, payload);
        self.publish_stats();
        result
    }

    /// Next received data payload.
    pub fn pull_data(&mut self) -> Option<Vec<u8>> {
        self.session.as_mut().and_then(|s| s.data.pop())
    }

    /// Next decoded voice frame.
    pub fn pull_speaker_frame(&mut self) -> Option<Vec<i16>> {
        self.session.as_mut().and_then(|s| s.speaker.pop())
    }

    /// Fill `out` with outbound audio, padding with silence.
    ///
    /// Returns the number of modulated samples written. Valid in every state.
    pub fn generate_outgoing_frame(&mut self, out: &mut [i16]) -> usize {
        match self.session.as_mut() {
            Some(session) => session.tx.fill(out),
            None => {
                out.fill(0);
                0
            }
        }
    }

    /// True while modulated audio is still waiting to be played.
    pub fn tx_pending(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.tx.is_idle())
    }

    /// Apply a partial JSON configuration atomically.
    pub fn set_config(&mut self, json: &str) -> Result<()> {
        let update = ConfigUpdate::from_json(json)?;
        for key in update.unknown_keys() {
            warn!("set_config: ignoring unknown key {:?}", key);
        }
        let next = self.config.merged(&update)?;

        if next.codec_mode != self.config.codec_mode {
            self.codec.set_mode(next.codec_mode)?;
        }
        let modem_changed = next.modem_config() != self.config.modem_config();
        if modem_changed {
            if let Err(e) = self.modem.reconfigure(next.modem_config()) {
                // Keep the codec consistent with the configuration we still hold
                let _ = self.codec.set_mode(self.config.codec_mode);
                return Err(e);
            }
        }

        self.config = next;
        if modem_changed {
            let guard = self.guard_samples();
            if let Some(session) = self.session.as_mut() {
                session.deframer.reset();
                let flushed = session.tx.flush();
                session.tx.set_guard(guard);
                info!("modem reconfigured, {} queued frames flushed", flushed);
            }
        }
        debug!("configuration applied: {:?}", self.config);
        self.publish_stats();
        Ok(())
    }

    /// Queue a sealed hangup, repeated against channel loss.
    pub fn send_hangup_signal(&mut self) -> Result<()> {
        self.require("send_hangup_signal", self.state == EngineState::Established)?;
        if self.session.as_ref().is_some_and(|s| s.hangup_sent) {
            return Ok(());
        }
        let mut result = Ok(());
        for _ in 0..HANGUP_REPEATS {
            result = self.send_sealed(ContentType::Hangup, &[]);
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            if let Some(session) = self.session.as_mut() {
                session.hangup_sent = true;
            }
            info!("hangup queued");
        }
        self.publish_stats();
        result
    }

    /// True once per received hangup; repeats before a consume collapse into one.
    pub fn consume_remote_hangup(&mut self) -> bool {
        std::mem::take(&mut self.remote_hangup_pending)
    }

    /// End the session from any state. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if let EngineState::Terminated(_) = self.state {
            return Ok(());
        }
        let was_established = self.state == EngineState::Established;
        self.state = EngineState::Stopping;

        let remote_hangup = self.retire_session().is_some_and(|s| s.remote_hangup_seen);
        self.modem.reset();

        if was_established && !remote_hangup {
            self.events.push(Event::CallEnded {
                origin: CallOrigin::Local,
            });
        }
        self.state = EngineState::Terminated(if remote_hangup {
            TerminationReason::Hangup
        } else {
            TerminationReason::Normal
        });
        info!("engine stopped: {}", self.state);
        self.publish_stats();
        Ok(())
    }

    // ----- observation -----------------------------------------------------

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.session.as_ref().map(|s| s.role)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn public_key(&self) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        self.identity.as_ref().map(Identity::public_key_bytes)
    }

    /// Why the engine entered `Terminated(Error)`.
    pub fn termination_reason(&self) -> Option<&str> {
        self.termination_reason.as_deref()
    }

    /// A receiver for engine events. All receivers share one queue.
    pub fn events(&self) -> Receiver<Event> {
        self.events.subscribe()
    }

    pub fn drain_events(&self) -> Vec<Event> {
        self.events.drain()
    }

    pub fn stats_handle(&self) -> StatsHandle {
        self.stats.clone()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    // ----- pipeline --------------------------------------------------------

    fn require(&self, operation: &'static str, allowed: bool) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(TunnelError::SessionState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    fn guard_samples(&self) -> usize {
        IDLE_GUARD_SYMBOLS * self.modem.samples_per_symbol()
    }

    fn client_message(&self) -> Option<Vec<u8>> {
        match self.session.as_ref()?.handshake.as_ref()? {
            PendingHandshake::Client(initiator) => Some(initiator.message().to_vec()),
            PendingHandshake::Server(_) => None,
        }
    }

    /// Frame, protect and modulate `inner` onto the TX queue.
    fn queue_frame(&mut self, kind: FrameKind, inner: &[u8]) -> Result<()> {
        let fec = if self.config.fec_enabled {
            Some(&mut self.fec)
        } else {
            None
        };
        let bytes = FrameEncoder::build(kind, inner, fec)?;
        let pcm = self.modem.modulate(&bytes);
        if self.config.debug_logging {
            debug!("queued {:?} frame: {} bytes, {} samples", kind, bytes.len(), pcm.len());
        }
        if let Some(session) = self.session.as_mut() {
            session.tx.push(pcm);
        }
        self.frames_sent += 1;
        Ok(())
    }

    fn send_sealed(&mut self, content: ContentType, payload: &[u8]) -> Result<()> {
        let aad = kind_byte(FrameKind::Sealed, self.config.fec_enabled);
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(keys) = session.keys.as_ref() else {
            return Err(TunnelError::SessionState {
                operation: "send",
                state: self.state.to_string(),
            });
        };
        let counter = session.send_counter;
        if counter == u64::MAX {
            return self.terminate_with_error("send counter exhausted".into());
        }

        let mut plaintext = Vec::with_capacity(1 + payload.len());
        plaintext.push(content as u8);
        plaintext.extend_from_slice(payload);
        let sealed = self.cipher.seal(&keys.send, counter, &[aad], &plaintext)?;
        session.send_counter += 1;

        let mut inner = Vec::with_capacity(COUNTER_SIZE + sealed.len());
        inner.extend_from_slice(&counter.to_be_bytes());
        inner.extend_from_slice(&sealed);
        self.queue_frame(FrameKind::Sealed, &inner)
    }

    /// Demodulate inbound audio and dispatch every completed frame.
    fn ingest(&mut self, pcm: &[i16]) -> Result<()> {
        let mut events = Vec::new();
        self.modem.demodulate_with(pcm, |event| events.push(event));

        for event in events {
            let Some(session) = self.session.as_mut() else {
                break;
            };
            match event {
                DemodEvent::LockLost => {
                    if session.deframer.reset() {
                        self.frame_lost("sync lost mid-frame".into());
                    }
                }
                DemodEvent::Byte(byte) => match session.deframer.push(byte) {
                    None => {}
                    Some(Ok(frame)) => self.dispatch_frame(frame)?,
                    Some(Err(e)) => self.frame_lost(e.to_string()),
                },
            }
        }
        Ok(())
    }

    fn dispatch_frame(&mut self, mut frame: Frame) -> Result<()> {
        let aad = frame.kind_byte();
        let (inner, corrected) = match open_frame(&mut frame, &mut self.fec) {
            Ok(opened) => opened,
            Err(e) => {
                self.frame_lost(e.to_string());
                return Ok(());
            }
        };
        if corrected > 0 {
            if self.config.debug_logging {
                debug!("FEC corrected {} bytes in {:?} frame", corrected, frame.kind);
            }
            self.events.push(Event::FecCorrection { count: corrected });
        }

        match frame.kind {
            FrameKind::Handshake => self.handle_handshake_message(inner),
            FrameKind::Sealed => {
                self.handle_sealed(aad, &inner);
                Ok(())
            }
            FrameKind::Plain => {
                self.frame_lost("unexpected plain frame".into());
                Ok(())
            }
        }
    }

    fn handle_handshake_message(&mut self, message: Vec<u8>) -> Result<()> {
        match self.state {
            EngineState::Handshaking(Role::Client) => {
                let (Some(session), Some(identity)) = (self.session.as_mut(), self.identity.as_ref()) else {
                    return Ok(());
                };
                let Some(PendingHandshake::Client(initiator)) = session.handshake.take() else {
                    return Ok(());
                };
                match initiator.finish(identity, &message, self.cipher.as_ref()) {
                    Ok(keys) => {
                        session.keys = Some(keys);
                        self.frames_received += 1;
                        self.establish();
                        Ok(())
                    }
                    Err(e) => self.fail_handshake(e),
                }
            }
            EngineState::Handshaking(Role::Server) => {
                let accepted = {
                    let (Some(session), Some(identity)) = (self.session.as_ref(), self.identity.as_ref()) else {
                        return Ok(());
                    };
                    let Some(PendingHandshake::Server(responder)) = session.handshake.as_ref() else {
                        return Ok(());
                    };
                    responder.accept(identity, &message, self.cipher.as_ref())
                };
                match accepted {
                    Ok(Accepted { reply, keys }) => {
                        self.frames_received += 1;
                        self.queue_frame(FrameKind::Handshake, &reply)?;
                        if let Some(session) = self.session.as_mut() {
                            session.handshake = None;
                            session.keys = Some(keys);
                            session.exchange = Some((message, reply));
                        }
                        self.establish();
                        Ok(())
                    }
                    Err(e) => self.fail_handshake(e),
                }
            }
            EngineState::Established => {
                let reply = self
                    .session
                    .as_ref()
                    .and_then(|s| s.exchange.as_ref())
                    .filter(|(first, _)| *first == message)
                    .map(|(_, reply)| reply.clone());
                match reply {
                    Some(reply) => {
                        debug!("peer repeated handshake message 1, re-sending reply");
                        self.queue_frame(FrameKind::Handshake, &reply)
                    }
                    None => {
                        debug!("ignoring handshake message in established session");
                        Ok(())
                    }
                }
            }
            _ => Ok(()),
        }
    }

    fn handle_sealed(&mut self, aad: u8, inner: &[u8]) {
        if self.state != EngineState::Established {
            self.frame_lost("sealed frame before session keys".into());
            return;
        }
        if inner.len() < COUNTER_SIZE + TAG_SIZE + 1 {
            self.frame_lost(format!("sealed body of {} bytes too short", inner.len()));
            return;
        }
        let mut counter_bytes = [0u8; COUNTER_SIZE];
        counter_bytes.copy_from_slice(&inner[..COUNTER_SIZE]);
        let counter = u64::from_be_bytes(counter_bytes);

        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.recv_counter.is_some_and(|last| counter <= last) {
            self.frame_lost(format!("replayed counter {}", counter));
            return;
        }
        let opened = match session.keys.as_ref() {
            Some(keys) => self.cipher.open(&keys.recv, counter, &[aad], &inner[COUNTER_SIZE..]),
            None => Err(TunnelError::Crypto("no traffic keys".into())),
        };
        let plaintext = match opened {
            Ok(plaintext) => plaintext,
            Err(e) => {
                self.frame_lost(e.to_string());
                return;
            }
        };
        let Some((&content, payload)) = plaintext.split_first() else {
            self.frame_lost("empty sealed plaintext".into());
            return;
        };

        if let Some(session) = self.session.as_mut() {
            session.recv_counter = Some(counter);
        }
        self.frames_received += 1;
        if self.config.debug_logging {
            debug!("opened sealed frame {} ({} payload bytes)", counter, payload.len());
        }

        match ContentType::from_u8(content) {
            Some(ContentType::Voice) => match self.codec.decode(payload) {
                Ok(pcm) => {
                    if let Some(session) = self.session.as_mut() {
                        session.speaker.push(pcm);
                    }
                }
                Err(e) => self.frame_lost(e.to_string()),
            },
            Some(ContentType::Data) => {
                if let Some(session) = self.session.as_mut() {
                    session.data.push(payload.to_vec());
                }
            }
            Some(ContentType::Hangup) => {
                let first = match self.session.as_mut() {
                    Some(session) => !std::mem::replace(&mut session.remote_hangup_seen, true),
                    None => false,
                };
                if first {
                    self.remote_hangup_pending = true;
                    info!("remote hangup received");
                    self.events.push(Event::CallEnded {
                        origin: CallOrigin::Remote,
                    });
                }
            }
            None => self.frame_lost(format!("unknown content type {}", content)),
        }
    }

    fn establish(&mut self) {
        self.state = EngineState::Established;
        self.events.push(Event::HandshakeSuccess);
        self.events.push(Event::SessionEstablished);
        info!("session established as {:?}", self.role());
    }

    fn fail_handshake(&mut self, error: TunnelError) -> Result<()> {
        let reason = error.to_string();
        warn!("handshake failed: {}", reason);
        self.retire_session();
        self.termination_reason = Some(reason.clone());
        self.state = EngineState::Terminated(TerminationReason::Error);
        self.events.push(Event::HandshakeFailed { reason });
        Err(error)
    }

    fn terminate_with_error(&mut self, message: String) -> Result<()> {
        warn!("session terminated: {}", message);
        self.retire_session();
        self.termination_reason = Some(message.clone());
        self.state = EngineState::Terminated(TerminationReason::Error);
        self.events.push(Event::Error {
            message: message.clone(),
        });
        Err(TunnelError::Crypto(message))
    }

    fn frame_lost(&mut self, reason: String) {
        self.frames_lost += 1;
        if self.config.debug_logging {
            debug!("frame lost: {}", reason);
        }
        self.events.push(Event::FrameLost { reason });
    }

    /// Drop the session, folding its queue counters into the engine totals.
    fn retire_session(&mut self) -> Option<Session> {
        let session = self.session.take()?;
        self.retired_tx_drops += session.tx.dropped();
        self.retired_rx_drops += session.rx_drops();
        Some(session)
    }

    fn publish_stats(&self) {
        let (tx_live, rx_live, tx_queued) = self
            .session
            .as_ref()
            .map(|s| (s.tx.dropped(), s.rx_drops(), s.tx.queued()))
            .unwrap_or((0, 0, 0));
        self.stats.publish(EngineStats {
            state: self.state.to_string(),
            modem: self.modem.stats(),
            fec: self.fec.stats(),
            frames_sent: self.frames_sent,
            frames_received: self.frames_received,
            frames_lost: self.frames_lost,
            tx_queued,
            tx_queue_drops: self.retired_tx_drops + tx_live,
            rx_queue_drops: self.retired_rx_drops + rx_live,
            events_dropped: self.retired_events_dropped + self.events.dropped(),
            handshake_retransmits: self.handshake_retransmits,
        });
    }

    #[cfg(test)]
    fn force_send_counter(&mut self, counter: u64) {
        if let Some(session) = self.session.as_mut() {
            session.send_counter = counter;
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_public_key;

    const SERVER_SEED: [u8; 32] = [0x5A; 32];
    const CLIENT_SEED: [u8; 32] = [0xC3; 32];
    const CHUNK: usize = 1600;

    fn engine(seed: &[u8]) -> Engine {
        let mut engine = Engine::new().unwrap();
        engine.initialize(seed).unwrap();
        engine
    }

    fn feed(engine: &mut Engine, pcm: &[i16]) {
        match engine.state() {
            EngineState::Handshaking(_) => {
                let _ = engine.poll_handshake(pcm);
            }
            EngineState::Established => engine.handle_incoming_frame(pcm).unwrap(),
            _ => {}
        }
    }

    /// Exchange audio in both directions for up to `rounds` chunks or until `done`.
    fn pump(a: &mut Engine, b: &mut Engine, rounds: usize, done: impl Fn(&Engine, &Engine) -> bool) {
        let mut to_b = vec![0i16; CHUNK];
        let mut to_a = vec![0i16; CHUNK];
        for _ in 0..rounds {
            if done(a, b) {
                return;
            }
            a.generate_outgoing_frame(&mut to_b);
            b.generate_outgoing_frame(&mut to_a);
            feed(b, &to_b);
            feed(a, &to_a);
        }
    }

    fn connected_pair() -> (Engine, Engine) {
        let mut server = engine(&SERVER_SEED);
        let mut client = engine(&CLIENT_SEED);
        server.start_server(&derive_public_key(&CLIENT_SEED).unwrap()).unwrap();
        client.start_client(&derive_public_key(&SERVER_SEED).unwrap()).unwrap();
        pump(&mut client, &mut server, 400, |a, b| {
            a.state() == EngineState::Established && b.state() == EngineState::Established
        });
        assert_eq!(client.state(), EngineState::Established);
        assert_eq!(server.state(), EngineState::Established);
        (server, client)
    }

    fn drain_tx(from: &mut Engine, to: &mut Engine) {
        let mut buf = vec![0i16; CHUNK];
        let mut silence = vec![0i16; CHUNK];
        for _ in 0..400 {
            if !from.tx_pending() {
                break;
            }
            from.generate_outgoing_frame(&mut buf);
            to.generate_outgoing_frame(&mut silence);
            to.handle_incoming_frame(&buf).unwrap();
        }
        // Trailing silence lets the receiver finish the last symbols
        from.generate_outgoing_frame(&mut buf);
        to.handle_incoming_frame(&buf).unwrap();
    }

    #[test]
    fn test_new_engine_is_uninitialized() {
        let engine = Engine::new().unwrap();
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(engine.public_key().is_none());
        assert_eq!(engine.stats().state, "Uninitialized");
    }

    #[test]
    fn test_initialize_rejects_bad_seed() {
        let mut engine = Engine::new().unwrap();
        assert!(matches!(engine.initialize(&[1u8; 31]), Err(TunnelError::Key(_))));
        assert_eq!(engine.state(), EngineState::Uninitialized);
        engine.initialize(&[1u8; 32]).unwrap();
        assert_eq!(engine.public_key(), Some(derive_public_key(&[1u8; 32]).unwrap()));
    }

    #[test]
    fn test_start_requires_idle_and_valid_key() {
        let mut engine = Engine::new().unwrap();
        let peer = derive_public_key(&CLIENT_SEED).unwrap();
        assert!(matches!(
            engine.start_server(&peer),
            Err(TunnelError::SessionState { operation: "start_server", .. })
        ));

        engine.initialize(&SERVER_SEED).unwrap();
        assert!(matches!(engine.start_server(&peer[..31]), Err(TunnelError::Key(_))));
        assert_eq!(engine.state(), EngineState::Idle);

        engine.start_server(&peer).unwrap();
        assert_eq!(engine.state(), EngineState::Handshaking(Role::Server));
        assert!(matches!(engine.start_client(&peer), Err(TunnelError::SessionState { .. })));
        assert_eq!(engine.drain_events(), vec![Event::HandshakeStarted]);
    }

    #[test]
    fn test_established_only_operations() {
        let mut engine = engine(&SERVER_SEED);
        assert!(engine.feed_mic_frame(&[0; 10]).is_err());
        assert!(engine.handle_incoming_frame(&[0; 10]).is_err());
        assert!(engine.send_hangup_signal().is_err());
        assert!(engine.send_data(b"x").is_err());
        assert!(engine.poll_handshake(&[0; 10]).is_err());
        assert!(!engine.consume_remote_hangup());
    }

    #[test]
    fn test_client_queues_message_one() {
        let mut client = engine(&CLIENT_SEED);
        client.start_client(&derive_public_key(&SERVER_SEED).unwrap()).unwrap();
        assert!(client.tx_pending());

        let mut out = vec![0i16; 640];
        assert_eq!(client.generate_outgoing_frame(&mut out), 640);
        assert_eq!(client.stats().frames_sent, 1);
    }

    #[test]
    fn test_generate_outgoing_without_session_is_silence() {
        let mut engine = Engine::new().unwrap();
        let mut out = vec![5i16; 32];
        assert_eq!(engine.generate_outgoing_frame(&mut out), 0);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut engine = engine(&SERVER_SEED);
        engine.start_server(&derive_public_key(&CLIENT_SEED).unwrap()).unwrap();
        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Terminated(TerminationReason::Normal));
        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Terminated(TerminationReason::Normal));
        // Cancelled handshake is not a call
        assert!(!engine.drain_events().iter().any(|e| matches!(e, Event::CallEnded { .. })));

        assert!(engine.start_server(&[0u8; 32]).is_err());
        engine.reset().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.reset().is_err());
    }

    #[test]
    fn test_stop_without_identity_then_reset() {
        let mut engine = Engine::new().unwrap();
        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Terminated(TerminationReason::Normal));
        engine.reset().unwrap();
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[test]
    fn test_handshake_timeout() {
        let mut engine = engine(&SERVER_SEED);
        engine.set_config(r#"{"handshakeTimeoutMs": 500}"#).unwrap();
        engine.start_server(&derive_public_key(&CLIENT_SEED).unwrap()).unwrap();

        let silence = vec![0i16; 4000];
        assert!(engine.poll_handshake(&silence).is_ok());
        let err = engine.poll_handshake(&silence).unwrap_err();
        assert!(matches!(err, TunnelError::Handshake(_)));
        assert_eq!(engine.state(), EngineState::Terminated(TerminationReason::Error));
        assert!(engine.termination_reason().unwrap().contains("timed out"));
        assert!(engine
            .drain_events()
            .iter()
            .any(|e| matches!(e, Event::HandshakeFailed { .. })));
    }

    #[test]
    fn test_client_retransmits_message_one() {
        let mut client = engine(&CLIENT_SEED);
        client.set_config(r#"{"handshakeRetransmitMs": 100}"#).unwrap();
        client.start_client(&derive_public_key(&SERVER_SEED).unwrap()).unwrap();

        let mut out = vec![0i16; CHUNK];
        let silence = vec![0i16; CHUNK];
        for _ in 0..100 {
            if client.stats().handshake_retransmits > 0 {
                break;
            }
            client.generate_outgoing_frame(&mut out);
            client.poll_handshake(&silence).unwrap();
        }
        assert_eq!(client.stats().handshake_retransmits, 1);
        assert!(client.tx_pending());
        assert_eq!(client.stats().frames_sent, 2);
    }

    #[test]
    fn test_set_config_is_atomic() {
        let mut engine = Engine::new().unwrap();
        let before = engine.config().clone();
        assert!(engine.set_config(r#"{"symbolRate": 50, "fecStrength": 16}"#).is_err());
        assert_eq!(engine.config(), &before);
        assert!(engine.set_config(r#"{"codecMode": 9}"#).is_err());
        assert_eq!(engine.config(), &before);

        engine.set_config(r#"{"symbolRate": 50, "unknownKey": 1}"#).unwrap();
        assert_eq!(engine.config().symbol_rate, 50.0);
        assert_eq!(engine.config().sample_rate, 16000);
    }

    #[test]
    fn test_set_config_flushes_tx_on_modem_change() {
        let mut client = engine(&CLIENT_SEED);
        client.start_client(&derive_public_key(&SERVER_SEED).unwrap()).unwrap();
        assert!(client.tx_pending());

        client.set_config(r#"{"debugLogging": true}"#).unwrap();
        assert!(client.tx_pending());

        client.set_config(r#"{"frequencies": [1000, 1400, 1800, 2200]}"#).unwrap();
        assert!(!client.tx_pending());
        assert_eq!(client.state(), EngineState::Handshaking(Role::Client));
    }

    #[test]
    fn test_data_roundtrip_and_replay_rejected() {
        let (mut server, mut client) = connected_pair();
        drain_tx(&mut server, &mut client);
        drain_tx(&mut client, &mut server);
        let lost_before = server.stats().frames_lost;

        client.send_data(b"ping").unwrap();
        let mut captured = Vec::new();
        let mut buf = vec![0i16; CHUNK];
        while client.tx_pending() {
            client.generate_outgoing_frame(&mut buf);
            captured.extend_from_slice(&buf);
        }
        captured.extend(std::iter::repeat(0).take(CHUNK));

        server.handle_incoming_frame(&captured).unwrap();
        assert_eq!(server.pull_data(), Some(b"ping".to_vec()));

        server.handle_incoming_frame(&captured).unwrap();
        assert_eq!(server.pull_data(), None);
        assert_eq!(server.stats().frames_lost, lost_before + 1);
        assert_eq!(server.state(), EngineState::Established);
    }

    #[test]
    fn test_oversized_data_rejected() {
        let (_server, mut client) = connected_pair();
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(client.send_data(&payload), Err(TunnelError::Frame(_))));
        assert_eq!(client.state(), EngineState::Established);
    }

    #[test]
    fn test_hangup_flag_semantics() {
        let (mut server, mut client) = connected_pair();
        drain_tx(&mut server, &mut client);

        client.send_hangup_signal().unwrap();
        drain_tx(&mut client, &mut server);

        assert!(server.consume_remote_hangup());
        assert!(!server.consume_remote_hangup());
        let remote_ends = server
            .drain_events()
            .into_iter()
            .filter(|e| *e == Event::CallEnded { origin: CallOrigin::Remote })
            .count();
        assert_eq!(remote_ends, 1);

        server.stop().unwrap();
        assert_eq!(server.state(), EngineState::Terminated(TerminationReason::Hangup));

        client.stop().unwrap();
        assert_eq!(client.state(), EngineState::Terminated(TerminationReason::Normal));
        assert!(client
            .drain_events()
            .contains(&Event::CallEnded { origin: CallOrigin::Local }));
    }

    #[test]
    fn test_repeated_hangup_frames_consume_once() {
        let (mut server, mut client) = connected_pair();
        drain_tx(&mut server, &mut client);

        client.send_hangup_signal().unwrap();
        let mut buf = vec![0i16; CHUNK];
        let mut hangups = 0;
        for _ in 0..400 {
            let pending = client.tx_pending();
            client.generate_outgoing_frame(&mut buf);
            server.handle_incoming_frame(&buf).unwrap();
            if server.consume_remote_hangup() {
                hangups += 1;
            }
            if !pending {
                break;
            }
        }

        // Every copy arrived, but the caller sees one hangup
        assert!(server.stats().frames_received >= HANGUP_REPEATS as u64);
        assert_eq!(hangups, 1);
        assert!(!server.consume_remote_hangup());
    }

    #[test]
    fn test_send_counter_exhaustion_is_fatal() {
        let (_server, mut client) = connected_pair();
        client.force_send_counter(u64::MAX);
        assert!(client.send_data(b"late").is_err());
        assert_eq!(client.state(), EngineState::Terminated(TerminationReason::Error));
        assert!(client
            .drain_events()
            .iter()
            .any(|e| matches!(e, Event::Error { .. })));
    }

    #[test]
    fn test_stats_handle_tracks_engine() {
        let mut engine = engine(&SERVER_SEED);
        let handle = engine.stats_handle();
        assert_eq!(handle.snapshot().state, "Idle");
        engine.start_server(&derive_public_key(&CLIENT_SEED).unwrap()).unwrap();
        assert_eq!(handle.snapshot().state, "Handshaking(Server)");
    }

    #[test]
    fn test_stats_report_queued_frames() {
        let (mut server, mut client) = connected_pair();
        drain_tx(&mut server, &mut client);

        for payload in [&b"one"[..], b"two", b"three"] {
            client.send_data(payload).unwrap();
        }
        assert!(client.stats().tx_queued >= 2);

        client.stop().unwrap();
        assert_eq!(client.stats().tx_queued, 0);
    }
}
