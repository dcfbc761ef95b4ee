//! Encrypted voice/data tunnel over an analog audio channel
//!
//! Bytes are carried as 4-tone FSK with Reed-Solomon FEC. Sessions are
//! mutually authenticated with an X25519 handshake and sealed with an AEAD.
//! [`Engine`] owns one session and is driven from the audio thread.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod fec;
pub mod framing;
pub mod fsk;
pub mod handshake;
pub mod session;
pub mod stats;

pub use codec::{RawPcmCodec, VoiceCodec};
pub use config::EngineConfig;
pub use crypto::{derive_public_key, ChaChaPolyCipher, FrameCipher, Identity};
pub use error::{Result, TunnelError};
pub use event::{CallOrigin, Event};
pub use fec::{FecCodec, FecStats};
pub use fsk::{FskModem, ModemConfig, ModemStats};
pub use session::{Engine, EngineState, Role, TerminationReason};
pub use stats::{EngineStats, StatsHandle};

// FEC configuration
pub const RS_DATA_BYTES: usize = 223;
pub const RS_TOTAL_BYTES: usize = 255;
pub const RS_ECC_BYTES: usize = RS_TOTAL_BYTES - RS_DATA_BYTES; // 32

// Link framing
pub const PREAMBLE: [u8; 2] = [0x1B, 0x1B]; // symbols 0,1,2,3 twice
pub const SYNC_WORD: [u8; 2] = [0xD3, 0x91];
pub const FRAME_HEADER_SIZE: usize = 5; // sync (2) + kind (1) + length (1) + CRC-8 (1)
pub const MAX_FRAME_BODY: usize = 255;

// Sealed frames
pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;
pub const COUNTER_SIZE: usize = 8;
pub const MAX_PAYLOAD_SIZE: usize = RS_DATA_BYTES - COUNTER_SIZE - TAG_SIZE - 1; // 198

/// Copies of the hangup frame sent against channel loss.
pub const HANGUP_REPEATS: usize = 3;
