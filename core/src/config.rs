//! Engine configuration
//!
//! The control surface passes configuration as a JSON object with camelCase
//! keys. It is parsed once into a [`ConfigUpdate`], merged over the current
//! [`EngineConfig`] and validated as a whole before anything is applied.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TunnelError};
use crate::fsk::{ModemConfig, NUM_TONES};
use crate::RS_ECC_BYTES;

/// Validated engine configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub symbol_rate: f32,
    pub frequencies: [u32; NUM_TONES],
    pub fec_enabled: bool,
    /// Parity bytes per codeword; only 32 is supported
    pub fec_strength: u32,
    pub codec_mode: u8,
    /// Per-frame debug logging
    pub debug_logging: bool,
    pub handshake_timeout_ms: u64,
    /// Client resend interval for handshake message 1
    pub handshake_retransmit_ms: u64,
    /// Modulated frames waiting for the speaker
    pub tx_queue_frames: usize,
    /// Decoded frames waiting for the caller
    pub rx_queue_frames: usize,
    pub event_queue_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let modem = ModemConfig::default();
        Self {
            sample_rate: modem.sample_rate,
            symbol_rate: modem.symbol_rate,
            frequencies: modem.frequencies,
            fec_enabled: true,
            fec_strength: RS_ECC_BYTES as u32,
            codec_mode: 0,
            debug_logging: false,
            handshake_timeout_ms: 20_000,
            handshake_retransmit_ms: 1_500,
            tx_queue_frames: 32,
            rx_queue_frames: 32,
            event_queue_len: 64,
        }
    }
}

/// Partial configuration as received from the control surface
///
/// Numbers are kept wide so out-of-range values produce a configuration
/// error rather than a parse error.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub sample_rate: Option<i64>,
    pub symbol_rate: Option<f64>,
    pub frequencies: Option<Vec<i64>>,
    pub fec_enabled: Option<bool>,
    pub fec_strength: Option<i64>,
    pub codec_mode: Option<i64>,
    pub debug_logging: Option<bool>,
    pub handshake_timeout_ms: Option<i64>,
    pub handshake_retransmit_ms: Option<i64>,
    pub tx_queue_frames: Option<i64>,
    pub rx_queue_frames: Option<i64>,
    pub event_queue_len: Option<i64>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

impl ConfigUpdate {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| TunnelError::Config(format!("invalid JSON: {}", e)))
    }

    /// Keys present in the JSON that this engine does not know.
    pub fn unknown_keys(&self) -> impl Iterator<Item = &str> {
        self.unknown.keys().map(String::as_str)
    }
}

fn in_range<T: TryFrom<i64>>(key: &str, value: i64, min: i64) -> Result<T> {
    if value < min {
        return Err(TunnelError::Config(format!("{} must be at least {}, got {}", key, min, value)));
    }
    T::try_from(value).map_err(|_| TunnelError::Config(format!("{} out of range: {}", key, value)))
}

impl EngineConfig {
    /// Defaults overlaid with a JSON object.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::default().merged(&ConfigUpdate::from_json(json)?)
    }

    /// A new configuration with `update` applied, validated as a whole.
    pub fn merged(&self, update: &ConfigUpdate) -> Result<Self> {
        let mut next = self.clone();

        if let Some(v) = update.sample_rate {
            next.sample_rate = in_range("sampleRate", v, 1)?;
        }
        if let Some(v) = update.symbol_rate {
            if !v.is_finite() || v <= 0.0 {
                return Err(TunnelError::Config(format!("symbolRate must be positive, got {}", v)));
            }
            next.symbol_rate = v as f32;
        }
        if let Some(list) = &update.frequencies {
            if list.len() != NUM_TONES {
                return Err(TunnelError::Config(format!(
                    "frequencies must list exactly {} tones, got {}",
                    NUM_TONES,
                    list.len()
                )));
            }
            for (slot, &v) in next.frequencies.iter_mut().zip(list.iter()) {
                *slot = in_range("frequencies", v, 1)?;
            }
        }
        if let Some(v) = update.fec_enabled {
            next.fec_enabled = v;
        }
        if let Some(v) = update.fec_strength {
            next.fec_strength = in_range("fecStrength", v, 0)?;
        }
        if let Some(v) = update.codec_mode {
            next.codec_mode = in_range("codecMode", v, 0)?;
        }
        if let Some(v) = update.debug_logging {
            next.debug_logging = v;
        }
        if let Some(v) = update.handshake_timeout_ms {
            next.handshake_timeout_ms = in_range("handshakeTimeoutMs", v, 1)?;
        }
        if let Some(v) = update.handshake_retransmit_ms {
            next.handshake_retransmit_ms = in_range("handshakeRetransmitMs", v, 1)?;
        }
        if let Some(v) = update.tx_queue_frames {
            next.tx_queue_frames = in_range("txQueueFrames", v, 1)?;
        }
        if let Some(v) = update.rx_queue_frames {
            next.rx_queue_frames = in_range("rxQueueFrames", v, 1)?;
        }
        if let Some(v) = update.event_queue_len {
            next.event_queue_len = in_range("eventQueueLen", v, 1)?;
        }

        next.validate()?;
        Ok(next)
    }

    pub fn validate(&self) -> Result<()> {
        self.modem_config().validate()?;

        if self.fec_strength != RS_ECC_BYTES as u32 {
            return Err(TunnelError::Config(format!(
                "fecStrength {} unsupported, only {} parity bytes",
                self.fec_strength, RS_ECC_BYTES
            )));
        }
        if self.handshake_timeout_ms == 0 || self.handshake_retransmit_ms == 0 {
            return Err(TunnelError::Config("handshake timers must be non-zero".into()));
        }
        if self.tx_queue_frames == 0 || self.rx_queue_frames == 0 || self.event_queue_len == 0 {
            return Err(TunnelError::Config("queue capacities must be non-zero".into()));
        }
        Ok(())
    }

    pub fn modem_config(&self) -> ModemConfig {
        ModemConfig {
            sample_rate: self.sample_rate,
            symbol_rate: self.symbol_rate,
            frequencies: self.frequencies,
        }
    }

    /// Convert a duration in milliseconds to samples at the configured rate.
    pub fn ms_to_samples(&self, ms: u64) -> u64 {
        ms.saturating_mul(self.sample_rate as u64) / 1000
    }
}
