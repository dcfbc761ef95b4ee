//! Engine statistics
//!
//! The engine is the only writer: it publishes a fresh snapshot after every
//! operation. Readers clone the [`StatsHandle`] and take short read locks.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::fec::FecStats;
use crate::fsk::ModemStats;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    /// Current engine state, e.g. `"Established"`
    pub state: String,
    pub modem: ModemStats,
    pub fec: FecStats,

    /// Frames queued for transmission
    pub frames_sent: u64,

    /// Frames accepted on receive
    pub frames_received: u64,

    /// Frames dropped by CRC, FEC, authentication or replay checks
    pub frames_lost: u64,

    /// Modulated frames waiting behind the one being played
    pub tx_queued: usize,

    /// Modulated frames evicted from the outbound queue
    pub tx_queue_drops: u64,

    /// Decoded voice or data frames evicted before the caller pulled them
    pub rx_queue_drops: u64,

    pub events_dropped: u64,
    pub handshake_retransmits: u64,
}

impl EngineStats {
    /// Fraction of received frames that were lost
    pub fn loss_rate(&self) -> f64 {
        let total = self.frames_received + self.frames_lost;
        if total == 0 {
            return 0.0;
        }
        self.frames_lost as f64 / total as f64
    }
}

/// Shared read access to the latest [`EngineStats`]
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    inner: Arc<RwLock<EngineStats>>,
}

impl StatsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> EngineStats {
        self.inner.read().clone()
    }

    pub(crate) fn publish(&self, stats: EngineStats) {
        *self.inner.write() = stats;
    }
}
