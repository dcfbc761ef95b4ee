use crate::error::{Result, TunnelError};
use serde::Serialize;
use std::cmp::Ordering;
use std::f32::consts::PI;

// 4-tone FSK configuration
//
// Symbol alphabet:
// - 4 fixed tones, one per 2-bit symbol value (frequencies[0] carries 0b00)
// - Each byte is sent as 4 symbols, most-significant bit pair first
// - Tones are phase-continuous across symbol boundaries and across calls
//
// Receiver:
// - Goertzel energy at each of the 4 tones per symbol window
// - Strongest tone wins
// - Early/late gate keeps the symbol clock aligned with the incoming stream

/// Number of symbols carrying one byte.
pub const SYMBOLS_PER_BYTE: usize = 4;

/// Bits carried by one symbol.
pub const BITS_PER_SYMBOL: usize = 2;

/// Number of tones in the alphabet.
pub const NUM_TONES: usize = 1 << BITS_PER_SYMBOL;

/// Peak amplitude of a transmitted tone (half of full scale).
const TONE_AMPLITUDE: f32 = 0.5 * i16::MAX as f32;

/// Tones weaker than this (in sample units) are treated as silence.
const MIN_TONE_AMPLITUDE: f32 = 200.0;

/// Minimum share of the strongest tone in the total tone energy.
const MIN_TONE_PURITY: f32 = 0.4;

/// Acquisition picks the earliest candidate within this fraction of the best.
const ACQUIRE_TOLERANCE: f32 = 0.95;

/// Candidate offsets evaluated across one symbol period during acquisition.
const ACQUIRE_STEPS: usize = 32;

/// A neighbouring window must beat the on-time window by this factor to move the clock.
const TRACK_MARGIN: f32 = 1.05;

/// Consecutive weak symbols that drop sync lock.
const LOCK_LOSS_SYMBOLS: u32 = 2;

/// Smoothing factor for the timing-error estimate.
const TIMING_ERROR_SMOOTHING: f32 = 0.1;

/// Modem parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ModemConfig {
    /// Samples per second of the PCM stream
    pub sample_rate: u32,
    /// Symbols per second
    pub symbol_rate: f32,
    /// Tone frequency in Hz for each 2-bit symbol value
    pub frequencies: [u32; NUM_TONES],
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            symbol_rate: 100.0,
            frequencies: [600, 900, 1200, 1500],
        }
    }
}

impl ModemConfig {
    /// `round(sample_rate / symbol_rate)`
    pub fn samples_per_symbol(&self) -> usize {
        (self.sample_rate as f64 / self.symbol_rate as f64).round() as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(TunnelError::Config("sample rate must be positive".into()));
        }
        if !(self.symbol_rate.is_finite() && self.symbol_rate > 0.0) {
            return Err(TunnelError::Config(format!(
                "symbol rate must be positive, got {}",
                self.symbol_rate
            )));
        }
        // Symbols longer than one second would need unbounded buffers
        if self.samples_per_symbol() > self.sample_rate as usize {
            return Err(TunnelError::Config(format!(
                "symbol rate {} below 1 symbol per second",
                self.symbol_rate
            )));
        }
        if self.samples_per_symbol() < 1 {
            return Err(TunnelError::Config(format!(
                "symbol rate {} too high for sample rate {}",
                self.symbol_rate, self.sample_rate
            )));
        }

        let nyquist = self.sample_rate / 2;
        for (i, &freq) in self.frequencies.iter().enumerate() {
            if freq == 0 {
                return Err(TunnelError::Config(format!("frequency {} must be positive", i)));
            }
            if freq >= nyquist {
                return Err(TunnelError::Config(format!(
                    "frequency {} Hz is not below Nyquist ({} Hz)",
                    freq, nyquist
                )));
            }
            if self.frequencies[..i].contains(&freq) {
                return Err(TunnelError::Config(format!("duplicate frequency {} Hz", freq)));
            }
        }
        Ok(())
    }
}

/// Modem counters and sync status
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ModemStats {
    pub symbols_tx: u64,
    pub symbols_rx: u64,
    pub sync_locked: bool,
    /// Smoothed (late - early) / on-time dominance; 0 when centred
    pub timing_error: f32,
    pub sync_losses: u64,
}

/// Output of the streaming demodulator, in stream order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemodEvent {
    Byte(u8),
    /// Sync was lost; any partially received byte was discarded
    LockLost,
}

/// Energy picture of one symbol window
#[derive(Debug, Clone, Copy)]
struct SymbolScore {
    symbol: u8,
    /// Squared amplitude of the strongest tone
    power: f32,
    /// Strongest minus second strongest tone power
    dominance: f32,
    /// Strongest tone power over the sum of all tone powers
    purity: f32,
}

#[derive(Debug, Default)]
struct RxState {
    /// Pending samples; `clock` indexes into this buffer
    buffer: Vec<f32>,
    clock: usize,
    locked: bool,
    weak_run: u32,
    /// Symbol bits of the byte being assembled
    bits: u8,
    symbols_in_byte: usize,
    timing_error: f32,
}

/// Goertzel power at angular frequency `omega`, normalised to squared tone amplitude.
fn tone_power(window: &[f32], omega: f32) -> f32 {
    let n = window.len();
    if n == 0 {
        return 0.0;
    }
    let coeff = 2.0 * omega.cos();

    let mut q1 = 0.0f32;
    let mut q2 = 0.0f32;
    for &sample in window {
        let q0 = coeff * q1 - q2 + sample;
        q2 = q1;
        q1 = q0;
    }

    let real = q1 - q2 * omega.cos();
    let imag = q2 * omega.sin();
    let scale = 2.0 / n as f32;
    (real * real + imag * imag) * scale * scale
}

/// 4-tone FSK modem
///
/// One instance owns both directions: a phase-continuous tone generator and a
/// streaming demodulator with its own symbol clock. The two directions share
/// only the configuration and the counters.
pub struct FskModem {
    config: ModemConfig,
    samples_per_symbol: usize,
    /// Per-sample phase increment for each tone
    phase_steps: [f32; NUM_TONES],
    /// Goertzel angular frequency for each tone
    omegas: [f32; NUM_TONES],
    tx_phase: f32,
    rx: RxState,
    symbols_tx: u64,
    symbols_rx: u64,
    sync_losses: u64,
}

impl FskModem {
    pub fn new(config: ModemConfig) -> Result<Self> {
        config.validate()?;
        let mut modem = Self {
            samples_per_symbol: 0,
            phase_steps: [0.0; NUM_TONES],
            omegas: [0.0; NUM_TONES],
            config,
            tx_phase: 0.0,
            rx: RxState::default(),
            symbols_tx: 0,
            symbols_rx: 0,
            sync_losses: 0,
        };
        modem.derive_tone_tables();
        Ok(modem)
    }

    /// Swap in new sampling parameters. State is reset, counters are kept.
    pub fn reconfigure(&mut self, config: ModemConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.derive_tone_tables();
        self.reset();
        Ok(())
    }

    fn derive_tone_tables(&mut self) {
        let sample_rate = self.config.sample_rate as f32;
        self.samples_per_symbol = self.config.samples_per_symbol();
        for (i, &freq) in self.config.frequencies.iter().enumerate() {
            let omega = 2.0 * PI * freq as f32 / sample_rate;
            self.phase_steps[i] = omega;
            self.omegas[i] = omega;
        }
    }

    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    pub fn samples_per_symbol(&self) -> usize {
        self.samples_per_symbol
    }

    /// Exact PCM length `modulate` produces for `n` bytes.
    pub fn samples_for_bytes(&self, n: usize) -> usize {
        n * SYMBOLS_PER_BYTE * self.samples_per_symbol
    }

    /// Modulate bytes into PCM
    ///
    /// Each byte is split into four 2-bit symbols, most-significant pair first.
    /// Each symbol is an unmodulated sinusoid at `frequencies[symbol]` lasting
    /// `samples_per_symbol` samples.
    pub fn modulate(&mut self, data: &[u8]) -> Vec<i16> {
        let mut pcm = Vec::with_capacity(self.samples_for_bytes(data.len()));

        for &byte in data {
            for shift in [6u32, 4, 2, 0] {
                let symbol = ((byte >> shift) & 0b11) as usize;
                let step = self.phase_steps[symbol];
                for _ in 0..self.samples_per_symbol {
                    pcm.push((TONE_AMPLITUDE * self.tx_phase.sin()).round() as i16);
                    self.tx_phase += step;
                    if self.tx_phase >= 2.0 * PI {
                        self.tx_phase -= 2.0 * PI;
                    }
                }
                self.symbols_tx += 1;
            }
        }

        pcm
    }

    /// Demodulate PCM into bytes
    ///
    /// Input does not need to be aligned to symbol boundaries and may arrive in
    /// arbitrary chunks: a trailing partial symbol is kept until the next call.
    pub fn demodulate(&mut self, pcm: &[i16]) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.demodulate_with(pcm, |event| {
            if let DemodEvent::Byte(byte) = event {
                bytes.push(byte);
            }
        });
        bytes
    }

    /// Streaming demodulation reporting bytes and sync losses in stream order.
    pub fn demodulate_with<F: FnMut(DemodEvent)>(&mut self, pcm: &[i16], mut sink: F) {
        self.rx.buffer.extend(pcm.iter().map(|&s| s as f32));

        let sps = self.samples_per_symbol;
        let guard = self.tracking_offset();

        loop {
            if !self.rx.locked {
                if self.acquire() {
                    continue;
                }
                break;
            }

            let start = self.rx.clock;
            let available = self.rx.buffer.len();
            if start + sps > available {
                break;
            }

            let on_time = self.score(&self.rx.buffer[start..start + sps]);
            let weak = self.is_weak(&on_time);

            let mut next_clock = start + sps;
            if !weak && start >= guard && start + guard + sps <= available {
                let early = self.score(&self.rx.buffer[start - guard..start - guard + sps]);
                let late = self.score(&self.rx.buffer[start + guard..start + guard + sps]);

                let reference = on_time.dominance.max(f32::EPSILON);
                let error = (late.dominance - early.dominance) / reference;
                self.rx.timing_error += TIMING_ERROR_SMOOTHING * (error - self.rx.timing_error);

                if late.dominance > on_time.dominance * TRACK_MARGIN
                    && late.dominance >= early.dominance
                {
                    next_clock += 1;
                } else if early.dominance > on_time.dominance * TRACK_MARGIN {
                    next_clock -= 1;
                }
            }
            self.rx.clock = next_clock;

            if weak {
                self.rx.weak_run += 1;
                if self.rx.weak_run >= LOCK_LOSS_SYMBOLS {
                    self.drop_lock();
                    sink(DemodEvent::LockLost);
                    continue;
                }
            } else {
                self.rx.weak_run = 0;
            }

            self.symbols_rx += 1;
            self.rx.bits = (self.rx.bits << BITS_PER_SYMBOL) | on_time.symbol;
            self.rx.symbols_in_byte += 1;
            if self.rx.symbols_in_byte == SYMBOLS_PER_BYTE {
                sink(DemodEvent::Byte(self.rx.bits));
                self.rx.bits = 0;
                self.rx.symbols_in_byte = 0;
            }
        }

        self.compact(guard);
    }

    /// Clear buffers, phase, clock and lock. Configuration and counters are kept.
    pub fn reset(&mut self) {
        self.tx_phase = 0.0;
        self.rx = RxState::default();
    }

    pub fn stats(&self) -> ModemStats {
        ModemStats {
            symbols_tx: self.symbols_tx,
            symbols_rx: self.symbols_rx,
            sync_locked: self.rx.locked,
            timing_error: self.rx.timing_error,
            sync_losses: self.sync_losses,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.rx.locked
    }

    /// Offset of the early/late windows from the on-time window.
    fn tracking_offset(&self) -> usize {
        (self.samples_per_symbol / 8).max(1)
    }

    fn score(&self, window: &[f32]) -> SymbolScore {
        let mut powers = [0.0f32; NUM_TONES];
        for (power, &omega) in powers.iter_mut().zip(self.omegas.iter()) {
            *power = tone_power(window, omega);
        }

        let mut order = [0usize, 1, 2, 3];
        order.sort_by(|&a, &b| powers[b].partial_cmp(&powers[a]).unwrap_or(Ordering::Equal));
        let best = order[0];
        let total: f32 = powers.iter().sum();

        SymbolScore {
            symbol: best as u8,
            power: powers[best],
            dominance: powers[best] - powers[order[1]],
            purity: if total > 0.0 { powers[best] / total } else { 0.0 },
        }
    }

    fn is_weak(&self, score: &SymbolScore) -> bool {
        score.power < MIN_TONE_AMPLITUDE * MIN_TONE_AMPLITUDE || score.purity < MIN_TONE_PURITY
    }

    /// Search one symbol period of candidate offsets for the symbol boundary.
    ///
    /// Returns true when progress was made (samples discarded or lock acquired),
    /// false when more samples are needed.
    fn acquire(&mut self) -> bool {
        let sps = self.samples_per_symbol;
        let step = (sps / ACQUIRE_STEPS).max(1);
        let last = ((sps - 1) / step) * step;
        if self.rx.buffer.len() < last + sps {
            return false;
        }

        let candidates: Vec<(usize, SymbolScore)> = (0..=last)
            .step_by(step)
            .map(|offset| (offset, self.score(&self.rx.buffer[offset..offset + sps])))
            .collect();

        let (_, strongest) = candidates
            .iter()
            .max_by(|a, b| a.1.dominance.partial_cmp(&b.1.dominance).unwrap_or(Ordering::Equal))
            .copied()
            .unwrap_or((0, candidates[0].1));

        if self.is_weak(&strongest) {
            // Idle channel: keep the tail in case a tone starts there
            self.discard(last.max(1));
            return true;
        }

        let threshold = strongest.dominance * ACQUIRE_TOLERANCE;
        let chosen = candidates
            .iter()
            .find(|(_, score)| score.dominance >= threshold)
            .map(|(offset, _)| *offset)
            .unwrap_or(0);

        if chosen == last && last > 0 {
            // Energy still rising at the end of the search range
            self.discard(last);
            return true;
        }

        self.discard(chosen);
        self.rx.clock = 0;
        self.rx.locked = true;
        self.rx.weak_run = 0;
        self.rx.bits = 0;
        self.rx.symbols_in_byte = 0;
        log::trace!("FSK sync acquired (skipped {} samples)", chosen);
        true
    }

    fn drop_lock(&mut self) {
        self.rx.locked = false;
        self.rx.weak_run = 0;
        self.rx.bits = 0;
        self.rx.symbols_in_byte = 0;
        self.sync_losses += 1;
        let consumed = self.rx.clock.min(self.rx.buffer.len());
        self.discard(consumed);
        self.rx.clock = 0;
        log::trace!("FSK sync lost (total losses {})", self.sync_losses);
    }

    fn discard(&mut self, count: usize) {
        let count = count.min(self.rx.buffer.len());
        self.rx.buffer.drain(..count);
    }

    /// Drop consumed samples, keeping `guard` samples of history for the early window.
    fn compact(&mut self, guard: usize) {
        if !self.rx.locked {
            return;
        }
        let keep_from = self.rx.clock.saturating_sub(guard).min(self.rx.buffer.len());
        if keep_from > 0 {
            self.rx.buffer.drain(..keep_from);
            self.rx.clock -= keep_from;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ModemConfig {
        ModemConfig {
            sample_rate: 16000,
            symbol_rate: 100.0,
            frequencies: [600, 900, 1200, 1500],
        }
    }

    #[test]
    fn test_samples_per_symbol() {
        assert_eq!(base_config().samples_per_symbol(), 160);

        let odd = ModemConfig {
            sample_rate: 8000,
            symbol_rate: 300.0,
            frequencies: [600, 900, 1200, 1500],
        };
        assert_eq!(odd.samples_per_symbol(), 27); // 26.67 rounds up
    }

    #[test]
    fn test_single_byte_scenario() {
        let mut tx = FskModem::new(base_config()).unwrap();
        let mut rx = FskModem::new(base_config()).unwrap();

        let samples = tx.modulate(&[0xA5]);
        assert_eq!(samples.len(), 640);
        assert_eq!(rx.demodulate(&samples), vec![0xA5]);
    }

    #[test]
    fn test_roundtrip_lengths() {
        for len in 0..24usize {
            let mut tx = FskModem::new(base_config()).unwrap();
            let mut rx = FskModem::new(base_config()).unwrap();
            let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(73).wrapping_add(11)).collect();

            let samples = tx.modulate(&data);
            let decoded = rx.demodulate(&samples);
            assert_eq!(decoded, data, "Failed roundtrip for length {}", len);
        }
    }

    #[test]
    fn test_byte_patterns() {
        let patterns = vec![
            vec![0x00; 6],
            vec![0xFF; 6],
            vec![0xAA; 6],
            vec![0x55; 6],
            vec![0x00, 0xFF, 0x00, 0xFF, 0x00, 0xFF],
            vec![0x1B, 0xE4, 0x27],
        ];

        for bytes in patterns {
            let mut tx = FskModem::new(base_config()).unwrap();
            let mut rx = FskModem::new(base_config()).unwrap();
            let samples = tx.modulate(&bytes);
            assert_eq!(rx.demodulate(&samples), bytes, "Failed for pattern {:02X?}", bytes);
        }
    }

    #[test]
    fn test_length_law_across_configs() {
        let configs = [
            base_config(),
            ModemConfig {
                sample_rate: 8000,
                symbol_rate: 50.0,
                frequencies: [500, 1000, 1500, 2000],
            },
            ModemConfig {
                sample_rate: 44100,
                symbol_rate: 441.0,
                frequencies: [1764, 2646, 3528, 4410],
            },
        ];

        for config in configs {
            let mut modem = FskModem::new(config).unwrap();
            for n in [0usize, 1, 3, 17] {
                let data = vec![0x3Cu8; n];
                assert_eq!(modem.modulate(&data).len(), modem.samples_for_bytes(n));
            }
        }
    }

    #[test]
    fn test_msb_pair_first_mapping() {
        // 0b00_01_10_11: tones 0, 1, 2, 3 in that order
        let mut tx = FskModem::new(base_config()).unwrap();
        let probe = FskModem::new(base_config()).unwrap();
        let samples = tx.modulate(&[0x1B]);
        let sps = tx.samples_per_symbol();

        for (expected, window) in samples.chunks(sps).enumerate() {
            let window: Vec<f32> = window.iter().map(|&s| s as f32).collect();
            assert_eq!(probe.score(&window).symbol as usize, expected);
        }
    }

    #[test]
    fn test_empty_input() {
        let mut modem = FskModem::new(base_config()).unwrap();
        assert!(modem.modulate(&[]).is_empty());
        assert!(modem.demodulate(&[]).is_empty());
        assert_eq!(modem.stats().symbols_tx, 0);
    }

    #[test]
    fn test_partial_symbol_is_buffered() {
        let mut tx = FskModem::new(base_config()).unwrap();
        let mut rx = FskModem::new(base_config()).unwrap();
        let data = [0xDE, 0xAD, 0xBE, 0xEF];
        let samples = tx.modulate(&data);

        // Split at points that are not symbol-aligned
        let mut decoded = Vec::new();
        decoded.extend(rx.demodulate(&samples[..333]));
        decoded.extend(rx.demodulate(&samples[333..1001]));
        decoded.extend(rx.demodulate(&samples[1001..]));
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_phase_continuity() {
        let mut modem = FskModem::new(base_config()).unwrap();
        let mut samples = modem.modulate(&[0x1B, 0xE4]);
        samples.extend(modem.modulate(&[0x93]));

        // Largest per-sample step of the highest tone is 2*pi*1500/16000 * A
        let max_step = (2.0 * PI * 1500.0 / 16000.0 * TONE_AMPLITUDE) as i32 + 2;
        for pair in samples.windows(2) {
            let step = (pair[1] as i32 - pair[0] as i32).abs();
            assert!(step <= max_step, "discontinuity of {} samples", step);
        }
    }

    #[test]
    fn test_config_validation() {
        let mut config = base_config();
        config.frequencies = [600, 900, 900, 1500];
        assert!(matches!(FskModem::new(config), Err(TunnelError::Config(_))));

        let mut config = base_config();
        config.frequencies = [0, 900, 1200, 1500];
        assert!(FskModem::new(config).is_err());

        let mut config = base_config();
        config.frequencies = [600, 900, 1200, 8000];
        assert!(FskModem::new(config).is_err());

        let mut config = base_config();
        config.symbol_rate = 0.0;
        assert!(FskModem::new(config).is_err());

        let mut config = base_config();
        config.symbol_rate = -100.0;
        assert!(FskModem::new(config).is_err());

        let mut config = base_config();
        config.sample_rate = 0;
        assert!(FskModem::new(config).is_err());

        let mut config = base_config();
        config.symbol_rate = 40000.0;
        assert!(FskModem::new(config).is_err());

        for tiny in [0.5, 1e-6, 1e-30] {
            let mut config = base_config();
            config.symbol_rate = tiny;
            assert!(matches!(FskModem::new(config), Err(TunnelError::Config(_))), "accepted {}", tiny);
        }

        let mut config = base_config();
        config.symbol_rate = 1.0;
        let modem = FskModem::new(config).unwrap();
        assert_eq!(modem.samples_for_bytes(1), 4 * 16000);
    }

    #[test]
    fn test_reset_keeps_config_and_counters() {
        let mut modem = FskModem::new(base_config()).unwrap();
        let samples = modem.modulate(&[0x42, 0x42]);
        modem.demodulate(&samples[..500]);
        let before = modem.stats();

        modem.reset();
        let after = modem.stats();
        assert_eq!(after.symbols_tx, before.symbols_tx);
        assert!(!after.sync_locked);
        assert_eq!(modem.config(), &base_config());

        // Fresh state decodes a new transmission from scratch
        let mut tx = FskModem::new(base_config()).unwrap();
        let fresh = tx.modulate(&[0x99]);
        assert_eq!(modem.demodulate(&fresh), vec![0x99]);
    }

    #[test]
    fn test_stats_counters() {
        let mut tx = FskModem::new(base_config()).unwrap();
        let mut rx = FskModem::new(base_config()).unwrap();
        let samples = tx.modulate(&[1, 2, 3]);
        assert_eq!(tx.stats().symbols_tx, 12);

        rx.demodulate(&samples);
        let stats = rx.stats();
        assert_eq!(stats.symbols_rx, 12);
        assert!(stats.sync_locked);
        assert_eq!(stats.sync_losses, 0);
    }

    #[test]
    fn test_silence_drops_lock() {
        let mut tx = FskModem::new(base_config()).unwrap();
        let mut rx = FskModem::new(base_config()).unwrap();
        let mut samples = tx.modulate(&[0x5A, 0xC3]);
        samples.extend(vec![0i16; 160 * 6]);

        let mut events = Vec::new();
        rx.demodulate_with(&samples, |event| events.push(event));
        assert_eq!(
            events,
            vec![DemodEvent::Byte(0x5A), DemodEvent::Byte(0xC3), DemodEvent::LockLost]
        );
        assert_eq!(rx.stats().sync_losses, 1);
        assert!(!rx.stats().sync_locked);
    }

    #[test]
    fn test_gain_invariance() {
        let mut tx = FskModem::new(base_config()).unwrap();
        let samples = tx.modulate(&[0x5A, 0xC3, 0x9F]);

        for gain in [0.1f32, 0.5, 1.0, 1.9] {
            let mut rx = FskModem::new(base_config()).unwrap();
            let scaled: Vec<i16> = samples.iter().map(|&s| (s as f32 * gain) as i16).collect();
            assert_eq!(rx.demodulate(&scaled), vec![0x5A, 0xC3, 0x9F], "Failed at gain {}", gain);
        }
    }

    #[test]
    fn test_reconfigure_resets_state() {
        let mut modem = FskModem::new(base_config()).unwrap();
        let samples = modem.modulate(&[0x11]);
        modem.demodulate(&samples);
        assert!(modem.is_locked());

        let new_config = ModemConfig {
            sample_rate: 8000,
            symbol_rate: 100.0,
            frequencies: [500, 1000, 1500, 2000],
        };
        modem.reconfigure(new_config.clone()).unwrap();
        assert!(!modem.is_locked());
        assert_eq!(modem.samples_per_symbol(), 80);
        assert_eq!(modem.stats().symbols_tx, 4);

        let mut bad = new_config;
        bad.frequencies = [500, 500, 1500, 2000];
        assert!(modem.reconfigure(bad).is_err());
        assert_eq!(modem.samples_per_symbol(), 80);
    }
}
