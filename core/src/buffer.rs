//! Fixed-capacity queues between the audio cadence and the pipeline stages
//!
//! Every queue drops its oldest entry when full and counts the drop.

use std::collections::VecDeque;

/// Bounded FIFO that evicts the oldest entry on overflow
#[derive(Debug, Clone)]
pub struct FrameRing<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> FrameRing<T> {
    /// A capacity of 0 is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append an item, returning the evicted oldest item if the ring was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Remove everything queued, returning how many items were discarded.
    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        count
    }
}

/// Outbound audio: modulated frames waiting for the speaker
///
/// Frames are played whole. Consecutive frames are separated by at least
/// `guard_samples` of silence so the far receiver drops lock between them and
/// re-acquires on the next preamble.
#[derive(Debug)]
pub struct TxQueue {
    pending: FrameRing<Vec<i16>>,
    /// Frame being played and the next sample to play
    current: Option<(Vec<i16>, usize)>,
    idle_samples: usize,
    guard_samples: usize,
}

impl TxQueue {
    pub fn new(capacity: usize, guard_samples: usize) -> Self {
        Self {
            pending: FrameRing::new(capacity),
            current: None,
            idle_samples: guard_samples,
            guard_samples,
        }
    }

    /// Queue a modulated frame. The frame being played is never evicted.
    pub fn push(&mut self, frame: Vec<i16>) {
        if frame.is_empty() {
            return;
        }
        self.pending.push(frame);
    }

    /// Fill `out` with queued audio and silence. Returns modulated samples written.
    pub fn fill(&mut self, out: &mut [i16]) -> usize {
        let mut pos = 0;
        let mut written = 0;

        while pos < out.len() {
            if let Some((frame, cursor)) = &mut self.current {
                let n = (frame.len() - *cursor).min(out.len() - pos);
                out[pos..pos + n].copy_from_slice(&frame[*cursor..*cursor + n]);
                *cursor += n;
                pos += n;
                written += n;
                if *cursor == frame.len() {
                    self.current = None;
                    self.idle_samples = 0;
                }
                continue;
            }

            if self.idle_samples >= self.guard_samples {
                if let Some(next) = self.pending.pop() {
                    self.current = Some((next, 0));
                    continue;
                }
            }

            let end = if self.pending.is_empty() {
                out.len()
            } else {
                (pos + self.guard_samples - self.idle_samples).min(out.len())
            };
            out[pos..end].fill(0);
            self.idle_samples = self.idle_samples.saturating_add(end - pos);
            pos = end;
        }

        written
    }

    /// Nothing playing and nothing queued.
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    /// Frames waiting behind the one being played.
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    pub fn dropped(&self) -> u64 {
        self.pending.dropped()
    }

    /// Discard queued and playing audio.
    pub fn flush(&mut self) -> usize {
        let playing = usize::from(self.current.take().is_some());
        self.idle_samples = self.guard_samples;
        self.pending.clear() + playing
    }

    /// Change the inter-frame gap after a modem reconfiguration.
    pub fn set_guard(&mut self, guard_samples: usize) {
        self.guard_samples = guard_samples;
        self.idle_samples = self.idle_samples.max(guard_samples);
    }
}
