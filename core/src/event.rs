use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;

/// Which side ended the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOrigin {
    Local,
    Remote,
}

/// Notifications for the control surface, serialised as `{"type": ..., ...}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    HandshakeStarted,
    HandshakeSuccess,
    HandshakeFailed { reason: String },
    SessionEstablished,
    FecCorrection { count: usize },
    FrameLost { reason: String },
    Error { message: String },
    CallEnded { origin: CallOrigin },
}

/// Bounded event channel that drops the oldest event when full
///
/// The engine keeps one receiver so it can evict; observers get clones from
/// [`EventQueue::subscribe`]. Every receiver competes for the same events.
#[derive(Debug)]
pub struct EventQueue {
    tx: Sender<Event>,
    rx: Receiver<Event>,
    capacity: usize,
    dropped: u64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, mut event: Event) {
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped += 1;
                    }
                    event = rejected;
                }
                // The queue owns a receiver, so the channel cannot disconnect
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.rx.clone()
    }

    /// Take every queued event.
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events evicted because nobody consumed them in time.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
