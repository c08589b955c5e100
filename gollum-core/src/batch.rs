//! A double-buffered message batch used by producers that flush on a
//! count/time trigger instead of per-message (the Ticker and Batched
//! producer flavors).
//!
//! Writers reserve a slot with a single atomic fetch-add, then lock only
//! that one slot to write into it — concurrent pushes into different slots
//! never contend with each other, unlike a single `Mutex` guarding the whole
//! buffer. A swap flips the active-buffer bit and resets the reservation
//! count in one atomic RMW, so there is no window where a push can land
//! against a buffer that the flusher believes it already owns exclusively;
//! draining a slot still has to acquire that slot's lock, which blocks until
//! any writer still mid-push finishes, so a swap never loses a message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use crate::message::Message;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("batch is full ({0} slots)")]
    Full(usize),
}

/// One bit of the reservation counter selects which of the two buffers is
/// active; the remaining bits are a monotonic count of reservations made
/// against the active buffer since the last swap.
const ACTIVE_BUFFER_BIT: u64 = 1 << 63;
const COUNT_MASK: u64 = !ACTIVE_BUFFER_BIT;

struct Slot {
    buffers: [Box<[Mutex<Option<Message>>]>; 2],
}

/// A fixed-capacity batch of messages, double-buffered so producers can keep
/// accepting new messages into one half while the other half is flushed.
pub struct MessageBatch {
    capacity: usize,
    reservation: AtomicU64,
    slot: Slot,
}

/// What pushing a message into the batch triggered, if anything.
pub enum PushOutcome {
    /// The message was accepted and the batch has not reached its flush
    /// threshold yet.
    Accepted,
    /// The message was accepted and the batch just reached `flush_count`;
    /// the caller should swap and flush.
    ShouldFlush,
}

impl MessageBatch {
    /// `flush_count` is clamped to `max_count` if it exceeds it — a batch can
    /// never be asked to flush later than it becomes completely full.
    pub fn new(max_count: usize) -> Self {
        let capacity = max_count.max(1);
        let make_buffer = || (0..capacity).map(|_| Mutex::new(None)).collect();
        Self {
            capacity,
            reservation: AtomicU64::new(0),
            slot: Slot {
                buffers: [make_buffer(), make_buffer()],
            },
        }
    }

    fn active_buffer_index(reservation: u64) -> usize {
        if reservation & ACTIVE_BUFFER_BIT == 0 {
            0
        } else {
            1
        }
    }

    /// Reserves a slot in the active buffer and writes `message` into it.
    /// Returns [`BatchError::Full`] if the active buffer's capacity is
    /// already exhausted (the caller should flush and retry).
    pub fn push(&self, message: Message, flush_count: usize) -> Result<PushOutcome, BatchError> {
        let flush_count = flush_count.min(self.capacity).max(1);
        let previous = self.reservation.fetch_add(1, Ordering::SeqCst);
        let index = previous & COUNT_MASK;
        let buffer_selector = Self::active_buffer_index(previous);

        if index as usize >= self.capacity {
            // Over-reserved past capacity; back out the reservation so a
            // subsequent swap starts counting from the right place.
            self.reservation.fetch_sub(1, Ordering::SeqCst);
            return Err(BatchError::Full(self.capacity));
        }

        let mut cell = self.slot.buffers[buffer_selector][index as usize]
            .lock()
            .expect("poisoned MessageBatch slot lock");
        *cell = Some(message);
        drop(cell);

        if (index as usize + 1) >= flush_count {
            Ok(PushOutcome::ShouldFlush)
        } else {
            Ok(PushOutcome::Accepted)
        }
    }

    /// Atomically swaps the active buffer and returns the messages
    /// accumulated in the buffer that was active until this call. Safe to
    /// call even if nothing was ever pushed (returns an empty vec).
    ///
    /// The bit flip and the count reset happen as a single
    /// compare-and-swap loop rather than two separate atomic operations, so
    /// there is no instant at which a concurrent `push` could observe a
    /// flipped active bit paired with the old (not-yet-reset) count.
    pub fn swap(&self) -> Vec<Message> {
        let previous = self
            .reservation
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let flipped = current ^ ACTIVE_BUFFER_BIT;
                Some(flipped & ACTIVE_BUFFER_BIT)
            })
            .expect("closure always returns Some");

        let drained_count = (previous & COUNT_MASK).min(self.capacity as u64) as usize;
        let drained_selector = Self::active_buffer_index(previous);

        self.slot.buffers[drained_selector]
            .iter()
            .take(drained_count)
            .filter_map(|cell| {
                cell.lock()
                    .expect("poisoned MessageBatch slot lock")
                    .take()
            })
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of messages currently reserved in the active buffer.
    pub fn len(&self) -> usize {
        let reservation = self.reservation.load(Ordering::SeqCst);
        ((reservation & COUNT_MASK) as usize).min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
