//! Bounded FIFO between the reader and writer loops
//!
//! One producer pushes filtered, frame-aligned chunks; one consumer drains
//! everything queued into its own accumulator. Both sides block on a
//! condition variable instead of polling, and [`PipelineQueue::close`] wakes
//! whichever side is waiting so a stop never hangs on the queue.

use minstrel_core::domain::config::OverflowPolicy;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{trace, warn};

/// Result of pushing one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The whole chunk was queued
    Queued,
    /// The chunk was queued after discarding this many older bytes
    DroppedOldest(usize),
    /// The chunk (or this many of its bytes) was discarded
    DroppedNewest(usize),
    /// The queue is closed; nothing was queued
    Closed,
}

/// Result of waiting for queued data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// This many bytes were appended to the accumulator
    Drained(usize),
    /// Nothing arrived before the timeout
    TimedOut,
    /// The queue is closed and empty
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    chunks: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    dropped_bytes: u64,
    closed: bool,
}

/// Capacity-bounded chunk queue with a configurable overflow policy
#[derive(Debug)]
pub struct PipelineQueue {
    state: Mutex<QueueState>,
    data_ready: Condvar,
    space_ready: Condvar,
    capacity: usize,
    frame_bytes: usize,
    policy: OverflowPolicy,
}

impl PipelineQueue {
    /// Create a queue holding at most `capacity` bytes
    ///
    /// The capacity is rounded down to whole frames and never below one frame.
    pub fn new(capacity: usize, frame_bytes: usize, policy: OverflowPolicy) -> Self {
        let frame_bytes = frame_bytes.max(1);
        let capacity = (capacity - capacity % frame_bytes).max(frame_bytes);

        Self {
            state: Mutex::new(QueueState::default()),
            data_ready: Condvar::new(),
            space_ready: Condvar::new(),
            capacity,
            frame_bytes,
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Append a frame-aligned chunk, applying the overflow policy when full
    pub fn push(&self, mut chunk: Vec<u8>) -> PushOutcome {
        if chunk.is_empty() {
            return PushOutcome::Queued;
        }

        let mut state = self.lock();
        if state.closed {
            return PushOutcome::Closed;
        }

        let outcome = match self.policy {
            OverflowPolicy::DropOldest => {
                // A single chunk larger than the queue keeps only its newest frames.
                let mut dropped = 0;
                if chunk.len() > self.capacity {
                    let excess = chunk.len() - self.capacity;
                    chunk.drain(..excess);
                    dropped += excess;
                }
                while state.queued_bytes + chunk.len() > self.capacity {
                    match state.chunks.pop_front() {
                        Some(old) => {
                            state.queued_bytes -= old.len();
                            dropped += old.len();
                        }
                        None => break,
                    }
                }
                if dropped > 0 {
                    PushOutcome::DroppedOldest(dropped)
                } else {
                    PushOutcome::Queued
                }
            }
            OverflowPolicy::DropNewest => {
                let room = self.capacity - state.queued_bytes;
                if chunk.len() > room {
                    let keep = room - room % self.frame_bytes;
                    let dropped = chunk.len() - keep;
                    chunk.truncate(keep);
                    PushOutcome::DroppedNewest(dropped)
                } else {
                    PushOutcome::Queued
                }
            }
            OverflowPolicy::Block => {
                // An oversized chunk waits for an empty queue rather than forever.
                let needed = chunk.len().min(self.capacity);
                state = self
                    .space_ready
                    .wait_while(state, |s| {
                        !s.closed && s.queued_bytes + needed > self.capacity
                    })
                    .unwrap_or_else(PoisonError::into_inner);
                if state.closed {
                    return PushOutcome::Closed;
                }
                PushOutcome::Queued
            }
        };

        match outcome {
            PushOutcome::DroppedOldest(n) | PushOutcome::DroppedNewest(n) => {
                state.dropped_bytes += n as u64;
                warn!(
                    dropped = n,
                    capacity = self.capacity,
                    policy = ?self.policy,
                    "Pipeline queue overflow"
                );
            }
            _ => {}
        }

        if !chunk.is_empty() {
            state.queued_bytes += chunk.len();
            state.chunks.push_back(chunk);
            trace!(queued = state.queued_bytes, "Chunk queued");
        }

        drop(state);
        self.data_ready.notify_one();
        outcome
    }

    /// Wait up to `timeout` for data, then move everything queued into `acc`
    pub fn drain_into(&self, acc: &mut Vec<u8>, timeout: Duration) -> DrainOutcome {
        let state = self.lock();
        let (mut state, _) = self
            .data_ready
            .wait_timeout_while(state, timeout, |s| !s.closed && s.chunks.is_empty())
            .unwrap_or_else(PoisonError::into_inner);

        if state.chunks.is_empty() {
            return if state.closed {
                DrainOutcome::Closed
            } else {
                DrainOutcome::TimedOut
            };
        }

        let drained = state.queued_bytes;
        acc.reserve(drained);
        for chunk in state.chunks.drain(..) {
            acc.extend_from_slice(&chunk);
        }
        state.queued_bytes = 0;

        drop(state);
        self.space_ready.notify_one();
        DrainOutcome::Drained(drained)
    }

    /// Refuse further pushes and wake both sides
    pub fn close(&self) {
        self.lock().closed = true;
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }

    /// Discard everything queued
    pub fn clear(&self) {
        let mut state = self.lock();
        state.chunks.clear();
        state.queued_bytes = 0;
        drop(state);
        self.space_ready.notify_all();
    }

    pub fn queued_bytes(&self) -> usize {
        self.lock().queued_bytes
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.lock().dropped_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const FRAME: usize = 8;

    fn chunk(value: u8, frames: usize) -> Vec<u8> {
        vec![value; frames * FRAME]
    }

    #[test]
    fn test_fifo_order() {
        let queue = PipelineQueue::new(64 * FRAME, FRAME, OverflowPolicy::DropOldest);
        queue.push(chunk(1, 2));
        queue.push(chunk(2, 1));
        queue.push(chunk(3, 3));

        let mut acc = Vec::new();
        assert_eq!(
            queue.drain_into(&mut acc, Duration::ZERO),
            DrainOutcome::Drained(6 * FRAME)
        );

        let mut expected = chunk(1, 2);
        expected.extend(chunk(2, 1));
        expected.extend(chunk(3, 3));
        assert_eq!(acc, expected);
        assert_eq!(queue.queued_bytes(), 0);
    }

    #[test]
    fn test_drop_oldest() {
        let queue = PipelineQueue::new(4 * FRAME, FRAME, OverflowPolicy::DropOldest);
        assert_eq!(queue.push(chunk(1, 2)), PushOutcome::Queued);
        assert_eq!(queue.push(chunk(2, 2)), PushOutcome::Queued);
        assert_eq!(
            queue.push(chunk(3, 1)),
            PushOutcome::DroppedOldest(2 * FRAME)
        );
        assert_eq!(queue.queued_bytes(), 3 * FRAME);
        assert_eq!(queue.dropped_bytes(), (2 * FRAME) as u64);

        let mut acc = Vec::new();
        queue.drain_into(&mut acc, Duration::ZERO);
        assert_eq!(acc[0], 2);
        assert_eq!(*acc.last().unwrap(), 3);
    }

    #[test]
    fn test_drop_oldest_oversized_chunk() {
        let queue = PipelineQueue::new(2 * FRAME, FRAME, OverflowPolicy::DropOldest);
        let mut big = chunk(1, 2);
        big.extend(chunk(2, 2));

        assert_eq!(queue.push(big), PushOutcome::DroppedOldest(2 * FRAME));

        let mut acc = Vec::new();
        queue.drain_into(&mut acc, Duration::ZERO);
        assert_eq!(acc, chunk(2, 2));
    }

    #[test]
    fn test_drop_newest() {
        let queue = PipelineQueue::new(3 * FRAME, FRAME, OverflowPolicy::DropNewest);
        assert_eq!(queue.push(chunk(1, 2)), PushOutcome::Queued);
        assert_eq!(queue.push(chunk(2, 2)), PushOutcome::DroppedNewest(FRAME));
        assert_eq!(queue.push(chunk(3, 1)), PushOutcome::DroppedNewest(FRAME));

        let mut acc = Vec::new();
        queue.drain_into(&mut acc, Duration::ZERO);
        let mut expected = chunk(1, 2);
        expected.extend(chunk(2, 1));
        assert_eq!(acc, expected);
    }

    #[test]
    fn test_block_waits_for_consumer() {
        let queue = Arc::new(PipelineQueue::new(2 * FRAME, FRAME, OverflowPolicy::Block));
        queue.push(chunk(1, 2));

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(chunk(2, 2)))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        let mut acc = Vec::new();
        queue.drain_into(&mut acc, Duration::from_secs(1));
        assert_eq!(producer.join().unwrap(), PushOutcome::Queued);

        queue.drain_into(&mut acc, Duration::from_secs(1));
        let mut expected = chunk(1, 2);
        expected.extend(chunk(2, 2));
        assert_eq!(acc, expected);
        assert_eq!(queue.dropped_bytes(), 0);
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let queue = Arc::new(PipelineQueue::new(FRAME, FRAME, OverflowPolicy::Block));
        queue.push(chunk(1, 1));

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(chunk(2, 1)))
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(producer.join().unwrap(), PushOutcome::Closed);
    }

    #[test]
    fn test_drain_timeout_and_close() {
        let queue = PipelineQueue::new(4 * FRAME, FRAME, OverflowPolicy::DropOldest);
        let mut acc = Vec::new();
        assert_eq!(
            queue.drain_into(&mut acc, Duration::from_millis(5)),
            DrainOutcome::TimedOut
        );

        queue.push(chunk(1, 1));
        queue.close();
        assert_eq!(queue.push(chunk(2, 1)), PushOutcome::Closed);

        // Data queued before the close is still delivered.
        assert_eq!(
            queue.drain_into(&mut acc, Duration::from_secs(1)),
            DrainOutcome::Drained(FRAME)
        );
        assert_eq!(
            queue.drain_into(&mut acc, Duration::from_secs(1)),
            DrainOutcome::Closed
        );
    }

    #[test]
    fn test_consumer_wakes_on_push() {
        let queue = Arc::new(PipelineQueue::new(4 * FRAME, FRAME, OverflowPolicy::DropOldest));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut acc = Vec::new();
                let outcome = queue.drain_into(&mut acc, Duration::from_secs(5));
                (outcome, acc)
            })
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(chunk(7, 1));

        let (outcome, acc) = consumer.join().unwrap();
        assert_eq!(outcome, DrainOutcome::Drained(FRAME));
        assert_eq!(acc, chunk(7, 1));
    }

    #[test]
    fn test_capacity_is_frame_aligned() {
        let queue = PipelineQueue::new(FRAME * 3 + 5, FRAME, OverflowPolicy::DropOldest);
        assert_eq!(queue.capacity(), FRAME * 3);

        let tiny = PipelineQueue::new(1, FRAME, OverflowPolicy::DropOldest);
        assert_eq!(tiny.capacity(), FRAME);
    }
}
