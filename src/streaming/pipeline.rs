//! Double-buffered per-frame pipeline queues
//!
//! Bridges the asynchronous decision pass and the next frame's command
//! emission. At most two decision sets may be in flight at once, capping
//! latency and memory growth when the background pass falls behind. Each
//! decision set carries strong references to the textures it concerns so a
//! texture cannot be destroyed while its tiles are being loaded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::streaming::policy::TextureDecisions;
use crate::streaming::record::TextureRecord;

/// Maximum decision sets awaiting commit.
pub const MAX_INFLIGHT_FRAMES: usize = 2;

/// One tick's decision set, staged for command translation.
#[derive(Debug)]
pub struct FrameOutcome {
    pub decisions: Vec<TextureDecisions>,
    /// Keep-alive references, released after the commit completes
    pub retained: Vec<Arc<TextureRecord>>,
}

/// Host copy of the feedback table awaiting decoding.
pub struct ReadbackFrame {
    /// Full feedback array indexed by node offset
    pub words: Vec<u32>,
    /// Countdown value of the tick that captured this readback
    pub countdown: u16,
}

/// Bounded queues between the decision pass and command emission.
pub struct FrameResourcePipeline {
    frame_resources: Mutex<VecDeque<FrameOutcome>>,
    frame_readbacks: Mutex<VecDeque<ReadbackFrame>>,
    inqueue: AtomicUsize,
}

impl FrameResourcePipeline {
    pub fn new() -> Self {
        Self {
            frame_resources: Mutex::new(VecDeque::new()),
            frame_readbacks: Mutex::new(VecDeque::new()),
            inqueue: AtomicUsize::new(0),
        }
    }

    /// Decision sets currently in flight.
    pub fn inqueue_frames(&self) -> usize {
        self.inqueue.load(Ordering::Acquire)
    }

    /// Whether another decision set may be queued.
    pub fn can_queue(&self) -> bool {
        self.inqueue_frames() < MAX_INFLIGHT_FRAMES
    }

    /// Queue a decision set; fails (returning it) when the bound is hit.
    pub fn push_outcome(&self, outcome: FrameOutcome) -> Result<(), FrameOutcome> {
        let mut count = self.inqueue.load(Ordering::Acquire);
        loop {
            if count >= MAX_INFLIGHT_FRAMES {
                return Err(outcome);
            }
            match self.inqueue.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => count = actual,
            }
        }
        self.frame_resources.lock().push_back(outcome);
        Ok(())
    }

    /// Take the oldest decision set for command translation.
    pub fn pop_outcome(&self) -> Option<FrameOutcome> {
        let outcome = self.frame_resources.lock().pop_front();
        if outcome.is_some() {
            self.inqueue.fetch_sub(1, Ordering::AcqRel);
        }
        outcome
    }

    /// Stage a host readback for the next decision pass.
    pub fn push_readback(&self, frame: ReadbackFrame) {
        self.frame_readbacks.lock().push_back(frame);
    }

    /// Take the oldest staged readback.
    pub fn pop_readback(&self) -> Option<ReadbackFrame> {
        self.frame_readbacks.lock().pop_front()
    }
}

impl Default for FrameResourcePipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> FrameOutcome {
        FrameOutcome {
            decisions: Vec::new(),
            retained: Vec::new(),
        }
    }

    #[test]
    fn test_outcome_queue_bounded_at_two() {
        let pipeline = FrameResourcePipeline::new();

        assert!(pipeline.push_outcome(outcome()).is_ok());
        assert!(pipeline.push_outcome(outcome()).is_ok());
        assert!(!pipeline.can_queue());
        assert!(pipeline.push_outcome(outcome()).is_err());
        assert_eq!(pipeline.inqueue_frames(), 2);
    }

    #[test]
    fn test_pop_frees_a_slot() {
        let pipeline = FrameResourcePipeline::new();
        pipeline.push_outcome(outcome()).unwrap();
        pipeline.push_outcome(outcome()).unwrap();

        assert!(pipeline.pop_outcome().is_some());
        assert!(pipeline.can_queue());
        assert!(pipeline.push_outcome(outcome()).is_ok());
    }

    #[test]
    fn test_readback_fifo() {
        let pipeline = FrameResourcePipeline::new();
        pipeline.push_readback(ReadbackFrame { words: vec![1], countdown: 10 });
        pipeline.push_readback(ReadbackFrame { words: vec![2], countdown: 9 });

        assert_eq!(pipeline.pop_readback().unwrap().countdown, 10);
        assert_eq!(pipeline.pop_readback().unwrap().countdown, 9);
        assert!(pipeline.pop_readback().is_none());
    }
}
