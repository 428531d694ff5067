//! Fence-gated deferred destruction
//!
//! Resources the GPU may still reference are queued here with the fence or
//! I/O completion they must outlive; they are destroyed on a later
//! bookkeeping pass once the gate is observed passed.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::gpu::stream::{DeviceBuffer, StreamDevice};
use crate::gpu::timeline::Timeline;
use crate::io::service::IoFence;
use crate::streaming::heap::SparseHeap;
use crate::streaming::record::TextureRecord;

/// Completion the payload must outlive.
pub enum DisposeGate {
    /// Main-stream timeline value
    Fence(u64),
    /// Disk I/O batch completion
    Io(IoFence),
}

/// Deferred-destroyed resource.
pub enum DisposePayload {
    Heaps(Vec<SparseHeap>),
    Buffer(DeviceBuffer),
    /// An unloaded texture record; releasing it also frees its remaining
    /// heaps and its level-table buffer
    Record(Arc<TextureRecord>),
}

struct DisposeEntry {
    gate: DisposeGate,
    payload: DisposePayload,
}

/// Queue of resources awaiting GPU-safe destruction.
pub struct DisposeQueue {
    device: Arc<dyn StreamDevice>,
    timeline: Arc<dyn Timeline>,
    entries: Mutex<Vec<DisposeEntry>>,
}

impl DisposeQueue {
    pub fn new(device: Arc<dyn StreamDevice>, timeline: Arc<dyn Timeline>) -> Self {
        Self {
            device,
            timeline,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Queue a payload for destruction once `gate` has passed.
    pub fn push(&self, gate: DisposeGate, payload: DisposePayload) {
        self.entries.lock().push(DisposeEntry { gate, payload });
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every payload whose gate has passed. Returns how many were
    /// released.
    pub fn collect(&self) -> usize {
        let completed = self.timeline.completed();
        let ready: Vec<DisposeEntry> = {
            let mut entries = self.entries.lock();
            let mut kept = Vec::with_capacity(entries.len());
            let mut ready = Vec::new();
            for entry in entries.drain(..) {
                let passed = match &entry.gate {
                    DisposeGate::Fence(value) => *value <= completed,
                    DisposeGate::Io(fence) => fence.is_signalled(),
                };
                if passed {
                    ready.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            *entries = kept;
            ready
        };

        let count = ready.len();
        for entry in ready {
            self.release(entry.payload);
        }
        count
    }

    /// Destroy everything regardless of gates.
    ///
    /// Only valid after the owning manager has force-synchronized the GPU
    /// and disk queues.
    pub fn drain_all(&self) -> usize {
        let drained: Vec<DisposeEntry> = std::mem::take(&mut *self.entries.lock());
        let count = drained.len();
        for entry in drained {
            self.release(entry.payload);
        }
        count
    }

    fn release(&self, payload: DisposePayload) {
        match payload {
            DisposePayload::Heaps(heaps) => drop(heaps),
            DisposePayload::Buffer(buffer) => self.device.destroy_buffer(buffer),
            DisposePayload::Record(record) => {
                {
                    let mut state = record.state.lock();
                    state.heaps.iter_mut().for_each(|slot| {
                        slot.take();
                    });
                }
                self.device.destroy_buffer(record.level_table);
                log::debug!("disposed texture record '{}'", record.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::gpu::stream::NullDevice;
    use crate::gpu::timeline::HostTimeline;

    fn queue() -> (Arc<NullDevice>, Arc<HostTimeline>, DisposeQueue) {
        let device = Arc::new(NullDevice::new());
        let timeline = Arc::new(HostTimeline::new());
        let dispose = DisposeQueue::new(device.clone(), timeline.clone());
        (device, timeline, dispose)
    }

    #[test]
    fn test_heaps_held_until_fence() {
        let (device, timeline, dispose) = queue();
        let allocated = Arc::new(AtomicU64::new(0));

        let heap = SparseHeap::new(device.clone(), allocated.clone(), 64).unwrap();
        dispose.push(DisposeGate::Fence(5), DisposePayload::Heaps(vec![heap]));

        assert_eq!(dispose.collect(), 0);
        assert_eq!(allocated.load(Ordering::SeqCst), 64);

        timeline.signal(5);
        assert_eq!(dispose.collect(), 1);
        assert_eq!(allocated.load(Ordering::SeqCst), 0);
        assert!(dispose.is_empty());
    }

    #[test]
    fn test_io_gate() {
        let (_device, _timeline, dispose) = queue();

        let fence = IoFence::new(1);
        dispose.push(DisposeGate::Io(fence.clone()), DisposePayload::Heaps(Vec::new()));
        assert_eq!(dispose.collect(), 0);

        fence.complete_one(true);
        assert_eq!(dispose.collect(), 1);
    }

    #[test]
    fn test_buffer_destroyed_on_release() {
        let (device, timeline, dispose) = queue();
        let buffer = device.create_buffer(16, "retired");

        dispose.push(DisposeGate::Fence(1), DisposePayload::Buffer(buffer));
        timeline.signal(1);
        dispose.collect();

        // Destroyed buffers read back as missing (no-op read)
        let mut out = [1u8; 4];
        device.read_buffer(buffer, 0, &mut out);
        assert_eq!(out, [1u8; 4]);
    }

    #[test]
    fn test_drain_all_ignores_gates() {
        let (_device, _timeline, dispose) = queue();
        dispose.push(DisposeGate::Fence(100), DisposePayload::Heaps(Vec::new()));
        assert_eq!(dispose.drain_all(), 1);
        assert!(dispose.is_empty());
    }
}
