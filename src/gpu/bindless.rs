//! Bindless slot registry contract
//!
//! Streamed textures are addressed from shaders through a stable slot
//! index; the registry also publishes per-texture reserved buffers (the
//! per-tile level table) under that slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::gpu::stream::DeviceBuffer;

/// Registry handing out stable shader-visible texture slots.
pub trait BindlessRegistry: Send + Sync {
    /// Reserve a slot; stable for the texture's lifetime.
    fn allocate_tex_slot(&self) -> u32;

    /// Return a slot for reuse.
    fn deallocate(&self, slot: u32);

    /// Publish a reserved buffer (e.g. the tile level table) under a slot.
    fn set_reserved_buffer(&self, slot: u32, buffer: DeviceBuffer);
}

/// Free-list slot registry.
pub struct SlotRegistry {
    free: Mutex<Vec<u32>>,
    next: AtomicU32,
    reserved: Mutex<HashMap<u32, DeviceBuffer>>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            next: AtomicU32::new(0),
            reserved: Mutex::new(HashMap::new()),
        }
    }

    /// Buffer currently published under a slot, if any.
    pub fn reserved_buffer(&self, slot: u32) -> Option<DeviceBuffer> {
        self.reserved.lock().get(&slot).copied()
    }
}

impl Default for SlotRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BindlessRegistry for SlotRegistry {
    fn allocate_tex_slot(&self) -> u32 {
        if let Some(slot) = self.free.lock().pop() {
            return slot;
        }
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    fn deallocate(&self, slot: u32) {
        self.reserved.lock().remove(&slot);
        self.free.lock().push(slot);
    }

    fn set_reserved_buffer(&self, slot: u32, buffer: DeviceBuffer) {
        self.reserved.lock().insert(slot, buffer);
    }
}
