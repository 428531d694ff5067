//! RAII device memory for one resident tile
//!
//! Creation and destruction are the only places the engine's global
//! allocated-byte counter moves, so the budget check always agrees with
//! actually-live allocations. Move-only; moving never touches the counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::error::Error;
use crate::gpu::stream::{StreamDevice, TileMemory};

/// Device memory backing one resident tile.
pub struct SparseHeap {
    device: Arc<dyn StreamDevice>,
    memory: TileMemory,
    size: u64,
    allocated: Arc<AtomicU64>,
}

impl SparseHeap {
    /// Allocate `size` bytes of tile memory and count them against the
    /// engine's global allocated-byte counter.
    pub fn new(
        device: Arc<dyn StreamDevice>,
        allocated: Arc<AtomicU64>,
        size: u64,
    ) -> Result<Self, Error> {
        let memory = device.allocate_tile_memory(size)?;
        allocated.fetch_add(size, Ordering::SeqCst);
        Ok(Self {
            device,
            memory,
            size,
            allocated,
        })
    }

    /// The backing allocation handle.
    pub fn memory(&self) -> TileMemory {
        self.memory
    }

    /// Allocation size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for SparseHeap {
    fn drop(&mut self) {
        self.allocated.fetch_sub(self.size, Ordering::SeqCst);
        self.device.release_tile_memory(self.memory);
    }
}

impl std::fmt::Debug for SparseHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseHeap")
            .field("memory", &self.memory)
            .field("size", &self.size)
            .finish()
    }
}
