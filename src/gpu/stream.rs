//! Stream device contract: buffers, tile memory and sparse mapping
//!
//! Mirrors what the engine needs from the renderer's command/stream layer:
//! plain buffer create/write/copy/readback for the feedback table, tile
//! memory allocation for resident tiles, and sparse (un)map submission on
//! an asynchronous compute queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::core::error::Error;
use crate::gpu::timeline::{HostTimeline, Timeline};

/// Opaque handle to a device buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceBuffer(pub u64);

/// Opaque handle to one tile-sized device memory allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileMemory(pub u64);

/// Identifies one tile of one mip level of a streamed texture.
///
/// `tile` is the tile's index in the texture's finest-level grid; the
/// footprint it addresses is the same across levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileRegion {
    /// Bindless slot of the texture
    pub tex_slot: u32,
    /// Mip level being (un)mapped
    pub level: u8,
    /// Tile index in the finest-level grid
    pub tile: u32,
}

/// A sparse mapping command submitted to the async compute queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileCommand {
    Map { region: TileRegion, memory: TileMemory },
    Unmap { region: TileRegion },
}

/// GPU command/stream abstraction the engine drives.
pub trait StreamDevice: Send + Sync {
    /// Create a device buffer of `len` bytes.
    fn create_buffer(&self, len: u64, label: &str) -> DeviceBuffer;

    /// Destroy a buffer previously created with [`StreamDevice::create_buffer`].
    fn destroy_buffer(&self, buffer: DeviceBuffer);

    /// Write host bytes into a buffer.
    fn write_buffer(&self, buffer: DeviceBuffer, offset: u64, data: &[u8]);

    /// Copy between buffers (used when the feedback table grows).
    fn copy_buffer(&self, src: DeviceBuffer, src_offset: u64, dst: DeviceBuffer, dst_offset: u64, len: u64);

    /// Read buffer bytes back into host memory.
    fn read_buffer(&self, buffer: DeviceBuffer, offset: u64, out: &mut [u8]);

    /// Allocate device memory backing one resident tile.
    fn allocate_tile_memory(&self, len: u64) -> Result<TileMemory, Error>;

    /// Release tile memory.
    fn release_tile_memory(&self, memory: TileMemory);

    /// Upload raw tile bytes into tile memory (disk I/O completion path).
    fn upload_tile(&self, memory: TileMemory, data: &[u8]);

    /// Submit sparse (un)mapping commands on the asynchronous compute queue.
    ///
    /// Failure here indicates an unrecoverable device fault.
    fn submit_mapping(&self, commands: &[TileCommand]) -> Result<(), Error>;

    /// Block until all submitted async-queue work has completed.
    fn synchronize(&self);

    /// The main render stream's timeline fence.
    fn main_timeline(&self) -> Arc<dyn Timeline>;
}

/// Host-memory device used for tests, benches and headless runs.
///
/// Buffers and tile memory are plain byte vectors; sparse mapping is
/// tracked in a table so tests can assert which tiles are mapped.
pub struct NullDevice {
    buffers: Mutex<HashMap<u64, Vec<u8>>>,
    tile_memory: Mutex<HashMap<u64, Vec<u8>>>,
    mapped: Mutex<HashMap<TileRegion, TileMemory>>,
    next_id: AtomicU64,
    submissions: AtomicUsize,
    timeline: Arc<HostTimeline>,
}

impl NullDevice {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            tile_memory: Mutex::new(HashMap::new()),
            mapped: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            submissions: AtomicUsize::new(0),
            timeline: Arc::new(HostTimeline::new()),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether a region currently has memory mapped.
    pub fn is_mapped(&self, region: TileRegion) -> bool {
        self.mapped.lock().contains_key(&region)
    }

    /// Number of regions currently mapped.
    pub fn mapped_count(&self) -> usize {
        self.mapped.lock().len()
    }

    /// Number of live tile memory allocations.
    pub fn live_tile_allocations(&self) -> usize {
        self.tile_memory.lock().len()
    }

    /// Number of mapping submissions observed.
    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::Relaxed)
    }

    /// Snapshot of the bytes held by a tile memory allocation.
    pub fn tile_memory_contents(&self, memory: TileMemory) -> Option<Vec<u8>> {
        self.tile_memory.lock().get(&memory.0).cloned()
    }
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDevice for NullDevice {
    fn create_buffer(&self, len: u64, label: &str) -> DeviceBuffer {
        let id = self.next_id();
        self.buffers.lock().insert(id, vec![0u8; len as usize]);
        log::trace!("created buffer '{}' ({} bytes)", label, len);
        DeviceBuffer(id)
    }

    fn destroy_buffer(&self, buffer: DeviceBuffer) {
        self.buffers.lock().remove(&buffer.0);
    }

    fn write_buffer(&self, buffer: DeviceBuffer, offset: u64, data: &[u8]) {
        let mut buffers = self.buffers.lock();
        if let Some(bytes) = buffers.get_mut(&buffer.0) {
            let start = offset as usize;
            let end = start + data.len();
            if end <= bytes.len() {
                bytes[start..end].copy_from_slice(data);
            }
        }
    }

    fn copy_buffer(&self, src: DeviceBuffer, src_offset: u64, dst: DeviceBuffer, dst_offset: u64, len: u64) {
        let mut buffers = self.buffers.lock();
        let Some(source) = buffers.get(&src.0) else { return };
        let start = src_offset as usize;
        let end = start + len as usize;
        if end > source.len() {
            return;
        }
        let chunk = source[start..end].to_vec();
        if let Some(target) = buffers.get_mut(&dst.0) {
            let start = dst_offset as usize;
            let end = start + chunk.len();
            if end <= target.len() {
                target[start..end].copy_from_slice(&chunk);
            }
        }
    }

    fn read_buffer(&self, buffer: DeviceBuffer, offset: u64, out: &mut [u8]) {
        let buffers = self.buffers.lock();
        if let Some(bytes) = buffers.get(&buffer.0) {
            let start = offset as usize;
            let end = start + out.len();
            if end <= bytes.len() {
                out.copy_from_slice(&bytes[start..end]);
            }
        }
    }

    fn allocate_tile_memory(&self, len: u64) -> Result<TileMemory, Error> {
        let id = self.next_id();
        self.tile_memory.lock().insert(id, vec![0u8; len as usize]);
        Ok(TileMemory(id))
    }

    fn release_tile_memory(&self, memory: TileMemory) {
        self.tile_memory.lock().remove(&memory.0);
    }

    fn upload_tile(&self, memory: TileMemory, data: &[u8]) {
        let mut allocations = self.tile_memory.lock();
        if let Some(bytes) = allocations.get_mut(&memory.0) {
            let len = data.len().min(bytes.len());
            bytes[..len].copy_from_slice(&data[..len]);
        }
    }

    fn submit_mapping(&self, commands: &[TileCommand]) -> Result<(), Error> {
        let mut mapped = self.mapped.lock();
        for command in commands {
            match *command {
                TileCommand::Map { region, memory } => {
                    mapped.insert(region, memory);
                }
                TileCommand::Unmap { region } => {
                    mapped.remove(&region);
                }
            }
        }
        self.submissions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn synchronize(&self) {
        // Host device: submissions complete synchronously
    }

    fn main_timeline(&self) -> Arc<dyn Timeline> {
        self.timeline.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_write_read() {
        let device = NullDevice::new();
        let buffer = device.create_buffer(16, "test");

        device.write_buffer(buffer, 4, &[1, 2, 3, 4]);

        let mut out = [0u8; 4];
        device.read_buffer(buffer, 4, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_copy_buffer() {
        let device = NullDevice::new();
        let src = device.create_buffer(8, "src");
        let dst = device.create_buffer(8, "dst");

        device.write_buffer(src, 0, &[9, 9, 9, 9, 0, 0, 0, 0]);
        device.copy_buffer(src, 0, dst, 4, 4);

        let mut out = [0u8; 4];
        device.read_buffer(dst, 4, &mut out);
        assert_eq!(out, [9, 9, 9, 9]);
    }

    #[test]
    fn test_map_unmap_tracking() {
        let device = NullDevice::new();
        let memory = device.allocate_tile_memory(64).unwrap();
        let region = TileRegion { tex_slot: 0, level: 1, tile: 3 };

        device.submit_mapping(&[TileCommand::Map { region, memory }]).unwrap();
        assert!(device.is_mapped(region));
        assert_eq!(device.mapped_count(), 1);

        device.submit_mapping(&[TileCommand::Unmap { region }]).unwrap();
        assert!(!device.is_mapped(region));
        assert_eq!(device.submission_count(), 2);
    }

    #[test]
    fn test_tile_memory_upload() {
        let device = NullDevice::new();
        let memory = device.allocate_tile_memory(4).unwrap();

        device.upload_tile(memory, &[7, 8, 9, 10]);
        assert_eq!(device.tile_memory_contents(memory), Some(vec![7, 8, 9, 10]));

        device.release_tile_memory(memory);
        assert_eq!(device.live_tile_allocations(), 0);
    }
}
