//! GPU-resident level feedback table
//!
//! One packed word per tile, written by shaders during sampling and read
//! back to host memory once per tick. Each streamed texture owns a
//! sub-range (node) of one shared device buffer; this module owns the
//! sub-range allocation protocol, including growth with migration.

use std::sync::Arc;

use crate::gpu::stream::{DeviceBuffer, StreamDevice};

/// Word value for a tile no shader has touched since its range was filled.
pub const FEEDBACK_UNSEEN: u32 = u32::MAX;

/// Pack a countdown stamp and requested level into one feedback word.
///
/// Layout: stamp in the high 16 bits, requested level in the low byte.
pub fn pack_feedback(countdown: u16, level: u8) -> u32 {
    ((countdown as u32) << 16) | level as u32
}

/// Unpack a feedback word into (countdown stamp, requested level).
pub fn unpack_feedback(word: u32) -> (u16, u8) {
    ((word >> 16) as u16, (word & 0xFF) as u8)
}

/// A sub-range of the shared feedback buffer, in words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeedbackNode {
    pub offset: u32,
    pub len: u32,
}

/// Shared, growable feedback table with per-texture sub-ranges.
pub struct LevelFeedbackBuffer {
    device: Arc<dyn StreamDevice>,
    buffer: DeviceBuffer,
    capacity: u32,
    /// Live nodes, kept sorted by offset
    nodes: Vec<FeedbackNode>,
}

impl LevelFeedbackBuffer {
    /// Create the table with an initial capacity in words.
    pub fn new(device: Arc<dyn StreamDevice>, initial_words: u32) -> Self {
        let capacity = initial_words.max(1);
        let buffer = device.create_buffer(capacity as u64 * 4, "level_feedback");
        Self {
            device,
            buffer,
            capacity,
            nodes: Vec::new(),
        }
    }

    /// The backing device buffer (rebound to shaders after growth).
    pub fn buffer(&self) -> DeviceBuffer {
        self.buffer
    }

    /// Total capacity in words.
    pub fn capacity_words(&self) -> u32 {
        self.capacity
    }

    /// Words covered by live nodes.
    pub fn live_words(&self) -> u32 {
        self.nodes.iter().map(|n| n.len).sum()
    }

    /// Reserve a sentinel-filled range of `tile_count` words.
    ///
    /// Returns the node and, when the buffer had to grow, the retired old
    /// buffer. The caller must keep the retired buffer alive until all GPU
    /// commands referencing it have completed (dispose queue).
    pub fn allocate(&mut self, tile_count: u32) -> (FeedbackNode, Option<DeviceBuffer>) {
        let len = tile_count.max(1);
        let retired = if self.gap_for(len).is_none() {
            Some(self.grow(len))
        } else {
            None
        };

        let offset = self
            .gap_for(len)
            .expect("feedback buffer growth must produce a fitting gap");
        let node = FeedbackNode { offset, len };

        let insert_at = self
            .nodes
            .iter()
            .position(|n| n.offset > offset)
            .unwrap_or(self.nodes.len());
        self.nodes.insert(insert_at, node);

        self.fill_unseen(node);
        log::debug!(
            "feedback node allocated: offset {} len {} ({} live / {} words)",
            node.offset,
            node.len,
            self.live_words(),
            self.capacity
        );
        (node, retired)
    }

    /// Release a node's range for reuse.
    pub fn free(&mut self, node: FeedbackNode) {
        self.nodes.retain(|n| *n != node);
    }

    /// Overwrite one word of the table (CPU-side demand injection).
    pub fn write_word(&self, index: u32, word: u32) {
        self.device
            .write_buffer(self.buffer, index as u64 * 4, &word.to_le_bytes());
    }

    /// Copy the live ranges back into a host array indexed by word offset.
    ///
    /// Words outside any live node read as [`FEEDBACK_UNSEEN`].
    pub fn readback(&self, out: &mut Vec<u32>) {
        out.clear();
        out.resize(self.capacity as usize, FEEDBACK_UNSEEN);
        for node in &self.nodes {
            let start = node.offset as usize;
            let end = start + node.len as usize;
            let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut out[start..end]);
            self.device.read_buffer(self.buffer, node.offset as u64 * 4, bytes);
        }
    }

    /// Reset every live range to the sentinel (countdown wrap policy).
    pub fn clear_all(&self) {
        for node in &self.nodes {
            self.fill_unseen(*node);
        }
    }

    fn fill_unseen(&self, node: FeedbackNode) {
        let words = vec![FEEDBACK_UNSEEN; node.len as usize];
        self.device
            .write_buffer(self.buffer, node.offset as u64 * 4, bytemuck::cast_slice(&words));
    }

    /// First-fit gap of at least `len` words between live nodes.
    fn gap_for(&self, len: u32) -> Option<u32> {
        let mut cursor = 0u32;
        for node in &self.nodes {
            if node.offset - cursor >= len {
                return Some(cursor);
            }
            cursor = node.offset + node.len;
        }
        if self.capacity - cursor >= len {
            Some(cursor)
        } else {
            None
        }
    }

    /// Grow the buffer and migrate live ranges. Returns the retired buffer.
    fn grow(&mut self, needed: u32) -> DeviceBuffer {
        // Migration keeps node offsets, so the tail gap must fit `needed`
        // even when every live node sits at the end of the old range.
        let new_capacity = (self.capacity * 2).max(self.capacity + needed);
        let new_buffer = self
            .device
            .create_buffer(new_capacity as u64 * 4, "level_feedback");

        for node in &self.nodes {
            self.device.copy_buffer(
                self.buffer,
                node.offset as u64 * 4,
                new_buffer,
                node.offset as u64 * 4,
                node.len as u64 * 4,
            );
        }

        log::info!(
            "feedback buffer grown: {} -> {} words",
            self.capacity,
            new_capacity
        );
        let retired = self.buffer;
        self.buffer = new_buffer;
        self.capacity = new_capacity;
        retired
    }
}
