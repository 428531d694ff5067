//! Residency policy: turns feedback readback into load/unload decisions
//!
//! Each texture is processed independently (safe to parallelize across
//! textures); tiles of one texture share the record lock for LRU and
//! unload-list mutation. The global byte budget is guarded by the live
//! allocated-byte counter plus a per-tick would-allocate tally.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::config::StreamConfig;
use crate::gpu::stream::{StreamDevice, TileMemory};
use crate::io::service::TileGenerator;
use crate::streaming::countdown::Countdown;
use crate::streaming::feedback::{FEEDBACK_UNSEEN, unpack_feedback};
use crate::streaming::heap::SparseHeap;
use crate::streaming::record::{TextureRecord, TileBacking};
use crate::streaming::tile_state::LEVEL_UNLOADED;

/// How a scheduled load obtains its bytes.
#[derive(Clone)]
pub enum LoadKind {
    /// Read tile bytes from the paged file at a computed offset
    FileRead { path: Arc<std::path::PathBuf>, offset: u64 },
    /// Invoke the texture's procedural callback
    Procedural { generator: Arc<dyn TileGenerator> },
}

impl std::fmt::Debug for LoadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadKind::FileRead { path, offset } => f
                .debug_struct("FileRead")
                .field("path", path)
                .field("offset", offset)
                .finish(),
            LoadKind::Procedural { .. } => f.debug_struct("Procedural").finish(),
        }
    }
}

/// A scheduled tile load.
#[derive(Debug)]
pub struct TileLoad {
    /// Finest-grid tile index
    pub tile: u32,
    /// Level being loaded
    pub level: u8,
    /// Level previously resident ([`LEVEL_UNLOADED`] if none)
    pub previous: u8,
    /// Destination memory of the freshly allocated heap
    pub memory: TileMemory,
    pub kind: LoadKind,
}

/// A tile unmapped by the unload sweep.
#[derive(Clone, Copy, Debug)]
pub struct TileUnmap {
    pub tile: u32,
    /// Level that was resident
    pub level: u8,
}

/// A per-tile level-table update for shaders.
#[derive(Clone, Copy, Debug)]
pub struct LevelWrite {
    pub tile: u32,
    pub level: u8,
}

/// Everything one texture contributed to a tick's decision set.
#[derive(Debug)]
pub struct TextureDecisions {
    pub record: Arc<TextureRecord>,
    pub loads: Vec<TileLoad>,
    pub unmaps: Vec<TileUnmap>,
    pub level_writes: Vec<LevelWrite>,
    /// Heaps displaced by re-level loads and unmaps; freed after commit
    pub superseded: Vec<SparseHeap>,
}

impl TextureDecisions {
    fn new(record: Arc<TextureRecord>) -> Self {
        Self {
            record,
            loads: Vec::new(),
            unmaps: Vec::new(),
            level_writes: Vec::new(),
            superseded: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.loads.is_empty() && self.unmaps.is_empty() && self.level_writes.is_empty()
    }
}

/// Reserve `bytes` against the budget; undone if the total would overflow.
fn try_reserve(tally: &AtomicU64, allocated: &AtomicU64, bytes: u64, limit: u64) -> bool {
    let prev = tally.fetch_add(bytes, Ordering::SeqCst);
    let total = allocated.load(Ordering::SeqCst) + prev + bytes;
    if total > limit {
        tally.fetch_sub(bytes, Ordering::SeqCst);
        false
    } else {
        true
    }
}

/// Budget-aware residency decisions from feedback readback.
pub struct ResidencyPolicy {
    config: StreamConfig,
}

impl ResidencyPolicy {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Process one texture's feedback words for the current tick.
    ///
    /// `words` is the full host readback array indexed by feedback-node
    /// offset; `now` is the countdown value of the tick being decided;
    /// `tally` accumulates would-be allocated bytes across all textures of
    /// this pass. Returns None when the texture contributes nothing.
    pub fn process_texture(
        &self,
        device: &Arc<dyn StreamDevice>,
        allocated: &Arc<AtomicU64>,
        tally: &AtomicU64,
        record: &Arc<TextureRecord>,
        words: &[u32],
        now: u16,
    ) -> Option<TextureDecisions> {
        let limit = self.config.allocate_size_limit;
        let window = self.config.lru_window(allocated.load(Ordering::SeqCst));
        let coarsest = record.coarsest_level();

        let mut decisions = TextureDecisions::new(record.clone());
        let mut state = record.state.lock();
        let loaded_countdown = state.loaded_countdown;

        // Sweep tiles queued for unload on previous ticks first.
        let pending = std::mem::take(&mut state.pending_unload);
        for tile in pending {
            let entry = state.tiles[tile as usize];
            if !entry.is_resident() {
                // Already unloaded; dropping the candidate is a no-op
                continue;
            }
            if entry.can_unmap() {
                let level = entry.resident_level;
                if let Some(heap) = state.heaps[tile as usize].take() {
                    decisions.superseded.push(heap);
                }
                state.tiles[tile as usize].resident_level = LEVEL_UNLOADED;
                decisions.unmaps.push(TileUnmap { tile, level });
                decisions.level_writes.push(LevelWrite { tile, level: LEVEL_UNLOADED });
            } else {
                // Load or frame reference still in flight; retry next tick
                state.pending_unload.push(tile);
            }
        }

        for tile in 0..record.tile_count {
            let word = words
                .get((record.node.offset + tile) as usize)
                .copied()
                .unwrap_or(FEEDBACK_UNSEEN);
            if word == FEEDBACK_UNSEEN {
                continue;
            }

            let (stamp, requested) = unpack_feedback(word);
            if Countdown::is_stale(stamp, loaded_countdown) {
                continue;
            }
            let Some(elapsed) = Countdown::elapsed_since(now, stamp) else {
                continue;
            };

            state.tiles[tile as usize].lru_age =
                window.saturating_sub(elapsed).min(u8::MAX as u32) as u8;
            let current = state.tiles[tile as usize].resident_level;

            let requested = requested.min(coarsest);
            let desired_raw = requested as u32 + elapsed / window;

            if desired_raw > coarsest as u32 {
                // Aged past the coarsest representable level
                if current != LEVEL_UNLOADED && !state.pending_unload.contains(&tile) {
                    state.pending_unload.push(tile);
                }
                continue;
            }
            let desired = desired_raw as u8;
            if desired == current {
                continue;
            }

            // Probe from the desired level toward coarser until one fits.
            let mut chosen = None;
            let mut probe = desired;
            loop {
                if probe == current {
                    // Reached the level already resident; keep it
                    break;
                }
                let bytes = self.config.tile_level_bytes(probe);
                if try_reserve(tally, allocated, bytes, limit) {
                    match SparseHeap::new(device.clone(), allocated.clone(), bytes) {
                        Ok(heap) => {
                            // Reservation is now carried by the live counter
                            tally.fetch_sub(bytes, Ordering::SeqCst);
                            chosen = Some((probe, heap));
                        }
                        Err(e) => {
                            tally.fetch_sub(bytes, Ordering::SeqCst);
                            log::warn!("tile memory allocation failed: {}", e);
                        }
                    }
                    break;
                }
                if probe == coarsest {
                    break;
                }
                probe += 1;
            }

            let Some((level, heap)) = chosen else {
                if desired > current && current != LEVEL_UNLOADED {
                    // Coarsening under budget pressure with nothing
                    // affordable left: give the tile up entirely
                    if !state.pending_unload.contains(&tile) {
                        state.pending_unload.push(tile);
                    }
                }
                continue;
            };

            let memory = heap.memory();
            let previous = current;
            {
                let entry = &mut state.tiles[tile as usize];
                entry.resident_level = level;
                entry.processing_count += 1;
                entry.ref_count += 1;
            }

            if let Some(old) = state.heaps[tile as usize].replace(heap) {
                decisions.superseded.push(old);
            }

            let kind = match &record.backing {
                TileBacking::File { path, .. } => LoadKind::FileRead {
                    path: path.clone(),
                    offset: record.file_offset(level, tile, self.config.tile_bytes()),
                },
                TileBacking::Procedural { generator } => LoadKind::Procedural {
                    generator: generator.clone(),
                },
            };

            decisions.loads.push(TileLoad { tile, level, previous, memory, kind });
            decisions.level_writes.push(LevelWrite { tile, level });
        }

        drop(state);

        if decisions.is_empty() {
            None
        } else {
            log::trace!(
                "texture '{}': {} loads, {} unmaps",
                record.name,
                decisions.loads.len(),
                decisions.unmaps.len()
            );
            Some(decisions)
        }
    }
}
