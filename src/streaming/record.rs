//! Per-texture residency records and backing descriptors

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::gpu::stream::DeviceBuffer;
use crate::io::service::TileGenerator;
use crate::streaming::feedback::FeedbackNode;
use crate::streaming::heap::SparseHeap;
use crate::streaming::tile_state::TileState;

/// Tile grid of one mip level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelGrid {
    /// Mip dimensions in texels
    pub width: u32,
    pub height: u32,
    /// Tile counts (rounded up)
    pub tiles_x: u32,
    pub tiles_y: u32,
    /// Cumulative tile count of all finer levels (file layout base)
    pub tile_offset: u32,
}

impl LevelGrid {
    pub fn tile_count(&self) -> u32 {
        self.tiles_x * self.tiles_y
    }
}

/// Build per-level tile grids for a texture.
///
/// Walks the mip chain until a level fits in a single tile; errors when the
/// chain runs out first, since such a texture can never be fully degraded.
pub fn build_level_grids(
    width: u32,
    height: u32,
    mip_levels: u32,
    tile_resolution: u32,
) -> Result<Vec<LevelGrid>, Error> {
    if width == 0 || height == 0 {
        return Err(Error::Config("texture dimensions must be non-zero".into()));
    }

    let mut grids = Vec::new();
    let mut tile_offset = 0u32;
    for level in 0..mip_levels {
        let w = (width >> level).max(1);
        let h = (height >> level).max(1);
        let tiles_x = w.div_ceil(tile_resolution);
        let tiles_y = h.div_ceil(tile_resolution);

        let grid = LevelGrid { width: w, height: h, tiles_x, tiles_y, tile_offset };
        tile_offset += grid.tile_count();
        grids.push(grid);

        if tiles_x == 1 && tiles_y == 1 {
            return Ok(grids);
        }
    }

    Err(Error::Config(format!(
        "coarsest mip of {}x{} texture does not fit within one {}px tile after {} levels",
        width, height, tile_resolution, mip_levels
    )))
}

/// Where a texture's tile bytes come from.
#[derive(Clone)]
pub enum TileBacking {
    /// Paged tile file: per-level tile grids stored back to back
    File { path: Arc<PathBuf>, data_offset: u64 },
    /// Runtime callback fills tile data on demand
    Procedural { generator: Arc<dyn TileGenerator> },
}

impl fmt::Debug for TileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileBacking::File { path, data_offset } => f
                .debug_struct("File")
                .field("path", path)
                .field("data_offset", data_offset)
                .finish(),
            TileBacking::Procedural { .. } => f.debug_struct("Procedural").finish(),
        }
    }
}

/// Registration descriptor for one streamed texture.
#[derive(Clone, Debug)]
pub struct TextureStreamDesc {
    pub name: String,
    /// Level-0 dimensions in texels
    pub width: u32,
    pub height: u32,
    /// Mip levels available in the backing store
    pub mip_levels: u32,
    pub backing: TileBacking,
}

/// Sidecar metadata describing a paged tile file on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PagedTextureMeta {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    /// Tile file, relative to the metadata file
    pub data_file: PathBuf,
    /// Byte offset of the first tile inside the data file
    pub data_offset: u64,
}

impl PagedTextureMeta {
    /// Load sidecar metadata from a JSON file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    /// Save sidecar metadata as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, json)
    }

    /// Resolve into a registration descriptor with file backing.
    pub fn into_desc(self, meta_path: &Path) -> TextureStreamDesc {
        let base = meta_path.parent().unwrap_or_else(|| Path::new(""));
        TextureStreamDesc {
            name: self.name,
            width: self.width,
            height: self.height,
            mip_levels: self.mip_levels,
            backing: TileBacking::File {
                path: Arc::new(base.join(self.data_file)),
                data_offset: self.data_offset,
            },
        }
    }
}

/// Mutable per-texture state, guarded by one lock.
#[derive(Debug)]
pub struct RecordState {
    /// One entry per finest-level tile
    pub tiles: Vec<TileState>,
    /// Heap slot per tile; `Some` iff the tile is resident
    pub heaps: Vec<Option<SparseHeap>>,
    /// Tiles queued for the next unload sweep
    pub pending_unload: Vec<u32>,
    /// Countdown value active when this record was (re)loaded
    pub loaded_countdown: u16,
}

/// One streamed texture's residency record.
#[derive(Debug)]
pub struct TextureRecord {
    pub name: String,
    pub grids: Vec<LevelGrid>,
    /// Finest-level tile count (= feedback node length)
    pub tile_count: u32,
    pub backing: TileBacking,
    pub node: FeedbackNode,
    pub bindless_slot: u32,
    /// Per-tile resident-level table published to shaders
    pub level_table: DeviceBuffer,
    /// Position in the manager's live list (O(1) swap-remove)
    pub vector_idx: AtomicUsize,
    pub state: Mutex<RecordState>,
}

impl TextureRecord {
    pub fn new(
        desc: &TextureStreamDesc,
        grids: Vec<LevelGrid>,
        node: FeedbackNode,
        bindless_slot: u32,
        level_table: DeviceBuffer,
        loaded_countdown: u16,
    ) -> Self {
        let tile_count = grids[0].tile_count();
        Self {
            name: desc.name.clone(),
            grids,
            tile_count,
            backing: desc.backing.clone(),
            node,
            bindless_slot,
            level_table,
            vector_idx: AtomicUsize::new(0),
            state: Mutex::new(RecordState {
                tiles: vec![TileState::default(); tile_count as usize],
                heaps: (0..tile_count).map(|_| None).collect(),
                pending_unload: Vec::new(),
                loaded_countdown,
            }),
        }
    }

    /// Coarsest representable level for any tile of this texture.
    pub fn coarsest_level(&self) -> u8 {
        (self.grids.len() - 1) as u8
    }

    /// Byte offset of a footprint tile's backing at `level` inside the
    /// paged tile file. File tiles are laid out level-major; every file
    /// tile occupies one full-resolution slot of `file_tile_bytes`.
    pub fn file_offset(&self, level: u8, tile: u32, file_tile_bytes: u64) -> u64 {
        let TileBacking::File { data_offset, .. } = &self.backing else {
            return 0;
        };
        let fine = &self.grids[0];
        let grid = &self.grids[level as usize];
        let tx = (tile % fine.tiles_x) >> level;
        let ty = (tile / fine.tiles_x) >> level;
        let tx = tx.min(grid.tiles_x - 1);
        let ty = ty.min(grid.tiles_y - 1);
        let covering = grid.tile_offset + ty * grid.tiles_x + tx;
        data_offset + covering as u64 * file_tile_bytes
    }
}

/// User-facing handle to a streamed texture.
///
/// Non-owning: an unloaded record's lifetime is governed by the dispose
/// queue, never by outstanding handles.
#[derive(Clone)]
pub struct TextureHandle {
    pub(crate) record: Weak<TextureRecord>,
    slot: u32,
}

impl TextureHandle {
    pub(crate) fn new(record: &Arc<TextureRecord>) -> Self {
        Self {
            record: Arc::downgrade(record),
            slot: record.bindless_slot,
        }
    }

    /// The texture's shader-visible slot.
    pub fn bindless_slot(&self) -> u32 {
        self.slot
    }

    /// Whether the texture is still registered.
    pub fn is_live(&self) -> bool {
        self.record.strong_count() > 0
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<TextureRecord>> {
        self.record.upgrade()
    }
}

impl fmt::Debug for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextureHandle")
            .field("slot", &self.slot)
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_grid_build_basic() {
        // 512x512 with 256px tiles: 2x2 at level 0, 1x1 at level 1
        let grids = build_level_grids(512, 512, 8, 256).unwrap();
        assert_eq!(grids.len(), 2);
        assert_eq!(grids[0].tile_count(), 4);
        assert_eq!(grids[1].tile_count(), 1);
        assert_eq!(grids[1].tile_offset, 4);
    }

    #[test]
    fn test_grid_rounds_up() {
        // 300x200 with 256px tiles: 2x1 tiles at level 0
        let grids = build_level_grids(300, 200, 8, 256).unwrap();
        assert_eq!(grids[0].tiles_x, 2);
        assert_eq!(grids[0].tiles_y, 1);
        // 150x100 fits in one tile at level 1
        assert_eq!(grids[1].tile_count(), 1);
    }

    #[test]
    fn test_grid_chain_too_short_errors() {
        // 2048px wide but only 2 mip levels: level 1 is 1024px, 4x4 tiles
        let err = build_level_grids(2048, 2048, 2, 256);
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_grid_zero_dims_error() {
        assert!(build_level_grids(0, 64, 4, 256).is_err());
    }

    #[test]
    fn test_file_offsets_level_major() {
        let grids = build_level_grids(1024, 1024, 8, 256).unwrap();
        // 4x4, 2x2, 1x1
        assert_eq!(grids.len(), 3);

        let desc = TextureStreamDesc {
            name: "t".into(),
            width: 1024,
            height: 1024,
            mip_levels: 8,
            backing: TileBacking::File {
                path: Arc::new(PathBuf::from("t.bin")),
                data_offset: 64,
            },
        };
        let record = TextureRecord::new(
            &desc,
            grids,
            FeedbackNode { offset: 0, len: 16 },
            0,
            DeviceBuffer(1),
            100,
        );

        let tile_bytes = 1024u64;
        // Tile 0 at level 0 is file tile 0
        assert_eq!(record.file_offset(0, 0, tile_bytes), 64);
        // Tile 5 (x=1, y=1) at level 0 is file tile 5
        assert_eq!(record.file_offset(0, 5, tile_bytes), 64 + 5 * tile_bytes);
        // Tile 5 at level 1 covers grid cell (0, 0) of the 2x2 grid, base 16
        assert_eq!(record.file_offset(1, 5, tile_bytes), 64 + 16 * tile_bytes);
        // Any tile at level 2 maps to the single coarsest file tile, base 20
        assert_eq!(record.file_offset(2, 15, tile_bytes), 64 + 20 * tile_bytes);
    }

    #[test]
    fn test_meta_roundtrip_and_desc() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bricks.json");

        let meta = PagedTextureMeta {
            name: "bricks".into(),
            width: 512,
            height: 512,
            mip_levels: 4,
            data_file: PathBuf::from("bricks.tiles"),
            data_offset: 16,
        };
        meta.save(&path).expect("save");

        let loaded = PagedTextureMeta::load(&path).expect("load");
        assert_eq!(loaded.width, 512);

        let desc = loaded.into_desc(&path);
        match desc.backing {
            TileBacking::File { path: data, data_offset } => {
                assert_eq!(data.as_ref(), &dir.path().join("bricks.tiles"));
                assert_eq!(data_offset, 16);
            }
            TileBacking::Procedural { .. } => panic!("expected file backing"),
        }
    }

    #[test]
    fn test_handle_liveness() {
        let desc = TextureStreamDesc {
            name: "t".into(),
            width: 256,
            height: 256,
            mip_levels: 1,
            backing: TileBacking::File {
                path: Arc::new(PathBuf::from("t.bin")),
                data_offset: 0,
            },
        };
        let grids = build_level_grids(256, 256, 1, 256).unwrap();
        let record = Arc::new(TextureRecord::new(
            &desc,
            grids,
            FeedbackNode { offset: 0, len: 1 },
            3,
            DeviceBuffer(1),
            50,
        ));

        let handle = TextureHandle::new(&record);
        assert!(handle.is_live());
        assert_eq!(handle.bindless_slot(), 3);

        drop(record);
        assert!(!handle.is_live());
        assert!(handle.upgrade().is_none());
    }

    #[test]
    fn test_vector_idx_updates() {
        let desc = TextureStreamDesc {
            name: "t".into(),
            width: 256,
            height: 256,
            mip_levels: 1,
            backing: TileBacking::File {
                path: Arc::new(PathBuf::from("t.bin")),
                data_offset: 0,
            },
        };
        let grids = build_level_grids(256, 256, 1, 256).unwrap();
        let record = TextureRecord::new(
            &desc,
            grids,
            FeedbackNode { offset: 0, len: 1 },
            0,
            DeviceBuffer(1),
            0,
        );

        record.vector_idx.store(7, Ordering::Relaxed);
        assert_eq!(record.vector_idx.load(Ordering::Relaxed), 7);
    }
}
