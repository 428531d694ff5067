//! Streaming engine configuration
//!
//! All byte budgets are expressed in bytes; all windows in ticks (one tick
//! per `before_rendering` call).

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Configuration for the tile residency engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Ticks an untouched tile keeps its detail level before coarsening one step
    pub lru_frame_window: u32,
    /// Shorter window applied while allocated bytes sit close to the budget
    pub lru_frame_window_memoryless: u32,
    /// Distance from the budget (bytes) at which the short window kicks in
    pub memoryless_threshold: u64,
    /// Hard byte budget for all resident tiles across all streamed textures
    pub allocate_size_limit: u64,
    /// Fixed edge length of a tile in texels
    pub tile_resolution: u32,
    /// Bytes per texel of the streamed format
    pub bytes_per_texel: u32,
    /// Upper bound on mip levels walked when building tile grids
    pub max_mip_levels: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            lru_frame_window: 24,
            lru_frame_window_memoryless: 6,
            memoryless_threshold: 64 * 1024 * 1024,
            allocate_size_limit: 512 * 1024 * 1024,
            tile_resolution: 256,
            bytes_per_texel: 4,
            max_mip_levels: 16,
        }
    }
}

impl StreamConfig {
    /// Byte size of one full-resolution tile
    pub fn tile_bytes(&self) -> u64 {
        self.tile_resolution as u64 * self.tile_resolution as u64 * self.bytes_per_texel as u64
    }

    /// Byte size of a tile's backing at the given mip level
    ///
    /// Each level quarters the texel count; never smaller than one texel.
    pub fn tile_level_bytes(&self, level: u8) -> u64 {
        (self.tile_bytes() >> (2 * level as u64)).max(self.bytes_per_texel as u64)
    }

    /// Whether the engine is within `memoryless_threshold` of the budget
    pub fn memoryless(&self, allocated: u64) -> bool {
        allocated + self.memoryless_threshold >= self.allocate_size_limit
    }

    /// LRU window in effect for the given allocated byte count
    pub fn lru_window(&self, allocated: u64) -> u32 {
        let window = if self.memoryless(allocated) {
            self.lru_frame_window_memoryless
        } else {
            self.lru_frame_window
        };
        window.max(1)
    }

    /// Load a configuration from a JSON file
    pub fn load(path: &Path) -> io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    /// Save the configuration as pretty-printed JSON
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_bytes() {
        let config = StreamConfig::default();
        assert_eq!(config.tile_bytes(), 256 * 256 * 4);
    }

    #[test]
    fn test_tile_level_bytes_quarters_per_level() {
        let config = StreamConfig::default();
        assert_eq!(config.tile_level_bytes(0), 256 * 256 * 4);
        assert_eq!(config.tile_level_bytes(1), 128 * 128 * 4);
        assert_eq!(config.tile_level_bytes(2), 64 * 64 * 4);
    }

    #[test]
    fn test_tile_level_bytes_floor() {
        let config = StreamConfig {
            tile_resolution: 4,
            ..Default::default()
        };
        // 4x4x4 = 64 bytes at level 0; deep levels clamp to one texel
        assert_eq!(config.tile_level_bytes(0), 64);
        assert_eq!(config.tile_level_bytes(8), 4);
    }

    #[test]
    fn test_memoryless_window_selection() {
        let config = StreamConfig {
            lru_frame_window: 24,
            lru_frame_window_memoryless: 6,
            memoryless_threshold: 100,
            allocate_size_limit: 1000,
            ..Default::default()
        };

        assert_eq!(config.lru_window(0), 24);
        assert_eq!(config.lru_window(899), 24);
        assert_eq!(config.lru_window(900), 6);
        assert_eq!(config.lru_window(1000), 6);
    }

    #[test]
    fn test_lru_window_never_zero() {
        let config = StreamConfig {
            lru_frame_window: 0,
            lru_frame_window_memoryless: 0,
            ..Default::default()
        };
        assert_eq!(config.lru_window(0), 1);
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stream.json");

        let config = StreamConfig {
            allocate_size_limit: 42 * 1024,
            ..Default::default()
        };
        config.save(&path).expect("save failed");

        let loaded = StreamConfig::load(&path).expect("load failed");
        assert_eq!(loaded.allocate_size_limit, 42 * 1024);
        assert_eq!(loaded.tile_resolution, config.tile_resolution);
    }
}
