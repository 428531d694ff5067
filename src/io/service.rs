//! Tile I/O service contract
//!
//! The engine hands the service batches of tile read requests and gets an
//! opaque fence back; it polls or blocks on the fence, never on individual
//! requests. Read errors surface through the fence's error flag and are
//! not otherwise interpreted by the engine.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::gpu::stream::{TileMemory, TileRegion};

/// Produces raw texel bytes for procedurally-backed tiles.
pub trait TileGenerator: Send + Sync {
    /// Fill one tile of one mip level; must return exactly `len` bytes.
    fn generate(&self, level: u8, tile: u32, len: usize) -> Vec<u8>;
}

/// Where a tile's bytes come from.
#[derive(Clone)]
pub enum IoSource {
    /// Read `len` bytes from a backing file at `offset`
    File {
        path: Arc<PathBuf>,
        offset: u64,
        len: u32,
    },
    /// Invoke a procedural generator for the affected tile
    Generate {
        generator: Arc<dyn TileGenerator>,
        len: u32,
    },
}

impl fmt::Debug for IoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoSource::File { path, offset, len } => f
                .debug_struct("File")
                .field("path", path)
                .field("offset", offset)
                .field("len", len)
                .finish(),
            IoSource::Generate { len, .. } => {
                f.debug_struct("Generate").field("len", len).finish()
            }
        }
    }
}

/// One tile read request: source bytes into a destination tile region.
#[derive(Clone, Debug)]
pub struct IoRequest {
    /// Destination tile region (for logging and upload routing)
    pub region: TileRegion,
    /// Destination tile memory; must already be allocated
    pub memory: TileMemory,
    /// Byte source
    pub source: IoSource,
}

struct FenceState {
    remaining: Mutex<usize>,
    cv: Condvar,
    failed: AtomicBool,
}

/// Completion fence for one submitted batch.
#[derive(Clone)]
pub struct IoFence(Arc<FenceState>);

impl IoFence {
    pub(crate) fn new(count: usize) -> Self {
        Self(Arc::new(FenceState {
            remaining: Mutex::new(count),
            cv: Condvar::new(),
            failed: AtomicBool::new(false),
        }))
    }

    /// A fence that is already signalled (empty batch).
    pub fn signalled() -> Self {
        Self::new(0)
    }

    pub(crate) fn complete_one(&self, ok: bool) {
        if !ok {
            self.0.failed.store(true, Ordering::Release);
        }
        let mut remaining = self.0.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.0.cv.notify_all();
        }
    }

    /// Whether every request in the batch has completed.
    pub fn is_signalled(&self) -> bool {
        *self.0.remaining.lock() == 0
    }

    /// Block until the whole batch has completed.
    pub fn wait(&self) {
        let mut remaining = self.0.remaining.lock();
        while *remaining > 0 {
            self.0.cv.wait(&mut remaining);
        }
    }

    /// Whether any request in the batch failed (completion still signals).
    pub fn failed(&self) -> bool {
        self.0.failed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for IoFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoFence")
            .field("remaining", &*self.0.remaining.lock())
            .field("failed", &self.failed())
            .finish()
    }
}

/// Asynchronous tile I/O service.
pub trait TileIo: Send + Sync {
    /// Submit a batch of tile reads; returns the batch's completion fence.
    fn submit(&self, batch: Vec<IoRequest>) -> IoFence;

    /// Poll a fence.
    fn is_signalled(&self, fence: &IoFence) -> bool {
        fence.is_signalled()
    }

    /// Block on a fence.
    fn wait(&self, fence: &IoFence) {
        fence.wait();
    }

    /// Block until every submitted request has completed.
    fn wait_idle(&self);
}
