//! Tokio-backed tile reader
//!
//! Owns a small multi-threaded runtime; file reads run as async tasks,
//! procedural generation on the blocking pool. Completed bytes are
//! uploaded straight into the destination tile memory.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::runtime::Runtime;

use crate::gpu::stream::StreamDevice;
use crate::io::service::{IoFence, IoRequest, IoSource, TileIo};

struct InflightCounter {
    count: Mutex<usize>,
    cv: Condvar,
}

impl InflightCounter {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    fn wait_zero(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cv.wait(&mut count);
        }
    }
}

/// Concurrent tile reader with async file I/O.
pub struct TokioTileIo {
    runtime: Runtime,
    device: Arc<dyn StreamDevice>,
    inflight: Arc<InflightCounter>,
}

impl TokioTileIo {
    /// Create a reader uploading into the given device.
    pub fn new(device: Arc<dyn StreamDevice>) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            device,
            inflight: Arc::new(InflightCounter::new()),
        })
    }
}

async fn read_tile_bytes(path: &Path, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

impl TileIo for TokioTileIo {
    fn submit(&self, batch: Vec<IoRequest>) -> IoFence {
        if batch.is_empty() {
            return IoFence::signalled();
        }

        let fence = IoFence::new(batch.len());
        for request in batch {
            self.inflight.increment();

            let device = self.device.clone();
            let fence = fence.clone();
            let inflight = self.inflight.clone();

            self.runtime.spawn(async move {
                let result = match request.source {
                    IoSource::File { path, offset, len } => {
                        read_tile_bytes(&path, offset, len as usize).await
                    }
                    IoSource::Generate { generator, len } => {
                        let region = request.region;
                        tokio::task::spawn_blocking(move || {
                            generator.generate(region.level, region.tile, len as usize)
                        })
                        .await
                        .map_err(|e| std::io::Error::other(e.to_string()))
                    }
                };

                match result {
                    Ok(bytes) => {
                        device.upload_tile(request.memory, &bytes);
                        fence.complete_one(true);
                    }
                    Err(e) => {
                        log::warn!(
                            "tile read failed for slot {} level {} tile {}: {}",
                            request.region.tex_slot,
                            request.region.level,
                            request.region.tile,
                            e
                        );
                        fence.complete_one(false);
                    }
                }
                inflight.decrement();
            });
        }
        fence
    }

    fn wait_idle(&self) {
        self.inflight.wait_zero();
    }
}
