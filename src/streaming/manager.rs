//! Stream manager: the engine façade
//!
//! Owns texture lifecycle, the one-per-frame driver entry point and
//! shutdown. Per tick it translates the previous decision set into a
//! fence-gated commit job, stages a feedback readback, and schedules the
//! next asynchronous decision pass off the render thread. A manual-reset
//! "tick done" event keeps the pipeline single-flight: at most one
//! decision pass runs at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;

use crate::core::config::StreamConfig;
use crate::core::error::Error;
use crate::gpu::bindless::BindlessRegistry;
use crate::gpu::stream::{StreamDevice, TileCommand, TileRegion};
use crate::gpu::timeline::Timeline;
use crate::io::service::{IoRequest, IoSource, TileIo};
use crate::streaming::commit::{CommitJob, CommitThread, InFlightLoad};
use crate::streaming::countdown::{COUNTDOWN_START, Countdown};
use crate::streaming::dispose::{DisposeGate, DisposePayload, DisposeQueue};
use crate::streaming::feedback::{LevelFeedbackBuffer, pack_feedback};
use crate::streaming::pipeline::{FrameOutcome, FrameResourcePipeline, ReadbackFrame};
use crate::streaming::policy::{LoadKind, ResidencyPolicy, TextureDecisions};
use crate::streaming::record::{
    TextureHandle, TextureRecord, TextureStreamDesc, build_level_grids,
};
use crate::streaming::tile_state::LEVEL_UNLOADED;

/// Initial feedback table capacity in words.
const INITIAL_FEEDBACK_WORDS: u32 = 1024;

/// Manual-reset event gating re-entry into the decision pass.
struct TickEvent {
    state: Mutex<bool>,
    cv: Condvar,
}

impl TickEvent {
    fn new_set() -> Self {
        Self {
            state: Mutex::new(true),
            cv: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.state.lock() = true;
        self.cv.notify_all();
    }

    fn clear(&self) {
        *self.state.lock() = false;
    }

    fn is_set(&self) -> bool {
        *self.state.lock()
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        while !*state {
            self.cv.wait(&mut state);
        }
    }
}

/// Façade coordinating feedback, residency decisions, commits and disposal.
pub struct StreamManager {
    config: StreamConfig,
    policy: Arc<ResidencyPolicy>,
    device: Arc<dyn StreamDevice>,
    io: Arc<dyn TileIo>,
    registry: Arc<dyn BindlessRegistry>,
    timeline: Arc<dyn Timeline>,
    /// Global allocated-byte counter; moved only by SparseHeap RAII
    allocated: Arc<AtomicU64>,
    /// Flat live-texture list; records know their index for O(1) removal
    textures: Arc<Mutex<Vec<Arc<TextureRecord>>>>,
    feedback: Arc<Mutex<LevelFeedbackBuffer>>,
    pipeline: Arc<FrameResourcePipeline>,
    dispose: DisposeQueue,
    inflight: Arc<Mutex<Vec<InFlightLoad>>>,
    fatal: Arc<Mutex<Option<String>>>,
    commit: CommitThread,
    countdown: Mutex<Countdown>,
    fence_value: AtomicU64,
    tick_done: Arc<TickEvent>,
    decision_passes: Arc<AtomicU64>,
}

impl StreamManager {
    pub fn new(
        config: StreamConfig,
        device: Arc<dyn StreamDevice>,
        io: Arc<dyn TileIo>,
        registry: Arc<dyn BindlessRegistry>,
    ) -> Self {
        let timeline = device.main_timeline();
        let inflight = Arc::new(Mutex::new(Vec::new()));
        let fatal = Arc::new(Mutex::new(None));
        let commit = CommitThread::spawn(
            device.clone(),
            io.clone(),
            timeline.clone(),
            inflight.clone(),
            fatal.clone(),
        );

        Self {
            policy: Arc::new(ResidencyPolicy::new(config.clone())),
            feedback: Arc::new(Mutex::new(LevelFeedbackBuffer::new(
                device.clone(),
                INITIAL_FEEDBACK_WORDS,
            ))),
            dispose: DisposeQueue::new(device.clone(), timeline.clone()),
            allocated: Arc::new(AtomicU64::new(0)),
            textures: Arc::new(Mutex::new(Vec::new())),
            pipeline: Arc::new(FrameResourcePipeline::new()),
            countdown: Mutex::new(Countdown::new()),
            fence_value: AtomicU64::new(0),
            tick_done: Arc::new(TickEvent::new_set()),
            decision_passes: Arc::new(AtomicU64::new(0)),
            config,
            device,
            io,
            registry,
            timeline,
            inflight,
            fatal,
            commit,
        }
    }

    /// Register a texture for streaming.
    ///
    /// Hard error when the descriptor's mip chain never reaches a single
    /// tile: that is a content/configuration fault, not a runtime
    /// condition to recover from.
    pub fn load(&self, desc: TextureStreamDesc) -> Result<TextureHandle, Error> {
        let mip_levels = desc.mip_levels.min(self.config.max_mip_levels);
        let grids =
            build_level_grids(desc.width, desc.height, mip_levels, self.config.tile_resolution)?;
        let tile_count = grids[0].tile_count();

        let (node, retired) = self.feedback.lock().allocate(tile_count);
        if let Some(old) = retired {
            // Commands of the current frame may still reference the old
            // table; they are covered by the next fence signal
            self.dispose.push(
                DisposeGate::Fence(self.fence_value.load(Ordering::SeqCst) + 1),
                DisposePayload::Buffer(old),
            );
        }

        let slot = self.registry.allocate_tex_slot();
        let level_table = self.device.create_buffer(tile_count as u64, "tile_level_table");
        self.device
            .write_buffer(level_table, 0, &vec![LEVEL_UNLOADED; tile_count as usize]);
        self.registry.set_reserved_buffer(slot, level_table);

        let loaded_countdown = self.countdown.lock().value();
        let record = Arc::new(TextureRecord::new(
            &desc,
            grids,
            node,
            slot,
            level_table,
            loaded_countdown,
        ));

        {
            let mut textures = self.textures.lock();
            record.vector_idx.store(textures.len(), Ordering::SeqCst);
            textures.push(record.clone());
        }

        log::info!(
            "registered streamed texture '{}' ({}x{}, {} tiles, slot {})",
            record.name,
            desc.width,
            desc.height,
            tile_count,
            slot
        );
        Ok(TextureHandle::new(&record))
    }

    /// Unregister a texture. Unloading an already-unloaded texture is a
    /// no-op. The bindless slot and feedback node return immediately; the
    /// record and its heaps go to the dispose queue.
    pub fn unload(&self, handle: &TextureHandle) -> Result<(), Error> {
        let Some(record) = handle.upgrade() else {
            return Ok(());
        };

        {
            let mut textures = self.textures.lock();
            let idx = record.vector_idx.load(Ordering::SeqCst);
            if idx >= textures.len() || !Arc::ptr_eq(&textures[idx], &record) {
                return Ok(());
            }
            textures.swap_remove(idx);
            if idx < textures.len() {
                textures[idx].vector_idx.store(idx, Ordering::SeqCst);
            }
        }

        self.registry.deallocate(record.bindless_slot);
        self.feedback.lock().free(record.node);

        log::info!("unloaded streamed texture '{}'", record.name);
        // The current frame's commands are covered by the next fence signal
        self.dispose.push(
            DisposeGate::Fence(self.fence_value.load(Ordering::SeqCst) + 1),
            DisposePayload::Record(record),
        );
        Ok(())
    }

    /// CPU-side demand injection: stamp a feedback word as if a shader had
    /// sampled `tile` at `level` this tick.
    pub fn touch_tile(&self, handle: &TextureHandle, tile: u32, level: u8) -> Result<(), Error> {
        let record = handle
            .upgrade()
            .ok_or_else(|| Error::Streaming("texture is not registered".into()))?;
        if tile >= record.tile_count {
            return Err(Error::Streaming(format!(
                "tile {} out of range for '{}' ({} tiles)",
                tile, record.name, record.tile_count
            )));
        }
        let stamp = self.countdown.lock().value();
        self.feedback
            .lock()
            .write_word(record.node.offset + tile, pack_feedback(stamp, level));
        Ok(())
    }

    /// One-per-frame driver call.
    ///
    /// Returns Ok(false) without doing tick work while the previous
    /// asynchronous decision pass has not signalled completion.
    pub fn before_rendering(&self) -> Result<bool, Error> {
        if let Some(msg) = self.fatal.lock().take() {
            return Err(Error::Gpu(msg));
        }

        // Completion bookkeeping runs on every call
        self.collect_completed();
        self.dispose.collect();

        if !self.tick_done.is_set() {
            return Ok(false);
        }

        // Translate the oldest staged decision set into a commit job,
        // then bump and signal the main-stream fence it depends on.
        let fence_value = self.fence_value.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(outcome) = self.pipeline.pop_outcome() {
            let job = self.build_commit_job(fence_value, outcome);
            self.commit.queue(job)?;
        }
        self.timeline.signal(fence_value);

        if !self.pipeline.can_queue() {
            // Bounded pipeline depth: let queued decision sets drain first
            return Ok(true);
        }

        // Advance the generation stamp; a wrap clears all recorded stamps
        let (now, wrapped) = {
            let mut countdown = self.countdown.lock();
            let wrapped = countdown.tick();
            (countdown.value(), wrapped)
        };
        if wrapped {
            self.clear_stamps();
        }

        // Stage this tick's feedback readback for the async pass
        let mut words = Vec::new();
        self.feedback.lock().readback(&mut words);
        self.pipeline.push_readback(ReadbackFrame { words, countdown: now });

        self.tick_done.clear();
        self.schedule_decision_pass();
        Ok(true)
    }

    /// Drain the commit queue and synchronize all outstanding GPU and disk
    /// work. Deterministic shutdown and tests.
    pub fn force_sync(&self) {
        self.tick_done.wait();
        self.commit.wait_idle();
        self.device.synchronize();
        self.io.wait_idle();
        self.collect_completed();
        self.dispose.drain_all();
    }

    /// Bytes currently backing resident tiles.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst)
    }

    /// Number of registered textures.
    pub fn live_texture_count(&self) -> usize {
        self.textures.lock().len()
    }

    /// Decision passes run since creation.
    pub fn decision_passes(&self) -> u64 {
        self.decision_passes.load(Ordering::SeqCst)
    }

    /// Latest main-stream fence value issued.
    pub fn current_fence(&self) -> u64 {
        self.fence_value.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Resident level of one tile, or None when the texture is gone.
    pub fn resident_level(&self, handle: &TextureHandle, tile: u32) -> Option<u8> {
        let record = handle.upgrade()?;
        let state = record.state.lock();
        state.tiles.get(tile as usize).map(|t| t.resident_level)
    }

    fn clear_stamps(&self) {
        self.feedback.lock().clear_all();
        for record in self.textures.lock().iter() {
            record.state.lock().loaded_countdown = COUNTDOWN_START;
        }
        log::debug!("countdown wrapped; all feedback stamps cleared");
    }

    fn build_commit_job(&self, fence_value: u64, outcome: FrameOutcome) -> CommitJob {
        let mut commands = Vec::new();
        let mut io_batch = Vec::new();
        let mut loaded = Vec::new();
        let mut superseded = Vec::new();

        for mut decisions in outcome.decisions {
            let slot = decisions.record.bindless_slot;

            for unmap in &decisions.unmaps {
                commands.push(TileCommand::Unmap {
                    region: TileRegion { tex_slot: slot, level: unmap.level, tile: unmap.tile },
                });
            }

            let mut tiles = Vec::with_capacity(decisions.loads.len());
            for load in &decisions.loads {
                if load.previous != LEVEL_UNLOADED {
                    commands.push(TileCommand::Unmap {
                        region: TileRegion { tex_slot: slot, level: load.previous, tile: load.tile },
                    });
                }
                let region = TileRegion { tex_slot: slot, level: load.level, tile: load.tile };
                commands.push(TileCommand::Map { region, memory: load.memory });

                let len = self.config.tile_level_bytes(load.level) as u32;
                let source = match &load.kind {
                    LoadKind::FileRead { path, offset } => IoSource::File {
                        path: path.clone(),
                        offset: *offset,
                        len,
                    },
                    LoadKind::Procedural { generator } => IoSource::Generate {
                        generator: generator.clone(),
                        len,
                    },
                };
                io_batch.push(IoRequest { region, memory: load.memory, source });
                tiles.push(load.tile);
            }

            // Pending bookkeeping writes: per-tile level table for shaders
            for write in &decisions.level_writes {
                self.device
                    .write_buffer(decisions.record.level_table, write.tile as u64, &[write.level]);
            }

            if !tiles.is_empty() {
                loaded.push((decisions.record.clone(), tiles));
            }
            superseded.append(&mut decisions.superseded);
        }

        log::debug!(
            "commit job fence={}: {} commands, {} reads",
            fence_value,
            commands.len(),
            io_batch.len()
        );
        CommitJob {
            fence_value,
            commands,
            io_batch,
            loaded,
            retained: outcome.retained,
            superseded,
        }
    }

    /// Release counters, keep-alive references and superseded heaps of
    /// every in-flight commit whose I/O has completed.
    fn collect_completed(&self) {
        let done: Vec<InFlightLoad> = {
            let mut inflight = self.inflight.lock();
            let mut kept = Vec::with_capacity(inflight.len());
            let mut done = Vec::new();
            for entry in inflight.drain(..) {
                if entry.fence.is_signalled() {
                    done.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            *inflight = kept;
            done
        };

        for entry in done {
            if entry.fence.failed() {
                log::warn!("tile I/O batch completed with failures");
            }
            for (record, tiles) in entry.loaded {
                let mut state = record.state.lock();
                for tile in tiles {
                    let tile_state = &mut state.tiles[tile as usize];
                    tile_state.processing_count = tile_state.processing_count.saturating_sub(1);
                    tile_state.ref_count = tile_state.ref_count.saturating_sub(1);
                }
            }
            // Superseded heaps and keep-alive references drop here
        }
    }

    fn schedule_decision_pass(&self) {
        let pipeline = self.pipeline.clone();
        let policy = self.policy.clone();
        let device = self.device.clone();
        let allocated = self.allocated.clone();
        let textures = self.textures.clone();
        let tick_done = self.tick_done.clone();
        let passes = self.decision_passes.clone();

        rayon::spawn(move || {
            if let Some(frame) = pipeline.pop_readback() {
                passes.fetch_add(1, Ordering::SeqCst);

                let records: Vec<Arc<TextureRecord>> = textures.lock().clone();
                let tally = AtomicU64::new(0);
                let decisions: Vec<TextureDecisions> = records
                    .par_iter()
                    .filter_map(|record| {
                        policy.process_texture(
                            &device,
                            &allocated,
                            &tally,
                            record,
                            &frame.words,
                            frame.countdown,
                        )
                    })
                    .collect();

                if !decisions.is_empty() {
                    let retained = decisions.iter().map(|d| d.record.clone()).collect();
                    let outcome = FrameOutcome { decisions, retained };
                    if pipeline.push_outcome(outcome).is_err() {
                        // Guarded by can_queue before scheduling; reaching
                        // this means a queued set was never translated
                        log::warn!("decision set dropped: frame pipeline full");
                    }
                }
            }
            tick_done.set();
        });
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.tick_done.wait();
        self.commit.shutdown();
        self.device.synchronize();
        self.io.wait_idle();
        self.collect_completed();
        self.dispose.drain_all();
        log::debug!("stream manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Arc;

    use crate::gpu::bindless::SlotRegistry;
    use crate::gpu::stream::NullDevice;
    use crate::io::service::TileGenerator;
    use crate::io::tokio_io::TokioTileIo;
    use crate::streaming::record::TileBacking;

    struct SolidGenerator(u8);

    impl TileGenerator for SolidGenerator {
        fn generate(&self, _level: u8, _tile: u32, len: usize) -> Vec<u8> {
            vec![self.0; len]
        }
    }

    fn small_config() -> StreamConfig {
        StreamConfig {
            lru_frame_window: 3,
            lru_frame_window_memoryless: 1,
            memoryless_threshold: 0,
            allocate_size_limit: 16 * 1024 * 1024,
            tile_resolution: 64,
            bytes_per_texel: 4,
            max_mip_levels: 8,
        }
    }

    fn manager(config: StreamConfig) -> (Arc<NullDevice>, StreamManager) {
        let device = Arc::new(NullDevice::new());
        let io: Arc<dyn TileIo> = Arc::new(TokioTileIo::new(device.clone()).unwrap());
        let registry: Arc<dyn BindlessRegistry> = Arc::new(SlotRegistry::new());
        let manager = StreamManager::new(config, device.clone(), io, registry);
        (device, manager)
    }

    /// 128x128 texture with 64px tiles: 2x2 grid at level 0, 1x1 at level 1.
    fn procedural_desc(name: &str) -> TextureStreamDesc {
        TextureStreamDesc {
            name: name.into(),
            width: 128,
            height: 128,
            mip_levels: 8,
            backing: TileBacking::Procedural {
                generator: Arc::new(SolidGenerator(0xAB)),
            },
        }
    }

    /// Run one full tick: driver call plus deterministic drain.
    fn tick(manager: &StreamManager) {
        manager.before_rendering().expect("tick failed");
        manager.force_sync();
    }

    #[test]
    fn test_load_rejects_oversized_coarsest_mip() {
        let (_device, manager) = manager(small_config());
        let desc = TextureStreamDesc {
            name: "broken".into(),
            width: 1024,
            height: 1024,
            // One level: the coarsest mip is 1024px and cannot fit a tile
            mip_levels: 1,
            backing: TileBacking::Procedural {
                generator: Arc::new(SolidGenerator(0)),
            },
        };
        assert!(matches!(manager.load(desc), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_unload_roundtrip() {
        let (_device, manager) = manager(small_config());
        let handle = manager.load(procedural_desc("a")).unwrap();

        assert!(handle.is_live());
        assert_eq!(manager.live_texture_count(), 1);

        manager.unload(&handle).unwrap();
        assert_eq!(manager.live_texture_count(), 0);

        // The record is only freed once the dispose queue drains
        manager.force_sync();
        assert!(!handle.is_live());
    }

    #[test]
    fn test_unload_is_idempotent() {
        let (_device, manager) = manager(small_config());
        let handle = manager.load(procedural_desc("a")).unwrap();

        manager.unload(&handle).unwrap();
        manager.unload(&handle).unwrap();
        assert_eq!(manager.live_texture_count(), 0);
    }

    #[test]
    fn test_swap_remove_fixes_vector_idx() {
        let (_device, manager) = manager(small_config());
        let a = manager.load(procedural_desc("a")).unwrap();
        let b = manager.load(procedural_desc("b")).unwrap();
        let c = manager.load(procedural_desc("c")).unwrap();

        manager.unload(&a).unwrap();
        assert_eq!(manager.live_texture_count(), 2);

        // 'c' was swapped into index 0; unloading it must still work
        manager.unload(&c).unwrap();
        assert_eq!(manager.live_texture_count(), 1);
        manager.unload(&b).unwrap();
        assert_eq!(manager.live_texture_count(), 0);
    }

    #[test]
    fn test_touched_tile_becomes_resident_and_mapped() {
        let (device, manager) = manager(small_config());
        let handle = manager.load(procedural_desc("a")).unwrap();
        let slot = handle.bindless_slot();

        manager.touch_tile(&handle, 0, 0).unwrap();
        // Tick 1 decides the load; tick 2 commits it
        tick(&manager);
        tick(&manager);

        assert_eq!(manager.resident_level(&handle, 0), Some(0));
        assert!(device.is_mapped(TileRegion { tex_slot: slot, level: 0, tile: 0 }));
        assert_eq!(
            manager.allocated_bytes(),
            manager.config().tile_level_bytes(0)
        );

        // Uploaded bytes came from the procedural generator
        let record = handle.upgrade().unwrap();
        let memory = {
            let state = record.state.lock();
            state.heaps[0].as_ref().unwrap().memory()
        };
        let contents = device.tile_memory_contents(memory).unwrap();
        assert!(contents.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_file_backed_tile_reads_computed_offset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.tiles");
        let config = small_config();
        let tile_bytes = config.tile_bytes() as usize;

        // Five file tiles (4 at level 0, 1 at level 1), each a solid value
        let mut file = std::fs::File::create(&path).expect("create");
        for value in 0u8..5 {
            file.write_all(&vec![value + 1; tile_bytes]).expect("write");
        }
        drop(file);

        let (device, manager) = manager(config);
        let handle = manager
            .load(TextureStreamDesc {
                name: "a".into(),
                width: 128,
                height: 128,
                mip_levels: 8,
                backing: TileBacking::File {
                    path: Arc::new(PathBuf::from(&path)),
                    data_offset: 0,
                },
            })
            .unwrap();

        manager.touch_tile(&handle, 2, 0).unwrap();
        tick(&manager);
        tick(&manager);

        assert_eq!(manager.resident_level(&handle, 2), Some(0));
        let record = handle.upgrade().unwrap();
        let memory = {
            let state = record.state.lock();
            state.heaps[2].as_ref().unwrap().memory()
        };
        // File tile 2 holds the value 3
        let contents = device.tile_memory_contents(memory).unwrap();
        assert!(contents.iter().all(|&b| b == 3));
    }

    #[test]
    fn test_same_level_touch_is_noop_after_load() {
        let (device, manager) = manager(small_config());
        let handle = manager.load(procedural_desc("a")).unwrap();

        manager.touch_tile(&handle, 0, 0).unwrap();
        tick(&manager);
        tick(&manager);
        let bytes = manager.allocated_bytes();
        let submissions = device.submission_count();

        // Re-touch at the same level: no further loads or submissions
        manager.touch_tile(&handle, 0, 0).unwrap();
        tick(&manager);
        tick(&manager);

        assert_eq!(manager.allocated_bytes(), bytes);
        assert_eq!(device.submission_count(), submissions);
    }

    #[test]
    fn test_single_flight_gate() {
        let (_device, manager) = manager(small_config());
        manager.load(procedural_desc("a")).unwrap();

        // Simulate a decision pass still in flight
        manager.tick_done.clear();
        let passes = manager.decision_passes();
        assert!(!manager.before_rendering().unwrap());
        assert_eq!(manager.decision_passes(), passes);

        manager.tick_done.set();
        assert!(manager.before_rendering().unwrap());
        manager.force_sync();
    }

    #[test]
    fn test_one_pass_per_tick() {
        let (_device, manager) = manager(small_config());
        manager.load(procedural_desc("a")).unwrap();

        for _ in 0..5 {
            tick(&manager);
        }
        assert_eq!(manager.decision_passes(), 5);
    }

    #[test]
    fn test_stale_feedback_from_before_reload_is_ignored() {
        let (_device, manager) = manager(small_config());

        // Age the countdown so a START-stamped word predates the load
        for _ in 0..3 {
            tick(&manager);
        }
        let handle = manager.load(procedural_desc("a")).unwrap();
        let record = handle.upgrade().unwrap();

        // Forge a word stamped before the texture existed
        manager
            .feedback
            .lock()
            .write_word(record.node.offset, pack_feedback(COUNTDOWN_START, 0));
        tick(&manager);
        tick(&manager);

        assert_eq!(manager.resident_level(&handle, 0), Some(LEVEL_UNLOADED));
        assert_eq!(manager.allocated_bytes(), 0);
    }

    #[test]
    fn test_budget_invariant_across_ticks() {
        let mut config = small_config();
        // Room for two level-0 tiles only
        config.allocate_size_limit = 2 * config.tile_bytes();
        config.memoryless_threshold = 0;
        let (_device, manager) = manager(config);

        let handle = manager.load(procedural_desc("a")).unwrap();
        let limit = manager.config().allocate_size_limit;

        for _ in 0..8 {
            for tile in 0..4 {
                manager.touch_tile(&handle, tile, 0).unwrap();
            }
            tick(&manager);
            assert!(
                manager.allocated_bytes() <= limit,
                "budget exceeded: {} > {}",
                manager.allocated_bytes(),
                limit
            );
        }
    }

    #[test]
    fn test_lru_coarsens_untouched_tile() {
        let (_device, manager) = manager(small_config());
        let handle = manager.load(procedural_desc("a")).unwrap();

        manager.touch_tile(&handle, 0, 0).unwrap();
        tick(&manager);
        tick(&manager);
        assert_eq!(manager.resident_level(&handle, 0), Some(0));

        // Untouched for several windows: the tile coarsens, then unloads
        for _ in 0..12 {
            tick(&manager);
        }
        assert_eq!(manager.resident_level(&handle, 0), Some(LEVEL_UNLOADED));
        assert_eq!(manager.allocated_bytes(), 0);
    }

    #[test]
    fn test_unload_returns_memory_after_sync() {
        let (device, manager) = manager(small_config());
        let handle = manager.load(procedural_desc("a")).unwrap();

        manager.touch_tile(&handle, 0, 0).unwrap();
        tick(&manager);
        tick(&manager);
        assert!(manager.allocated_bytes() > 0);

        manager.unload(&handle).unwrap();
        manager.force_sync();

        assert_eq!(manager.allocated_bytes(), 0);
        assert_eq!(device.live_tile_allocations(), 0);
    }

    #[test]
    fn test_fatal_device_error_is_not_raised_spuriously() {
        let (_device, manager) = manager(small_config());
        manager.load(procedural_desc("a")).unwrap();
        for _ in 0..3 {
            assert!(manager.before_rendering().is_ok());
            manager.force_sync();
        }
    }
}
