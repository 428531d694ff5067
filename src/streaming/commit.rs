//! Background commit thread
//!
//! Decouples potentially blocking submission from the render thread: each
//! job waits (cancellably) until the main stream has signalled the fence
//! value it depends on, then submits its sparse-mapping commands and disk
//! I/O requests on the asynchronous queue. Completed submissions are
//! parked on a shared list; the manager's bookkeeping pass releases their
//! counters, keep-alive references and superseded heaps once the I/O
//! completion is observed.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};

use crate::core::error::Error;
use crate::gpu::stream::{StreamDevice, TileCommand};
use crate::gpu::timeline::{CancelToken, Timeline};
use crate::io::service::{IoFence, IoRequest, TileIo};
use crate::streaming::heap::SparseHeap;
use crate::streaming::record::TextureRecord;

/// Lifecycle of one queued commit job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    WaitingOnFence,
    Submitted,
}

/// One tick's GPU + I/O submission, gated on a main-stream fence value.
pub struct CommitJob {
    /// Main-stream fence value this job must not outrun
    pub fence_value: u64,
    /// Sparse (un)mapping commands
    pub commands: Vec<TileCommand>,
    /// Tile read requests issued after the mapping commands
    pub io_batch: Vec<IoRequest>,
    /// Tiles whose in-flight counters drop when the I/O completes
    pub loaded: Vec<(Arc<TextureRecord>, Vec<u32>)>,
    /// Keep-alive references released at completion
    pub retained: Vec<Arc<TextureRecord>>,
    /// Heaps displaced by this job, freed at completion
    pub superseded: Vec<SparseHeap>,
}

/// A submitted (or discarded) job awaiting completion bookkeeping.
pub struct InFlightLoad {
    pub fence: IoFence,
    pub loaded: Vec<(Arc<TextureRecord>, Vec<u32>)>,
    pub retained: Vec<Arc<TextureRecord>>,
    pub superseded: Vec<SparseHeap>,
}

struct PendingGate {
    count: Mutex<usize>,
    cv: Condvar,
}

impl PendingGate {
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

/// Handle to the background commit worker.
pub struct CommitThread {
    tx: Option<Sender<CommitJob>>,
    cancel: CancelToken,
    pending: Arc<PendingGate>,
    join: Option<JoinHandle<()>>,
}

impl CommitThread {
    /// Spawn the worker. Submitted jobs land on `inflight` for the
    /// manager's completion bookkeeping; a fatal device fault is parked in
    /// `fatal` and re-raised by the next driver call.
    pub fn spawn(
        device: Arc<dyn StreamDevice>,
        io: Arc<dyn TileIo>,
        timeline: Arc<dyn Timeline>,
        inflight: Arc<Mutex<Vec<InFlightLoad>>>,
        fatal: Arc<Mutex<Option<String>>>,
    ) -> Self {
        let (tx, rx) = unbounded::<CommitJob>();
        let cancel = CancelToken::new();
        let pending = Arc::new(PendingGate::new());

        let worker_cancel = cancel.clone();
        let worker_pending = pending.clone();
        let join = std::thread::Builder::new()
            .name("tile-commit".into())
            .spawn(move || {
                commit_loop(
                    device,
                    io,
                    timeline,
                    rx,
                    worker_cancel,
                    worker_pending,
                    inflight,
                    fatal,
                );
            })
            .expect("failed to spawn commit thread");

        Self {
            tx: Some(tx),
            cancel,
            pending,
            join: Some(join),
        }
    }

    /// Queue a job for fence-gated submission.
    pub fn queue(&self, job: CommitJob) -> Result<(), Error> {
        let Some(tx) = &self.tx else {
            return Err(Error::Streaming("commit thread is disabled".into()));
        };
        self.pending.increment();
        if tx.send(job).is_err() {
            self.pending.decrement();
            return Err(Error::Streaming("commit thread is gone".into()));
        }
        Ok(())
    }

    /// Block until every queued job has been submitted or discarded.
    pub fn wait_idle(&self) {
        self.pending.wait_zero();
    }

    /// Disable the worker and join it. Undispatched jobs' command lists are
    /// discarded; their payloads surface on the in-flight list for the
    /// manager's final cleanup.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        self.tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for CommitThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn commit_loop(
    device: Arc<dyn StreamDevice>,
    io: Arc<dyn TileIo>,
    timeline: Arc<dyn Timeline>,
    rx: Receiver<CommitJob>,
    cancel: CancelToken,
    pending: Arc<PendingGate>,
    inflight: Arc<Mutex<Vec<InFlightLoad>>>,
    fatal: Arc<Mutex<Option<String>>>,
) {
    let discard = |job: CommitJob| {
        // Command lists are dropped; completion bookkeeping still runs so
        // counters and heaps are released by the manager's final sync.
        inflight.lock().push(InFlightLoad {
            fence: IoFence::signalled(),
            loaded: job.loaded,
            retained: job.retained,
            superseded: job.superseded,
        });
        pending.decrement();
    };

    while let Ok(job) = rx.recv() {
        let mut state = CommitState::Pending;
        log::trace!("commit job fence={} {:?}", job.fence_value, state);

        state = CommitState::WaitingOnFence;
        if !timeline.wait(job.fence_value, &cancel) {
            log::debug!(
                "commit job fence={} discarded during shutdown ({:?})",
                job.fence_value,
                state
            );
            discard(job);
            break;
        }

        if let Err(e) = device.submit_mapping(&job.commands) {
            // Device fault: unrecoverable, surface to the driver thread
            log::error!("sparse mapping submission failed: {}", e);
            *fatal.lock() = Some(e.to_string());
            discard(job);
            break;
        }

        let fence = io.submit(job.io_batch);
        inflight.lock().push(InFlightLoad {
            fence,
            loaded: job.loaded,
            retained: job.retained,
            superseded: job.superseded,
        });
        pending.decrement();

        state = CommitState::Submitted;
        log::trace!("commit job fence={} {:?}", job.fence_value, state);
    }

    // Disabled: drain whatever was queued but never dispatched.
    while let Ok(job) = rx.try_recv() {
        discard(job);
    }
}
