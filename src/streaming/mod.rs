//! Feedback-driven tile residency and streaming

pub mod commit;
pub mod countdown;
pub mod dispose;
pub mod feedback;
pub mod heap;
pub mod manager;
pub mod pipeline;
pub mod policy;
pub mod record;
pub mod tile_state;

pub use commit::{CommitJob, CommitState, CommitThread, InFlightLoad};
pub use countdown::{COUNTDOWN_START, Countdown};
pub use dispose::{DisposeGate, DisposePayload, DisposeQueue};
pub use feedback::{
    FEEDBACK_UNSEEN, FeedbackNode, LevelFeedbackBuffer, pack_feedback, unpack_feedback,
};
pub use heap::SparseHeap;
pub use manager::StreamManager;
pub use pipeline::{FrameOutcome, FrameResourcePipeline, MAX_INFLIGHT_FRAMES, ReadbackFrame};
pub use policy::{LevelWrite, LoadKind, ResidencyPolicy, TextureDecisions, TileLoad, TileUnmap};
pub use record::{
    LevelGrid, PagedTextureMeta, TextureHandle, TextureRecord, TextureStreamDesc, TileBacking,
    build_level_grids,
};
pub use tile_state::{LEVEL_UNLOADED, TileState};
