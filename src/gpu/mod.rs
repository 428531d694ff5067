//! GPU command/stream contract required by the streaming engine
//!
//! The engine never talks to a concrete graphics API; it drives the traits
//! in this module. `NullDevice` is a host-memory implementation used for
//! tests, benches and headless runs.

pub mod bindless;
pub mod stream;
pub mod timeline;

pub use bindless::{BindlessRegistry, SlotRegistry};
pub use stream::{DeviceBuffer, NullDevice, StreamDevice, TileCommand, TileMemory, TileRegion};
pub use timeline::{CancelToken, HostTimeline, Timeline};
