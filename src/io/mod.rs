//! Disk I/O service contract and the tokio-backed tile reader

pub mod service;
pub mod tokio_io;

pub use service::{IoFence, IoRequest, IoSource, TileGenerator, TileIo};
pub use tokio_io::TokioTileIo;
