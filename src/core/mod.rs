//! Core engine types and utilities

pub mod config;
pub mod error;
pub mod logging;

pub use config::StreamConfig;
pub use error::Error;
