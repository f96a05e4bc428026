//! Chronocast - time-addressable recording index and playback engine
//!
//! Recording paths accumulate fragmented-MP4 segments on disk; this crate
//! maintains a per-path time→byte-offset index over them (persisted in
//! binary sidecar files, rebuilt from the media when sidecars are stale)
//! and serves range-capable playback by seeking via the index and virtually
//! concatenating segments into one stream.

pub mod config;
pub mod error;
pub mod index;
pub mod mp4;
pub mod playback;
pub mod server;

pub use error::{Error, Result};
