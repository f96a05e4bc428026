//! Range-capable playback of recorded segments.

pub mod mux;
pub mod range_writer;
pub mod seek_mux;
pub mod segment;

pub use mux::{Fmp4Muxer, Muxer};
pub use range_writer::RangeWriter;
pub use seek_mux::seek_and_mux;
pub use segment::{DiskSegmentFinder, Segment, SegmentFinder, SharedSegmentFinder};
