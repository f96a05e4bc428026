//! MP4 container parsing: the generic box walker and fragmented-MP4 init
//! metadata extraction built on top of it.

pub mod init;
#[cfg(any(test, feature = "test-fixtures"))]
pub mod test_fixtures;
pub mod walker;

pub use init::{read_init, InitError, SegmentInit, TrackInit};
pub use walker::{walk_boxes, BoxHandle, BoxInfo, BoxType, WalkAction, WalkContext, WalkError};
