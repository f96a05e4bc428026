//! Rebuilding index entries straight from segment media.
//!
//! When no valid sidecar exists, the scanner walks the segment's box tree
//! and produces one entry per media fragment: the fragment's `moof` byte
//! offset paired with its wall-clock start time, derived from the
//! `tfdt` base decode time in the track's own time scale.

use chrono::TimeDelta;

use crate::error::{Error, Result};
use crate::index::IndexEntry;
use crate::mp4::{read_init, walk_boxes, BoxType, WalkAction, WalkError};
use crate::playback::segment::Segment;

/// Scan a segment and produce its index entries in file order, starting
/// with the sentinel `{segment.start, 0}`.
///
/// An unopenable file or unparseable init section fails the scan, as does a
/// fragment referencing a track the init never declared. A single fragment
/// with a malformed `tfhd`/`tfdt` payload is skipped, not fatal.
pub fn scan_segment(segment: &Segment) -> Result<Vec<IndexEntry>> {
    let name = segment
        .fpath
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| segment.fpath.display().to_string());

    let mut file =
        std::fs::File::open(&segment.fpath).map_err(|e| Error::scan(&name, e))?;
    let init = read_init(&mut file).map_err(|e| Error::scan(&name, e))?;

    let mut entries = Vec::with_capacity(128);
    entries.push(IndexEntry {
        time: segment.start,
        offset: 0,
    });

    let mut moof_offset: i64 = 0;
    // Time scale of this fragment's resolved track; cleared at each moof so
    // a fragment with an unreadable tfhd never borrows another fragment's
    // scale.
    let mut frag_scale: Option<u32> = None;

    walk_boxes(&mut file, &mut |h| match h.box_type() {
        BoxType::MOOF => {
            moof_offset = h.info.offset as i64;
            frag_scale = None;
            Ok(WalkAction::Descend)
        }
        BoxType::TRAF => Ok(WalkAction::Descend),
        BoxType::TFHD => {
            let payload = h.read_payload()?;
            match read_tfhd_track_id(&payload) {
                Some(track_id) => {
                    let track = init.track(track_id).ok_or_else(|| {
                        WalkError::Visitor(format!("invalid track ID: {track_id}"))
                    })?;
                    frag_scale = Some(track.time_scale);
                }
                None => {
                    tracing::debug!(segment = %name, "skipping fragment with malformed tfhd");
                }
            }
            Ok(WalkAction::Continue)
        }
        BoxType::TFDT => {
            let payload = h.read_payload()?;
            match (frag_scale, read_tfdt_decode_time(&payload)) {
                (Some(scale), Some(units)) => {
                    let dt = scaled_duration(units, scale);
                    entries.push(IndexEntry {
                        time: segment.start + dt,
                        offset: moof_offset,
                    });
                }
                (None, _) => {
                    tracing::debug!(segment = %name, "skipping fragment without resolved track");
                }
                (_, None) => {
                    tracing::debug!(segment = %name, "skipping fragment with malformed tfdt");
                }
            }
            Ok(WalkAction::Continue)
        }
        _ => Ok(WalkAction::Continue),
    })
    .map_err(|e| Error::scan(&name, e))?;

    Ok(entries)
}

fn read_tfhd_track_id(payload: &[u8]) -> Option<u32> {
    let bytes = payload.get(4..8)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

pub(crate) fn read_tfdt_decode_time(payload: &[u8]) -> Option<u64> {
    let version = *payload.first()?;
    if version == 1 {
        let bytes = payload.get(4..12)?;
        Some(u64::from_be_bytes(bytes.try_into().ok()?))
    } else {
        let bytes = payload.get(4..8)?;
        Some(u64::from(u32::from_be_bytes(bytes.try_into().ok()?)))
    }
}

/// Convert `units` in `scale` units-per-second to a duration using integer
/// division with a remainder-scaled correction, avoiding float drift.
pub fn scaled_duration(units: u64, scale: u32) -> TimeDelta {
    let scale = u64::from(scale.max(1));
    let secs = units / scale;
    let rem = units % scale;
    let nanos = rem * 1_000_000_000 / scale;
    TimeDelta::seconds(secs as i64) + TimeDelta::nanoseconds(nanos as i64)
}
