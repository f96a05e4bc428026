//! Binary sidecar files persisting a segment's index entries.
//!
//! Layout, bit-exact:
//! - 16-byte header: magic `SIDX`, version byte `1`, 11 reserved zero bytes.
//! - Records: a 16-byte timestamp slot followed by an 8-byte big-endian
//!   signed offset. Slot layout for the version-1 short encoding (15
//!   meaningful bytes + 1 pad): tag byte `1`, big-endian i64 unix seconds,
//!   big-endian u32 nanoseconds, 2 reserved bytes, pad byte. Any other tag
//!   byte is reserved for a full 16-byte encoding and rejected as stale.
//!
//! A sidecar is only trusted when its modification time is not older than
//! the segment's; anything questionable is reported as [`Error::StaleIndex`]
//! so the caller falls back to re-scanning the segment. Writes go through a
//! temp file plus atomic rename and never leave a broken sidecar behind.

use chrono::{DateTime, TimeZone, Utc};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::index::IndexEntry;
use crate::playback::segment::Segment;

/// Extension carried by sidecar files.
pub const SIDECAR_EXT: &str = "idx";

const MAGIC: [u8; 4] = *b"SIDX";
const VERSION: u8 = 1;
const TIME_TAG_SHORT: u8 = 1;
const HEADER_LEN: usize = 16;
const TIME_SLOT_LEN: usize = 16;

/// Sidecar file name for a segment: extension replaced with `.idx`.
pub fn sidecar_path(segment_path: &Path) -> PathBuf {
    segment_path.with_extension(SIDECAR_EXT)
}

/// Read a segment's sidecar, verifying it is not older than the segment.
pub fn read_sidecar(segment: &Segment) -> Result<Vec<IndexEntry>> {
    let seg_meta = fs::metadata(&segment.fpath)?;

    let idx_path = sidecar_path(&segment.fpath);
    let idx_meta = fs::metadata(&idx_path).map_err(|_| Error::StaleIndex)?;

    let seg_mtime = seg_meta.modified()?;
    let idx_mtime = idx_meta.modified().map_err(|_| Error::StaleIndex)?;
    if idx_mtime < seg_mtime {
        return Err(Error::StaleIndex);
    }

    read_sidecar_file(&idx_path)
}

/// Decode a sidecar file, trusting nothing: any malformed header or record
/// makes the whole file stale. Never returns a partially decoded list.
pub fn read_sidecar_file(idx_path: &Path) -> Result<Vec<IndexEntry>> {
    tracing::info!(sidecar = %idx_path.display(), "loading index sidecar");

    let file = File::open(idx_path).map_err(|_| Error::StaleIndex)?;
    let mut reader = BufReader::new(file);

    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).map_err(|_| Error::StaleIndex)?;
    if header[..4] != MAGIC || header[4] != VERSION {
        return Err(Error::StaleIndex);
    }

    let mut entries = Vec::with_capacity(256);
    loop {
        let mut slot = [0u8; TIME_SLOT_LEN];
        match read_full(&mut reader, &mut slot)? {
            0 => break,
            TIME_SLOT_LEN => {}
            _ => return Err(Error::StaleIndex),
        }
        let time = decode_time_slot(&slot).ok_or(Error::StaleIndex)?;

        let mut offset_bytes = [0u8; 8];
        reader
            .read_exact(&mut offset_bytes)
            .map_err(|_| Error::StaleIndex)?;
        let offset = i64::from_be_bytes(offset_bytes);

        entries.push(IndexEntry { time, offset });
    }

    Ok(entries)
}

/// Persist `entries` as the sidecar for `segment_path`. Writes to a temp
/// file and renames it into place; on any failure the temp file is removed
/// and the previous sidecar, if any, is left untouched.
pub fn write_sidecar(segment_path: &Path, entries: &[IndexEntry]) -> Result<()> {
    let idx_path = sidecar_path(segment_path);
    let tmp_path = {
        let mut s = idx_path.clone().into_os_string();
        s.push(".tmp");
        PathBuf::from(s)
    };

    if let Err(e) = write_records(&tmp_path, entries) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    if let Err(e) = fs::rename(&tmp_path, &idx_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    Ok(())
}

fn write_records(tmp_path: &Path, entries: &[IndexEntry]) -> Result<()> {
    let file = File::create(tmp_path)?;
    let mut writer = BufWriter::new(file);

    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&MAGIC);
    header[4] = VERSION;
    writer.write_all(&header)?;

    for entry in entries {
        writer.write_all(&encode_time_slot(entry.time))?;
        writer.write_all(&entry.offset.to_be_bytes())?;
    }

    writer.flush()?;
    Ok(())
}

fn encode_time_slot(time: DateTime<Utc>) -> [u8; TIME_SLOT_LEN] {
    let mut slot = [0u8; TIME_SLOT_LEN];
    slot[0] = TIME_TAG_SHORT;
    slot[1..9].copy_from_slice(&time.timestamp().to_be_bytes());
    slot[9..13].copy_from_slice(&time.timestamp_subsec_nanos().to_be_bytes());
    slot
}

fn decode_time_slot(slot: &[u8; TIME_SLOT_LEN]) -> Option<DateTime<Utc>> {
    if slot[0] != TIME_TAG_SHORT {
        return None;
    }
    let secs = i64::from_be_bytes(slot[1..9].try_into().ok()?);
    let nanos = u32::from_be_bytes(slot[9..13].try_into().ok()?);
    Utc.timestamp_opt(secs, nanos).single()
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
