//! Generic recursive walker over the MP4 box tree.
//!
//! MP4 files are a sequence of nested length-prefixed boxes. The walker
//! reads box headers and hands each box to a caller-supplied visitor, which
//! decides per box whether to decode its payload, descend into its children,
//! or skip it. Children are only seeked into when the visitor asks, so a
//! top-level pass over a multi-gigabyte segment touches headers only.
//!
//! Walking starts at the reader's current position, and all reported offsets
//! are absolute within the stream.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

/// Size of a compact box header (32-bit size + type).
pub const SMALL_HEADER_SIZE: u64 = 8;

/// Size of an extended box header (32-bit size sentinel + type + 64-bit size).
pub const LARGE_HEADER_SIZE: u64 = 16;

/// Refuse to buffer payloads larger than this; visitors only ever decode
/// small metadata boxes, never media data.
const MAX_PAYLOAD_READ: u64 = 16 << 20;

/// Four-character box type code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxType(pub [u8; 4]);

impl BoxType {
    pub const FTYP: BoxType = BoxType(*b"ftyp");
    pub const MOOV: BoxType = BoxType(*b"moov");
    pub const TRAK: BoxType = BoxType(*b"trak");
    pub const TKHD: BoxType = BoxType(*b"tkhd");
    pub const MDIA: BoxType = BoxType(*b"mdia");
    pub const MDHD: BoxType = BoxType(*b"mdhd");
    pub const MOOF: BoxType = BoxType(*b"moof");
    pub const TRAF: BoxType = BoxType(*b"traf");
    pub const TFHD: BoxType = BoxType(*b"tfhd");
    pub const TFDT: BoxType = BoxType(*b"tfdt");
    pub const TRUN: BoxType = BoxType(*b"trun");
    pub const MDAT: BoxType = BoxType(*b"mdat");
    pub const WAVE: BoxType = BoxType(*b"wave");
    pub const ILST: BoxType = BoxType(*b"ilst");
}

impl fmt::Display for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoxType({self})")
    }
}

/// Walker failure modes.
#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    #[error("I/O error while walking boxes: {0}")]
    Io(#[from] io::Error),

    /// A box declared more bytes than its parent has left.
    #[error("too large box size: type={box_type}, size={size}, available={available}")]
    OversizedBox {
        box_type: BoxType,
        size: u64,
        available: u64,
    },

    /// A box declared fewer bytes than its own header occupies.
    #[error("malformed box size: type={box_type}, size={size}")]
    MalformedSize { box_type: BoxType, size: u64 },

    /// The stream ended in the middle of a box header.
    #[error("truncated box header")]
    TruncatedHeader,

    /// A box region ended with declared bytes left unconsumed.
    #[error("unexpected end of box region")]
    UnexpectedEof,

    /// A payload exceeded the decode buffer cap.
    #[error("payload too large to decode: type={box_type}, size={size}")]
    PayloadTooLarge { box_type: BoxType, size: u64 },

    /// Error raised by the visitor itself.
    #[error("{0}")]
    Visitor(String),
}

/// Parse state threaded down the recursion, copied and modified at each
/// level, never mutated in place below the current level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkContext {
    /// Sticky once an `ftyp` box declares the QuickTime compatible brand.
    /// Excuses trailing-byte mismatches in legacy files.
    pub qt_compatible: bool,
    /// Inside a `wave` container, where some box types decode differently.
    pub under_wave: bool,
    /// Inside an `ilst` metadata list, where item box types are ambiguous.
    pub under_ilst: bool,
}

/// Header-level description of one box.
#[derive(Debug, Clone, Copy)]
pub struct BoxInfo {
    pub box_type: BoxType,
    /// Absolute offset of the box header in the stream.
    pub offset: u64,
    /// Total declared size, header included.
    pub size: u64,
    pub header_size: u64,
    /// Nesting depth; top-level boxes are depth 0.
    pub depth: usize,
    pub context: WalkContext,
}

impl BoxInfo {
    /// Size of the payload region (everything after the header).
    pub fn payload_size(&self) -> u64 {
        self.size - self.header_size
    }

    /// Absolute offset one past the last byte of this box.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// What the visitor wants done with the current box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    /// Skip to the next sibling.
    Continue,
    /// Recurse into this box's children (after any payload the visitor
    /// already consumed).
    Descend,
    /// Abort the whole walk cleanly.
    Stop,
}

/// Handle passed to the visitor for each box.
pub struct BoxHandle<'a, R: Read + Seek> {
    pub info: BoxInfo,
    reader: &'a mut R,
    payload_consumed: u64,
}

impl<R: Read + Seek> BoxHandle<'_, R> {
    pub fn box_type(&self) -> BoxType {
        self.info.box_type
    }

    /// Read the full payload of this box. Children, if any, are then taken
    /// to start after the payload when the visitor asks to descend.
    pub fn read_payload(&mut self) -> Result<Vec<u8>, WalkError> {
        let size = self.info.payload_size();
        if size > MAX_PAYLOAD_READ {
            return Err(WalkError::PayloadTooLarge {
                box_type: self.info.box_type,
                size,
            });
        }
        self.reader
            .seek(SeekFrom::Start(self.info.offset + self.info.header_size))?;
        let mut buf = vec![0u8; size as usize];
        self.reader.read_exact(&mut buf)?;
        self.payload_consumed = size;
        Ok(buf)
    }
}

/// Walk the box tree starting at the reader's current position, invoking
/// `visitor` for every box it does not skip over. Returns cleanly when the
/// top-level region reaches end of stream or the visitor requests
/// [`WalkAction::Stop`].
pub fn walk_boxes<R, F>(reader: &mut R, visitor: &mut F) -> Result<(), WalkError>
where
    R: Read + Seek,
    F: FnMut(&mut BoxHandle<'_, R>) -> Result<WalkAction, WalkError>,
{
    walk_region(reader, None, 0, WalkContext::default(), visitor).map(|_keep_going| ())
}

fn walk_region<R, F>(
    reader: &mut R,
    region_end: Option<u64>,
    depth: usize,
    mut ctx: WalkContext,
    visitor: &mut F,
) -> Result<bool, WalkError>
where
    R: Read + Seek,
    F: FnMut(&mut BoxHandle<'_, R>) -> Result<WalkAction, WalkError>,
{
    let at_root = region_end.is_none();

    loop {
        let offset = reader.stream_position()?;

        if let Some(end) = region_end {
            let remaining = end.saturating_sub(offset);
            if remaining < SMALL_HEADER_SIZE {
                if remaining != 0 && !ctx.qt_compatible {
                    return Err(WalkError::UnexpectedEof);
                }
                return Ok(true);
            }
        }

        let Some((size32, type_bytes)) = read_compact_header(reader, at_root)? else {
            // Clean end of stream at a top-level box boundary.
            return Ok(true);
        };
        let box_type = BoxType(type_bytes);

        let (size, header_size) = match size32 {
            1 => {
                let mut large = [0u8; 8];
                reader.read_exact(&mut large).map_err(io_to_truncated)?;
                (u64::from_be_bytes(large), LARGE_HEADER_SIZE)
            }
            0 => {
                // Box extends to the end of its region.
                let end = match region_end {
                    Some(end) => end,
                    None => stream_len(reader)?,
                };
                (end - offset, SMALL_HEADER_SIZE)
            }
            n => (u64::from(n), SMALL_HEADER_SIZE),
        };

        if size < header_size {
            return Err(WalkError::MalformedSize { box_type, size });
        }
        if let Some(end) = region_end {
            let available = end - offset;
            if size > available {
                return Err(WalkError::OversizedBox {
                    box_type,
                    size,
                    available,
                });
            }
        }

        // The legacy-compatibility flag is set once at the top level and
        // stays on for the remainder of the tree.
        if at_root && box_type == BoxType::FTYP && has_qt_brand(reader, offset, size, header_size)?
        {
            ctx.qt_compatible = true;
        }

        let mut child_ctx = ctx;
        if box_type == BoxType::WAVE {
            child_ctx.under_wave = true;
        } else if box_type == BoxType::ILST {
            child_ctx.under_ilst = true;
        }

        let mut handle = BoxHandle {
            info: BoxInfo {
                box_type,
                offset,
                size,
                header_size,
                depth,
                context: ctx,
            },
            reader: &mut *reader,
            payload_consumed: 0,
        };

        let action = visitor(&mut handle)?;
        let payload_consumed = handle.payload_consumed;
        let box_end = offset + size;

        match action {
            WalkAction::Continue => {
                reader.seek(SeekFrom::Start(box_end))?;
            }
            WalkAction::Descend => {
                let children_start = offset + header_size + payload_consumed;
                reader.seek(SeekFrom::Start(children_start))?;
                if !walk_region(reader, Some(box_end), depth + 1, child_ctx, visitor)? {
                    return Ok(false);
                }
                reader.seek(SeekFrom::Start(box_end))?;
            }
            WalkAction::Stop => return Ok(false),
        }
    }
}

/// Read the compact 8-byte header. Returns `None` on a clean end of stream
/// at the top level.
fn read_compact_header<R: Read>(
    reader: &mut R,
    at_root: bool,
) -> Result<Option<(u32, [u8; 4])>, WalkError> {
    let mut head = [0u8; 8];
    let mut filled = 0usize;
    while filled < head.len() {
        let n = reader.read(&mut head[filled..])?;
        if n == 0 {
            if at_root && filled == 0 {
                return Ok(None);
            }
            return Err(WalkError::TruncatedHeader);
        }
        filled += n;
    }
    let size32 = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    Ok(Some((size32, [head[4], head[5], head[6], head[7]])))
}

fn io_to_truncated(err: io::Error) -> WalkError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        WalkError::TruncatedHeader
    } else {
        WalkError::Io(err)
    }
}

fn stream_len<R: Seek>(reader: &mut R) -> Result<u64, WalkError> {
    let pos = reader.stream_position()?;
    let len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(pos))?;
    Ok(len)
}

/// Check an `ftyp` payload for the QuickTime compatible brand. Leaves the
/// cursor wherever the check ends; callers reposition via absolute seeks.
fn has_qt_brand<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    size: u64,
    header_size: u64,
) -> Result<bool, WalkError> {
    let payload_size = size - header_size;
    if payload_size < 8 || payload_size > MAX_PAYLOAD_READ {
        return Ok(false);
    }
    reader.seek(SeekFrom::Start(offset + header_size))?;
    let mut payload = vec![0u8; payload_size as usize];
    reader.read_exact(&mut payload)?;
    // major brand + minor version, then compatible brands.
    Ok(payload[8..].chunks_exact(4).any(|brand| brand == b"qt  "))
}
