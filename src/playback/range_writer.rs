//! Byte-range windowing over a muxed output stream.
//!
//! Range requests are served in two passes over the same mux: a counting
//! pass that establishes the total body length without emitting anything,
//! then an emitting pass that forwards only the requested window. Once the
//! window is fully emitted, further writes fail with the early-completion
//! marker so the producer stops instead of muxing data nobody will see.

use std::io::{self, Write};

use crate::error::early_completion;

/// Writer that forwards the slice `[start, end]` (inclusive, absolute
/// positions in the unranged stream) of everything written through it.
pub struct RangeWriter<W: Write> {
    inner: W,
    start: u64,
    end: Option<u64>,
    pos: u64,
    sent: u64,
    count_only: bool,
    done: bool,
}

impl RangeWriter<io::Sink> {
    /// Counting pass: consumes everything, emits nothing. `position()`
    /// afterwards is the total stream length.
    pub fn counting() -> Self {
        Self {
            inner: io::sink(),
            start: 0,
            end: None,
            pos: 0,
            sent: 0,
            count_only: true,
            done: false,
        }
    }
}

impl<W: Write> RangeWriter<W> {
    /// Emit the whole stream unmodified.
    pub fn full(inner: W) -> Self {
        Self::range(inner, 0, None)
    }

    /// Emit only `[start, end]`; `end == None` means to the end of the
    /// stream.
    pub fn range(inner: W, start: u64, end: Option<u64>) -> Self {
        Self {
            inner,
            start,
            end,
            pos: 0,
            sent: 0,
            count_only: false,
            done: false,
        }
    }

    /// Absolute position in the unranged stream.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Bytes actually forwarded to the inner writer.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Whether any body byte has been emitted yet.
    pub fn body_started(&self) -> bool {
        self.sent > 0
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for RangeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.done {
            return Err(early_completion());
        }

        let buf_start = self.pos;
        let buf_end = buf_start + buf.len() as u64;
        self.pos = buf_end;

        if self.count_only {
            return Ok(buf.len());
        }

        // Intersect the buffer with the requested window.
        let lo = self.start.max(buf_start);
        let hi = match self.end {
            Some(end) => buf_end.min(end + 1),
            None => buf_end,
        };
        if lo < hi {
            let a = (lo - buf_start) as usize;
            let b = (hi - buf_start) as usize;
            self.inner.write_all(&buf[a..b])?;
            self.sent += (b - a) as u64;
        }

        if let Some(end) = self.end {
            if buf_end > end {
                self.done = true;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
