//! Offset and range views over a shared stream

use crate::error::{FlashError, Result};
use crate::io::{SharedStream, Stream};

/// Bounds-checked window `[base, base+len)` of the inner stream.
///
/// Position 0 of the view is `base` of the inner stream. Nothing outside the
/// window can be read, written or seeked to.
pub struct RangeView {
    inner: SharedStream,
    base: u64,
    len: u64,
    pos: u64,
}

impl RangeView {
    pub fn new(inner: SharedStream, base: u64, len: u64) -> Result<Self> {
        let end = base
            .checked_add(len)
            .ok_or(FlashError::AddressOverflow { offset: base, length: len })?;
        let limit = inner.size();
        if end > limit {
            return Err(FlashError::OutOfRange { pos: end, limit });
        }
        Ok(RangeView {
            inner,
            base,
            len,
            pos: 0,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }
}

impl Stream for RangeView {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let want = buf.len().min((self.len - self.pos) as usize);
        let n = self.inner.read_at(self.base + self.pos, &mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let end = self.pos + buf.len() as u64;
        if end > self.len {
            return Err(FlashError::OutOfRange {
                pos: end,
                limit: self.len,
            });
        }
        self.inner.write_at(self.base + self.pos, buf)?;
        self.pos = end;
        Ok(())
    }

    fn set_pos(&mut self, pos: u64) -> Result<()> {
        if pos > self.len {
            return Err(FlashError::OutOfRange {
                pos,
                limit: self.len,
            });
        }
        self.pos = pos;
        Ok(())
    }

    fn pos(&self) -> u64 {
        self.pos
    }

    /// Shrinks the window. The inner stream is left alone.
    fn truncate(&mut self, len: u64) -> Result<()> {
        if len > self.len {
            return Err(FlashError::OutOfRange {
                pos: len,
                limit: self.len,
            });
        }
        self.len = len;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.len
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }
}

/// View shifted by a fixed base. Unlike [`RangeView`] it may grow past its
/// nominal length, which the filesystems rely on when they append.
pub struct OffsetView {
    inner: SharedStream,
    base: u64,
    len: u64,
    pos: u64,
}

impl OffsetView {
    pub fn new(inner: SharedStream, base: u64, len: Option<u64>) -> Result<Self> {
        let limit = inner.size();
        if base > limit {
            return Err(FlashError::OutOfRange { pos: base, limit });
        }
        let len = len.unwrap_or(limit - base);
        Ok(OffsetView {
            inner,
            base,
            len,
            pos: 0,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }
}

impl Stream for OffsetView {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let want = buf.len().min((self.len - self.pos) as usize);
        let n = self.inner.read_at(self.base + self.pos, &mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let phys = self
            .base
            .checked_add(self.pos)
            .ok_or(FlashError::AddressOverflow {
                offset: self.pos,
                length: buf.len() as u64,
            })?;
        self.inner.write_at(phys, buf)?;
        self.pos += buf.len() as u64;
        self.len = self.len.max(self.pos);
        Ok(())
    }

    fn set_pos(&mut self, pos: u64) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn pos(&self) -> u64 {
        self.pos
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.inner.truncate(self.base + len)?;
        self.len = len;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.len
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }
}
