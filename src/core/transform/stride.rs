//! Periodic-skip views
//!
//! Both the block deinterleaver (data block followed by a fixed trailer) and
//! the sector-remapping view (every N logical bytes followed by skip bytes)
//! are the same mapping:
//!
//! ```text
//! physical = (pos / logical_period) * physical_period + pos % logical_period
//! ```

use crate::error::{FlashError, Result};
use crate::io::{SharedStream, Stream};

/// Logical period of the HIMA sector layout
pub const HIMA_LOGICAL_PERIOD: u64 = 0x3f000;
/// Physical period of the HIMA sector layout
pub const HIMA_PHYSICAL_PERIOD: u64 = 0x40000;

pub struct StrideView {
    inner: SharedStream,
    logical: u64,
    physical: u64,
    pos: u64,
}

impl StrideView {
    /// Drop `trailer` bytes after every `data_block` bytes.
    pub fn deinterleave(inner: SharedStream, data_block: u64, trailer: u64) -> Result<Self> {
        Self::sector_remap(inner, data_block, data_block + trailer)
    }

    /// Map every `logical_period` logical bytes onto the start of each
    /// `physical_period` run of the inner stream.
    pub fn sector_remap(
        inner: SharedStream,
        logical_period: u64,
        physical_period: u64,
    ) -> Result<Self> {
        if logical_period == 0 || logical_period > physical_period {
            return Err(FlashError::format(format!(
                "invalid stride {:#x}/{:#x}",
                logical_period, physical_period
            )));
        }
        Ok(StrideView {
            inner,
            logical: logical_period,
            physical: physical_period,
            pos: 0,
        })
    }

    pub fn hima(inner: SharedStream) -> Result<Self> {
        Self::sector_remap(inner, HIMA_LOGICAL_PERIOD, HIMA_PHYSICAL_PERIOD)
    }

    pub fn physical_of(&self, pos: u64) -> u64 {
        (pos / self.logical) * self.physical + pos % self.logical
    }

    /// Inverse mapping. Positions inside skipped bytes map to the next logical byte.
    pub fn logical_of(&self, real: u64) -> u64 {
        (real / self.physical) * self.logical + (real % self.physical).min(self.logical)
    }
}

impl Stream for StrideView {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        let mut done = 0;
        while done < buf.len() && self.pos < size {
            let within = self.pos % self.logical;
            let n = (buf.len() - done)
                .min((self.logical - within) as usize)
                .min((size - self.pos) as usize);
            let got = self
                .inner
                .read_at(self.physical_of(self.pos), &mut buf[done..done + n])?;
            done += got;
            self.pos += got as u64;
            if got < n {
                break;
            }
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let within = self.pos % self.logical;
            let n = (buf.len() - done).min((self.logical - within) as usize);
            self.inner
                .write_at(self.physical_of(self.pos), &buf[done..done + n])?;
            done += n;
            self.pos += n as u64;
        }
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
        let real = self.physical_of(len);
        self.inner.truncate(real)
    }

    fn size(&self) -> u64 {
        self.logical_of(self.inner.size())
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }
}
