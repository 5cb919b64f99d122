//! Byte stores and the shared stream handle
//!
//! Every layer of the engine talks to a [`Stream`]: a seekable, resizable,
//! byte-addressed store. Leaf stores wrap memory, files or memory maps;
//! transforms in [`crate::transform`] wrap other streams through a
//! [`SharedStream`] so several logical views can alias the same bytes.

use crate::error::{FlashError, Result};
use memmap2::{Mmap, MmapMut};
use parking_lot::{Mutex, MutexGuard};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Seekable random-access byte store.
///
/// Positions are in the stream's own logical address space. `read` returns
/// the number of bytes produced, 0 at end of stream.
pub trait Stream: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<()>;
    fn set_pos(&mut self, pos: u64) -> Result<()>;
    fn pos(&self) -> u64;
    fn truncate(&mut self, len: u64) -> Result<()>;
    fn size(&self) -> u64;

    fn eof(&self) -> bool {
        self.pos() >= self.size()
    }

    fn is_read_only(&self) -> bool {
        false
    }

    /// Perform deferred work. Calling it again without intervening writes is a no-op.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Reference-counted handle to a stream shared between transform layers.
#[derive(Clone)]
pub struct SharedStream(Arc<Mutex<Box<dyn Stream>>>);

impl std::fmt::Debug for SharedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStream")
            .field("size", &self.size())
            .finish()
    }
}

impl SharedStream {
    pub fn new<S: Stream + 'static>(stream: S) -> Self {
        SharedStream(Arc::new(Mutex::new(Box::new(stream))))
    }

    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Stream>> {
        self.0.lock()
    }

    /// Read as many bytes as available at `pos`, looping over short reads.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let mut s = self.0.lock();
        s.set_pos(pos)?;
        let mut done = 0;
        while done < buf.len() {
            let n = s.read(&mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    pub fn read_exact_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at(pos, buf)?;
        if n < buf.len() {
            return Err(FlashError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read at {:#x}: {} of {} bytes", pos, n, buf.len()),
            )));
        }
        Ok(())
    }

    pub fn read_vec(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(pos, &mut buf)?;
        Ok(buf)
    }

    /// Like [`read_vec`](Self::read_vec) but truncated at end of stream.
    pub fn read_upto(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.read_at(pos, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn read_u32_at(&self, pos: u64) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_exact_at(pos, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn write_at(&self, pos: u64, buf: &[u8]) -> Result<()> {
        let mut s = self.0.lock();
        if s.is_read_only() {
            return Err(FlashError::ReadOnlyViolation);
        }
        s.set_pos(pos)?;
        s.write(buf)
    }

    pub fn write_u32_at(&self, pos: u64, value: u32) -> Result<()> {
        self.write_at(pos, &value.to_le_bytes())
    }

    /// Fill `len` bytes at `pos` with `byte`.
    pub fn fill_at(&self, pos: u64, len: u64, byte: u8) -> Result<()> {
        const STEP: u64 = 0x10000;
        let chunk = vec![byte; len.min(STEP) as usize];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(STEP) as usize;
            self.write_at(pos + done, &chunk[..n])?;
            done += n as u64;
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.0.lock().size()
    }

    pub fn truncate(&self, len: u64) -> Result<()> {
        self.0.lock().truncate(len)
    }

    pub fn is_read_only(&self) -> bool {
        self.0.lock().is_read_only()
    }

    pub fn flush(&self) -> Result<()> {
        self.0.lock().flush()
    }

    /// True when both handles refer to the same underlying stream.
    pub fn same_as(&self, other: &SharedStream) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Stream for SharedStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.0.lock().read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let mut s = self.0.lock();
        if s.is_read_only() {
            return Err(FlashError::ReadOnlyViolation);
        }
        s.write(buf)
    }

    fn set_pos(&mut self, pos: u64) -> Result<()> {
        self.0.lock().set_pos(pos)
    }

    fn pos(&self) -> u64 {
        self.0.lock().pos()
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.0.lock().truncate(len)
    }

    fn size(&self) -> u64 {
        self.0.lock().size()
    }

    fn is_read_only(&self) -> bool {
        self.0.lock().is_read_only()
    }

    fn flush(&mut self) -> Result<()> {
        self.0.lock().flush()
    }
}

/// Prior contents of every range a mutation overwrote.
///
/// [`rollback`](Self::rollback) writes them back newest first, so a failed
/// mutation leaves the bytes of the stream as they were when the log began.
#[derive(Debug)]
pub struct UndoLog {
    size: u64,
    images: Vec<(u64, Vec<u8>)>,
}

impl UndoLog {
    pub fn begin(stream: &SharedStream) -> Self {
        UndoLog {
            size: stream.size(),
            images: Vec::new(),
        }
    }

    /// Save `len` bytes at `pos` ahead of a write. Bytes past the end of
    /// the stream have no prior contents and are not saved.
    pub fn record(&mut self, stream: &SharedStream, pos: u64, len: u64) -> Result<()> {
        if len == 0 || pos >= stream.size() {
            return Ok(());
        }
        let old = stream.read_upto(pos, len as usize)?;
        self.images.push((pos, old));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn rollback(self, stream: &SharedStream) -> Result<()> {
        for (pos, old) in self.images.iter().rev() {
            stream.write_at(*pos, old)?;
        }
        if stream.size() > self.size {
            if let Err(e) = stream.truncate(self.size) {
                tracing::debug!("undo: stream stays at {:#x} bytes: {}", stream.size(), e);
            }
        }
        Ok(())
    }
}

/// Growable in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Vec<u8>,
    pos: u64,
    read_only: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        MemoryStore {
            data,
            pos: 0,
            read_only: false,
        }
    }

    pub fn read_only(data: Vec<u8>) -> Self {
        MemoryStore {
            data,
            pos: 0,
            read_only: true,
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Stream for MemoryStore {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let start = (self.pos as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(FlashError::ReadOnlyViolation);
        }
        let start = usize::try_from(self.pos).map_err(|_| FlashError::AddressOverflow {
            offset: self.pos,
            length: buf.len() as u64,
        })?;
        let end = start + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
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
        if self.read_only {
            return Err(FlashError::ReadOnlyViolation);
        }
        self.data.resize(len as usize, 0);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Disk-backed store over a regular file.
pub struct FileStore {
    file: File,
    path: PathBuf,
    pos: u64,
    len: u64,
    read_only: bool,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;
        let len = file.metadata()?.len();
        Ok(FileStore {
            file,
            path: path.as_ref().to_path_buf(),
            pos: 0,
            len,
            read_only,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(FileStore {
            file,
            path: path.as_ref().to_path_buf(),
            pos: 0,
            len: 0,
            read_only: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Stream for FileStore {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(self.pos))?;
        let want = buf.len().min((self.len - self.pos) as usize);
        let n = self.file.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(FlashError::ReadOnlyViolation);
        }
        self.file.seek(SeekFrom::Start(self.pos))?;
        self.file.write_all(buf)?;
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
        if self.read_only {
            return Err(FlashError::ReadOnlyViolation);
        }
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.len
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn flush(&mut self) -> Result<()> {
        if !self.read_only {
            self.file.flush()?;
        }
        Ok(())
    }
}

enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
    Empty,
}

/// Memory-mapped store. Read-write maps grow by resizing the file and remapping.
pub struct MmapStore {
    file: File,
    map: Mapping,
    pos: u64,
    read_only: bool,
}

impl MmapStore {
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;
        let map = Self::map_file(&file, read_only)?;
        Ok(MmapStore {
            file,
            map,
            pos: 0,
            read_only,
        })
    }

    fn map_file(file: &File, read_only: bool) -> Result<Mapping> {
        if file.metadata()?.len() == 0 {
            // zero-length maps are rejected on some platforms
            return Ok(Mapping::Empty);
        }
        // SAFETY: the store assumes exclusive ownership of the image file for its lifetime.
        let map = unsafe {
            if read_only {
                Mapping::ReadOnly(Mmap::map(file)?)
            } else {
                Mapping::ReadWrite(MmapMut::map_mut(file)?)
            }
        };
        Ok(map)
    }

    fn bytes(&self) -> &[u8] {
        match &self.map {
            Mapping::ReadOnly(m) => m,
            Mapping::ReadWrite(m) => m,
            Mapping::Empty => &[],
        }
    }

    fn resize(&mut self, len: u64) -> Result<()> {
        if let Mapping::ReadWrite(m) = &self.map {
            m.flush()?;
        }
        self.map = Mapping::Empty;
        self.file.set_len(len)?;
        self.map = Self::map_file(&self.file, false)?;
        Ok(())
    }
}

impl Stream for MmapStore {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let data = self.bytes();
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(FlashError::ReadOnlyViolation);
        }
        let end = self.pos + buf.len() as u64;
        if end > self.size() {
            self.resize(end)?;
        }
        let start = self.pos as usize;
        if let Mapping::ReadWrite(m) = &mut self.map {
            m[start..start + buf.len()].copy_from_slice(buf);
        }
        self.pos = end;
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
        if self.read_only {
            return Err(FlashError::ReadOnlyViolation);
        }
        self.resize(len)
    }

    fn size(&self) -> u64 {
        self.bytes().len() as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn flush(&mut self) -> Result<()> {
        if let Mapping::ReadWrite(m) = &self.map {
            m.flush()?;
        }
        Ok(())
    }
}

pub(crate) fn le_u16(buf: &[u8], ofs: usize) -> u16 {
    u16::from_le_bytes([buf[ofs], buf[ofs + 1]])
}

pub(crate) fn le_u32(buf: &[u8], ofs: usize) -> u32 {
    u32::from_le_bytes([buf[ofs], buf[ofs + 1], buf[ofs + 2], buf[ofs + 3]])
}

pub(crate) fn le_u64(buf: &[u8], ofs: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[ofs..ofs + 8]);
    u64::from_le_bytes(b)
}

pub(crate) fn put_u16(buf: &mut [u8], ofs: usize, v: u16) {
    buf[ofs..ofs + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], ofs: usize, v: u32) {
    buf[ofs..ofs + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], ofs: usize, v: u64) {
    buf[ofs..ofs + 8].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_memory_store_grows_on_write() {
        let s = SharedStream::new(MemoryStore::new());
        s.write_at(4, b"abcd").unwrap();
        assert_eq!(s.size(), 8);
        assert_eq!(s.read_vec(0, 8).unwrap(), b"\0\0\0\0abcd");
    }

    #[test]
    fn test_read_only_memory_store() {
        let s = SharedStream::new(MemoryStore::read_only(vec![1, 2, 3]));
        assert!(matches!(
            s.write_at(0, b"x"),
            Err(FlashError::ReadOnlyViolation)
        ));
        assert_eq!(s.read_vec(0, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_short_read_is_error() {
        let s = SharedStream::new(MemoryStore::from_vec(vec![0; 4]));
        assert!(s.read_vec(2, 4).is_err());
        assert_eq!(s.read_upto(2, 4).unwrap().len(), 2);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), vec![0xaau8; 16]).unwrap();

        let s = SharedStream::new(FileStore::open(tmp.path(), false).unwrap());
        s.write_u32_at(16, 0x1234_5678).unwrap();
        assert_eq!(s.size(), 20);
        assert_eq!(s.read_u32_at(16).unwrap(), 0x1234_5678);
        s.truncate(8).unwrap();
        assert_eq!(s.size(), 8);
        drop(s);

        let ro = SharedStream::new(FileStore::open(tmp.path(), true).unwrap());
        assert!(ro.is_read_only());
        assert_eq!(ro.read_vec(0, 8).unwrap(), vec![0xaa; 8]);
    }

    #[test]
    fn test_mmap_store_grows() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"hello").unwrap();

        let s = SharedStream::new(MmapStore::open(tmp.path(), false).unwrap());
        s.write_at(5, b" world").unwrap();
        s.flush().unwrap();
        assert_eq!(s.read_vec(0, 11).unwrap(), b"hello world");
        drop(s);

        assert_eq!(std::fs::read(tmp.path()).unwrap(), b"hello world");
    }

    #[test]
    fn test_undo_log_restores_overwritten_bytes() {
        let s = SharedStream::new(MemoryStore::from_vec(b"0123456789".to_vec()));
        let mut undo = UndoLog::begin(&s);
        undo.record(&s, 2, 4).unwrap();
        s.write_at(2, b"abcd").unwrap();
        undo.record(&s, 4, 8).unwrap();
        s.write_at(4, b"WXYZWXYZ").unwrap();
        assert_eq!(s.size(), 12);
        assert!(!undo.is_empty());

        undo.rollback(&s).unwrap();
        assert_eq!(s.size(), 10);
        assert_eq!(s.read_vec(0, 10).unwrap(), b"0123456789");
    }
}
