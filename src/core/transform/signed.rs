//! Signed block container ("R000FF")
//!
//! ```text
//! 0x00  "R000FF\n"
//! 0x07  guid[16]
//! 0x17  blocks: { data_size u32, sig_size u32, flag u8, data, signature }*
//! ```
//!
//! A block with flag 2 ends the container. The logical stream is the
//! concatenation of every block's data. Signatures are produced by an
//! external [`BlockSigner`]; without one, written blocks keep their stale
//! signature and a warning is logged at flush.

use crate::error::{FlashError, Result};
use crate::io::{le_u32, SharedStream, Stream};
use std::sync::Arc;

pub const SIGNED_TAG: &[u8; 7] = b"R000FF\n";
const BLOCKS_START: u64 = 0x17;
const BLOCK_HEADER_LEN: u64 = 9;
const LAST_BLOCK_FLAG: u8 = 2;

/// Check for the 7-byte signed-container tag at `offset`.
pub fn is_signed_blocks(store: &SharedStream, offset: u64) -> bool {
    let mut tag = [0u8; 7];
    matches!(store.read_at(offset, &mut tag), Ok(7)) && &tag == SIGNED_TAG
}

/// Produces block signatures.
///
/// `message` is `data || 12 zero bytes || flag || guid || sequence (u32 LE)`;
/// the signer hashes and signs it and must return exactly `signature_len` bytes.
pub trait BlockSigner: Send + Sync {
    fn sign(&self, message: &[u8], signature_len: usize) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
struct SignedBlock {
    data_ofs: u64,
    data_size: u32,
    sig_size: u32,
    flag: u8,
    logical: u64,
    modified: bool,
}

pub struct SignedBlockView {
    inner: SharedStream,
    guid: [u8; 16],
    blocks: Vec<SignedBlock>,
    size: u64,
    pos: u64,
    signer: Option<Arc<dyn BlockSigner>>,
}

impl SignedBlockView {
    pub fn open(inner: SharedStream, signer: Option<Arc<dyn BlockSigner>>) -> Result<Self> {
        let mut header = [0u8; BLOCKS_START as usize];
        if inner.read_at(0, &mut header)? < header.len() || &header[..7] != SIGNED_TAG {
            return Err(FlashError::format("missing R000FF tag"));
        }
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&header[7..23]);

        let total = inner.size();
        let mut blocks = Vec::new();
        let mut pos = BLOCKS_START;
        let mut logical = 0u64;
        let mut terminated = false;
        while pos + BLOCK_HEADER_LEN <= total {
            let hdr = inner.read_vec(pos, BLOCK_HEADER_LEN as usize)?;
            let data_size = le_u32(&hdr, 0);
            let sig_size = le_u32(&hdr, 4);
            let flag = hdr[8];
            let data_ofs = pos + BLOCK_HEADER_LEN;
            let next = data_ofs + data_size as u64 + sig_size as u64;
            if next > total {
                return Err(FlashError::format(format!(
                    "R000FF block at {:#x} runs past end of container",
                    pos
                )));
            }
            blocks.push(SignedBlock {
                data_ofs,
                data_size,
                sig_size,
                flag,
                logical,
                modified: false,
            });
            logical += data_size as u64;
            pos = next;
            if flag == LAST_BLOCK_FLAG {
                terminated = true;
                break;
            }
        }
        if !terminated {
            tracing::warn!("R000FF container has no final block");
        }
        tracing::info!("R000FF: {} blocks, {:#x} data bytes", blocks.len(), logical);

        Ok(SignedBlockView {
            inner,
            guid,
            blocks,
            size: logical,
            pos: 0,
            signer,
        })
    }

    pub fn guid(&self) -> [u8; 16] {
        self.guid
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Index of the block holding logical position `pos`
    fn block_at(&self, pos: u64) -> Option<usize> {
        let idx = self.blocks.partition_point(|b| b.logical <= pos);
        if idx == 0 {
            return None;
        }
        let b = &self.blocks[idx - 1];
        (pos < b.logical + b.data_size as u64).then_some(idx - 1)
    }

    fn signed_message(&self, idx: usize) -> Result<Vec<u8>> {
        let b = &self.blocks[idx];
        let mut msg = self.inner.read_vec(b.data_ofs, b.data_size as usize)?;
        msg.extend_from_slice(&[0u8; 12]);
        msg.push(b.flag);
        msg.extend_from_slice(&self.guid);
        msg.extend_from_slice(&(idx as u32).to_le_bytes());
        Ok(msg)
    }
}

impl Stream for SignedBlockView {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let Some(idx) = self.block_at(self.pos) else {
                break;
            };
            let b = &self.blocks[idx];
            let within = self.pos - b.logical;
            let n = (buf.len() - done).min((b.data_size as u64 - within) as usize);
            let got = self
                .inner
                .read_at(b.data_ofs + within, &mut buf[done..done + n])?;
            done += got;
            self.pos += got as u64;
            if got < n {
                break;
            }
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let end = self.pos + buf.len() as u64;
        if end > self.size {
            return Err(FlashError::OutOfRange {
                pos: end,
                limit: self.size,
            });
        }
        let mut done = 0;
        while done < buf.len() {
            let idx = self.block_at(self.pos).ok_or(FlashError::OutOfRange {
                pos: self.pos,
                limit: self.size,
            })?;
            let b = &mut self.blocks[idx];
            let within = self.pos - b.logical;
            let n = (buf.len() - done).min((b.data_size as u64 - within) as usize);
            self.inner
                .write_at(b.data_ofs + within, &buf[done..done + n])?;
            b.modified = true;
            done += n;
            self.pos += n as u64;
        }
        Ok(())
    }

    fn set_pos(&mut self, pos: u64) -> Result<()> {
        if pos > self.size {
            return Err(FlashError::OutOfRange {
                pos,
                limit: self.size,
            });
        }
        self.pos = pos;
        Ok(())
    }

    fn pos(&self) -> u64 {
        self.pos
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        Err(FlashError::Unsupported(format!(
            "resizing a signed container to {:#x}",
            len
        )))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn flush(&mut self) -> Result<()> {
        let modified: Vec<usize> = (0..self.blocks.len())
            .filter(|&i| self.blocks[i].modified)
            .collect();
        if modified.is_empty() {
            return Ok(());
        }
        match self.signer.clone() {
            Some(signer) => {
                for &idx in &modified {
                    let msg = self.signed_message(idx)?;
                    let b = &self.blocks[idx];
                    let sig = signer.sign(&msg, b.sig_size as usize)?;
                    if sig.len() != b.sig_size as usize {
                        return Err(FlashError::format(format!(
                            "signer returned {} bytes, block {} needs {}",
                            sig.len(),
                            idx,
                            b.sig_size
                        )));
                    }
                    self.inner
                        .write_at(b.data_ofs + b.data_size as u64, &sig)?;
                }
                tracing::debug!("R000FF: re-signed {} blocks", modified.len());
            }
            None => {
                tracing::warn!(
                    "R000FF: {} modified blocks left with stale signatures",
                    modified.len()
                );
            }
        }
        for idx in modified {
            self.blocks[idx].modified = false;
        }
        Ok(())
    }
}

impl Drop for SignedBlockView {
    fn drop(&mut self) {
        if self.blocks.iter().any(|b| b.modified) {
            if let Err(e) = Stream::flush(self) {
                tracing::warn!("R000FF flush on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStore;
    use parking_lot::Mutex;

    fn build(blocks: &[(&[u8], u8)], sig_len: usize) -> Vec<u8> {
        let mut out = SIGNED_TAG.to_vec();
        out.extend_from_slice(&[0x11; 16]);
        for (data, flag) in blocks {
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(sig_len as u32).to_le_bytes());
            out.push(*flag);
            out.extend_from_slice(data);
            out.extend(std::iter::repeat(0xcc).take(sig_len));
        }
        out
    }

    #[derive(Default)]
    struct RecordingSigner {
        messages: Mutex<Vec<Vec<u8>>>,
    }

    impl BlockSigner for RecordingSigner {
        fn sign(&self, message: &[u8], len: usize) -> Result<Vec<u8>> {
            self.messages.lock().push(message.to_vec());
            Ok(vec![0x5a; len])
        }
    }

    #[test]
    fn test_concatenates_block_data() {
        let store = SharedStream::new(MemoryStore::from_vec(build(
            &[(b"hello ", 1), (b"world", 1), (b"", 2)],
            4,
        )));
        assert!(is_signed_blocks(&store, 0));
        let view = SharedStream::new(SignedBlockView::open(store, None).unwrap());
        assert_eq!(view.size(), 11);
        assert_eq!(view.read_vec(0, 11).unwrap(), b"hello world");
        assert_eq!(view.read_vec(4, 4).unwrap(), b"o wo");
    }

    #[test]
    fn test_write_resigns_only_touched_blocks() {
        let store = SharedStream::new(MemoryStore::from_vec(build(
            &[(b"aaaa", 1), (b"bbbb", 1), (b"", 2)],
            4,
        )));
        let signer = Arc::new(RecordingSigner::default());
        let view = SharedStream::new(
            SignedBlockView::open(store.clone(), Some(signer.clone())).unwrap(),
        );
        view.write_at(5, b"X").unwrap();
        view.flush().unwrap();

        let messages = signer.messages.lock();
        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert_eq!(&msg[..4], b"bXbb");
        assert_eq!(&msg[4..16], &[0u8; 12]);
        assert_eq!(msg[16], 1);
        assert_eq!(&msg[17..33], &[0x11; 16]);
        assert_eq!(&msg[33..], &1u32.to_le_bytes());

        // second block's signature follows its data
        let sig_ofs = 0x17 + 9 + 4 + 4 + 9 + 4;
        assert_eq!(store.read_vec(sig_ofs, 4).unwrap(), vec![0x5a; 4]);
        // first block untouched
        assert_eq!(store.read_vec(0x17 + 9 + 4, 4).unwrap(), vec![0xcc; 4]);
    }

    #[test]
    fn test_write_past_end_rejected() {
        let store = SharedStream::new(MemoryStore::from_vec(build(&[(b"ab", 2)], 0)));
        let view = SharedStream::new(SignedBlockView::open(store, None).unwrap());
        assert!(matches!(
            view.write_at(1, b"xy"),
            Err(FlashError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_truncated_block_is_format_error() {
        let mut bytes = build(&[(b"abcdef", 2)], 0);
        bytes.truncate(bytes.len() - 2);
        let store = SharedStream::new(MemoryStore::from_vec(bytes));
        assert!(matches!(SignedBlockView::open(store, None), Err(e) if e.is_format()));
    }
}
