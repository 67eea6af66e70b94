//! File data reassembly (§4.7, C7): data blocks plus an optional tail fragment, decompressed and
//! streamed out in original file order.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::{instrument, trace};

use crate::compressor::{self, Compressor};
use crate::error::SquashfsError;
use crate::inode::NO_FRAGMENT;
use crate::tables::FragmentEntry;

const BLOCK_SIZE_ON_DISK_MASK: u32 = 0x00ff_ffff;
const BLOCK_UNCOMPRESSED_FLAG: u32 = 0x0100_0000;

/// Reads and decompresses data/fragment blocks straight from the underlying image. Unlike
/// [`crate::metadata::MetablockStream`], these blocks are not metablock-framed: their on-disk
/// size comes from the inode's `block_sizes` array or the fragment table, not a 2-byte header.
pub(crate) struct DataReader<R> {
    reader: Rc<RefCell<R>>,
    compressor: Compressor,
    block_size: u32,
    /// Fragment blocks are commonly shared by the tails of several files, so they're cached by
    /// absolute start offset in the same style as [`crate::metadata::MetablockStream`]'s cache.
    fragment_cache: RefCell<FxHashMap<u64, Rc<Vec<u8>>>>,
}

impl<R: Read + Seek> DataReader<R> {
    pub(crate) fn new(reader: Rc<RefCell<R>>, compressor: Compressor, block_size: u32) -> Self {
        Self {
            reader,
            compressor,
            block_size,
            fragment_cache: RefCell::new(FxHashMap::default()),
        }
    }

    /// Reassembles a regular file's content and writes it to `out`.
    ///
    /// Failure modes: a short disk read surfaces as [`SquashfsError::StdIo`] (`UnexpectedEof`), a
    /// codec rejecting a block as [`SquashfsError::CodecFailure`], and an out-of-range fragment
    /// index as [`SquashfsError::FragmentOutOfRange`].
    #[instrument(skip(self, block_sizes, fragments, out))]
    pub(crate) fn reassemble(
        &self,
        blocks_start: u64,
        file_size: u64,
        block_sizes: &[u32],
        frag_index: u32,
        frag_offset: u32,
        fragments: &[FragmentEntry],
        out: &mut dyn Write,
    ) -> Result<(), SquashfsError> {
        let mut cur = blocks_start;
        let mut remaining = file_size;

        for &raw in block_sizes {
            if remaining == 0 {
                break;
            }
            let on_disk = raw & BLOCK_SIZE_ON_DISK_MASK;
            let uncompressed = raw & BLOCK_UNCOMPRESSED_FLAG != 0;

            if on_disk == 0 {
                let take = u64::from(self.block_size).min(remaining);
                write_zeros(out, take)?;
                remaining -= take;
                continue;
            }

            let compressed = self.read_raw(cur, on_disk as usize)?;
            let decompressed = if uncompressed {
                compressed
            } else {
                let mut buf = Vec::with_capacity(self.block_size as usize);
                compressor::decompress(&compressed, &mut buf, self.compressor)?;
                buf
            };
            let take = (decompressed.len() as u64).min(remaining) as usize;
            out.write_all(&decompressed[..take])?;
            remaining -= take as u64;
            cur += u64::from(on_disk);
        }

        if remaining > 0 {
            if frag_index == NO_FRAGMENT {
                return Err(SquashfsError::BadImage);
            }
            let entry = fragments
                .get(frag_index as usize)
                .ok_or(SquashfsError::FragmentOutOfRange(frag_index))?;
            let decompressed = self.fragment_block(entry)?;
            let start = frag_offset as usize;
            let end = start
                .checked_add(remaining as usize)
                .ok_or(SquashfsError::BadImage)?;
            let tail = decompressed
                .get(start..end)
                .ok_or(SquashfsError::Truncated {
                    wanted: end,
                    got: decompressed.len(),
                })?;
            out.write_all(tail)?;
        }
        Ok(())
    }

    fn fragment_block(&self, entry: &FragmentEntry) -> Result<Rc<Vec<u8>>, SquashfsError> {
        if let Some(cached) = self.fragment_cache.borrow().get(&entry.start) {
            trace!(start = entry.start, "fragment block cache hit");
            return Ok(cached.clone());
        }
        let compressed = self.read_raw(entry.start, entry.size_on_disk() as usize)?;
        let decompressed = if entry.is_uncompressed() {
            compressed
        } else {
            let mut buf = Vec::with_capacity(self.block_size as usize);
            compressor::decompress(&compressed, &mut buf, self.compressor)?;
            buf
        };
        let rc = Rc::new(decompressed);
        self.fragment_cache
            .borrow_mut()
            .insert(entry.start, rc.clone());
        Ok(rc)
    }

    fn read_raw(&self, abs_offset: u64, len: usize) -> Result<Vec<u8>, SquashfsError> {
        let mut reader = self.reader.borrow_mut();
        reader.seek(SeekFrom::Start(abs_offset))?;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn write_zeros(out: &mut dyn Write, mut n: u64) -> Result<(), SquashfsError> {
    const CHUNK: usize = 8192;
    let zeros = [0u8; CHUNK];
    while n > 0 {
        let take = n.min(CHUNK as u64) as usize;
        out.write_all(&zeros[..take])?;
        n -= take as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader_over(bytes: Vec<u8>, block_size: u32) -> DataReader<Cursor<Vec<u8>>> {
        DataReader::new(Rc::new(RefCell::new(Cursor::new(bytes))), Compressor::None, block_size)
    }

    #[test]
    fn reassembles_single_uncompressed_block() {
        let data = b"hello world!!!!!".to_vec();
        let reader = reader_over(data.clone(), 16);
        let mut out = Vec::new();
        reader
            .reassemble(0, 16, &[16 | BLOCK_UNCOMPRESSED_FLAG], NO_FRAGMENT, 0, &[], &mut out)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn sparse_block_emits_zeros() {
        let reader = reader_over(Vec::new(), 16);
        let mut out = Vec::new();
        reader
            .reassemble(0, 16, &[0], NO_FRAGMENT, 0, &[], &mut out)
            .unwrap();
        assert_eq!(out, vec![0u8; 16]);
    }

    #[test]
    fn tail_fragment_is_read_and_cached() {
        let mut image = vec![0u8; 8];
        image.extend_from_slice(b"tail-data");
        let reader = reader_over(image, 16);
        let fragments = vec![FragmentEntry {
            start: 8,
            size_raw: 9 | BLOCK_UNCOMPRESSED_FLAG,
            _unused: 0,
        }];
        let mut out = Vec::new();
        reader
            .reassemble(0, 4, &[], 0, 0, &fragments, &mut out)
            .unwrap();
        assert_eq!(out, b"tail");
    }

    #[test]
    fn out_of_range_fragment_index_errors() {
        let reader = reader_over(Vec::new(), 16);
        let mut out = Vec::new();
        let err = reader
            .reassemble(0, 4, &[], 3, 0, &[], &mut out)
            .unwrap_err();
        assert!(matches!(err, SquashfsError::FragmentOutOfRange(3)));
    }
}
