//! Lookup tables (§4.4, C4): id table, fragment table, xattr lookup table.
//!
//! Each table is a flat array of fixed-size records split across metablocks, indexed via a plain
//! (uncompressed, directly on-disk) array of absolute metablock pointers. All three readers are
//! lazy, computed on first use and cached for the image handle's lifetime, and all three treat
//! the sentinel offset (§3) as "table absent", yielding an empty array rather than an error.

use std::cell::RefCell;
use std::io::{Read, Seek};

use deku::prelude::*;

use crate::error::SquashfsError;
use crate::metadata::{MetablockStream, METADATA_MAXSIZE};
use crate::superblock::NOT_SET;

const ID_ENTRIES_PER_BLOCK: usize = METADATA_MAXSIZE / 4;
const FRAGMENT_ENTRIES_PER_BLOCK: usize = METADATA_MAXSIZE / FragmentEntry::SIZE;
const XATTR_LOOKUP_ENTRIES_PER_BLOCK: usize = METADATA_MAXSIZE / XattrLookupEntry::SIZE;

#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct FragmentEntry {
    pub(crate) start: u64,
    pub(crate) size_raw: u32,
    pub(crate) _unused: u32,
}

impl FragmentEntry {
    const SIZE: usize = 16;

    pub(crate) fn size_on_disk(&self) -> u32 {
        self.size_raw & 0x00ff_ffff
    }

    pub(crate) fn is_uncompressed(&self) -> bool {
        self.size_raw & 0x0100_0000 != 0
    }
}

#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct XattrLookupEntry {
    /// Metadata reference into the key/value stream; base is the KV stream's own absolute start.
    pub(crate) kv_ref: u64,
    pub(crate) count: u32,
    pub(crate) size: u32,
}

impl XattrLookupEntry {
    const SIZE: usize = 16;
}

/// Reads the flat pointer array of `n` absolute `u64` metablock offsets located at `table_start`.
fn read_pointer_array<R: Read + Seek>(
    stream: &MetablockStream<R>,
    table_start: u64,
    n: usize,
) -> Result<Vec<u64>, SquashfsError> {
    let raw = stream.read_raw(table_start, n * 8)?;
    Ok(raw
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

/// Lazily loaded, cached UID/GID lookup table.
pub(crate) struct IdTable(RefCell<Option<Vec<u32>>>);

impl IdTable {
    pub(crate) fn new() -> Self {
        Self(RefCell::new(None))
    }

    pub(crate) fn get<R: Read + Seek>(
        &self,
        stream: &MetablockStream<R>,
        table_start: u64,
        id_count: u16,
    ) -> Result<Vec<u32>, SquashfsError> {
        if let Some(ids) = self.0.borrow().as_ref() {
            return Ok(ids.clone());
        }
        let ids = if table_start == NOT_SET || id_count == 0 {
            Vec::new()
        } else {
            let id_count = id_count as usize;
            let n_blocks = (id_count + ID_ENTRIES_PER_BLOCK - 1) / ID_ENTRIES_PER_BLOCK;
            let pointers = read_pointer_array(stream, table_start, n_blocks)?;
            let mut ids = Vec::with_capacity(id_count);
            for ptr in pointers {
                let (data, _next) = stream.read_metablock(ptr)?;
                for chunk in data.chunks_exact(4) {
                    if ids.len() == id_count {
                        break;
                    }
                    ids.push(u32::from_le_bytes(chunk.try_into().unwrap()));
                }
            }
            ids
        };
        *self.0.borrow_mut() = Some(ids.clone());
        Ok(ids)
    }
}

/// Lazily loaded, cached fragment (tail-fragment descriptor) table.
pub(crate) struct FragmentTable(RefCell<Option<Vec<FragmentEntry>>>);

impl FragmentTable {
    pub(crate) fn new() -> Self {
        Self(RefCell::new(None))
    }

    pub(crate) fn get<R: Read + Seek>(
        &self,
        stream: &MetablockStream<R>,
        table_start: u64,
        frag_count: u32,
    ) -> Result<Vec<FragmentEntry>, SquashfsError> {
        if let Some(entries) = self.0.borrow().as_ref() {
            return Ok(entries.clone());
        }
        let entries = if table_start == NOT_SET || frag_count == 0 {
            Vec::new()
        } else {
            let frag_count = frag_count as usize;
            let n_blocks = (frag_count + FRAGMENT_ENTRIES_PER_BLOCK - 1) / FRAGMENT_ENTRIES_PER_BLOCK;
            let pointers = read_pointer_array(stream, table_start, n_blocks)?;
            let mut entries = Vec::with_capacity(frag_count);
            for ptr in pointers {
                let (data, _next) = stream.read_metablock(ptr)?;
                let mut rest: &[u8] = &data;
                while entries.len() < frag_count && rest.len() >= FragmentEntry::SIZE {
                    let ((new_rest, _bits), entry) = FragmentEntry::from_bytes((rest, 0))?;
                    rest = new_rest;
                    entries.push(entry);
                }
            }
            entries
        };
        *self.0.borrow_mut() = Some(entries.clone());
        Ok(entries)
    }
}

/// The 16-byte xattr table header: `{kv_stream_abs_start, xattr_ids, _pad}`.
#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
struct XattrTableHeader {
    kv_stream_abs_start: u64,
    xattr_ids: u32,
    _pad: u32,
}

/// Lazily loaded, cached xattr id-lookup table, plus the KV stream base it resolves against.
pub(crate) struct XattrTable(RefCell<Option<(u64, Vec<XattrLookupEntry>)>>);

impl XattrTable {
    pub(crate) fn new() -> Self {
        Self(RefCell::new(None))
    }

    /// Returns `(kv_stream_abs_start, lookup_entries)`, both empty/zero when the table is absent.
    pub(crate) fn get<R: Read + Seek>(
        &self,
        stream: &MetablockStream<R>,
        table_start: u64,
    ) -> Result<(u64, Vec<XattrLookupEntry>), SquashfsError> {
        if let Some(v) = self.0.borrow().as_ref() {
            return Ok(v.clone());
        }
        let result = if table_start == NOT_SET {
            (0, Vec::new())
        } else {
            let header_bytes = stream.read_raw(table_start, 16)?;
            let ((_rest, _bits), header) = XattrTableHeader::from_bytes((&header_bytes, 0))?;
            let xattr_ids = header.xattr_ids as usize;
            let n_blocks = (xattr_ids + XATTR_LOOKUP_ENTRIES_PER_BLOCK - 1) / XATTR_LOOKUP_ENTRIES_PER_BLOCK;
            let pointers = read_pointer_array(stream, table_start + 16, n_blocks)?;
            let mut entries = Vec::with_capacity(xattr_ids);
            for ptr in pointers {
                let (data, _next) = stream.read_metablock(ptr)?;
                let mut rest: &[u8] = &data;
                while entries.len() < xattr_ids && rest.len() >= XattrLookupEntry::SIZE {
                    let ((new_rest, _bits), entry) = XattrLookupEntry::from_bytes((rest, 0))?;
                    rest = new_rest;
                    entries.push(entry);
                }
            }
            (header.kv_stream_abs_start, entries)
        };
        *self.0.borrow_mut() = Some(result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::Compressor;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::io::Cursor;

    fn metablock(payload: &[u8]) -> Vec<u8> {
        let header = (payload.len() as u16) | 0x8000;
        let mut out = header.to_le_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn id_table_collects_values_across_blocks() {
        let mut ids_payload = Vec::new();
        for v in 0u32..3 {
            ids_payload.extend_from_slice(&v.to_le_bytes());
        }
        let block = metablock(&ids_payload);

        let mut image = 8u64.to_le_bytes().to_vec(); // pointer array: one pointer to offset 8
        image.extend_from_slice(&block);

        let stream = MetablockStream::new(Rc::new(RefCell::new(Cursor::new(image))), Compressor::None);
        let table = IdTable::new();
        let ids = table.get(&stream, 0, 3).unwrap();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn missing_table_is_empty() {
        let stream = MetablockStream::new(Rc::new(RefCell::new(Cursor::new(Vec::<u8>::new()))), Compressor::None);
        let table = FragmentTable::new();
        let entries = table.get(&stream, NOT_SET, 0).unwrap();
        assert!(entries.is_empty());
    }
}
