//! Xattr decoding (§4.8, C8): given a lookup index, resolve the full set of extended attribute
//! key/value pairs for an inode.

use std::io::{Read, Seek};

use deku::prelude::*;
use tracing::{instrument, warn};

use crate::error::SquashfsError;
use crate::metadata::MetablockStream;
use crate::tables::{XattrLookupEntry, XattrTable};

/// A single decoded xattr: a `namespace.name` key, and its raw value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Xattr {
    pub(crate) key: String,
    pub(crate) value: Vec<u8>,
}

fn namespace_prefix(type_: u16) -> Option<&'static str> {
    match type_ & 0xff {
        0 => Some("user"),
        1 => Some("trusted"),
        2 => Some("security"),
        _ => None,
    }
}

const VALUE_IS_REFERENCE: u16 = 1 << 8;

#[derive(Debug, DekuRead, Clone)]
#[deku(endian = "little")]
struct PairHeader {
    type_: u16,
    name_size: u16,
    #[deku(count = "*name_size")]
    name: Vec<u8>,
    value_size: u32,
}

/// Resolve every `(key, value)` pair for xattr lookup index `idx`.
#[instrument(skip(stream, table))]
pub(crate) fn decode<R: Read + Seek>(
    stream: &MetablockStream<R>,
    table: &XattrTable,
    table_start: u64,
    idx: u32,
) -> Result<Vec<Xattr>, SquashfsError> {
    let (kv_base, entries) = table.get(stream, table_start)?;
    let Some(entry) = entries.get(idx as usize) else {
        return Err(SquashfsError::BadImage);
    };
    decode_entry(stream, kv_base, entry)
}

fn decode_entry<R: Read + Seek>(
    stream: &MetablockStream<R>,
    kv_base: u64,
    entry: &XattrLookupEntry,
) -> Result<Vec<Xattr>, SquashfsError> {
    let abs = kv_base + (entry.kv_ref >> 16);
    let off = (entry.kv_ref & 0xffff) as usize;
    let bytes = stream.read_span_from_abs(abs, off, entry.size as usize)?;

    let mut rest: &[u8] = &bytes;
    let mut out = Vec::with_capacity(entry.count as usize);
    for _ in 0..entry.count {
        if rest.is_empty() {
            break;
        }
        let ((new_rest, _bits), header) = PairHeader::from_bytes((rest, 0))?;
        rest = new_rest;

        let is_ref = header.type_ & VALUE_IS_REFERENCE != 0;
        let value = if is_ref {
            if rest.len() < 8 {
                break;
            }
            let vref = u64::from_le_bytes(rest[..8].try_into().unwrap());
            rest = &rest[8..];
            let vabs = kv_base + (vref >> 16);
            let voff = (vref & 0xffff) as usize;
            let len_bytes = stream.read_span_from_abs(vabs, voff, 4)?;
            let len = u32::from_le_bytes(len_bytes[..4].try_into().unwrap()) as usize;
            stream.read_span_from_abs(vabs, voff + 4, len)?
        } else {
            let take = (header.value_size as usize).min(rest.len());
            let value = rest[..take].to_vec();
            rest = &rest[take..];
            value
        };

        match namespace_prefix(header.type_) {
            Some(prefix) => {
                let name = String::from_utf8_lossy(&header.name);
                out.push(Xattr {
                    key: format!("{prefix}.{name}"),
                    value,
                });
            },
            None => {
                warn!(type_ = header.type_, "skipping xattr with unknown namespace");
            },
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::Compressor;
    use crate::superblock::NOT_SET;
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
    fn decodes_user_namespace_pair() {
        let mut pair = Vec::new();
        pair.extend_from_slice(&0u16.to_le_bytes()); // type = user, inline value
        pair.extend_from_slice(&4u16.to_le_bytes()); // name_size
        pair.extend_from_slice(b"demo");
        pair.extend_from_slice(&3u32.to_le_bytes()); // value_size
        pair.extend_from_slice(b"yes");
        let kv_block = metablock(&pair);

        // KV stream base at 0; entry ref points at block offset 0, intra-offset 0.
        let entry = XattrLookupEntry {
            kv_ref: 0,
            count: 1,
            size: pair.len() as u32,
        };

        let stream = MetablockStream::new(Rc::new(RefCell::new(Cursor::new(kv_block))), Compressor::None);
        let xattrs = decode_entry(&stream, 0, &entry).unwrap();
        assert_eq!(xattrs.len(), 1);
        assert_eq!(xattrs[0].key, "user.demo");
        assert_eq!(xattrs[0].value, b"yes");
    }

    #[test]
    fn missing_table_yields_bad_image_for_any_index() {
        let stream = MetablockStream::new(Rc::new(RefCell::new(Cursor::new(Vec::<u8>::new()))), Compressor::None);
        let table = XattrTable::new();
        let err = decode(&stream, &table, NOT_SET, 0).unwrap_err();
        assert!(matches!(err, SquashfsError::BadImage));
    }
}
