//! Directory listing decoding (§4.5/§4.6, C6): headers and entries inside a directory's metadata
//! span.

use deku::prelude::*;

use crate::error::SquashfsError;

/// One `{count, inode_table_rel_start, ref_ino_base}` header followed by `count + 1` entries.
#[derive(Debug, DekuRead, Clone)]
#[deku(endian = "little")]
pub(crate) struct DirHeader {
    pub(crate) count: u32,
    /// Byte offset of the child inodes' metablock, relative to the inode table start.
    pub(crate) inode_table_rel_start: u32,
    pub(crate) ref_ino_base: u32,
}

#[derive(Debug, DekuRead, Clone)]
#[deku(endian = "little")]
pub(crate) struct RawDirEntry {
    pub(crate) offset_in_block: u16,
    pub(crate) ino_delta: i16,
    pub(crate) entry_type: u16,
    pub(crate) name_size_minus_1: u16,
    #[deku(count = "*name_size_minus_1 as usize + 1")]
    pub(crate) name: Vec<u8>,
}

/// A decoded directory entry: child name, reconstructed inode reference, and raw on-disk type.
#[derive(Debug, Clone)]
pub(crate) struct DirEntry {
    pub(crate) name: std::ffi::OsString,
    pub(crate) inode_ref: u64,
    pub(crate) entry_type: u16,
}

impl DirEntry {
    /// Decode a name that may not be valid UTF-8 losslessly, matching the original
    /// implementation's tolerance for arbitrary byte sequences in directory entries.
    fn decode_name(bytes: &[u8]) -> std::ffi::OsString {
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStringExt;
            std::ffi::OsString::from_vec(bytes.to_vec())
        }
        #[cfg(not(unix))]
        {
            std::ffi::OsString::from(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

/// Decode the full entry list of one directory, given its decompressed metadata bytes (exactly
/// `total_size` bytes, already sliced by the caller from `dir_block_start`/`block_offset`).
///
/// The child inode-ref is reconstructed as `(inode_table_rel_start << 16) | offset_in_block`
/// (§4.5), which matches the 48-bit packing used for `Inode` references elsewhere.
pub(crate) fn decode_entries(bytes: &[u8]) -> Result<Vec<DirEntry>, SquashfsError> {
    let mut entries = Vec::new();
    let mut rest = bytes;

    while rest.len() >= 12 {
        let Ok(((new_rest, _bits), header)) = DirHeader::from_bytes((rest, 0)) else {
            // Truncated trailing header: tolerated as long as at least one complete
            // header/entry group was already read (§4.6).
            break;
        };
        let mut cursor = new_rest;
        let mut group = Vec::with_capacity(header.count as usize + 1);

        let complete = (0..=header.count).all(|_| match RawDirEntry::from_bytes((cursor, 0)) {
            Ok(((new_cursor, _bits), raw)) => {
                cursor = new_cursor;
                let inode_ref = (u64::from(header.inode_table_rel_start) << 16)
                    | u64::from(raw.offset_in_block);
                group.push(DirEntry {
                    name: DirEntry::decode_name(&raw.name),
                    inode_ref,
                    entry_type: raw.entry_type,
                });
                true
            },
            Err(_) => false,
        });

        if !complete {
            break;
        }
        entries.extend(group);
        rest = cursor;
    }
    Ok(entries)
}

/// An index entry inside an extended directory's `dir_index` array, used by `squashfs-tools` to
/// binary-search large directories. This crate always does a linear scan, so the index is parsed
/// only so the inode's byte layout decodes correctly, its contents are otherwise unused.
#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct DirectoryIndex {
    pub(crate) index: u32,
    pub(crate) start: u32,
    pub(crate) name_size: u32,
    #[deku(count = "*name_size + 1")]
    pub(crate) name: Vec<u8>,
}
