//! Inode decoding (§4.5, C5): the common 16-byte header plus a type-specific tail.
//!
//! Every inode is read independently through [`crate::metadata::MetablockStream::read_span_from_abs`]
//! rather than sequentially advanced through a shared cursor, so a type-specific tail only needs to
//! declare the fields this crate actually consumes, trailing bytes of a tail we don't otherwise
//! care about (e.g. a named pipe's absent device number) are simply left unread.

use deku::prelude::*;

use crate::dir::DirectoryIndex;

/// Sentinel for "no xattr" on basic inodes, which carry no `xattr_idx` field at all.
pub(crate) const NO_XATTR: u32 = 0xffff_ffff;

/// Sentinel `frag_index` meaning "this file has no tail fragment; all of it lives in full blocks".
pub(crate) const NO_FRAGMENT: u32 = 0xffff_ffff;

#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(type = "u16")]
#[rustfmt::skip]
pub(crate) enum InodeId {
    BasicDirectory         = 1,
    BasicFile              = 2,
    BasicSymlink           = 3,
    BasicBlockDevice       = 4,
    BasicCharacterDevice   = 5,
    BasicNamedPipe         = 6,
    BasicSocket            = 7,
    ExtendedDirectory      = 8,
    ExtendedFile           = 9,
    ExtendedSymlink        = 10,
    ExtendedBlockDevice    = 11,
    ExtendedCharacterDevice = 12,
    ExtendedNamedPipe      = 13,
    ExtendedSocket         = 14,
}

impl InodeId {
    pub(crate) fn is_other(self) -> bool {
        !matches!(
            self,
            Self::BasicDirectory
                | Self::BasicFile
                | Self::BasicSymlink
                | Self::ExtendedDirectory
                | Self::ExtendedFile
                | Self::ExtendedSymlink
        )
    }
}

/// The 16-byte header common to every inode.
#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct InodeHeader {
    pub(crate) mode: u16,
    pub(crate) uid_idx: u16,
    pub(crate) gid_idx: u16,
    pub(crate) mtime: u32,
    pub(crate) inode_number: u32,
}

#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(ctx = "block_size: u32, block_log: u16")]
#[deku(endian = "little")]
pub(crate) struct Inode {
    pub(crate) id: InodeId,
    pub(crate) header: InodeHeader,
    #[deku(ctx = "id, block_size, block_log")]
    pub(crate) inner: InodeInner,
}

#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(ctx = "id: InodeId, block_size: u32, block_log: u16")]
#[deku(id = "id")]
pub(crate) enum InodeInner {
    #[deku(id = "InodeId::BasicDirectory")]
    BasicDirectory(BasicDirectory),

    #[deku(id = "InodeId::BasicFile")]
    BasicFile(#[deku(ctx = "block_size, block_log")] BasicFile),

    #[deku(id = "InodeId::BasicSymlink")]
    BasicSymlink(BasicSymlink),

    #[deku(id = "InodeId::ExtendedDirectory")]
    ExtendedDirectory(ExtendedDirectory),

    #[deku(id = "InodeId::ExtendedFile")]
    ExtendedFile(#[deku(ctx = "block_size, block_log")] ExtendedFile),

    #[deku(id = "InodeId::ExtendedSymlink")]
    ExtendedSymlink(ExtendedSymlink),

    #[deku(id_pat = "_")]
    Other(OtherInode),
}

#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct BasicDirectory {
    pub(crate) block_index: u32,
    pub(crate) link_count: u32,
    /// Carries a 3-byte bias for the implicit "." / ".." entries (§4.5); callers must subtract 3.
    pub(crate) file_size: u16,
    pub(crate) block_offset: u16,
    pub(crate) parent_inode: u32,
}

#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct ExtendedDirectory {
    pub(crate) link_count: u32,
    pub(crate) file_size: u32,
    pub(crate) block_index: u32,
    pub(crate) parent_inode: u32,
    pub(crate) index_count: u16,
    pub(crate) block_offset: u16,
    pub(crate) xattr_index: u32,
    #[deku(count = "*index_count")]
    pub(crate) dir_index: Vec<DirectoryIndex>,
}

#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(ctx = "block_size: u32, block_log: u16")]
#[deku(endian = "little")]
pub(crate) struct BasicFile {
    pub(crate) blocks_start: u32,
    pub(crate) frag_index: u32,
    pub(crate) block_offset: u32,
    pub(crate) file_size: u32,
    #[deku(count = "block_count(block_size, block_log, *frag_index, *file_size as u64)")]
    pub(crate) block_sizes: Vec<u32>,
}

/// Field order here (`blocks_start:u64, file_size:u64, sparse:u64, link_count:u32, frag_index:u32,
/// block_offset:u32` before `xattr_index`) puts `xattr_index` at payload offset 36 on disk.
#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(ctx = "block_size: u32, block_log: u16")]
#[deku(endian = "little")]
pub(crate) struct ExtendedFile {
    pub(crate) blocks_start: u64,
    pub(crate) file_size: u64,
    pub(crate) sparse: u64,
    pub(crate) link_count: u32,
    pub(crate) frag_index: u32,
    pub(crate) block_offset: u32,
    pub(crate) xattr_index: u32,
    #[deku(count = "block_count(block_size, block_log, *frag_index, *file_size)")]
    pub(crate) block_sizes: Vec<u32>,
}

fn block_count(block_size: u32, block_log: u16, frag_index: u32, file_size: u64) -> u64 {
    if frag_index == NO_FRAGMENT {
        (file_size + u64::from(block_size) - 1) >> block_log
    } else {
        file_size >> block_log
    }
}

#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct BasicSymlink {
    pub(crate) link_count: u32,
    pub(crate) target_size: u32,
    #[deku(count = "*target_size")]
    pub(crate) target: Vec<u8>,
}

/// Same as [`BasicSymlink`] but with a trailing `xattr_index`.
#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct ExtendedSymlink {
    pub(crate) link_count: u32,
    pub(crate) target_size: u32,
    #[deku(count = "*target_size")]
    pub(crate) target: Vec<u8>,
    pub(crate) xattr_index: u32,
}

/// Devices, fifos, and sockets (§4.9): not extracted in full, just recognized and placeholder-
/// written. We read only `link_count`, which every variant shares at the front of its tail.
#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct OtherInode {
    pub(crate) link_count: u32,
}
