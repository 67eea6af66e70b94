//! Top-level image handle: ties the superblock, metablock stream, lookup tables, and data reader
//! together into the one object callers open and extract from.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use deku::prelude::*;
use tracing::{info, instrument};

use crate::data::DataReader;
use crate::dir::{self, DirEntry};
use crate::error::SquashfsError;
use crate::inode::{Inode, InodeInner, NO_XATTR};
use crate::metadata::MetablockStream;
use crate::superblock::SuperBlock;
use crate::tables::{FragmentTable, IdTable, XattrTable};

/// An opened SquashFS v4 image: superblock geometry plus the lazy readers layered on top of it.
pub struct Squashfs<R> {
    pub(crate) superblock: SuperBlock,
    pub(crate) metablocks: MetablockStream<R>,
    pub(crate) data: DataReader<R>,
    pub(crate) ids: IdTable,
    pub(crate) fragments: FragmentTable,
    pub(crate) xattrs: XattrTable,
}

impl<R: Read + Seek> Squashfs<R> {
    /// Reads the superblock, validates it (§4.2), and constructs the lazy readers layered on top.
    /// Nothing else is read eagerly, id/fragment/xattr tables are populated on first use.
    #[instrument(skip_all)]
    pub fn open(mut reader: R) -> Result<Self, SquashfsError> {
        let total_length = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; 96];
        reader.read_exact(&mut header)?;
        let superblock = SuperBlock::parse(&header, total_length)?;

        info!(
            block_size = superblock.block_size,
            compressor = %superblock.compressor,
            inode_count = superblock.inode_count,
            "opened squashfs image"
        );

        let shared = Rc::new(RefCell::new(reader));
        let metablocks = MetablockStream::new(shared.clone(), superblock.compressor);
        let data = DataReader::new(shared, superblock.compressor, superblock.block_size);

        Ok(Self {
            superblock,
            metablocks,
            data,
            ids: IdTable::new(),
            fragments: FragmentTable::new(),
            xattrs: XattrTable::new(),
        })
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.superblock
    }

    /// Decode the inode addressed by `inode_ref` (§4.5): `(inode_ref >> 16)` is a byte offset
    /// relative to the inode table start, `inode_ref & 0xffff` the intra-block offset.
    pub(crate) fn read_inode(&self, inode_ref: u64) -> Result<Inode, SquashfsError> {
        let abs = self.superblock.inode_table + (inode_ref >> 16);
        let off = (inode_ref & 0xffff) as usize;
        // Generous upper bound on a single inode's on-disk tail; extended files with a long
        // block-size array are the largest case but still comfortably under this.
        let bytes = self.metablocks.read_span_from_abs(abs, off, 8192)?;
        let mut cursor = std::io::Cursor::new(bytes);
        let mut container = Reader::new(&mut cursor);
        let inode = Inode::from_reader_with_ctx(
            &mut container,
            (self.superblock.block_size, self.superblock.block_log),
        )?;
        Ok(inode)
    }

    pub(crate) fn root_inode(&self) -> Result<Inode, SquashfsError> {
        self.read_inode(self.superblock.root_inode)
    }

    /// Decode a directory's entry list given its locator fields from a `BasicDirectory` /
    /// `ExtendedDirectory` (§4.6).
    pub(crate) fn read_dir(
        &self,
        block_index: u32,
        block_offset: u16,
        total_size: usize,
    ) -> Result<Vec<DirEntry>, SquashfsError> {
        if total_size == 0 {
            return Ok(Vec::new());
        }
        let abs = self.superblock.dir_table + u64::from(block_index);
        let bytes = self
            .metablocks
            .read_span_from_abs(abs, block_offset as usize, total_size)?;
        dir::decode_entries(&bytes)
    }

    pub(crate) fn resolve_xattr(&self, xattr_idx: u32) -> Result<Vec<crate::xattr::Xattr>, SquashfsError> {
        if xattr_idx == NO_XATTR {
            return Ok(Vec::new());
        }
        crate::xattr::decode(
            &self.metablocks,
            &self.xattrs,
            self.superblock.xattr_table,
            xattr_idx,
        )
    }

    pub(crate) fn resolve_id(&self, idx: u16) -> Result<u32, SquashfsError> {
        let ids = self
            .ids
            .get(&self.metablocks, self.superblock.id_table, self.superblock.id_count)?;
        ids.get(idx as usize).copied().ok_or(SquashfsError::BadImage)
    }

    pub(crate) fn write_file_data(
        &self,
        blocks_start: u64,
        file_size: u64,
        block_sizes: &[u32],
        frag_index: u32,
        frag_offset: u32,
        out: &mut dyn std::io::Write,
    ) -> Result<(), SquashfsError> {
        let fragments = self.fragments.get(
            &self.metablocks,
            self.superblock.frag_table,
            self.superblock.frag_count,
        )?;
        self.data.reassemble(
            blocks_start,
            file_size,
            block_sizes,
            frag_index,
            frag_offset,
            &fragments,
            out,
        )
    }
}

/// A node decoded from an [`Inode`], with its common fields normalized across basic/extended
/// variants so the extractor driver doesn't need to match on [`InodeInner`] itself.
pub(crate) enum Node {
    Directory {
        block_index: u32,
        block_offset: u16,
        total_size: usize,
        xattr_idx: u32,
    },
    File {
        blocks_start: u64,
        file_size: u64,
        block_sizes: Vec<u32>,
        frag_index: u32,
        frag_offset: u32,
        xattr_idx: u32,
    },
    Symlink {
        target: Vec<u8>,
        xattr_idx: u32,
    },
    Other {
        inode_type: u16,
    },
}

impl Inode {
    pub(crate) fn node(&self) -> Node {
        match &self.inner {
            InodeInner::BasicDirectory(d) => Node::Directory {
                block_index: d.block_index,
                block_offset: d.block_offset,
                total_size: (d.file_size as i64 - 3).max(0) as usize,
                xattr_idx: NO_XATTR,
            },
            InodeInner::ExtendedDirectory(d) => Node::Directory {
                block_index: d.block_index,
                block_offset: d.block_offset,
                total_size: d.file_size as usize,
                xattr_idx: d.xattr_index,
            },
            InodeInner::BasicFile(f) => Node::File {
                blocks_start: u64::from(f.blocks_start),
                file_size: u64::from(f.file_size),
                block_sizes: f.block_sizes.clone(),
                frag_index: f.frag_index,
                frag_offset: f.block_offset,
                xattr_idx: NO_XATTR,
            },
            InodeInner::ExtendedFile(f) => Node::File {
                blocks_start: f.blocks_start,
                file_size: f.file_size,
                block_sizes: f.block_sizes.clone(),
                frag_index: f.frag_index,
                frag_offset: f.block_offset,
                xattr_idx: f.xattr_index,
            },
            InodeInner::BasicSymlink(s) => Node::Symlink {
                target: s.target.clone(),
                xattr_idx: NO_XATTR,
            },
            InodeInner::ExtendedSymlink(s) => Node::Symlink {
                target: s.target.clone(),
                xattr_idx: s.xattr_index,
            },
            InodeInner::Other(_) => Node::Other {
                inode_type: self.id as u16,
            },
        }
    }
}
