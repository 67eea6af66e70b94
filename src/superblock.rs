//! The 96-byte SquashFS v4.0 superblock: image geometry and the five absolute table offsets.

use deku::prelude::*;
use tracing::error;

use crate::compressor::{self, Compressor};

/// Little-endian magic, `"hsqs"` on disk.
pub const MAGIC: [u8; 4] = *b"hsqs";

/// Sentinel offset meaning "this table is absent from the image".
pub const NOT_SET: u64 = 0xffff_ffff_ffff_ffff;

/// 1 MiB, the largest legal `block_size`.
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;

/// 4 KiB, the smallest legal `block_size`.
pub const MIN_BLOCK_SIZE: u32 = 4096;

/// Bit flags packed into [`SuperBlock::flags`].
#[rustfmt::skip]
#[allow(dead_code)]
#[derive(Debug, Copy, Clone)]
pub(crate) enum SuperBlockFlags {
    InodesStoredUncompressed    = 0b0000_0000_0000_0001,
    DataBlockStoredUncompressed = 0b0000_0000_0000_0010,
    Unused                      = 0b0000_0000_0000_0100,
    FragmentsStoredUncompressed = 0b0000_0000_0000_1000,
    FragmentsAreNotUsed         = 0b0000_0000_0001_0000,
    FragmentsAreAlwaysGenerated = 0b0000_0000_0010_0000,
    DataHasBeenDeduplicated     = 0b0000_0000_0100_0000,
    NFSExportTableExists        = 0b0000_0000_1000_0000,
    XattrsAreStoredUncompressed = 0b0000_0001_0000_0000,
    NoXattrsInArchive           = 0b0000_0010_0000_0000,
    CompressorOptionsArePresent = 0b0000_0100_0000_0000,
}

/// Contains important information about the archive, including the locations of other sections.
#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct SuperBlock {
    /// Must be set to 0x73717368 ("hsqs" on disk).
    #[deku(assert_eq = "MAGIC")]
    pub magic: [u8; 4],
    /// The number of inodes stored in the archive.
    pub inode_count: u32,
    /// Last modification time of the archive. Seconds since 00:00, Jan 1st 1970 UTC.
    pub mod_time: u32,
    /// The size of a data block in bytes. Must be a power of two between 4096 and 1048576.
    pub block_size: u32,
    /// The number of entries in the fragment table.
    pub frag_count: u32,
    /// Compressor used for data and metadata.
    pub compressor: Compressor,
    /// The log2 of `block_size`. If the two fields do not agree, the archive is corrupted.
    pub block_log: u16,
    /// Bit wise OR of the flag bits.
    pub flags: u16,
    /// The number of entries in the ID lookup table.
    pub id_count: u16,
    /// Major version of the format. Must be set to 4.
    #[deku(assert_eq = "4")]
    pub version_major: u16,
    /// Minor version of the format. Must be set to 0.
    #[deku(assert_eq = "0")]
    pub version_minor: u16,
    /// A reference to the inode of the root directory.
    pub root_inode: u64,
    /// The number of bytes used by the archive. Archives are padded to a device block size, so
    /// this can be less than the actual file size.
    pub bytes_used: u64,
    pub id_table: u64,
    pub xattr_table: u64,
    pub inode_table: u64,
    pub dir_table: u64,
    pub frag_table: u64,
    pub export_table: u64,
}

impl SuperBlock {
    pub fn inodes_uncompressed(&self) -> bool {
        self.flags & SuperBlockFlags::InodesStoredUncompressed as u16 != 0
    }

    pub fn data_block_stored_uncompressed(&self) -> bool {
        self.flags & SuperBlockFlags::DataBlockStoredUncompressed as u16 != 0
    }

    pub fn fragments_stored_uncompressed(&self) -> bool {
        self.flags & SuperBlockFlags::FragmentsStoredUncompressed as u16 != 0
    }

    pub fn fragments_are_not_used(&self) -> bool {
        self.flags & SuperBlockFlags::FragmentsAreNotUsed as u16 != 0
    }

    pub fn fragments_are_always_generated(&self) -> bool {
        self.flags & SuperBlockFlags::FragmentsAreAlwaysGenerated as u16 != 0
    }

    pub fn data_has_been_duplicated(&self) -> bool {
        self.flags & SuperBlockFlags::DataHasBeenDeduplicated as u16 != 0
    }

    pub fn nfs_export_table_exists(&self) -> bool {
        self.flags & SuperBlockFlags::NFSExportTableExists as u16 != 0
    }

    pub fn xattrs_are_stored_uncompressed(&self) -> bool {
        self.flags & SuperBlockFlags::XattrsAreStoredUncompressed as u16 != 0
    }

    pub fn no_xattrs_in_archive(&self) -> bool {
        self.flags & SuperBlockFlags::NoXattrsInArchive as u16 != 0
    }

    pub fn compressor_options_are_present(&self) -> bool {
        self.flags & SuperBlockFlags::CompressorOptionsArePresent as u16 != 0
    }

    /// Parse the 96-byte header from the start of `bytes` and run the cheap structural sanity
    /// checks (§4.2) that every downstream table read otherwise silently trusts: block size
    /// shape, and every present table offset within the image's own length.
    pub(crate) fn parse(bytes: &[u8], total_length: u64) -> Result<Self, crate::error::SquashfsError> {
        use crate::error::SquashfsError;

        if bytes.len() < 96 {
            return Err(SquashfsError::Truncated {
                wanted: 96,
                got: bytes.len(),
            });
        }

        let ((_rest, _bit_offset), sb) = Self::from_bytes((bytes, 0))?;

        let power_of_two = sb.block_size != 0 && (sb.block_size & (sb.block_size - 1)) == 0;
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&sb.block_size) || !power_of_two {
            error!("block_size({:#x}) invalid", sb.block_size);
            return Err(SquashfsError::BadImage);
        }
        if (sb.block_size as f32).log2() != sb.block_log as f32 {
            error!("block_size.log2() != block_log");
            return Err(SquashfsError::BadImage);
        }

        compressor::ensure_supported(sb.compressor)?;

        if sb.bytes_used > total_length {
            error!("corrupted or invalid bytes_used");
            return Err(SquashfsError::BadImage);
        }
        for (name, offset) in [
            ("id_table", sb.id_table),
            ("inode_table", sb.inode_table),
            ("dir_table", sb.dir_table),
        ] {
            if offset > total_length {
                error!("corrupted or invalid {name}");
                return Err(SquashfsError::BadImage);
            }
        }
        for (name, offset) in [
            ("xattr_table", sb.xattr_table),
            ("frag_table", sb.frag_table),
            ("export_table", sb.export_table),
        ] {
            if offset != NOT_SET && offset > total_length {
                error!("corrupted or invalid {name}");
                return Err(SquashfsError::BadImage);
            }
        }

        Ok(sb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_superblock(block_size: u32, block_log: u16) -> Vec<u8> {
        let sb = SuperBlock {
            magic: MAGIC,
            inode_count: 1,
            mod_time: 0,
            block_size,
            frag_count: 0,
            compressor: Compressor::Gzip,
            block_log,
            flags: SuperBlockFlags::NoXattrsInArchive as u16,
            id_count: 1,
            version_major: 4,
            version_minor: 0,
            root_inode: 0,
            bytes_used: 96,
            id_table: 96,
            xattr_table: NOT_SET,
            inode_table: 0,
            dir_table: 0,
            frag_table: NOT_SET,
            export_table: NOT_SET,
        };
        sb.to_bytes().unwrap()
    }

    #[test]
    fn parses_well_formed_superblock() {
        let bytes = raw_superblock(MIN_BLOCK_SIZE, 12);
        let sb = SuperBlock::parse(&bytes, 4096).unwrap();
        assert_eq!(sb.block_size, MIN_BLOCK_SIZE);
        assert!(sb.no_xattrs_in_archive());
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let bytes = raw_superblock(5000, 12);
        assert!(is_bad_image(SuperBlock::parse(&bytes, 4096)));
    }

    #[test]
    fn rejects_mismatched_block_log() {
        let bytes = raw_superblock(MIN_BLOCK_SIZE, 13);
        assert!(is_bad_image(SuperBlock::parse(&bytes, 4096)));
    }

    fn is_bad_image(r: Result<SuperBlock, crate::error::SquashfsError>) -> bool {
        matches!(r, Err(crate::error::SquashfsError::BadImage))
    }
}
