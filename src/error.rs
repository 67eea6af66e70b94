//! Errors

use std::{io, string};

use thiserror::Error;

use crate::compressor::Compressor;

/// Errors generated while reading or extracting a SquashFS image.
#[derive(Error, Debug)]
pub enum SquashfsError {
    #[error("std io error: {0}")]
    StdIo(#[from] io::Error),

    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),

    #[error("string error: {0:?}")]
    StringUtf8(#[from] string::FromUtf8Error),

    #[error("string error: {0:?}")]
    StrUtf8(#[from] std::str::Utf8Error),

    #[error("compressor {0:?} is not compiled into this binary")]
    UnsupportedCompressor(Compressor),

    #[error("decompressor rejected a buffer")]
    CodecFailure,

    #[error("corrupted or invalid squashfs image")]
    BadImage,

    #[error("underlying read returned fewer bytes than required: wanted {wanted}, got {got}")]
    Truncated { wanted: usize, got: usize },

    #[error("inode was unexpected in this position")]
    UnexpectedInode,

    #[error("unsupported inode type {0}: devices/fifo/socket are written as placeholders")]
    UnsupportedInode(u16),

    #[error("directory entry name is empty after path sanitization")]
    IllegalEntryName,

    #[error("fragment index {0} out of range of the fragment table")]
    FragmentOutOfRange(u32),
}

impl From<SquashfsError> for io::Error {
    fn from(value: SquashfsError) -> Self {
        use SquashfsError::*;
        match value {
            StdIo(io) => io,
            Deku(e) => e.into(),
            StringUtf8(e) => Self::new(io::ErrorKind::InvalidData, e),
            StrUtf8(e) => Self::new(io::ErrorKind::InvalidData, e),
            e @ UnsupportedCompressor(_) => Self::new(io::ErrorKind::Unsupported, e),
            e @ (CodecFailure
            | BadImage
            | Truncated { .. }
            | UnexpectedInode
            | UnsupportedInode(_)
            | IllegalEntryName
            | FragmentOutOfRange(_)) => Self::new(io::ErrorKind::InvalidData, e),
        }
    }
}
