#![doc = include_str!("../README.md")]

pub mod compressor;
mod data;
mod dir;
pub mod driver;
pub mod error;
mod inode;
mod metadata;
pub mod sink;
mod squashfs;
mod superblock;
mod tables;
mod xattr;

pub use crate::driver::{extract, ExtractStats};
pub use crate::error::SquashfsError;
pub use crate::sink::{PosixSink, Sink};
pub use crate::squashfs::Squashfs;
pub use crate::superblock::SuperBlock;
