//! Codec dispatch: decompresses a buffer using whichever compressor the image's superblock
//! declares.
//!
//! The compressor is chosen exactly once, when the superblock is read, and every subsequent
//! metablock or data-block decompression simply calls [`decompress`] with that fixed id. An
//! image that declares a compressor whose backend was not compiled into this binary is rejected
//! by [`ensure_supported`] at image-open time rather than failing partway through extraction.

use std::io::Read;

use deku::prelude::*;
#[cfg(feature = "xz")]
use xz2::read::XzDecoder;
use tracing::instrument;

use crate::error::SquashfsError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite, Default)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[deku(type = "u16")]
#[rustfmt::skip]
pub enum Compressor {
    None = 0,
    Gzip = 1,
    Lzma = 2,
    Lzo =  3,
    #[default]
    Xz =   4,
    Lz4 =  5,
    Zstd = 6,
}

impl Compressor {
    fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Lzma => "lzma",
            Self::Lzo => "lzo",
            Self::Xz => "xz",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    /// Whether this binary was compiled with a decompression backend for `self`.
    fn is_compiled_in(self) -> bool {
        match self {
            Self::None => true,
            Self::Gzip => cfg!(feature = "gzip"),
            Self::Lzma | Self::Xz => cfg!(feature = "xz"),
            Self::Lzo => cfg!(feature = "lzo"),
            Self::Lz4 => cfg!(feature = "lz4"),
            Self::Zstd => cfg!(feature = "zstd"),
        }
    }
}

impl std::fmt::Display for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(
    endian = "endian",
    ctx = "endian: deku::ctx::Endian, compressor: Compressor"
)]
#[deku(id = "compressor")]
pub enum CompressionOptions {
    #[deku(id = "Compressor::Gzip")]
    Gzip(Gzip),

    #[deku(id = "Compressor::Lzo")]
    Lzo(Lzo),

    #[deku(id = "Compressor::Xz")]
    Xz(Xz),

    #[deku(id = "Compressor::Lz4")]
    Lz4(Lz4),

    #[deku(id = "Compressor::Zstd")]
    Zstd(Zstd),

    #[deku(id = "Compressor::Lzma")]
    Lzma,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Gzip {
    pub compression_level: u32,
    pub window_size: u16,
    pub strategies: u16,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Lzo {
    pub algorithm: u32,
    pub compression_level: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Xz {
    pub dictionary_size: u32,
    pub filters: XzFilter,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[deku(type = "u32")]
#[rustfmt::skip]
pub enum XzFilter {
    X86      = 0x01,
    PowerPC  = 0x02,
    IA64     = 0x04,
    Arm      = 0x08,
    ArmThumb = 0x10,
    Sparc    = 0x20,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Lz4 {
    pub version: u32,
    pub flags: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Zstd {
    pub compression_level: u32,
}

/// LZMA1 "alone" streams use a 2^23 dictionary when the image doesn't otherwise specify one.
const LZMA1_DEFAULT_DICT_SIZE: u32 = 1 << 23;

/// Checked once at image-open time (superblock validation), never mid-extract: §4.1's
/// construction-time *UnsupportedCompressor* contract.
pub(crate) fn ensure_supported(compressor: Compressor) -> Result<(), SquashfsError> {
    if compressor.is_compiled_in() {
        Ok(())
    } else {
        Err(SquashfsError::UnsupportedCompressor(compressor))
    }
}

/// Decompress `bytes` (compressed with `compressor`) into `out`, appending the decompressed
/// bytes. Used uniformly for both metablocks (≤ 8 KiB output) and data/fragment blocks (≤
/// `block_size` output).
#[instrument(skip_all)]
pub(crate) fn decompress(
    bytes: &[u8],
    out: &mut Vec<u8>,
    compressor: Compressor,
) -> Result<(), SquashfsError> {
    match compressor {
        #[cfg(feature = "gzip")]
        Compressor::Gzip => {
            let mut decoder = zune_inflate::DeflateDecoder::new(bytes);
            let decompressed_data = decoder
                .decode_zlib()
                .map_err(|_| SquashfsError::CodecFailure)?;
            out.extend_from_slice(&decompressed_data);
        },
        #[cfg(feature = "xz")]
        Compressor::Xz => {
            let mut decoder = XzDecoder::new(bytes);
            decoder
                .read_to_end(out)
                .map_err(|_| SquashfsError::CodecFailure)?;
        },
        #[cfg(feature = "xz")]
        Compressor::Lzma => {
            decompress_lzma1(bytes, out)?;
        },
        #[cfg(feature = "lzo")]
        Compressor::Lzo => {
            let start = out.len();
            out.resize(start + bytes.len() * 32, 0);
            let (decompressed, error) = rust_lzo::LZOContext::decompress_to_slice(bytes, &mut out[start..]);
            let decompressed_len = decompressed.len();
            out.truncate(start + decompressed_len);
            if error != rust_lzo::LZOError::OK {
                return Err(SquashfsError::CodecFailure);
            }
        },
        #[cfg(feature = "lz4")]
        Compressor::Lz4 => {
            let mut decoder = lz4_flex::frame::FrameDecoder::new(bytes);
            decoder
                .read_to_end(out)
                .map_err(|_| SquashfsError::CodecFailure)?;
        },
        #[cfg(feature = "zstd")]
        Compressor::Zstd => {
            let mut decoder = zstd::bulk::Decompressor::new().map_err(|_| SquashfsError::CodecFailure)?;
            let decompressed = decoder
                .decompress(bytes, 8 * crate::superblock::MAX_BLOCK_SIZE as usize)
                .map_err(|_| SquashfsError::CodecFailure)?;
            out.extend_from_slice(&decompressed);
        },
        Compressor::None => out.extend_from_slice(bytes),
        _ => return Err(SquashfsError::UnsupportedCompressor(compressor)),
    }
    Ok(())
}

/// Decode a raw LZMA1 stream. Per §4.1: attempt auto-detect of the stream's own properties first;
/// on failure, fall back to decoding as headerless raw LZMA1 with a 2^23 dictionary, the
/// convention `squashfs-tools` uses for this legacy compressor id.
#[cfg(feature = "xz")]
fn decompress_lzma1(bytes: &[u8], out: &mut Vec<u8>) -> Result<(), SquashfsError> {
    use xz2::stream::{Filters, LzmaOptions, Stream};

    // First try: some images store the legacy "LZMA alone" container, which carries its own
    // 13-byte header (5-byte properties + 8-byte uncompressed size) that `new_lzma_decoder`
    // auto-detects from the stream itself, mirroring the original implementation's
    // `lzma.decompress(data)` auto-detect attempt.
    if let Ok(stream) = Stream::new_lzma_decoder(u64::MAX) {
        let mut decoder = xz2::read::XzDecoder::new_stream(bytes, stream);
        let mut probe = Vec::with_capacity(out.capacity());
        if decoder.read_to_end(&mut probe).is_ok() {
            out.extend_from_slice(&probe);
            return Ok(());
        }
    }

    // Fall back to headerless raw LZMA1 with `squashfs-tools`' conventional 2^23 dictionary,
    // built the same way the teacher builds a raw filter chain for its xz encoder.
    let mut options = LzmaOptions::new_preset(6).map_err(|_| SquashfsError::CodecFailure)?;
    options.dict_size(LZMA1_DEFAULT_DICT_SIZE);
    let mut filters = Filters::new();
    filters.lzma1(&options);
    let stream = Stream::new_raw_decoder(&filters).map_err(|_| SquashfsError::CodecFailure)?;
    let mut decoder = xz2::read::XzDecoder::new_stream(bytes, stream);
    decoder
        .read_to_end(out)
        .map_err(|_| SquashfsError::CodecFailure)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_compressor_passthrough() {
        let mut out = Vec::new();
        decompress(b"raw bytes", &mut out, Compressor::None).unwrap();
        assert_eq!(out, b"raw bytes");
    }

    #[test]
    fn compiled_in_matches_features() {
        assert!(Compressor::None.is_compiled_in());
        assert_eq!(Compressor::Gzip.is_compiled_in(), cfg!(feature = "gzip"));
        assert_eq!(Compressor::Zstd.is_compiled_in(), cfg!(feature = "zstd"));
    }
}
