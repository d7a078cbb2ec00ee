//! Pluggable decompression backend for byte sources.
//!
//! A document on disk is either a plain block container or a compressed stream wrapping one.
//! The [`CompressorRegistry`] sniffs the leading bytes of a file and hands the buffer to the
//! first [`Compressor`] whose magic matches. Compressors also implement the inverse so tests
//! and tools can produce compressed fixtures.

use crate::error::{LoaderError, Result};
use std::borrow::Cow;

/// Interface for compressed-stream codecs.
pub trait Compressor: Send + Sync + std::fmt::Debug {
    /// Human readable name, used in log output.
    fn name(&self) -> &'static str;

    /// Returns true if `prefix` (the first bytes of a file) starts a stream of this codec.
    fn sniff(&self, prefix: &[u8]) -> bool;

    /// Decompresses a complete stream.
    fn decompress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>>;

    /// Compresses a complete buffer into a stream that `sniff` recognises.
    fn compress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>>;
}

// --- LZ4 Frame ---

/// Magic number opening an LZ4 frame.
pub const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];

#[cfg(feature = "lz4_flex")]
/// Decodes documents stored as an LZ4 frame.
///
/// Available when the `lz4_flex` feature is enabled.
#[derive(Debug, Clone, Copy)]
pub struct Lz4Compressor;

#[cfg(feature = "lz4_flex")]
impl Compressor for Lz4Compressor {
    fn name(&self) -> &'static str {
        "lz4-frame"
    }

    fn sniff(&self, prefix: &[u8]) -> bool {
        prefix.starts_with(&LZ4_FRAME_MAGIC)
    }

    fn decompress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        use std::io::Read;

        let mut decoder = lz4_flex::frame::FrameDecoder::new(data);
        let mut out = Vec::with_capacity(data.len().saturating_mul(2));
        decoder
            .read_to_end(&mut out)
            .map_err(|e| LoaderError::Compression(e.to_string()))?;
        Ok(Cow::Owned(out))
    }

    fn compress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        use std::io::Write;

        let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::with_capacity(data.len()));
        encoder
            .write_all(data)
            .map_err(|e| LoaderError::Compression(e.to_string()))?;
        let out = encoder
            .finish()
            .map_err(|e| LoaderError::Compression(e.to_string()))?;
        Ok(Cow::Owned(out))
    }
}

// --- REGISTRY ---

/// Ordered list of codecs tried when a file does not start with the container magic.
#[derive(Debug)]
pub struct CompressorRegistry {
    algorithms: Vec<Box<dyn Compressor>>,
}

impl CompressorRegistry {
    /// Creates a registry with the built-in codecs.
    ///
    /// *   `Lz4Compressor` (if the `lz4_flex` feature is enabled)
    pub fn new() -> Self {
        let mut reg = Self::empty();

        #[cfg(feature = "lz4_flex")]
        reg.register(Box::new(Lz4Compressor));

        reg
    }

    /// Creates a registry without any codec.
    pub fn empty() -> Self {
        Self {
            algorithms: Vec::new(),
        }
    }

    /// Registers a codec. Later registrations are tried first.
    pub fn register(&mut self, algo: Box<dyn Compressor>) {
        self.algorithms.insert(0, algo);
    }

    /// Returns the codec whose magic matches `prefix`.
    pub fn detect(&self, prefix: &[u8]) -> Option<&dyn Compressor> {
        self.algorithms
            .iter()
            .find(|algo| algo.sniff(prefix))
            .map(|algo| algo.as_ref())
    }

    /// Number of registered codecs.
    pub fn len(&self) -> usize {
        self.algorithms.len()
    }

    /// Returns true when no codec is registered.
    pub fn is_empty(&self) -> bool {
        self.algorithms.is_empty()
    }
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
