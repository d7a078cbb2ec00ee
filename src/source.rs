//! Byte sources feeding the block stream reader.
//!
//! A [`ByteSource`] is a minimal read/seek abstraction. The loader only needs sequential reads
//! while scanning, plus seek-read-restore for deferred `DATA` payloads. Sources that know
//! whether the bytes they just produced are unchanged relative to a previous snapshot
//! (the undo [`MemFileSource`]) report that through [`ByteSource::is_content_identical`].

use std::fmt;
use std::fs::File;
use std::hash::Hasher;
use std::io::{Read, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use rayon::prelude::*;
use twox_hash::XxHash64;

use crate::compression::CompressorRegistry;
use crate::error::{LoaderError, Result};
use crate::format::{FILE_HEADER_SIZE, MAGIC_BYTES};

/// Abstract byte supplier.
pub trait ByteSource: fmt::Debug {
    /// Reads up to `buf.len()` bytes, returning how many were produced (0 at the end).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Moves the cursor and returns the new absolute offset.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Returns false for pipes and other forward-only sources.
    fn can_seek(&self) -> bool {
        true
    }

    /// Identity of the span covered by the most recent [`read`](Self::read) relative to a
    /// previous snapshot. `None` when the source does not track identity.
    fn is_content_identical(&self) -> Option<bool> {
        None
    }

    /// Releases the underlying resource. Further reads return zero bytes.
    fn close(&mut self) {}

    /// Fills `buf` completely or fails with a `Corrupt` error.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(LoaderError::Corrupt(format!(
                    "corrupt document: unexpected end of stream ({filled} of {} bytes)",
                    buf.len()
                )));
            }
            filled += n;
        }
        Ok(())
    }
}

fn resolve_seek(pos: SeekFrom, cursor: u64, len: u64) -> Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::Current(d) => cursor.checked_add_signed(d),
        SeekFrom::End(d) => len.checked_add_signed(d),
    };
    match target {
        Some(t) if t <= len => Ok(t),
        _ => Err(LoaderError::Corrupt(format!(
            "corrupt document: seek outside of {len} byte stream"
        ))),
    }
}

// --- In-memory ---

/// Cursor over any contiguous buffer: a `Vec<u8>`, a memory map or a static slice.
pub struct MemorySource<B: AsRef<[u8]>> {
    data: Option<B>,
    pos: u64,
}

impl<B: AsRef<[u8]>> MemorySource<B> {
    /// Wraps a buffer.
    pub fn new(data: B) -> Self {
        Self {
            data: Some(data),
            pos: 0,
        }
    }

    fn bytes(&self) -> &[u8] {
        self.data.as_ref().map(|d| d.as_ref()).unwrap_or(&[])
    }
}

impl<B: AsRef<[u8]>> fmt::Debug for MemorySource<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("len", &self.bytes().len())
            .field("pos", &self.pos)
            .field("closed", &self.data.is_none())
            .finish()
    }
}

impl<B: AsRef<[u8]>> ByteSource for MemorySource<B> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let pos = self.pos as usize;
        let data = self.bytes();
        let available = data.len().saturating_sub(pos);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.pos = resolve_seek(pos, self.pos, self.bytes().len() as u64)?;
        Ok(self.pos)
    }

    fn close(&mut self) {
        self.data = None;
        self.pos = 0;
    }
}

// --- Forward-only ---

/// Adapts any `std::io::Read` (a pipe, a socket) as a non-seekable source.
pub struct ReadSource<R: Read> {
    inner: Option<R>,
}

impl<R: Read> ReadSource<R> {
    /// Wraps a reader.
    pub fn new(inner: R) -> Self {
        Self { inner: Some(inner) }
    }
}

impl<R: Read> fmt::Debug for ReadSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSource")
            .field("closed", &self.inner.is_none())
            .finish()
    }
}

impl<R: Read> ByteSource for ReadSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.inner.as_mut() {
            Some(r) => Ok(r.read(buf)?),
            None => Ok(0),
        }
    }

    fn seek(&mut self, _pos: SeekFrom) -> Result<u64> {
        Err(LoaderError::Internal("seek on a forward-only source".into()))
    }

    fn can_seek(&self) -> bool {
        false
    }

    fn close(&mut self) {
        self.inner = None;
    }
}

// --- Files ---

/// Opens a document on disk.
///
/// The file is memory mapped. If it starts with the container magic the map is used
/// directly, otherwise the registry is asked for a codec that recognises the prefix and the
/// decoded buffer is served from memory.
pub fn open_path<P: AsRef<Path>>(
    path: P,
    compressors: &CompressorRegistry,
) -> Result<Box<dyn ByteSource>> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let file_size = file.metadata()?.len();

    if file_size < FILE_HEADER_SIZE as u64 {
        return Err(LoaderError::Format(
            "not a valid document: file smaller than header".into(),
        ));
    }

    // Safety: the map is read-only; concurrent truncation by another process is outside the
    // loader's control.
    #[allow(unsafe_code)]
    let mmap = unsafe { Mmap::map(&file)? };

    if mmap.starts_with(&MAGIC_BYTES) {
        log::debug!("opened {} ({file_size} bytes, plain)", path.display());
        return Ok(Box::new(MemorySource::new(mmap)));
    }

    open_compressed(&mmap, compressors).inspect(|_| {
        log::debug!("opened {} ({file_size} bytes, compressed)", path.display());
    })
}

/// Serves an in-memory buffer, decoding it first when it is a compressed stream.
pub fn open_memory(
    data: Vec<u8>,
    compressors: &CompressorRegistry,
) -> Result<Box<dyn ByteSource>> {
    if data.starts_with(&MAGIC_BYTES) {
        return Ok(Box::new(MemorySource::new(data)));
    }
    open_compressed(&data, compressors)
}

fn open_compressed(
    data: &[u8],
    compressors: &CompressorRegistry,
) -> Result<Box<dyn ByteSource>> {
    let Some(codec) = compressors.detect(data) else {
        return Err(LoaderError::Format(
            "not a valid document: unknown file prefix".into(),
        ));
    };
    let decoded = codec.decompress(data)?.into_owned();
    if !decoded.starts_with(&MAGIC_BYTES) {
        return Err(LoaderError::Format(format!(
            "not a valid document: {} stream does not contain a container",
            codec.name()
        )));
    }
    Ok(Box::new(MemorySource::new(decoded)))
}

// --- Undo snapshots ---

/// One contiguous piece of a [`MemFile`].
#[derive(Debug, Clone)]
pub struct MemFileChunk {
    data: Arc<[u8]>,
    digest: u64,
    is_identical: bool,
}

impl MemFileChunk {
    /// Chunk bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// `XxHash64` digest of the bytes.
    pub fn digest(&self) -> u64 {
        self.digest
    }

    /// True when the bytes equal the previous snapshot's chunk at the same position.
    pub fn is_identical(&self) -> bool {
        self.is_identical
    }

    /// True when this chunk shares its storage with `other`.
    pub fn shares_storage(&self, other: &MemFileChunk) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

pub(crate) fn digest(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// An in-memory snapshot of a serialized document, split into chunks.
#[derive(Debug, Clone, Default)]
pub struct MemFile {
    chunks: Vec<MemFileChunk>,
    size: u64,
}

impl MemFile {
    /// Builds a snapshot, flagging each chunk identical to `prev`'s chunk at the same index.
    ///
    /// Identical chunks reuse the previous chunk's allocation. Digests and comparisons run on
    /// the rayon pool.
    pub fn from_chunks(prev: Option<&MemFile>, chunks: Vec<Vec<u8>>) -> Self {
        let chunks: Vec<MemFileChunk> = chunks
            .into_par_iter()
            .enumerate()
            .map(|(i, bytes)| {
                let digest = digest(&bytes);
                let previous = prev.and_then(|p| p.chunks.get(i));
                match previous {
                    Some(old) if old.digest == digest && *old.data == bytes[..] => MemFileChunk {
                        data: Arc::clone(&old.data),
                        digest,
                        is_identical: true,
                    },
                    _ => MemFileChunk {
                        data: Arc::from(bytes),
                        digest,
                        is_identical: false,
                    },
                }
            })
            .collect();
        let size = chunks.iter().map(|c| c.data.len() as u64).sum();
        Self { chunks, size }
    }

    /// All chunks in stream order.
    pub fn chunks(&self) -> &[MemFileChunk] {
        &self.chunks
    }

    /// Total size in bytes.
    pub fn len(&self) -> u64 {
        self.size
    }

    /// True when the snapshot holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Concatenates all chunks.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size as usize);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.data);
        }
        out
    }
}

/// Reads a [`MemFile`] and reports chunk identity for every read.
#[derive(Debug)]
pub struct MemFileSource {
    file: MemFile,
    starts: Vec<u64>,
    pos: u64,
    last_identical: bool,
}

impl MemFileSource {
    /// Wraps a snapshot.
    pub fn new(file: MemFile) -> Self {
        let mut starts = Vec::with_capacity(file.chunks.len());
        let mut offset = 0u64;
        for chunk in &file.chunks {
            starts.push(offset);
            offset += chunk.data.len() as u64;
        }
        Self {
            file,
            starts,
            pos: 0,
            last_identical: false,
        }
    }

    fn chunk_at(&self, pos: u64) -> Option<usize> {
        match self.starts.binary_search(&pos) {
            Ok(mut i) => {
                // Skip empty chunks sharing the same start.
                while i + 1 < self.starts.len() && self.file.chunks[i].data.is_empty() {
                    i += 1;
                }
                Some(i)
            }
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }
}

impl ByteSource for MemFileSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut written = 0;
        let mut identical = true;
        while written < buf.len() {
            let Some(index) = self.chunk_at(self.pos) else {
                break;
            };
            let chunk = &self.file.chunks[index];
            let within = (self.pos - self.starts[index]) as usize;
            let available = chunk.data.len().saturating_sub(within);
            if available == 0 {
                break;
            }
            let n = available.min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&chunk.data[within..within + n]);
            identical &= chunk.is_identical;
            written += n;
            self.pos += n as u64;
        }
        self.last_identical = identical && written > 0;
        Ok(written)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.pos = resolve_seek(pos, self.pos, self.file.size)?;
        Ok(self.pos)
    }

    fn is_content_identical(&self) -> Option<bool> {
        Some(self.last_identical)
    }

    fn close(&mut self) {
        self.file = MemFile::default();
        self.starts.clear();
        self.pos = 0;
    }
}
