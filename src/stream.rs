//! The block stream reader.
//!
//! Scans a [`ByteSource`] once, validating the file header and every block header, and keeps
//! a table of [`BlockRecord`]s for random access by the linker. Payloads are copied while
//! scanning, except `DATA` payloads of seekable sources without identity tracking, which are
//! read on demand by [`BlockStream::read_payload`].

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use crate::error::{LoaderError, Result};
use crate::format::{BlockCode, BlockHeader, FILE_HEADER_SIZE, FileHeader, IdCode, PointerWidth};
use crate::source::ByteSource;

#[derive(Debug, Clone)]
enum Payload {
    Eager(Arc<[u8]>),
    Deferred { offset: u64, len: usize },
}

/// One block, as found while scanning.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    index: usize,
    header: BlockHeader,
    payload: Payload,
    identical: bool,
}

impl BlockRecord {
    /// Position of the block in the stream (0 = first block after the file header).
    pub fn index(&self) -> usize {
        self.index
    }

    /// The block header. `old` is already normalised to the memory pointer width.
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// Block code.
    pub fn code(&self) -> BlockCode {
        self.header.code
    }

    /// Normalised stale address.
    pub fn old(&self) -> u64 {
        self.header.old
    }

    /// Struct index of the payload.
    pub fn sdna(&self) -> usize {
        self.header.sdna.max(0) as usize
    }

    /// Number of structs stored in the payload.
    pub fn count(&self) -> usize {
        self.header.nr.max(0) as usize
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.header.len.max(0) as usize
    }

    /// True for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the payload has not been copied yet.
    pub fn is_deferred(&self) -> bool {
        matches!(self.payload, Payload::Deferred { .. })
    }

    /// True when the source flagged header and payload as unchanged from the previous
    /// snapshot.
    pub fn is_identical(&self) -> bool {
        self.identical
    }
}

/// Options controlling how a stream is scanned.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Width that stale addresses are normalised to.
    pub memory_width: PointerWidth,
    /// Allow deferring `DATA` payloads on seekable sources.
    pub defer_data_blocks: bool,
}

/// Random-access view over all blocks of one document.
#[derive(Debug)]
pub struct BlockStream {
    source: RefCell<Box<dyn ByteSource>>,
    header: FileHeader,
    blocks: Vec<BlockRecord>,
    by_old: Vec<(u64, usize)>,
    by_name: HashMap<(IdCode, String), usize>,
    cursor: usize,
}

impl BlockStream {
    /// Validates the header and scans every block up to `ENDB`.
    pub fn open(mut source: Box<dyn ByteSource>, options: StreamOptions) -> Result<Self> {
        let header = read_file_header(source.as_mut())?;
        let layout = header.layout;
        let header_size = layout.block_header_size();
        let deferrable = options.defer_data_blocks
            && source.can_seek()
            && source.is_content_identical().is_none();

        let mut blocks = Vec::new();
        let mut buf = vec![0u8; header_size];
        let mut terminated = false;
        loop {
            let got = read_fully(source.as_mut(), &mut buf)?;
            if got == 0 {
                break;
            }
            if got < header_size {
                return Err(LoaderError::Corrupt(
                    "corrupt document: truncated block header".into(),
                ));
            }
            let header_identical = source.is_content_identical().unwrap_or(false);
            let mut block = BlockHeader::decode(&layout, &buf)?;
            if block.len < 0 {
                return Err(LoaderError::Corrupt(format!(
                    "corrupt document: block {} has negative length {}",
                    block.code, block.len
                )));
            }
            if block.code == BlockCode::ENDB {
                terminated = true;
                break;
            }
            block.old = layout.convert_address(block.old, options.memory_width);

            let len = block.len as usize;
            let (payload, identical) = if deferrable && block.code == BlockCode::DATA {
                let offset = source.seek(SeekFrom::Current(0))?;
                source.seek(SeekFrom::Current(block.len as i64))?;
                (Payload::Deferred { offset, len }, false)
            } else {
                let mut bytes = vec![0u8; len];
                if read_fully(source.as_mut(), &mut bytes)? < len {
                    return Err(LoaderError::Corrupt(format!(
                        "corrupt document: truncated {} block payload",
                        block.code
                    )));
                }
                let payload_identical =
                    len == 0 || source.is_content_identical().unwrap_or(false);
                (
                    Payload::Eager(Arc::from(bytes)),
                    header_identical && payload_identical,
                )
            };

            blocks.push(BlockRecord {
                index: blocks.len(),
                header: block,
                payload,
                identical,
            });
        }

        if !terminated {
            return Err(LoaderError::Corrupt(
                "corrupt document: missing ENDB record".into(),
            ));
        }

        let mut by_old: Vec<(u64, usize)> = blocks
            .iter()
            .filter(|b| b.old() != 0)
            .map(|b| (b.old(), b.index))
            .collect();
        by_old.sort();

        log::trace!(
            "scanned {} blocks (version {}, {:?})",
            blocks.len(),
            header.version,
            layout
        );

        Ok(Self {
            source: RefCell::new(source),
            header,
            blocks,
            by_old,
            by_name: HashMap::new(),
            cursor: 0,
        })
    }

    /// Decoded file header.
    pub fn file_header(&self) -> &FileHeader {
        &self.header
    }

    /// Returns the next block of the sequential cursor.
    pub fn next_block(&mut self) -> Option<&BlockRecord> {
        let block = self.blocks.get(self.cursor)?;
        self.cursor += 1;
        Some(block)
    }

    /// Restarts the sequential cursor.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// All blocks in stream order.
    pub fn blocks(&self) -> &[BlockRecord] {
        &self.blocks
    }

    /// Block at `index`.
    pub fn block(&self, index: usize) -> Option<&BlockRecord> {
        self.blocks.get(index)
    }

    /// First block with the given code.
    pub fn find_code(&self, code: BlockCode) -> Option<&BlockRecord> {
        self.blocks.iter().find(|b| b.code() == code)
    }

    /// First block whose normalised stale address is `old`.
    pub fn find_by_old(&self, old: u64) -> Option<&BlockRecord> {
        if old == 0 {
            return None;
        }
        let pos = self.by_old.partition_point(|(addr, _)| *addr < old);
        match self.by_old.get(pos) {
            Some((addr, index)) if *addr == old => self.blocks.get(*index),
            _ => None,
        }
    }

    /// Entity block with the given code and name (without the code prefix).
    pub fn find_by_name(&self, code: IdCode, name: &str) -> Option<&BlockRecord> {
        let index = self.by_name.get(&(code, name.to_owned()))?;
        self.blocks.get(*index)
    }

    /// Nearest `LI` block before `index`.
    pub fn previous_library(&self, index: usize) -> Option<&BlockRecord> {
        self.blocks[..index.min(self.blocks.len())]
            .iter()
            .rev()
            .find(|b| b.code() == BlockCode::entity(IdCode::LIBRARY))
    }

    /// Indexes entity blocks by name.
    ///
    /// `name_offset` is the byte offset of the stored name inside the block's `ID` header in
    /// the file layout; `name_len` its capacity.
    pub fn index_names(&mut self, name_offset: usize, name_len: usize) {
        let mut by_name = HashMap::new();
        for block in &self.blocks {
            let Some(code) = block.code().id_code() else {
                continue;
            };
            let Payload::Eager(data) = &block.payload else {
                continue;
            };
            let Some(raw) = data.get(name_offset..(name_offset + name_len).min(data.len())) else {
                continue;
            };
            let name = decode_stored_name(raw);
            // Placeholders share the name of the entity they stand for; keep real blocks.
            if code == IdCode::LINK_PLACEHOLDER {
                continue;
            }
            by_name.entry((code, name)).or_insert(block.index);
        }
        self.by_name = by_name;
    }

    /// Zero-copy access to an already loaded payload.
    pub fn peek_payload<'a>(&self, block: &'a BlockRecord) -> Option<&'a [u8]> {
        match &block.payload {
            Payload::Eager(data) => Some(data),
            Payload::Deferred { .. } => None,
        }
    }

    /// Returns the payload, reading a deferred one from the source.
    pub fn read_payload<'a>(&self, block: &'a BlockRecord) -> Result<Cow<'a, [u8]>> {
        match &block.payload {
            Payload::Eager(data) => Ok(Cow::Borrowed(data)),
            Payload::Deferred { offset, len } => {
                let mut source = self.source.try_borrow_mut().map_err(|_| {
                    LoaderError::Internal("block source already borrowed".into())
                })?;
                let restore = source.seek(SeekFrom::Current(0))?;
                source.seek(SeekFrom::Start(*offset))?;
                let mut bytes = vec![0u8; *len];
                let result = source.read_exact(&mut bytes);
                source.seek(SeekFrom::Start(restore))?;
                result?;
                Ok(Cow::Owned(bytes))
            }
        }
    }

    /// Closes the underlying source. Eager payloads stay available.
    pub fn close(&self) {
        if let Ok(mut source) = self.source.try_borrow_mut() {
            source.close();
        }
    }
}

/// Splits a stored `ID` name (`"OBCube\0..."`) into its name part.
pub(crate) fn decode_stored_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    let bytes = raw.get(2..end).unwrap_or(&[]);
    String::from_utf8_lossy(bytes).into_owned()
}

fn read_fully(source: &mut dyn ByteSource, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Reads the file header and the blocks at the start of `source` for as long as `keep`
/// accepts their code. The first refused block ends the scan; its payload is not read.
pub fn read_leading_blocks(
    mut source: Box<dyn ByteSource>,
    keep: impl Fn(BlockCode) -> bool,
) -> Result<(FileHeader, Vec<(BlockHeader, Vec<u8>)>)> {
    let header = read_file_header(source.as_mut())?;
    let mut buf = vec![0u8; header.layout.block_header_size()];
    let mut blocks = Vec::new();
    while read_fully(source.as_mut(), &mut buf)? == buf.len() {
        let block = BlockHeader::decode(&header.layout, &buf)?;
        if !keep(block.code) {
            break;
        }
        let len = usize::try_from(block.len).map_err(|_| {
            LoaderError::Corrupt(format!(
                "corrupt document: block {} has negative length {}",
                block.code, block.len
            ))
        })?;
        let mut payload = vec![0u8; len];
        if read_fully(source.as_mut(), &mut payload)? < len {
            return Err(LoaderError::Corrupt(format!(
                "corrupt document: truncated {} block payload",
                block.code
            )));
        }
        blocks.push((block, payload));
    }
    source.close();
    Ok((header, blocks))
}

fn read_file_header(source: &mut dyn ByteSource) -> Result<FileHeader> {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    if read_fully(source, &mut buf)? < FILE_HEADER_SIZE {
        return Err(LoaderError::Format(
            "not a valid document: truncated header".into(),
        ));
    }
    FileHeader::parse(&buf)
}
