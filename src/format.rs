//! Defines the physical binary layout of the block container.
//!
//! # Layout
//! A document is a fixed 12 byte header followed by a flat sequence of blocks and a
//! terminating `ENDB` block.
//!
//! File: `[Header] [Block] [Block] ... [ENDB]`
//!
//! ## Header
//! `BLENDER` + pointer marker (`_` = 4 bytes, `-` = 8 bytes) + endian marker (`v` = little,
//! `V` = big) + three ASCII version digits, e.g. `BLENDER-v405`.
//!
//! ## Block Anatomy
//! `[ code: 4 raw bytes ] [ len: i32 ] [ old: pointer ] [ sdna: i32 ] [ nr: i32 ] [ payload ]`
//!
//! All integers use the endianness declared by the header, and `old` uses its pointer width.

use std::fmt;

use crate::error::{LoaderError, Result};

/// Magic bytes identifying the container: "BLENDER".
pub const MAGIC_BYTES: [u8; 7] = *b"BLENDER";

/// The fixed size of the file header.
/// Magic(7) + PointerMarker(1) + EndianMarker(1) + Version(3) = 12
pub const FILE_HEADER_SIZE: usize = 12;

/// Width of pointer values stored in a stream or used by an in-memory catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerWidth {
    /// 4 byte pointers.
    Width32,
    /// 8 byte pointers.
    Width64,
}

impl PointerWidth {
    /// Size of one pointer in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Width32 => 4,
            Self::Width64 => 8,
        }
    }

    /// Width of the running process.
    pub fn native() -> Self {
        if std::mem::size_of::<usize>() == 4 {
            Self::Width32
        } else {
            Self::Width64
        }
    }

    /// Maps a byte size to a width.
    pub fn from_size(size: usize) -> Option<Self> {
        match size {
            4 => Some(Self::Width32),
            8 => Some(Self::Width64),
            _ => None,
        }
    }
}

/// Byte order of multi-byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

impl Endian {
    /// Byte order of the running process.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }
}

/// Pointer width × endianness, decoded once from the header.
///
/// Every integer and pointer decode after the header goes through this strategy value, so
/// the conversion rules live in one place instead of being scattered through the readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Layout {
    /// Pointer width.
    pub width: PointerWidth,
    /// Byte order.
    pub endian: Endian,
}

macro_rules! layout_int {
    ($read:ident, $write:ident, $ty:ty, $n:expr) => {
        /// Reads one value at `at`.
        pub fn $read(&self, data: &[u8], at: usize) -> Result<$ty> {
            let bytes: [u8; $n] = data
                .get(at..at + $n)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| out_of_bounds(at, $n, data.len()))?;
            Ok(match self.endian {
                Endian::Little => <$ty>::from_le_bytes(bytes),
                Endian::Big => <$ty>::from_be_bytes(bytes),
            })
        }

        /// Writes one value at `at`.
        pub fn $write(&self, data: &mut [u8], at: usize, value: $ty) -> Result<()> {
            let len = data.len();
            let slot = data
                .get_mut(at..at + $n)
                .ok_or_else(|| out_of_bounds(at, $n, len))?;
            let bytes = match self.endian {
                Endian::Little => value.to_le_bytes(),
                Endian::Big => value.to_be_bytes(),
            };
            slot.copy_from_slice(&bytes);
            Ok(())
        }
    };
}

fn out_of_bounds(at: usize, size: usize, len: usize) -> LoaderError {
    LoaderError::Corrupt(format!(
        "read of {size} bytes at offset {at} exceeds buffer of {len} bytes"
    ))
}

impl Layout {
    /// Layout of the running process.
    pub fn native() -> Self {
        Self {
            width: PointerWidth::native(),
            endian: Endian::native(),
        }
    }

    /// Creates a layout.
    pub fn new(width: PointerWidth, endian: Endian) -> Self {
        Self { width, endian }
    }

    /// Size of one pointer in bytes.
    pub fn pointer_size(&self) -> usize {
        self.width.size()
    }

    layout_int!(read_u16, write_u16, u16, 2);
    layout_int!(read_i16, write_i16, i16, 2);
    layout_int!(read_u32, write_u32, u32, 4);
    layout_int!(read_i32, write_i32, i32, 4);
    layout_int!(read_u64, write_u64, u64, 8);

    /// Reads a pointer value, zero-extended to 64 bits.
    pub fn read_ptr(&self, data: &[u8], at: usize) -> Result<u64> {
        match self.width {
            PointerWidth::Width32 => self.read_u32(data, at).map(u64::from),
            PointerWidth::Width64 => self.read_u64(data, at),
        }
    }

    /// Writes a pointer value. 32-bit layouts keep the low 32 bits.
    pub fn write_ptr(&self, data: &mut [u8], at: usize, value: u64) -> Result<()> {
        match self.width {
            PointerWidth::Width32 => self.write_u32(data, at, value as u32),
            PointerWidth::Width64 => self.write_u64(data, at, value),
        }
    }

    /// Appends an `i16`.
    pub fn put_i16(&self, out: &mut Vec<u8>, value: i16) {
        match self.endian {
            Endian::Little => out.extend_from_slice(&value.to_le_bytes()),
            Endian::Big => out.extend_from_slice(&value.to_be_bytes()),
        }
    }

    /// Appends an `i32`.
    pub fn put_i32(&self, out: &mut Vec<u8>, value: i32) {
        match self.endian {
            Endian::Little => out.extend_from_slice(&value.to_le_bytes()),
            Endian::Big => out.extend_from_slice(&value.to_be_bytes()),
        }
    }

    /// Appends a pointer.
    pub fn put_ptr(&self, out: &mut Vec<u8>, value: u64) {
        match (self.width, self.endian) {
            (PointerWidth::Width32, Endian::Little) => {
                out.extend_from_slice(&(value as u32).to_le_bytes());
            }
            (PointerWidth::Width32, Endian::Big) => {
                out.extend_from_slice(&(value as u32).to_be_bytes());
            }
            (PointerWidth::Width64, Endian::Little) => out.extend_from_slice(&value.to_le_bytes()),
            (PointerWidth::Width64, Endian::Big) => out.extend_from_slice(&value.to_be_bytes()),
        }
    }

    /// Converts an address stored with this layout's width into `target`'s width.
    ///
    /// Narrowing drops the low alignment bits (`>> 3`), widening zero-extends. Struct pointer
    /// members go through the same rule during reconstruction, so block addresses and the
    /// pointers referring to them keep matching.
    pub fn convert_address(&self, old: u64, target: PointerWidth) -> u64 {
        match (self.width, target) {
            (PointerWidth::Width64, PointerWidth::Width32) => u64::from((old >> 3) as u32),
            (PointerWidth::Width32, PointerWidth::Width64) => old & 0xFFFF_FFFF,
            _ => old,
        }
    }

    /// Size of one block header for this layout.
    pub fn block_header_size(&self) -> usize {
        16 + self.pointer_size()
    }
}

/// The decoded file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Pointer width and endianness of the stream.
    pub layout: Layout,
    /// Version of the program that wrote the file (e.g. `405`).
    pub version: u16,
}

impl FileHeader {
    /// Creates a header.
    pub fn new(layout: Layout, version: u16) -> Self {
        Self { layout, version }
    }

    /// Parses the fixed-size header.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let header = bytes
            .get(..FILE_HEADER_SIZE)
            .ok_or_else(|| LoaderError::Format("not a valid document: truncated header".into()))?;
        if header[..7] != MAGIC_BYTES {
            return Err(LoaderError::Format("not a valid document: bad magic".into()));
        }
        let width = match header[7] {
            b'_' => PointerWidth::Width32,
            b'-' => PointerWidth::Width64,
            other => {
                return Err(LoaderError::Format(format!(
                    "not a valid document: unknown pointer marker {:?}",
                    other as char
                )));
            }
        };
        let endian = match header[8] {
            b'v' => Endian::Little,
            b'V' => Endian::Big,
            other => {
                return Err(LoaderError::Format(format!(
                    "not a valid document: unknown endian marker {:?}",
                    other as char
                )));
            }
        };
        let mut version: u16 = 0;
        for digit in &header[9..12] {
            if !digit.is_ascii_digit() {
                return Err(LoaderError::Format(
                    "not a valid document: version is not three ASCII digits".into(),
                ));
            }
            version = version * 10 + u16::from(digit - b'0');
        }
        Ok(Self {
            layout: Layout { width, endian },
            version,
        })
    }

    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        buf[..7].copy_from_slice(&MAGIC_BYTES);
        buf[7] = match self.layout.width {
            PointerWidth::Width32 => b'_',
            PointerWidth::Width64 => b'-',
        };
        buf[8] = match self.layout.endian {
            Endian::Little => b'v',
            Endian::Big => b'V',
        };
        let version = self.version % 1000;
        buf[9] = b'0' + (version / 100) as u8;
        buf[10] = b'0' + ((version / 10) % 10) as u8;
        buf[11] = b'0' + (version % 10) as u8;
        buf
    }
}

/// Two character type tag of an entity kind, e.g. `OB` or `LI`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdCode([u8; 2]);

impl IdCode {
    /// External document reference ("library").
    pub const LIBRARY: Self = Self(*b"LI");
    /// Link placeholder written for entities that live in another document.
    pub const LINK_PLACEHOLDER: Self = Self(*b"ID");

    /// Creates a code from two ASCII bytes.
    pub const fn new(code: [u8; 2]) -> Self {
        Self(code)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> [u8; 2] {
        self.0
    }
}

impl fmt::Debug for IdCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdCode({self})")
    }
}

impl fmt::Display for IdCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.0[0] as char, self.0[1] as char)
    }
}

/// Four byte block code.
///
/// Entity blocks use their two character [`IdCode`] followed by two zero bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockCode([u8; 4]);

impl BlockCode {
    /// End of stream sentinel.
    pub const ENDB: Self = Self(*b"ENDB");
    /// Struct descriptor table.
    pub const DNA1: Self = Self(*b"DNA1");
    /// Global settings.
    pub const GLOB: Self = Self(*b"GLOB");
    /// Anonymous data owned by the preceding entity.
    pub const DATA: Self = Self(*b"DATA");
    /// Render info (precedes the thumbnail).
    pub const REND: Self = Self(*b"REND");
    /// Thumbnail.
    pub const TEST: Self = Self(*b"TEST");
    /// User settings.
    pub const USER: Self = Self(*b"USER");

    /// Creates a code from raw bytes.
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Code of an entity block.
    pub const fn entity(code: IdCode) -> Self {
        Self([code.0[0], code.0[1], 0, 0])
    }

    /// Returns the entity code if this is an entity block.
    pub fn id_code(&self) -> Option<IdCode> {
        if self.0[2] == 0 && self.0[3] == 0 && self.0[0] != 0 {
            Some(IdCode([self.0[0], self.0[1]]))
        } else {
            None
        }
    }

    /// Returns true for entity blocks.
    pub fn is_entity(&self) -> bool {
        self.id_code().is_some()
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> [u8; 4] {
        self.0
    }
}

impl fmt::Debug for BlockCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockCode({self})")
    }
}

impl fmt::Display for BlockCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id_code() {
            Some(code) => write!(f, "{code}"),
            None => {
                for b in self.0 {
                    let c = if b.is_ascii_graphic() { b as char } else { '?' };
                    write!(f, "{c}")?;
                }
                Ok(())
            }
        }
    }
}

/// Fixed part of a block as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block code.
    pub code: BlockCode,
    /// Payload length in bytes.
    pub len: i32,
    /// Stale address of the block when it was written.
    pub old: u64,
    /// Index of the struct describing the payload (0 = raw bytes).
    pub sdna: i32,
    /// Number of structs in the payload.
    pub nr: i32,
}

impl BlockHeader {
    /// Decodes a header with the given layout.
    pub fn decode(layout: &Layout, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < layout.block_header_size() {
            return Err(LoaderError::Corrupt(
                "corrupt document: truncated block header".into(),
            ));
        }
        let code = BlockCode([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let len = layout.read_i32(bytes, 4)?;
        let old = layout.read_ptr(bytes, 8)?;
        let after = 8 + layout.pointer_size();
        let sdna = layout.read_i32(bytes, after)?;
        let nr = layout.read_i32(bytes, after + 4)?;
        Ok(Self {
            code,
            len,
            old,
            sdna,
            nr,
        })
    }

    /// Appends the encoded header.
    pub fn encode(&self, layout: &Layout, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.code.0);
        layout.put_i32(out, self.len);
        layout.put_ptr(out, self.old);
        layout.put_i32(out, self.sdna);
        layout.put_i32(out, self.nr);
    }
}
