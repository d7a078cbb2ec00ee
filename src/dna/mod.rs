//! Struct descriptor tables: parsing, reconciliation and typed views.
//!
//! The built-in structs every document relies on are declared here with
//! `#[derive(DnaStruct)]`; [`builtin_catalog`] returns a builder pre-loaded with them so
//! applications only add their own entity structs.

pub mod catalog;
pub mod reconcile;
pub mod view;

pub use catalog::{Catalog, CatalogBuilder, MemberInfo, MemberKind, Primitive, StructInfo};
pub use reconcile::{Reconciler, StructFlag, reconcile};
pub use view::{DnaField, DnaPrimitive, DnaStruct, StructView, StructViewMut};

pub use blendloader_derive::DnaStruct;

use crate::error::Result;
use crate::format::Layout;

/// Capacity of the stored entity name, including the two-character code prefix.
pub const MAX_ID_NAME: usize = 66;

/// Capacity of stored file paths.
pub const FILE_MAX: usize = 1024;

/// Doubly linked list head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, DnaStruct)]
#[dna(name = "ListBase")]
pub struct ListBase {
    /// First element.
    #[dna(pointer)]
    pub first: u64,
    /// Last element.
    #[dna(pointer)]
    pub last: u64,
}

/// Header embedded at offset 0 of every entity struct.
#[derive(Debug, Clone, Default, PartialEq, Eq, DnaStruct)]
#[dna(name = "ID")]
pub struct IdHeader {
    /// Stale list link.
    #[dna(pointer)]
    pub next: u64,
    /// Stale list link.
    #[dna(pointer)]
    pub prev: u64,
    /// Two-character code followed by the entity name.
    #[dna(string = 66)]
    pub name: String,
    /// Stored flags (see [`crate::graph::StoredFlags`]).
    pub flag: i16,
    /// Runtime tags, meaningless on disk.
    pub tag: i32,
    /// User count.
    pub us: i32,
    /// Session-unique identifier, kept across undo steps.
    pub session_uid: u32,
    /// Library the entity was linked from.
    #[dna(pointer = "Library")]
    pub lib: u64,
}

/// External document reference (`LI` entities).
#[derive(Debug, Clone, Default, PartialEq, Eq, DnaStruct)]
#[dna(name = "Library")]
pub struct LibraryStruct {
    /// Entity header.
    pub id: IdHeader,
    /// Path as written, possibly relative (`//lib.blend`).
    #[dna(string = 1024)]
    pub filepath: String,
    /// Embedded copy of the referenced document.
    #[dna(pointer = "PackedFile")]
    pub packedfile: u64,
}

/// Bytes of a document embedded into another one.
#[derive(Debug, Clone, Default, PartialEq, Eq, DnaStruct)]
#[dna(name = "PackedFile")]
pub struct PackedFileStruct {
    /// Number of bytes behind `data`.
    pub size: i32,
    /// Unused read cursor.
    pub seek: i32,
    /// Data block holding the bytes.
    #[dna(pointer)]
    pub data: u64,
}

/// Global settings block (`GLOB`).
#[derive(Debug, Clone, Default, PartialEq, Eq, DnaStruct)]
#[dna(name = "FileGlobal")]
pub struct FileGlobalStruct {
    /// Sub-version of the writing program.
    pub subversion: i16,
    /// Oldest program version able to read the file.
    pub minversion: i16,
    /// Sub-version paired with `minversion`.
    pub minsubversion: i16,
    /// Alignment.
    pub pad: [u8; 2],
    /// Active scene when the file was written.
    #[dna(pointer = "Scene")]
    pub curscene: u64,
    /// File-level flags.
    pub fileflags: i32,
    /// Global flags.
    pub globalf: i32,
    /// Path the file was saved to.
    #[dna(string = 1024)]
    pub filename: String,
}

/// Returns a builder holding the built-in structs for `layout`.
pub fn builtin_catalog(layout: Layout) -> Result<CatalogBuilder> {
    let mut builder = CatalogBuilder::new(layout);
    builder
        .define::<ListBase>()?
        .define::<IdHeader>()?
        .define::<PackedFileStruct>()?
        .define::<LibraryStruct>()?
        .define::<FileGlobalStruct>()?;
    Ok(builder)
}
