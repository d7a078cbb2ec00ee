//! # blendloader
//!
//! A loader for versioned, pointer-graph documents stored as block containers: files made of
//! typed binary records whose payload layout is described by a struct table embedded in the
//! file itself, and whose records point at each other (and into other files) through the
//! addresses they had when they were written.
//!
//! ## Overview
//!
//! Loading such a document means more than decoding bytes. The loader
//!
//! *   **Reconciles layouts:** every struct stored in the file is matched by name against
//!     the struct table of the running program. Members are copied by name, converted
//!     between primitive types, pointer widths and byte orders; new members are
//!     zero-filled and dropped members ignored.
//! *   **Rebuilds the graph:** entity records become nodes of an arena, their anonymous data
//!     records are claimed by the entity that owns them, and stale addresses are resolved
//!     through per-file remapping tables.
//! *   **Follows references into other documents:** entities that live in another file are
//!     represented by placeholders first, then a fixed-point loop opens the referenced
//!     files, reads exactly the requested entities (and whatever they drag in) and
//!     replaces the placeholders in place.
//! *   **Upgrades old data:** version-gated passes run on entities written by older
//!     programs, before and after pointer resolution.
//! *   **Restores undo steps cheaply:** an in-memory snapshot is compared block by block
//!     with the previous state, and unchanged entities are handed over without decoding.
//!
//! ## Architecture
//!
//! ### The Container
//!
//! ```text
//! [File Header 12B] [Block] [Block] ... [DNA1 Block] [ENDB]
//! ```
//!
//! Each block is a header (`code`, `len`, stale `old` address, struct index, count)
//! followed by its payload. Entity blocks carry a two-character type code (`OB`, `LI`,
//! ...), `DATA` blocks following an entity belong to it, `ID` blocks stand for entities of
//! the library declared by the preceding `LI` block. See [`format`] and [`stream`].
//!
//! ### Load Phases
//!
//! 1.  **Open:** header, struct table ([`dna`]), global block, minimum version check.
//! 2.  **Read:** entities, libraries and link placeholders of the root file.
//! 3.  **Resolve:** library files are read until a pass makes no progress, weak references
//!     that stayed unresolved are dropped, then every document is linked.
//! 4.  **Finalize:** post-link versioning, cleanup, the global block's current scene.
//!
//! Non-fatal problems never abort a load; they end up in the [`report::LoadReport`] handed
//! back with the graph.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use blendloader::dna::{DnaStruct, IdHeader};
//! use blendloader::format::IdCode;
//! use blendloader::kind::GenericKind;
//! use blendloader::Loader;
//!
//! #[derive(Debug, Default, DnaStruct)]
//! #[dna(name = "Object")]
//! struct Object {
//!     id: IdHeader,
//!     #[dna(pointer = "Object")]
//!     parent: u64,
//!     loc: [f32; 3],
//! }
//!
//! let loader = Loader::builder()
//!     .define::<Object>()
//!     .kind(GenericKind::new(IdCode::new(*b"OB"), "object", "Object"))
//!     .build()?;
//!
//! let blend = loader.load_path("scene.blend")?;
//! println!("{}", blend.report);
//! # Ok::<(), blendloader::LoaderError>(())
//! ```
//!
//! ### Safety and Error Handling
//!
//! * **Encapsulated Unsafe:** the only `unsafe` block maps files into memory in
//!   [`source::open_path`].
//! * **No Panics:** no `unwrap()` or `panic!()` in the library (enforced by clippy lints).
//! * **Comprehensive Errors:** all failures correspond to a [`LoaderError`].

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![warn(missing_docs)]

// Lets the derive macro refer to `blendloader::...` from inside this crate.
extern crate self as blendloader;

// --- PUBLIC API MODULES ---
pub mod address_map;
pub mod compression;
pub mod dna;
pub mod error;
pub mod format;
pub mod graph;
pub mod kind;
pub mod loader;
pub mod report;
pub mod source;
pub mod stream;
pub mod versioning;
pub mod writer;

// Private modules
mod linker;
mod undo;

// --- RE-EXPORTS ---

#[cfg(feature = "lz4_flex")]
pub use compression::Lz4Compressor;
pub use compression::{Compressor, CompressorRegistry};

pub use dna::DnaStruct;
pub use error::{LoaderError, Result};
pub use graph::{DocumentId, Entity, EntityId, EntityTags, Graph, SessionUid};
pub use kind::{EntityKind, GenericKind, KindFlags};
pub use loader::{Blend, Loader, LoaderBuilder, LoaderConfig};
pub use report::{LoadReport, Severity};
pub use source::MemFile;
pub use versioning::{VersionInfo, Versioning};

/// Constants used throughout the library.
pub mod constants {
    /// Program version assumed when none is configured.
    pub const PROGRAM_VERSION: u16 = 405;

    /// Program sub-version assumed when none is configured.
    pub const PROGRAM_SUBVERSION: i16 = 0;

    /// First synthetic entity address in snapshots written by the loader.
    pub const SNAPSHOT_ADDRESS_BASE: u64 = 0x1000_0000;
}
