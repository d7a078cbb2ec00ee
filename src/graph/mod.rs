//! The live object graph produced by a load.
//!
//! Entities live in an arena addressed by [`EntityId`]; documents in a table addressed by
//! [`DocumentId`]. Replacing a placeholder writes the real entity into the placeholder's
//! slot, so every handle already pointing at it stays valid.

/// Defines `Graph`, `Entity` and `Document`.
pub mod core;
/// Defines the handle and flag types.
pub mod id;

pub use core::{CacheHandle, CacheKey, DataBlock, Document, DocumentOrigin, Entity, Graph};
pub use id::{DocumentId, EntityId, EntityTags, LinkState, SessionUid, StoredFlags};
