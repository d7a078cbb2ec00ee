use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Arena slot of an entity. Doubles as the entity's in-memory address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u32);

impl EntityId {
    /// Creates a new EntityId.
    /// Restrict visibility to the crate to prevent arbitrary creation.
    pub(crate) fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw numeric value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a document in the graph. The local document is always 0.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(u32);

impl DocumentId {
    /// The document that was loaded directly.
    pub const LOCAL: Self = Self(0);

    pub(crate) fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw numeric value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

/// Identifier stable for the lifetime of a session, kept across undo steps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SessionUid(u32);

impl SessionUid {
    /// No identifier assigned.
    pub const NONE: Self = Self(0);

    /// Wraps a raw value.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// True for [`SessionUid::NONE`].
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for SessionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionUid({})", self.0)
    }
}

/// Runtime status bits of an entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntityTags(u32);

impl EntityTags {
    /// Read during the current load.
    pub const NEW: Self = Self(1 << 0);
    /// Placeholder still waiting for its real entity.
    pub const NEEDS_LINK: Self = Self(1 << 1);
    /// Read from a library; outgoing pointers not expanded yet.
    pub const NEEDS_EXPAND: Self = Self(1 << 2);
    /// Stand-in for an entity that could not be found.
    pub const MISSING: Self = Self(1 << 3);
    /// Pulled in because another linked entity points at it.
    pub const LINKED_INDIRECTLY: Self = Self(1 << 4);
    /// Lives in an external document.
    pub const EXTERN: Self = Self(1 << 5);
    /// Undo: reused from the previous state without decoding.
    pub const UNDO_REUSED_UNCHANGED: Self = Self(1 << 6);
    /// Undo: decoded again into the previous slot.
    pub const UNDO_REREAD_IN_PLACE: Self = Self(1 << 7);
    /// Undo: kind excluded from undo, moved over untouched.
    pub const UNDO_REUSED_NOUNDO: Self = Self(1 << 8);

    const UNDO_MASK: u32 = Self::UNDO_REUSED_UNCHANGED.0
        | Self::UNDO_REREAD_IN_PLACE.0
        | Self::UNDO_REUSED_NOUNDO.0;

    /// No bits set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// True if every bit of `other` is set.
    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Bits of both sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Clears the undo classification bits.
    pub fn clear_undo(&mut self) {
        self.0 &= !Self::UNDO_MASK;
    }

    /// Returns the raw representation.
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for EntityTags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EntityTags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EntityTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EntityTags, &str); 9] = [
            (EntityTags::NEW, "NEW"),
            (EntityTags::NEEDS_LINK, "NEEDS_LINK"),
            (EntityTags::NEEDS_EXPAND, "NEEDS_EXPAND"),
            (EntityTags::MISSING, "MISSING"),
            (EntityTags::LINKED_INDIRECTLY, "LINKED_INDIRECTLY"),
            (EntityTags::EXTERN, "EXTERN"),
            (EntityTags::UNDO_REUSED_UNCHANGED, "UNDO_REUSED_UNCHANGED"),
            (EntityTags::UNDO_REREAD_IN_PLACE, "UNDO_REREAD_IN_PLACE"),
            (EntityTags::UNDO_REUSED_NOUNDO, "UNDO_REUSED_NOUNDO"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "EntityTags({})", set.join(" | "))
    }
}

/// Flags persisted in the entity header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StoredFlags(i16);

impl StoredFlags {
    const WEAK_LINK_MASK: i16 = 0b0000_0001;

    /// Decodes the stored value.
    pub fn from_raw(raw: i16) -> Self {
        Self(raw)
    }

    /// Builds flags with the weak-link bit set or cleared.
    pub fn new(weak_link: bool) -> Self {
        Self(if weak_link { Self::WEAK_LINK_MASK } else { 0 })
    }

    /// A reference that is dropped instead of reported when its target is missing.
    pub fn is_weak_link(&self) -> bool {
        (self.0 & Self::WEAK_LINK_MASK) != 0
    }

    /// Returns the raw representation.
    pub fn as_raw(&self) -> i16 {
        self.0
    }
}

/// Progress of an entity through the linker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Stands in for an entity of an external document not read yet.
    Placeholder,
    /// Payload reconstructed, pointers untouched.
    RawRead,
    /// Waiting for pointer resolution.
    NeedLink,
    /// Outgoing pointers are being followed to pull in more entities.
    Expanding,
    /// Pointers resolved.
    Resolved,
}
