//! Entity kinds: per-type behaviour plugged into the loader.
//!
//! Every two-character type tag maps to an [`EntityKind`] through the [`KindRegistry`]. The
//! loader asks the kind which data blocks belong to a freshly read entity, which payload
//! slots point at other entities, and gives it hooks around versioning and undo. The
//! registry is resolved against the memory catalog once per load so default pointer walks
//! are computed a single time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::address_map::AddressMap;
use crate::dna::{Catalog, LibraryStruct, MemberKind, PackedFileStruct, StructView};
use crate::dna::DnaStruct;
use crate::error::{LoaderError, Result};
use crate::format::{IdCode, Layout};
use crate::graph::{CacheKey, DataBlock, Entity, EntityId, Graph};
use crate::versioning::VersionInfo;

/// Capabilities of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindFlags {
    /// Entities may be pulled in from external documents.
    pub linkable: bool,
    /// Entities are excluded from undo and carried over untouched.
    pub no_undo: bool,
}

impl Default for KindFlags {
    fn default() -> Self {
        Self {
            linkable: true,
            no_undo: false,
        }
    }
}

/// A pointer slot of an entity payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerSlot {
    /// Byte offset within the payload.
    pub offset: usize,
    /// Stale address stored in the slot.
    pub old: u64,
}

/// Input to [`EntityKind::foreach_outgoing_pointer`].
#[derive(Debug)]
pub struct PointerWalk<'a> {
    view: StructView<'a>,
    default_slots: &'a [usize],
}

impl<'a> PointerWalk<'a> {
    pub(crate) fn new(view: StructView<'a>, default_slots: &'a [usize]) -> Self {
        Self {
            view,
            default_slots,
        }
    }

    /// Typed view of the payload.
    pub fn view(&self) -> &StructView<'a> {
        &self.view
    }

    /// Reports the slot holding the pointer member `name` (element `index`).
    pub fn slot(&self, name: &str, index: usize) -> Result<PointerSlot> {
        let member = self.view.member(name)?;
        let old = self.view.pointer_at(name, index)?;
        Ok(PointerSlot {
            offset: member.offset + index * member.elem_size,
            old,
        })
    }

    /// Visits every pointer member whose pointee is an entity struct.
    pub fn visit_defaults(&self, visit: &mut dyn FnMut(PointerSlot)) -> Result<()> {
        let layout = self.view.catalog().layout();
        for offset in self.default_slots {
            let old = layout.read_ptr(self.view.bytes(), *offset)?;
            visit(PointerSlot {
                offset: *offset,
                old,
            });
        }
        Ok(())
    }
}

/// Scalars that typed array reads can convert between byte orders.
pub trait ArrayElement: Copy {
    /// Size in bytes.
    const SIZE: usize;

    /// Reads one element at `at`.
    fn read(layout: &Layout, data: &[u8], at: usize) -> Result<Self>;

    /// Writes one element at `at`.
    fn write(self, layout: &Layout, data: &mut [u8], at: usize) -> Result<()>;
}

macro_rules! array_element {
    ($ty:ty, $size:expr, $read:ident, $write:ident, $bits:ty) => {
        impl ArrayElement for $ty {
            const SIZE: usize = $size;

            fn read(layout: &Layout, data: &[u8], at: usize) -> Result<Self> {
                layout.$read(data, at).map(|v| <$ty>::from_ne_bytes(<$bits>::to_ne_bytes(v)))
            }

            fn write(self, layout: &Layout, data: &mut [u8], at: usize) -> Result<()> {
                layout.$write(data, at, <$bits>::from_ne_bytes(self.to_ne_bytes()))
            }
        }
    };
}

array_element!(i16, 2, read_u16, write_u16, u16);
array_element!(u16, 2, read_u16, write_u16, u16);
array_element!(i32, 4, read_u32, write_u32, u32);
array_element!(u32, 4, read_u32, write_u32, u32);
array_element!(f32, 4, read_u32, write_u32, u32);
array_element!(i64, 8, read_u64, write_u64, u64);
array_element!(u64, 8, read_u64, write_u64, u64);
array_element!(f64, 8, read_u64, write_u64, u64);

/// Access to the data blocks read after an entity block.
///
/// Blocks the kind claims become the entity's data; the rest are dropped. Struct blocks
/// arrive in the memory layout. Raw blocks keep the layout of their file until one of the
/// typed `read_*` calls converts them in place.
#[derive(Debug)]
pub struct DataReader<'a> {
    map: &'a mut AddressMap<DataBlock>,
    memory: &'a Catalog,
    data_slots: &'a [usize],
}

impl<'a> DataReader<'a> {
    pub(crate) fn new(
        map: &'a mut AddressMap<DataBlock>,
        memory: &'a Catalog,
        data_slots: &'a [usize],
    ) -> Self {
        Self {
            map,
            memory,
            data_slots,
        }
    }

    /// Memory catalog, for decoding claimed blocks.
    pub fn memory(&self) -> &Catalog {
        self.memory
    }

    /// Inspects a block without claiming it.
    pub fn get(&self, old: u64) -> Option<&DataBlock> {
        self.map.peek(old)
    }

    /// Claims the block at `old`. Returns false if there is none.
    pub fn claim(&mut self, old: u64) -> bool {
        old != 0 && self.map.lookup(old, true).is_some()
    }

    /// Claims every pending block.
    pub fn claim_all(&mut self) {
        let keys: Vec<u64> = self.map.iter().map(|(old, _)| old).collect();
        for old in keys {
            self.map.lookup(old, true);
        }
    }

    /// Claims the blocks referenced by the payload's non-entity pointer members.
    pub fn claim_referenced(&mut self, entity: &Entity) -> Result<()> {
        let layout = self.memory.layout();
        for offset in self.data_slots {
            let old = layout.read_ptr(entity.payload(), *offset)?;
            self.claim(old);
        }
        Ok(())
    }

    fn claim_mut(&mut self, old: u64) -> Option<&mut DataBlock> {
        if old == 0 {
            return None;
        }
        self.map.lookup_mut(old, true)
    }

    /// Claims the block at `old` as an array of `count` pointers and returns them in the
    /// memory pointer width. The block is rewritten in the memory layout.
    ///
    /// Returns `None` when no block sits at `old`.
    pub fn read_pointer_array(&mut self, old: u64, count: usize) -> Result<Option<Vec<u64>>> {
        let memory = self.memory.layout();
        let Some(block) = self.claim_mut(old) else {
            return Ok(None);
        };
        let from = block.layout;
        check_array_len(old, count, from.pointer_size(), block.bytes.len())?;
        let values = (0..count)
            .map(|i| {
                from.read_ptr(&block.bytes, i * from.pointer_size())
                    .map(|v| from.convert_address(v, memory.width))
            })
            .collect::<Result<Vec<u64>>>()?;
        if from != memory {
            let mut bytes = vec![0u8; count * memory.pointer_size()];
            for (i, value) in values.iter().enumerate() {
                memory.write_ptr(&mut bytes, i * memory.pointer_size(), *value)?;
            }
            block.bytes = bytes;
            block.layout = memory;
        }
        Ok(Some(values))
    }

    /// Claims the block at `old` as an array of `count` scalars, swapping the byte order to
    /// the memory layout in place.
    ///
    /// Returns `None` when no block sits at `old`.
    pub fn read_array<T: ArrayElement>(&mut self, old: u64, count: usize) -> Result<Option<Vec<T>>> {
        let memory = self.memory.layout();
        let Some(block) = self.claim_mut(old) else {
            return Ok(None);
        };
        let from = block.layout;
        check_array_len(old, count, T::SIZE, block.bytes.len())?;
        let values = (0..count)
            .map(|i| T::read(&from, &block.bytes, i * T::SIZE))
            .collect::<Result<Vec<T>>>()?;
        if from.endian != memory.endian {
            for (i, value) in values.iter().enumerate() {
                value.write(&memory, &mut block.bytes, i * T::SIZE)?;
            }
        }
        block.layout = Layout::new(block.layout.width, memory.endian);
        Ok(Some(values))
    }

    /// [`read_array`](Self::read_array) for `i32`.
    pub fn read_i32_array(&mut self, old: u64, count: usize) -> Result<Option<Vec<i32>>> {
        self.read_array(old, count)
    }

    /// [`read_array`](Self::read_array) for `f32`.
    pub fn read_f32_array(&mut self, old: u64, count: usize) -> Result<Option<Vec<f32>>> {
        self.read_array(old, count)
    }

    /// [`read_array`](Self::read_array) for `f64`.
    pub fn read_f64_array(&mut self, old: u64, count: usize) -> Result<Option<Vec<f64>>> {
        self.read_array(old, count)
    }
}

fn check_array_len(old: u64, count: usize, elem: usize, len: usize) -> Result<()> {
    match count.checked_mul(elem) {
        Some(needed) if needed <= len => Ok(()),
        _ => Err(LoaderError::Corrupt(format!(
            "corrupt document: data block {old:#x} holds {len} bytes, {count} x {elem} requested"
        ))),
    }
}

/// Behaviour of one entity type.
pub trait EntityKind: Send + Sync + fmt::Debug {
    /// Two-character type tag.
    fn code(&self) -> IdCode;

    /// Human readable name.
    fn name(&self) -> &str;

    /// Memory struct of the payload.
    fn struct_name(&self) -> &str;

    /// Capabilities.
    fn flags(&self) -> KindFlags {
        KindFlags::default()
    }

    /// Claims the data blocks belonging to a freshly read entity.
    ///
    /// The default claims every block a non-entity pointer member of the payload refers to.
    fn decode_payload(&self, entity: &mut Entity, data: &mut DataReader<'_>) -> Result<()> {
        data.claim_referenced(entity)
    }

    /// Reports the payload slots pointing at other entities.
    fn foreach_outgoing_pointer(
        &self,
        walk: &PointerWalk<'_>,
        visit: &mut dyn FnMut(PointerSlot),
    ) -> Result<()> {
        walk.visit_defaults(visit)
    }

    /// Reports the runtime caches the kind keeps on an entity.
    fn foreach_cache_handle(&self, _entity: &Entity, _visit: &mut dyn FnMut(CacheKey)) {}

    /// Runs before pointers are resolved, for each newly read entity of this kind.
    fn pre_link(&self, _entity: &mut Entity, _version: VersionInfo, _memory: &Catalog) -> Result<()> {
        Ok(())
    }

    /// Runs after the whole graph is resolved, for each newly read entity of this kind.
    fn post_link(&self, _graph: &mut Graph, _id: EntityId, _version: VersionInfo) -> Result<()> {
        Ok(())
    }

    /// Carries runtime state of the previous undo step into an entity decoded again.
    fn undo_preserve(&self, _new: &mut Entity, _old: &Entity) {}
}

/// Kind for external document references (`LI`).
///
/// Claims the packed copy of the referenced document, if any.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibraryKind;

impl EntityKind for LibraryKind {
    fn code(&self) -> IdCode {
        IdCode::LIBRARY
    }

    fn name(&self) -> &str {
        "Library"
    }

    fn struct_name(&self) -> &str {
        LibraryStruct::NAME
    }

    fn flags(&self) -> KindFlags {
        KindFlags {
            linkable: false,
            no_undo: false,
        }
    }

    fn decode_payload(&self, entity: &mut Entity, data: &mut DataReader<'_>) -> Result<()> {
        let library = LibraryStruct::from_bytes(data.memory(), entity.payload())?;
        if library.packedfile == 0 || !data.claim(library.packedfile) {
            return Ok(());
        }
        let packed = match data.get(library.packedfile) {
            Some(block) if block.struct_name.as_deref() == Some(PackedFileStruct::NAME) => {
                PackedFileStruct::from_bytes(data.memory(), &block.bytes)?
            }
            _ => return Ok(()),
        };
        data.claim(packed.data);
        Ok(())
    }

    fn foreach_outgoing_pointer(
        &self,
        _walk: &PointerWalk<'_>,
        _visit: &mut dyn FnMut(PointerSlot),
    ) -> Result<()> {
        Ok(())
    }
}

/// Kind without custom behaviour, for types that only need the default pointer walk.
#[derive(Debug, Clone)]
pub struct GenericKind {
    code: IdCode,
    name: String,
    struct_name: String,
    flags: KindFlags,
}

impl GenericKind {
    /// Creates a kind reading `struct_name` payloads.
    pub fn new(code: IdCode, name: impl Into<String>, struct_name: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
            struct_name: struct_name.into(),
            flags: KindFlags::default(),
        }
    }

    /// Overrides the capabilities.
    pub fn with_flags(mut self, flags: KindFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl EntityKind for GenericKind {
    fn code(&self) -> IdCode {
        self.code
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn struct_name(&self) -> &str {
        &self.struct_name
    }

    fn flags(&self) -> KindFlags {
        self.flags
    }
}

/// Maps type tags to kinds.
#[derive(Debug, Clone)]
pub struct KindRegistry {
    kinds: HashMap<IdCode, Arc<dyn EntityKind>>,
}

impl KindRegistry {
    /// Creates a registry holding the built-in [`LibraryKind`].
    pub fn new() -> Self {
        let mut reg = Self {
            kinds: HashMap::new(),
        };
        reg.register(Arc::new(LibraryKind));
        reg
    }

    /// Registers a kind, replacing any previous kind with the same code.
    pub fn register(&mut self, kind: Arc<dyn EntityKind>) {
        self.kinds.insert(kind.code(), kind);
    }

    /// Kind registered for `code`.
    pub fn get(&self, code: IdCode) -> Option<&Arc<dyn EntityKind>> {
        self.kinds.get(&code)
    }

    /// Every registered kind.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn EntityKind>> {
        self.kinds.values()
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Precomputes pointer slots against the memory catalog.
    pub(crate) fn resolve(&self, memory: &Catalog) -> ResolvedKinds {
        let mut entity_structs: Vec<&str> = self.kinds.values().map(|k| k.struct_name()).collect();
        entity_structs.push("ID");

        let mut entries = HashMap::new();
        for (code, kind) in &self.kinds {
            entries.insert(*code, ResolvedKind::new(Arc::clone(kind), memory, &entity_structs));
        }
        ResolvedKinds {
            entries,
            entity_structs: entity_structs.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A kind with its precomputed slots.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedKind {
    pub(crate) kind: Arc<dyn EntityKind>,
    pub(crate) entity_slots: Vec<usize>,
    pub(crate) data_slots: Vec<usize>,
}

impl ResolvedKind {
    fn new(kind: Arc<dyn EntityKind>, memory: &Catalog, entity_structs: &[&str]) -> Self {
        let mut entity_slots = Vec::new();
        let mut data_slots = Vec::new();
        if let Some(info) = memory.struct_info_by_name(kind.struct_name()) {
            for member in &info.members {
                if member.kind != MemberKind::Pointer {
                    continue;
                }
                let to_entity = entity_structs.contains(&member.type_name.as_str());
                for e in 0..member.array_len {
                    let offset = member.offset + e * member.elem_size;
                    if to_entity {
                        entity_slots.push(offset);
                    } else {
                        data_slots.push(offset);
                    }
                }
            }
        }
        Self {
            kind,
            entity_slots,
            data_slots,
        }
    }
}

/// Registry resolved against one memory catalog.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedKinds {
    entries: HashMap<IdCode, ResolvedKind>,
    entity_structs: Vec<String>,
}

impl ResolvedKinds {
    /// Kind for `code`, or a generic kind reading `struct_name` when none is registered.
    pub(crate) fn get_or_generic(
        &mut self,
        code: IdCode,
        struct_name: &str,
        memory: &Catalog,
    ) -> ResolvedKind {
        if let Some(kind) = self.entries.get(&code) {
            return kind.clone();
        }
        log::debug!("no kind registered for {code}, reading {struct_name} generically");
        let structs: Vec<&str> = self.entity_structs.iter().map(|s| s.as_str()).collect();
        let resolved = ResolvedKind::new(
            Arc::new(GenericKind::new(code, code.to_string(), struct_name)),
            memory,
            &structs,
        );
        self.entries.insert(code, resolved.clone());
        resolved
    }

    /// Registered kind for `code`.
    pub(crate) fn get(&self, code: IdCode) -> Option<&ResolvedKind> {
        self.entries.get(&code)
    }
}
