use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::id::{DocumentId, EntityId, EntityTags, LinkState, SessionUid, StoredFlags};
use crate::format::{IdCode, Layout};

/// Key of a runtime cache attached to an entity.
pub type CacheKey = u32;

/// Opaque runtime cache. Shared so undo can hand it to the restored entity.
pub type CacheHandle = Arc<dyn Any + Send + Sync>;

/// An anonymous data block owned by an entity, keyed by its stale address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    /// Memory struct of the contents, `None` for raw bytes.
    pub struct_name: Option<String>,
    /// Number of structs stored.
    pub count: usize,
    /// Contents, laid out as `layout` says.
    pub bytes: Vec<u8>,
    /// Layout of `bytes`: the memory layout for struct blocks. Raw blocks keep the layout of
    /// the file they were read from until a typed read converts them.
    pub layout: Layout,
}

/// One node of the object graph.
#[derive(Clone)]
pub struct Entity {
    pub(crate) code: IdCode,
    pub(crate) name: String,
    pub(crate) session_uid: SessionUid,
    pub(crate) document: DocumentId,
    pub(crate) flags: StoredFlags,
    pub(crate) tags: EntityTags,
    pub(crate) state: LinkState,
    pub(crate) struct_name: Option<String>,
    pub(crate) payload: Vec<u8>,
    pub(crate) data: BTreeMap<u64, DataBlock>,
    pub(crate) links: BTreeMap<usize, Option<EntityId>>,
    pub(crate) caches: BTreeMap<CacheKey, CacheHandle>,
    pub(crate) old_address: u64,
}

impl Entity {
    /// Creates an entity without payload.
    pub fn new(code: IdCode, name: impl Into<String>, document: DocumentId) -> Self {
        Self {
            code,
            name: name.into(),
            session_uid: SessionUid::NONE,
            document,
            flags: StoredFlags::default(),
            tags: EntityTags::empty(),
            state: LinkState::RawRead,
            struct_name: None,
            payload: Vec::new(),
            data: BTreeMap::new(),
            links: BTreeMap::new(),
            caches: BTreeMap::new(),
            old_address: 0,
        }
    }

    pub(crate) fn placeholder(
        code: IdCode,
        name: impl Into<String>,
        document: DocumentId,
        flags: StoredFlags,
    ) -> Self {
        let mut entity = Self::new(code, name, document);
        entity.flags = flags;
        entity.state = LinkState::Placeholder;
        entity.tags = EntityTags::NEW | EntityTags::NEEDS_LINK | EntityTags::EXTERN;
        entity
    }

    /// Type tag.
    pub fn code(&self) -> IdCode {
        self.code
    }

    /// Name, without the type prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session-unique identifier.
    pub fn session_uid(&self) -> SessionUid {
        self.session_uid
    }

    /// Owning document.
    pub fn document(&self) -> DocumentId {
        self.document
    }

    /// Flags persisted with the entity.
    pub fn flags(&self) -> StoredFlags {
        self.flags
    }

    /// Runtime status bits.
    pub fn tags(&self) -> EntityTags {
        self.tags
    }

    /// Mutable runtime status bits.
    pub fn tags_mut(&mut self) -> &mut EntityTags {
        &mut self.tags
    }

    /// Linker state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// True while the entity only stands in for one in an external document.
    pub fn is_placeholder(&self) -> bool {
        self.state == LinkState::Placeholder
    }

    /// True for entities of external documents.
    pub fn is_linked(&self) -> bool {
        self.document != DocumentId::LOCAL
    }

    /// Memory struct of the payload.
    pub fn struct_name(&self) -> Option<&str> {
        self.struct_name.as_deref()
    }

    /// Reconstructed payload in the memory layout.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Mutable payload.
    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }

    /// Owned data blocks, by stale address.
    pub fn data(&self) -> &BTreeMap<u64, DataBlock> {
        &self.data
    }

    /// Mutable data blocks.
    pub fn data_mut(&mut self) -> &mut BTreeMap<u64, DataBlock> {
        &mut self.data
    }

    /// Target of the pointer slot at payload `offset` (`None` when null or unresolved).
    pub fn link(&self, offset: usize) -> Option<EntityId> {
        self.links.get(&offset).copied().flatten()
    }

    /// Every resolved pointer slot.
    pub fn links(&self) -> &BTreeMap<usize, Option<EntityId>> {
        &self.links
    }

    /// Overwrites a pointer slot.
    pub fn set_link(&mut self, offset: usize, target: Option<EntityId>) {
        self.links.insert(offset, target);
    }

    /// Runtime caches.
    pub fn caches(&self) -> &BTreeMap<CacheKey, CacheHandle> {
        &self.caches
    }

    /// Mutable runtime caches.
    pub fn caches_mut(&mut self) -> &mut BTreeMap<CacheKey, CacheHandle> {
        &mut self.caches
    }

    /// Address the entity had in the file it was read from.
    pub fn old_address(&self) -> u64 {
        self.old_address
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("code", &self.code)
            .field("name", &self.name)
            .field("session_uid", &self.session_uid)
            .field("document", &self.document)
            .field("tags", &self.tags)
            .field("state", &self.state)
            .field("payload_len", &self.payload.len())
            .field("data_blocks", &self.data.len())
            .field("links", &self.links)
            .field("caches", &self.caches.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Where an external document lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentOrigin {
    /// Path as written in the referencing file.
    pub stored: String,
    /// Absolute, normalised path used for deduplication.
    pub absolute: PathBuf,
}

/// A file contributing entities to the graph.
#[derive(Debug, Clone)]
pub struct Document {
    pub(crate) id: DocumentId,
    pub(crate) origin: Option<DocumentOrigin>,
    pub(crate) version: u16,
    pub(crate) subversion: i16,
    pub(crate) minversion: i16,
    pub(crate) minsubversion: i16,
    pub(crate) entities: Vec<EntityId>,
    pub(crate) index: HashMap<(IdCode, String), EntityId>,
    pub(crate) read_invalid: bool,
    pub(crate) missing: bool,
    pub(crate) opened: bool,
    pub(crate) library: Option<EntityId>,
}

impl Document {
    pub(crate) fn new(id: DocumentId, origin: Option<DocumentOrigin>) -> Self {
        Self {
            id,
            origin,
            version: 0,
            subversion: 0,
            minversion: 0,
            minsubversion: 0,
            entities: Vec::new(),
            index: HashMap::new(),
            read_invalid: false,
            missing: false,
            opened: false,
            library: None,
        }
    }

    /// Handle of this document.
    pub fn id(&self) -> DocumentId {
        self.id
    }

    /// `None` for the local document.
    pub fn origin(&self) -> Option<&DocumentOrigin> {
        self.origin.as_ref()
    }

    /// Absolute path of an external document.
    pub fn absolute_path(&self) -> Option<&Path> {
        self.origin.as_ref().map(|o| o.absolute.as_path())
    }

    /// Program version recorded in the file header.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Sub-version recorded in the global block.
    pub fn subversion(&self) -> i16 {
        self.subversion
    }

    /// Minimum reader version recorded in the global block.
    pub fn minversion(&self) -> (i16, i16) {
        (self.minversion, self.minsubversion)
    }

    /// Entities in read order.
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Entity registered under `(code, name)`.
    pub fn find(&self, code: IdCode, name: &str) -> Option<EntityId> {
        self.index.get(&(code, name.to_owned())).copied()
    }

    /// Set when versioning flagged the document corrupt.
    pub fn is_read_invalid(&self) -> bool {
        self.read_invalid
    }

    /// Set when the document's file could not be opened.
    pub fn is_missing(&self) -> bool {
        self.missing
    }

    /// Library entity referencing this document (external documents only).
    pub fn library(&self) -> Option<EntityId> {
        self.library
    }
}

/// Arena of entities and documents.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    slots: Vec<Option<Entity>>,
    documents: Vec<Option<Document>>,
}

impl Graph {
    /// Creates a graph holding only the local document.
    pub fn new() -> Self {
        let mut graph = Self::default();
        graph.documents.push(Some(Document::new(DocumentId::LOCAL, None)));
        graph
    }

    /// Creates an empty graph whose fresh handles never collide with those of `previous`.
    pub(crate) fn reserved_like(previous: &Graph) -> Self {
        let mut graph = Self::new();
        graph.slots.resize_with(previous.slots.len(), || None);
        graph
            .documents
            .resize_with(previous.documents.len().max(1), || None);
        graph
    }

    // --- Documents ---

    /// Adds an external document.
    pub fn add_document(&mut self, origin: DocumentOrigin) -> DocumentId {
        let id = DocumentId::new(self.documents.len() as u32);
        self.documents.push(Some(Document::new(id, Some(origin))));
        id
    }

    /// Document by handle.
    pub fn document(&self, id: DocumentId) -> Option<&Document> {
        self.documents.get(id.index()).and_then(|d| d.as_ref())
    }

    /// Mutable document by handle.
    pub fn document_mut(&mut self, id: DocumentId) -> Option<&mut Document> {
        self.documents.get_mut(id.index()).and_then(|d| d.as_mut())
    }

    /// The local document.
    pub fn local(&self) -> Option<&Document> {
        self.document(DocumentId::LOCAL)
    }

    /// Every live document, local first.
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.iter().flatten()
    }

    /// Handles of external documents, in creation order.
    pub fn library_documents(&self) -> Vec<DocumentId> {
        self.documents()
            .filter(|d| d.id != DocumentId::LOCAL)
            .map(|d| d.id)
            .collect()
    }

    /// External document whose absolute path equals `path`.
    pub fn find_document_by_path(&self, path: &Path) -> Option<DocumentId> {
        self.documents()
            .find(|d| d.absolute_path() == Some(path))
            .map(|d| d.id)
    }

    pub(crate) fn remove_document(&mut self, id: DocumentId) -> Option<Document> {
        if id == DocumentId::LOCAL {
            return None;
        }
        self.documents.get_mut(id.index()).and_then(|d| d.take())
    }

    pub(crate) fn place_document(&mut self, document: Document) {
        let index = document.id.index();
        if self.documents.len() <= index {
            self.documents.resize_with(index + 1, || None);
        }
        self.documents[index] = Some(document);
    }

    // --- Entities ---

    /// Appends an entity to its document and returns its handle.
    pub fn insert(&mut self, entity: Entity) -> EntityId {
        let id = EntityId::new(self.slots.len() as u32);
        self.slots.push(None);
        self.place(id, entity);
        id
    }

    /// Puts an entity into a specific slot, registering it with its document.
    pub(crate) fn place(&mut self, id: EntityId, entity: Entity) {
        let index = id.index();
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        let key = (entity.code, entity.name.clone());
        if let Some(doc) = self.document_mut(entity.document) {
            if !doc.entities.contains(&id) {
                doc.entities.push(id);
            }
            doc.index.insert(key, id);
        }
        self.slots[index] = Some(entity);
    }

    /// Replaces the contents of a slot, keeping the document registration.
    pub(crate) fn replace(&mut self, id: EntityId, entity: Entity) -> Option<Entity> {
        let old = self.detach(id);
        self.place(id, entity);
        old
    }

    /// Removes an entity from the arena and from its document.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.detach(id)?;
        Some(entity)
    }

    fn detach(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.slots.get_mut(id.index())?.take()?;
        if let Some(doc) = self.document_mut(entity.document) {
            doc.entities.retain(|e| *e != id);
            let key = (entity.code, entity.name.clone());
            if doc.index.get(&key) == Some(&id) {
                doc.index.remove(&key);
            }
        }
        Some(entity)
    }

    /// Entity by handle.
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.slots.get(id.index()).and_then(|s| s.as_ref())
    }

    /// Mutable entity by handle.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.slots.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    /// True if the slot holds an entity.
    pub fn contains(&self, id: EntityId) -> bool {
        self.get(id).is_some()
    }

    /// Every live entity, in slot order.
    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|e| (EntityId::new(i as u32), e)))
    }

    /// Handles of every live entity.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities().map(|(id, _)| id).collect()
    }

    /// Finds an entity by document, type and name.
    pub fn find(&self, document: DocumentId, code: IdCode, name: &str) -> Option<EntityId> {
        self.document(document)?.find(code, name)
    }

    /// Finds a local entity by type and name.
    pub fn find_local(&self, code: IdCode, name: &str) -> Option<EntityId> {
        self.find(DocumentId::LOCAL, code, name)
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// True when no entity is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots, live or free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Rewrites every pointer slot targeting `from`.
    pub(crate) fn retarget_links(&mut self, from: EntityId, to: Option<EntityId>) {
        for entity in self.slots.iter_mut().flatten() {
            for target in entity.links.values_mut() {
                if *target == Some(from) {
                    *target = to;
                }
            }
        }
        for doc in self.documents.iter_mut().flatten() {
            if doc.library == Some(from) {
                doc.library = to;
            }
        }
    }
}
