//! Cross-document resolution.
//!
//! Placeholders created while reading the root file are resolved by a fixed-point loop:
//! each pass opens the files of library documents that still wait for entities, reads the
//! requested blocks into the placeholders' slots and follows their pointers to pull in
//! whatever else they need, possibly creating placeholders in further documents. The loop
//! ends when a full pass reads nothing. Pointer slots are resolved afterwards, per document,
//! through the entity map of the file the owner was read from.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::address_map::EntityRef;
use crate::dna::{DnaStruct, IdHeader, LibraryStruct, PackedFileStruct, StructView};
use crate::error::{LoaderError, Result};
use crate::format::IdCode;
use crate::graph::{
    DocumentId, DocumentOrigin, Entity, EntityId, EntityTags, LinkState, SessionUid, StoredFlags,
};
use crate::kind::{PointerSlot, PointerWalk};
use crate::loader::{Blend, FileData, GlobalInfo, LoadContext, Loader, resolve_library_path};
use crate::report::{MissingDocument, MissingEntity, Severity};
use crate::source::{self, ByteSource};

/// Links one entity of the document at `absolute` into `blend`.
pub(crate) fn link_named(
    loader: &Loader,
    blend: &mut Blend,
    absolute: &Path,
    code: IdCode,
    name: &str,
) -> Result<EntityId> {
    let mut ctx = LoadContext::new(loader, absolute.display().to_string());
    ctx.graph = std::mem::take(&mut blend.graph);
    ctx.next_uid = ctx
        .graph
        .entities()
        .map(|(_, e)| e.session_uid.as_u32())
        .max()
        .unwrap_or(0)
        + 1;
    let linked = ctx.link_entity(absolute, code, name);
    ctx.finalize();
    let LoadContext { graph, report, .. } = ctx;
    blend.graph = graph;
    blend.report.merge(report);
    linked
}

const READ_TAGS: EntityTags = EntityTags::NEW
    .union(EntityTags::NEEDS_EXPAND)
    .union(EntityTags::EXTERN);

impl LoadContext<'_> {
    fn link_entity(&mut self, absolute: &Path, code: IdCode, name: &str) -> Result<EntityId> {
        let doc = match self.graph.find_document_by_path(absolute) {
            Some(doc) => doc,
            None => self.add_library(absolute)?,
        };
        let id = self.find_or_create_placeholder(
            doc,
            code,
            name,
            StoredFlags::new(false),
            SessionUid::NONE,
        );
        self.read_libraries()?;
        self.clear_weak_links();
        for doc in self.graph.library_documents() {
            if !self.file_of.contains_key(&doc) {
                continue;
            }
            self.version_pre_link(doc);
            if let Err(err) = self.lib_link(doc) {
                self.invalidate_document(doc, err.to_string());
            }
        }
        Ok(id)
    }

    /// Creates a library entity and its document for a file not referenced yet.
    fn add_library(&mut self, absolute: &Path) -> Result<DocumentId> {
        let stored = absolute.display().to_string();
        let label = absolute
            .file_name()
            .map_or_else(|| stored.clone(), |n| n.to_string_lossy().into_owned());
        let payload = LibraryStruct {
            id: IdHeader {
                name: format!("{}{label}", IdCode::LIBRARY),
                ..IdHeader::default()
            },
            filepath: stored.clone(),
            packedfile: 0,
        }
        .to_bytes(self.memory())?;

        let mut entity = Entity::new(IdCode::LIBRARY, label, DocumentId::LOCAL);
        entity.session_uid = self.assign_uid(SessionUid::NONE, None);
        entity.struct_name = Some(LibraryStruct::NAME.to_owned());
        entity.payload = payload;
        entity.state = LinkState::Resolved;
        let library = self.graph.insert(entity);

        let doc = self.graph.add_document(DocumentOrigin {
            stored,
            absolute: absolute.to_path_buf(),
        });
        if let Some(d) = self.graph.document_mut(doc) {
            d.library = Some(library);
        }
        log::debug!("linking from new library {} ({doc:?})", absolute.display());
        Ok(doc)
    }

    /// Reads library entities until no pass makes progress.
    pub(crate) fn read_libraries(&mut self) -> Result<()> {
        loop {
            self.report.stats.link_passes += 1;
            let mut read_any = false;
            for doc in self.graph.library_documents() {
                let pending = self.pending_placeholders(doc);
                if pending.is_empty() {
                    continue;
                }
                let file = match self.file_of.get(&doc) {
                    Some(file) => *file,
                    None => {
                        if self.is_missing(doc) || !self.has_strong(&pending) {
                            continue;
                        }
                        match self.open_library(doc) {
                            Some(file) => file,
                            None => continue,
                        }
                    }
                };
                read_any |= self.read_placeholders(doc, file, pending);
                self.expand_document(doc, file);
            }
            if !read_any {
                break;
            }
        }
        log::debug!(
            "library resolution settled after {} passes",
            self.report.stats.link_passes
        );
        Ok(())
    }

    fn pending_placeholders(&self, doc: DocumentId) -> Vec<EntityId> {
        let Some(document) = self.graph.document(doc) else {
            return Vec::new();
        };
        document
            .entities
            .iter()
            .copied()
            .filter(|id| {
                self.graph
                    .get(*id)
                    .is_some_and(|e| e.is_placeholder() && e.tags.contains(EntityTags::NEEDS_LINK))
            })
            .collect()
    }

    fn has_strong(&self, placeholders: &[EntityId]) -> bool {
        placeholders
            .iter()
            .any(|id| self.graph.get(*id).is_some_and(|e| !e.flags.is_weak_link()))
    }

    fn is_missing(&self, doc: DocumentId) -> bool {
        self.graph.document(doc).is_some_and(|d| d.missing)
    }

    /// Opens the file behind a library document: packed bytes first, then the disk.
    fn open_library(&mut self, doc: DocumentId) -> Option<usize> {
        let (stored, absolute, library) = {
            let document = self.graph.document(doc)?;
            let origin = document.origin.as_ref()?;
            (origin.stored.clone(), origin.absolute.clone(), document.library)
        };

        let opened = match library.and_then(|lib| self.packed_source(lib)) {
            Some(packed) => {
                log::debug!("reading library {} from packed data", absolute.display());
                packed
            }
            None => source::open_path(&absolute, self.loader.compressors()),
        };
        let loader = self.loader;
        match opened.and_then(|src| FileData::open(src, Some(&absolute), doc, loader)) {
            Ok(file) => {
                self.report.stats.libraries_opened += 1;
                log::info!(
                    "opened library {} (version {})",
                    absolute.display(),
                    file.version
                );
                Some(self.push_file(file))
            }
            Err(err) => {
                self.mark_missing(doc, stored, absolute, err);
                None
            }
        }
    }

    fn packed_source(&self, library: EntityId) -> Option<Result<Box<dyn ByteSource>>> {
        let memory = self.memory();
        let entity = self.graph.get(library)?;
        let lib = LibraryStruct::from_bytes(memory, entity.payload()).ok()?;
        if lib.packedfile == 0 {
            return None;
        }
        let packed = entity.data.get(&lib.packedfile)?;
        let packed = match PackedFileStruct::from_bytes(memory, &packed.bytes) {
            Ok(packed) => packed,
            Err(err) => return Some(Err(err)),
        };
        let Some(bytes) = entity.data.get(&packed.data) else {
            return Some(Err(LoaderError::Corrupt(
                "packed library has no data block".into(),
            )));
        };
        let size = (packed.size.max(0) as usize).min(bytes.bytes.len());
        Some(source::open_memory(
            bytes.bytes[..size].to_vec(),
            self.loader.compressors(),
        ))
    }

    fn mark_missing(
        &mut self,
        doc: DocumentId,
        stored: String,
        absolute: std::path::PathBuf,
        err: LoaderError,
    ) {
        if let Some(document) = self.graph.document_mut(doc) {
            document.missing = true;
        }
        for id in self.pending_placeholders(doc) {
            if let Some(entity) = self.graph.get_mut(id) {
                entity.tags.remove(EntityTags::NEEDS_LINK);
                entity.tags.insert(EntityTags::MISSING);
            }
        }
        self.report.message(
            Severity::Warning,
            format!("library '{stored}' not found at {}: {err}", absolute.display()),
        );
        self.report.missing_documents.push(MissingDocument {
            stored_path: stored,
            absolute_path: absolute,
            reason: err.to_string(),
        });
    }

    /// Reads the blocks the placeholders of `doc` stand for. Returns true if any was read.
    fn read_placeholders(&mut self, doc: DocumentId, file: usize, pending: Vec<EntityId>) -> bool {
        let mut loaded_ids: HashMap<(IdCode, String), EntityId> = HashMap::new();
        let mut read_any = false;
        for placeholder in pending {
            let Some((code, name, weak)) = self
                .graph
                .get(placeholder)
                .map(|e| (e.code, e.name.clone(), e.flags.is_weak_link()))
            else {
                continue;
            };
            let key = (code, name);
            if let Some(real) = loaded_ids.get(&key).copied() {
                if real != placeholder {
                    self.merge_into(placeholder, real, code);
                }
                continue;
            }

            let linkable = self.kinds.get(code).is_none_or(|k| k.kind.flags().linkable);
            let block = self
                .files
                .get(file)
                .and_then(|f| f.stream.find_by_name(code, &key.1))
                .map(|b| b.index());
            let Some(index) = block.filter(|_| linkable) else {
                if weak {
                    if let Some(entity) = self.graph.get_mut(placeholder) {
                        entity.tags.remove(EntityTags::NEEDS_LINK);
                    }
                } else {
                    self.missing_entity(doc, placeholder);
                }
                continue;
            };

            match self.read_entity(file, index, doc, READ_TAGS, Some(placeholder)) {
                Ok((Some(id), _)) => {
                    log::trace!("resolved {}{} in {doc:?}", key.0, key.1);
                    loaded_ids.insert(key, id);
                    read_any = true;
                }
                Ok((None, _)) => self.missing_entity(doc, placeholder),
                Err(err) => {
                    self.invalidate_document(doc, err.to_string());
                    break;
                }
            }
        }
        read_any
    }

    /// Replaces every reference to `from` by `to` and drops `from`.
    fn merge_into(&mut self, from: EntityId, to: EntityId, code: IdCode) {
        let target = EntityRef {
            id: to,
            code,
            linked: true,
        };
        let mut repointed = 0;
        for fd in &mut self.files {
            repointed += fd.entities.repoint(from, Some(target));
        }
        self.graph.remove(from);
        self.graph.retarget_links(from, Some(to));
        log::debug!("merged duplicate {from} into {to} ({repointed} map entries)");
    }

    fn missing_entity(&mut self, doc: DocumentId, placeholder: EntityId) {
        let Some(entity) = self.graph.get_mut(placeholder) else {
            return;
        };
        entity.tags.remove(EntityTags::NEEDS_LINK);
        entity.tags.insert(EntityTags::MISSING);
        let (code, name) = (entity.code, entity.name.clone());
        let document = self
            .graph
            .document(doc)
            .and_then(|d| d.absolute_path())
            .map(|p| p.to_path_buf())
            .unwrap_or_default();
        self.report.message(
            Severity::Warning,
            format!("{code}{name} not found in {}", document.display()),
        );
        self.report.missing_entities.push(MissingEntity {
            document,
            code: code.to_string(),
            name,
        });
    }

    /// Follows the pointers of every entity of `doc` waiting for expansion.
    fn expand_document(&mut self, doc: DocumentId, file: usize) {
        loop {
            let pending: Vec<EntityId> = self
                .graph
                .document(doc)
                .map(|d| d.entities.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|id| {
                    self.graph
                        .get(*id)
                        .is_some_and(|e| e.tags.contains(EntityTags::NEEDS_EXPAND))
                })
                .collect();
            if pending.is_empty() {
                return;
            }
            for id in pending {
                if let Err(err) = self.expand_entity(doc, file, id) {
                    self.invalidate_document(doc, err.to_string());
                    if let Some(entity) = self.graph.get_mut(id) {
                        entity.tags.remove(EntityTags::NEEDS_EXPAND);
                    }
                }
            }
        }
    }

    fn expand_entity(&mut self, doc: DocumentId, file: usize, id: EntityId) -> Result<()> {
        if let Some(entity) = self.graph.get_mut(id) {
            entity.tags.remove(EntityTags::NEEDS_EXPAND);
            entity.state = LinkState::Expanding;
        }
        let memory = self.memory();
        for slot in self.outgoing_slots(id)? {
            let fd = self.file(file)?;
            if slot.old == 0 || fd.entities.contains(slot.old) {
                continue;
            }
            let Some(block) = fd.stream.find_by_old(slot.old).cloned() else {
                continue;
            };
            match block.code().id_code() {
                None | Some(IdCode::LIBRARY) => {}
                Some(IdCode::LINK_PLACEHOLDER) => self.expand_link_placeholder(file, block.index())?,
                Some(code) => {
                    let Some(identity) = fd.identity(memory, &block)? else {
                        continue;
                    };
                    if let Some(existing) = self.graph.find(doc, code, &identity.name) {
                        if let Some(fd) = self.files.get_mut(file) {
                            fd.entities.insert_entity(
                                block.old(),
                                EntityRef {
                                    id: existing,
                                    code,
                                    linked: true,
                                },
                            );
                        }
                        continue;
                    }
                    if self.kinds.get(code).is_some_and(|k| !k.kind.flags().linkable) {
                        continue;
                    }
                    self.read_entity(
                        file,
                        block.index(),
                        doc,
                        READ_TAGS.union(EntityTags::LINKED_INDIRECTLY),
                        None,
                    )?;
                }
            }
        }
        if let Some(entity) = self.graph.get_mut(id) {
            entity.state = LinkState::NeedLink;
        }
        Ok(())
    }

    /// A pointer into another document: find or create the document, then the placeholder.
    fn expand_link_placeholder(&mut self, file: usize, index: usize) -> Result<()> {
        let memory = self.memory();
        let fd = self.file(file)?;
        let Some(library_block) = fd.stream.previous_library(index).cloned() else {
            self.report.message(
                Severity::Warning,
                format!("placeholder block {index} has no preceding library"),
            );
            return Ok(());
        };
        let Some(library) = fd.reconstruct(memory, &library_block)? else {
            return Ok(());
        };
        let stored = LibraryStruct::from_bytes(memory, &library.bytes)?.filepath;
        let absolute = resolve_library_path(&fd.base_dir, &stored);
        let block = fd.block(index)?;
        let Some(identity) = fd.identity(memory, &block)? else {
            return Ok(());
        };

        let doc = match self.graph.find_document_by_path(&absolute) {
            Some(doc) => doc,
            None => {
                let (lib, _) = self.read_entity(
                    file,
                    library_block.index(),
                    DocumentId::LOCAL,
                    EntityTags::NEW | EntityTags::LINKED_INDIRECTLY,
                    None,
                )?;
                let lib = lib.ok_or_else(|| {
                    LoaderError::Internal("library struct missing from the memory catalog".into())
                })?;
                self.attach_library(file, lib)?
            }
        };

        let id = self.find_or_create_placeholder(
            doc,
            identity.code,
            &identity.name,
            identity.flags,
            identity.uid,
        );
        if let Some(entity) = self.graph.get_mut(id)
            && entity.is_placeholder()
        {
            entity.tags.insert(EntityTags::LINKED_INDIRECTLY);
        }
        if let Some(fd) = self.files.get_mut(file) {
            fd.entities.insert_entity(
                block.old(),
                EntityRef {
                    id,
                    code: identity.code,
                    linked: true,
                },
            );
        }
        Ok(())
    }

    /// Pointer slots of an entity, as reported by its kind.
    pub(crate) fn outgoing_slots(&mut self, id: EntityId) -> Result<Vec<PointerSlot>> {
        let memory = self.memory();
        let Some((code, struct_name)) = self
            .graph
            .get(id)
            .and_then(|e| Some((e.code, e.struct_name.clone()?)))
        else {
            return Ok(Vec::new());
        };
        let kind = self.kinds.get_or_generic(code, &struct_name, memory);
        let entity = self
            .graph
            .get(id)
            .ok_or_else(|| LoaderError::Internal(format!("entity {id} vanished")))?;
        let walk = PointerWalk::new(
            StructView::new(memory, &struct_name, entity.payload())?,
            &kind.entity_slots,
        );
        let mut slots = Vec::new();
        kind.kind
            .foreach_outgoing_pointer(&walk, &mut |slot| slots.push(slot))?;
        Ok(slots)
    }

    /// Resolves the pointer slots of every entity of `doc` not resolved yet.
    pub(crate) fn lib_link(&mut self, doc: DocumentId) -> Result<()> {
        let Some(file) = self.file_of.get(&doc).copied() else {
            return Ok(());
        };
        let ids: Vec<EntityId> = self
            .graph
            .document(doc)
            .map(|d| d.entities.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|id| {
                self.graph
                    .get(*id)
                    .is_some_and(|e| !e.is_placeholder() && e.state != LinkState::Resolved)
            })
            .collect();

        let mut dangling = 0usize;
        for id in ids {
            let slots = self.outgoing_slots(id)?;
            let linked = self.graph.get(id).is_some_and(|e| e.is_linked());
            let fd = self
                .files
                .get_mut(file)
                .ok_or_else(|| LoaderError::Internal(format!("file {file} not opened")))?;
            let mut links = BTreeMap::new();
            for slot in slots {
                let target = match slot.old {
                    0 => None,
                    old => {
                        let found = fd.entities.lookup_entity(old, linked).map(|r| r.id);
                        if found.is_none() {
                            dangling += 1;
                        }
                        found
                    }
                };
                links.insert(slot.offset, target);
            }
            if let Some(entity) = self.graph.get_mut(id) {
                entity.links = links;
                entity.state = LinkState::Resolved;
            }
        }
        if dangling > 0 {
            log::debug!("{doc:?}: {dangling} pointers left unresolved");
        }
        Ok(())
    }

    /// Drops weak placeholders that were never resolved and nulls every reference to them.
    pub(crate) fn clear_weak_links(&mut self) {
        let weak: Vec<EntityId> = self
            .graph
            .entities()
            .filter(|(_, e)| e.is_placeholder() && e.flags.is_weak_link())
            .map(|(id, _)| id)
            .collect();
        for id in weak {
            for fd in &mut self.files {
                fd.entities.repoint(id, None);
            }
            self.graph.retarget_links(id, None);
            if let Some(entity) = self.graph.remove(id) {
                log::debug!("dropped weak reference {}{}", entity.code, entity.name);
            }
        }
    }

    /// Resolves the global block of the root file.
    pub(crate) fn link_global(&mut self) -> Option<GlobalInfo> {
        let root = self.files.first_mut()?;
        let global = root.global.clone()?;
        let curscene = match global.curscene {
            0 => None,
            old => root.entities.lookup_entity(old, false).map(|r| r.id),
        };
        Some(GlobalInfo {
            subversion: global.subversion,
            minversion: global.minversion,
            minsubversion: global.minsubversion,
            fileflags: global.fileflags,
            globalf: global.globalf,
            filename: global.filename,
            curscene,
        })
    }

    /// Removes library documents that were never opened and hold nothing.
    pub(crate) fn remove_unused_libraries(&mut self) {
        for doc in self.graph.library_documents() {
            let unused = self
                .graph
                .document(doc)
                .is_some_and(|d| !d.opened && !d.missing && d.entities.is_empty());
            if !unused {
                continue;
            }
            let Some(document) = self.graph.remove_document(doc) else {
                continue;
            };
            if let Some(library) = document.library {
                for fd in &mut self.files {
                    fd.entities.repoint(library, None);
                }
                self.graph.retarget_links(library, None);
                self.graph.remove(library);
            }
            log::debug!(
                "removed unused library {}",
                document
                    .absolute_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
        }
    }
}
