//! Differential restore of an undo snapshot.
//!
//! The snapshot is read like a regular document, except that every entity block is first
//! matched against the previous state by session uid. Blocks flagged identical hand their
//! previous entity over untouched, changed ones are decoded into the previous arena slot,
//! and only genuinely new entities get fresh slots. Library documents are carried over
//! instead of being read from disk again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::address_map::EntityRef;
use crate::error::Result;
use crate::format::{BlockCode, IdCode};
use crate::graph::{
    CacheHandle, CacheKey, DocumentId, Entity, EntityId, EntityTags, Graph, LinkState, SessionUid,
};
use crate::loader::{Blend, LoadContext, Loader};
use crate::report::UndoStats;
use crate::source::{MemFile, MemFileSource};

struct Restore<'l> {
    ctx: LoadContext<'l>,
    previous: Graph,
    /// Previous local entities by uid.
    by_uid: HashMap<SessionUid, EntityId>,
    /// Uid of every previous entity, for remapping pointers of no-undo entities.
    previous_uids: HashMap<EntityId, SessionUid>,
    /// No-undo entities already moved, by uid.
    moved_noundo: HashMap<SessionUid, EntityId>,
    caches: HashMap<(SessionUid, CacheKey), CacheHandle>,
    preserve: Vec<(EntityId, Entity)>,
    stats: UndoStats,
}

pub(crate) fn restore(loader: &Loader, previous: Blend, snapshot: &MemFile) -> Result<Blend> {
    let Blend {
        graph: previous,
        user_settings,
        thumbnail,
        ..
    } = previous;

    // 1. A context that keeps stored uids and never hands out a previous slot twice.
    let mut ctx = LoadContext::new(loader, "<undo>".to_owned());
    ctx.keep_uids = true;
    ctx.graph = Graph::reserved_like(&previous);
    ctx.next_uid = previous
        .entities()
        .map(|(_, e)| e.session_uid.as_u32())
        .max()
        .unwrap_or(0)
        + 1;
    let root = ctx.open_root(Box::new(MemFileSource::new(snapshot.clone())), None)?;

    let mut restore = Restore {
        ctx,
        by_uid: HashMap::new(),
        previous_uids: previous
            .entities()
            .map(|(id, e)| (id, e.session_uid))
            .collect(),
        previous,
        moved_noundo: HashMap::new(),
        caches: HashMap::new(),
        preserve: Vec::new(),
        stats: UndoStats::default(),
    };

    // 2. Kinds excluded from undo move over first, untouched.
    restore.move_noundo();

    // 3. Runtime caches and the uid index of what is left.
    restore.index_previous();

    // 4. Classify every block of the snapshot.
    restore.read_blocks(root)?;

    // 5. Link, then patch what linking does not cover.
    restore.ctx.resolve()?;
    restore.remap_noundo();
    restore.run_preserve();
    restore.null_dangling();

    restore.stats.removed = restore
        .previous
        .entities()
        .filter(|(_, e)| e.document == DocumentId::LOCAL)
        .count();
    restore.ctx.finalize();

    let Restore { ctx, stats, .. } = restore;
    log::info!(
        "undo restore: {} unchanged, {} re-read, {} no-undo, {} added, {} removed",
        stats.reused_unchanged,
        stats.reread_in_place,
        stats.reused_noundo,
        stats.added,
        stats.removed
    );
    let mut blend = ctx.into_blend(user_settings, thumbnail);
    blend.report.stats.undo = Some(stats);
    Ok(blend)
}

impl Restore<'_> {
    fn is_noundo(&self, code: IdCode) -> bool {
        self.ctx
            .kinds
            .get(code)
            .is_some_and(|k| k.kind.flags().no_undo)
    }

    fn move_noundo(&mut self) {
        let ids: Vec<EntityId> = self
            .previous
            .entities()
            .filter(|(_, e)| e.document == DocumentId::LOCAL && self.is_noundo(e.code))
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            let Some(mut entity) = self.previous.remove(id) else {
                continue;
            };
            entity.tags.clear_undo();
            entity.tags.insert(EntityTags::UNDO_REUSED_NOUNDO);
            self.moved_noundo.insert(entity.session_uid, id);
            log::trace!("undo: kept {}{} (no undo)", entity.code, entity.name);
            self.ctx.graph.place(id, entity);
            self.stats.reused_noundo += 1;
        }
    }

    fn index_previous(&mut self) {
        for (id, entity) in self.previous.entities() {
            for (key, handle) in &entity.caches {
                self.caches
                    .insert((entity.session_uid, *key), Arc::clone(handle));
            }
            if entity.document == DocumentId::LOCAL
                && !entity.is_placeholder()
                && !entity.session_uid.is_none()
            {
                self.by_uid.insert(entity.session_uid, id);
            }
        }
    }

    fn read_blocks(&mut self, root: usize) -> Result<()> {
        let count = self.ctx.file(root)?.stream.blocks().len();
        let mut current_library: Option<DocumentId> = None;
        let mut index = 0;
        while index < count {
            let block = self.ctx.file(root)?.block(index)?;
            index += 1;
            match block.code() {
                // Previous user settings and thumbnail are carried over as they are.
                BlockCode::USER => index = self.ctx.file(root)?.data_run_end(block.index()),
                BlockCode::TEST
                | BlockCode::GLOB
                | BlockCode::DNA1
                | BlockCode::REND
                | BlockCode::DATA => {}
                code => match code.id_code() {
                    Some(IdCode::LIBRARY) => {
                        let (doc, next) = self.restore_library(root, block.index())?;
                        current_library = doc.or(current_library);
                        index = next;
                    }
                    Some(IdCode::LINK_PLACEHOLDER) => {
                        if let Some(doc) = current_library {
                            self.restore_linked(root, block.index(), doc)?;
                        }
                    }
                    Some(_) => index = self.restore_entity(root, block.index())?,
                    None => {}
                },
            }
        }
        Ok(())
    }

    /// Carries over the previous library document with the same uid, or reads the block.
    fn restore_library(&mut self, root: usize, index: usize) -> Result<(Option<DocumentId>, usize)> {
        let memory = self.ctx.memory();
        let fd = self.ctx.file(root)?;
        let block = fd.block(index)?;
        let next = fd.data_run_end(index);
        let uid = match fd.peek_identity(&block) {
            Some((_, uid)) => Some(uid),
            None => fd.identity(memory, &block)?.map(|identity| identity.uid),
        };

        let previous_library = uid.filter(|uid| !uid.is_none()).and_then(|uid| {
            self.previous
                .entities()
                .find(|(_, e)| e.code == IdCode::LIBRARY && e.session_uid == uid)
        });
        let previous_doc = previous_library.and_then(|(library, _)| {
            self.previous
                .documents()
                .find(|d| d.library == Some(library))
                .map(|d| (library, d.id))
        });
        let Some((library, doc)) = previous_doc else {
            return self.ctx.read_library_block(root, index);
        };

        let Some(document) = self.previous.remove_document(doc) else {
            return self.ctx.read_library_block(root, index);
        };
        let members = document.entities.clone();
        self.ctx.graph.place_document(document);
        for id in members {
            if let Some(mut entity) = self.previous.remove(id) {
                entity.tags.clear_undo();
                entity.tags.insert(EntityTags::UNDO_REUSED_UNCHANGED);
                self.ctx.graph.place(id, entity);
                self.stats.reused_unchanged += 1;
            }
        }
        if let Some(mut entity) = self.previous.remove(library) {
            entity.tags.clear_undo();
            entity.tags.insert(EntityTags::UNDO_REUSED_UNCHANGED);
            self.ctx.graph.place(library, entity);
        }
        if let Some(fd) = self.ctx.files.get_mut(root) {
            fd.entities.insert_entity(
                block.old(),
                EntityRef {
                    id: library,
                    code: IdCode::LIBRARY,
                    linked: false,
                },
            );
        }
        log::debug!("undo: kept library document {doc:?}");
        Ok((Some(doc), next))
    }

    /// Maps a link placeholder block onto the carried-over entity, by uid then by name.
    fn restore_linked(&mut self, root: usize, index: usize, doc: DocumentId) -> Result<()> {
        let memory = self.ctx.memory();
        let fd = self.ctx.file(root)?;
        let block = fd.block(index)?;
        let Some(identity) = fd.identity(memory, &block)? else {
            return Ok(());
        };
        let by_uid = self.ctx.graph.document(doc).and_then(|d| {
            d.entities.iter().copied().find(|id| {
                !identity.uid.is_none()
                    && self
                        .ctx
                        .graph
                        .get(*id)
                        .is_some_and(|e| e.session_uid == identity.uid)
            })
        });
        let Some(id) = by_uid else {
            return self.ctx.read_link_placeholder(root, index, doc);
        };
        if let Some(fd) = self.ctx.files.get_mut(root) {
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

    fn restore_entity(&mut self, root: usize, index: usize) -> Result<usize> {
        let memory = self.ctx.memory();
        let fd = self.ctx.file(root)?;
        let block = fd.block(index)?;
        let next = fd.data_run_end(index);
        let identical = fd
            .stream
            .blocks()
            .iter()
            .skip(index)
            .take(next - index)
            .all(|b| b.is_identical());
        // Unchanged entities are matched without decoding their payload.
        let peeked = match fd.peek_identity(&block) {
            Some(found) => Some(found),
            None => fd.identity(memory, &block)?.map(|identity| (identity.code, identity.uid)),
        };
        let Some((code, uid)) = peeked else {
            let (_, next) =
                self.ctx
                    .read_entity(root, index, DocumentId::LOCAL, EntityTags::NEW, None)?;
            return Ok(next);
        };
        let local = |id| EntityRef {
            id,
            code,
            linked: false,
        };

        // Moved already: the block only feeds the entity map.
        if let Some(id) = self.moved_noundo.get(&uid).copied() {
            if let Some(fd) = self.ctx.files.get_mut(root) {
                fd.entities.insert_entity(block.old(), local(id));
            }
            return Ok(next);
        }

        let previous = self
            .by_uid
            .get(&uid)
            .copied()
            .filter(|id| self.previous.get(*id).is_some_and(|e| e.code == code));
        match previous {
            Some(id) if identical => {
                let Some(mut entity) = self.previous.remove(id) else {
                    return Ok(next);
                };
                entity.tags.clear_undo();
                entity.tags.remove(EntityTags::NEW);
                entity.tags.insert(EntityTags::UNDO_REUSED_UNCHANGED);
                entity.state = LinkState::NeedLink;
                entity.old_address = block.old();
                log::trace!("undo: {}{} unchanged", entity.code, entity.name);
                self.ctx.graph.place(id, entity);
                if let Some(fd) = self.ctx.files.get_mut(root) {
                    fd.entities.insert_entity(block.old(), local(id));
                }
                self.stats.reused_unchanged += 1;
            }
            Some(id) => {
                let (read, _) = self.ctx.read_entity(
                    root,
                    index,
                    DocumentId::LOCAL,
                    EntityTags::NEW | EntityTags::UNDO_REREAD_IN_PLACE,
                    Some(id),
                )?;
                if read.is_some() {
                    self.restore_caches(id);
                    log::trace!("undo: {code} uid {} re-read in place", uid.as_u32());
                    self.stats.reread_in_place += 1;
                }
                if let Some(old) = self.previous.remove(id) {
                    self.preserve.push((id, old));
                }
            }
            None => {
                let (read, _) =
                    self.ctx
                        .read_entity(root, index, DocumentId::LOCAL, EntityTags::NEW, None)?;
                if read.is_some() {
                    self.stats.added += 1;
                }
            }
        }
        Ok(next)
    }

    fn restore_caches(&mut self, id: EntityId) {
        let Some(entity) = self.ctx.graph.get(id) else {
            return;
        };
        let Some(kind) = self.ctx.kinds.get(entity.code) else {
            return;
        };
        let mut keys = Vec::new();
        kind.kind.foreach_cache_handle(entity, &mut |key| keys.push(key));
        let uid = entity.session_uid;
        let Some(entity) = self.ctx.graph.get_mut(id) else {
            return;
        };
        for key in keys {
            if let Some(handle) = self.caches.remove(&(uid, key)) {
                entity.caches.insert(key, handle);
                self.stats.caches_restored += 1;
            }
        }
    }

    /// Points the links of no-undo entities at whatever now carries the old target's uid.
    fn remap_noundo(&mut self) {
        let current: HashMap<SessionUid, EntityId> = self
            .ctx
            .graph
            .entities()
            .map(|(id, e)| (e.session_uid, id))
            .collect();
        for id in self.moved_noundo.values().copied() {
            let Some(entity) = self.ctx.graph.get_mut(id) else {
                continue;
            };
            for target in entity.links.values_mut() {
                *target = target
                    .and_then(|old| self.previous_uids.get(&old))
                    .and_then(|uid| current.get(uid))
                    .copied();
            }
        }
    }

    fn run_preserve(&mut self) {
        for (id, old) in std::mem::take(&mut self.preserve) {
            let Some(kind) = self.ctx.kinds.get(old.code) else {
                continue;
            };
            if let Some(entity) = self.ctx.graph.get_mut(id) {
                kind.kind.undo_preserve(entity, &old);
            }
        }
    }

    fn null_dangling(&mut self) {
        let live: HashSet<EntityId> = self.ctx.graph.entity_ids().into_iter().collect();
        let mut nulled = 0usize;
        for id in self.ctx.graph.entity_ids() {
            let Some(entity) = self.ctx.graph.get_mut(id) else {
                continue;
            };
            for target in entity.links.values_mut() {
                if target.is_some_and(|t| !live.contains(&t)) {
                    *target = None;
                    nulled += 1;
                }
            }
        }
        if nulled > 0 {
            log::debug!("undo: nulled {nulled} pointers to removed entities");
        }
    }
}
