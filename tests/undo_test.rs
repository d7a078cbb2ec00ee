#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use blendloader::dna::{Catalog, DnaStruct};
use blendloader::format::IdCode;
use blendloader::graph::{CacheHandle, CacheKey};
use blendloader::{Blend, Entity, EntityId, EntityKind, EntityTags, Loader, LoaderError, Result};
use common::*;

fn missing() -> LoaderError {
    LoaderError::Internal("entity not found".into())
}

/// The shared scene plus a window manager pointing at the cube.
fn undo_file(catalog: &Catalog) -> Result<Vec<u8>> {
    let mut w = start(catalog, 405)?;
    entity(
        &mut w,
        OB,
        0x100,
        &Object {
            data: 0x200,
            props: 0x180,
            loc: [1.0, 2.0, 3.0],
            ..object("Cube")
        },
    )?;
    w.write_raw(blendloader::format::BlockCode::DATA, 0x180, &[7u8; 16])?;
    entity(&mut w, ME, 0x200, &mesh("CubeMesh", 0x300))?;
    entity(&mut w, MA, 0x300, &material("Red", 1.0))?;
    entity(
        &mut w,
        OB,
        0x400,
        &Object {
            parent: 0x100,
            ..object("Child")
        },
    )?;
    entity(
        &mut w,
        WM,
        0x800,
        &WindowManager {
            id: header(WM, "WinMan"),
            active: 0x100,
            winactive: 1,
        },
    )?;
    Ok(w.finish())
}

fn find(blend: &Blend, code: IdCode, name: &str) -> Result<EntityId> {
    blend.find_local(code, name).ok_or_else(missing)
}

fn set_loc(loader: &Loader, blend: &mut Blend, id: EntityId, loc: [f32; 3]) -> Result<()> {
    let mut object: Object = decode(loader, blend, id)?;
    object.loc = loc;
    let bytes = object.to_bytes(loader.memory_catalog())?;
    let entity = blend.graph.get_mut(id).ok_or_else(missing)?;
    *entity.payload_mut() = bytes;
    Ok(())
}

#[test]
fn test_unchanged_step_reuses_everything() -> Result<()> {
    init_logging();
    let loader = loader()?;
    let blend = loader.load_memory(undo_file(&native_catalog()?)?)?;
    let before: Vec<(EntityId, String, Vec<u8>)> = blend
        .graph
        .entities()
        .map(|(id, e)| (id, e.name().to_owned(), e.payload().to_vec()))
        .collect();
    let links_before: Vec<_> = blend
        .graph
        .entities()
        .map(|(_, e)| e.links().clone())
        .collect();

    let first = loader.write_snapshot(&blend, None)?;
    let second = loader.write_snapshot(&blend, Some(&first))?;
    assert!(second.chunks().iter().all(|c| c.is_identical()));

    let restored = loader.restore_undo(blend, &second)?;
    let stats = restored.report.stats.undo.clone().ok_or_else(missing)?;
    assert_eq!(stats.reused_unchanged, 4);
    assert_eq!(stats.reused_noundo, 1);
    assert_eq!(stats.reread_in_place, 0);
    assert_eq!(stats.added, 0);
    assert_eq!(stats.removed, 0);
    assert_eq!(restored.report.stats.bytes_decoded, 0);

    for (id, name, payload) in before {
        let entity = restored.graph.get(id).ok_or_else(missing)?;
        assert_eq!(entity.name(), name);
        assert_eq!(entity.payload(), payload.as_slice());
        assert!(!entity.tags().contains(EntityTags::UNDO_REREAD_IN_PLACE));
    }
    let links_after: Vec<_> = restored
        .graph
        .entities()
        .map(|(_, e)| e.links().clone())
        .collect();
    assert_eq!(links_before, links_after);

    let cube = find(&restored, OB, "Cube")?;
    assert!(
        restored
            .graph
            .get(cube)
            .is_some_and(|e| e.tags().contains(EntityTags::UNDO_REUSED_UNCHANGED))
    );
    Ok(())
}

#[test]
fn test_changed_entity_is_reread_in_place() -> Result<()> {
    let loader = loader()?;
    let mut blend = loader.load_memory(undo_file(&native_catalog()?)?)?;
    let first = loader.write_snapshot(&blend, None)?;

    let cube = find(&blend, OB, "Cube")?;
    let mesh_id = find(&blend, ME, "CubeMesh")?;
    let uid = blend.graph.get(cube).map(|e| e.session_uid());
    set_loc(&loader, &mut blend, cube, [9.0, 8.0, 7.0])?;
    let second = loader.write_snapshot(&blend, Some(&first))?;

    let restored = loader.restore_undo(blend, &second)?;
    let stats = restored.report.stats.undo.clone().ok_or_else(missing)?;
    assert_eq!(stats.reread_in_place, 1);
    assert_eq!(stats.reused_unchanged, 3);
    assert_eq!(stats.added, 0);
    assert!(restored.report.stats.bytes_decoded > 0);

    assert_eq!(find(&restored, OB, "Cube")?, cube);
    let entity = restored.graph.get(cube).ok_or_else(missing)?;
    assert!(entity.tags().contains(EntityTags::UNDO_REREAD_IN_PLACE));
    assert_eq!(Some(entity.session_uid()), uid);
    assert_eq!(entity.data().len(), 1);
    let object: Object = decode(&loader, &restored, cube)?;
    assert_eq!(object.loc, [9.0, 8.0, 7.0]);

    // Links into and out of the re-read entity still hold.
    assert_eq!(entity.link(offset(&loader, "Object", "data")?), Some(mesh_id));
    let child = find(&restored, OB, "Child")?;
    let parent = offset(&loader, "Object", "parent")?;
    assert_eq!(restored.graph.get(child).and_then(|e| e.link(parent)), Some(cube));
    Ok(())
}

#[test]
fn test_entity_missing_from_previous_state_is_added() -> Result<()> {
    let loader = loader()?;
    let mut blend = loader.load_memory(undo_file(&native_catalog()?)?)?;
    let snapshot = loader.write_snapshot(&blend, None)?;

    let child = find(&blend, OB, "Child")?;
    let cube = find(&blend, OB, "Cube")?;
    blend.graph.remove(child);

    let restored = loader.restore_undo(blend, &snapshot)?;
    let stats = restored.report.stats.undo.clone().ok_or_else(missing)?;
    assert_eq!(stats.added, 1);
    assert_eq!(stats.removed, 0);

    let readded = find(&restored, OB, "Child")?;
    assert_ne!(readded, child);
    let parent = offset(&loader, "Object", "parent")?;
    assert_eq!(restored.graph.get(readded).and_then(|e| e.link(parent)), Some(cube));
    Ok(())
}

#[test]
fn test_entity_missing_from_snapshot_is_removed() -> Result<()> {
    let loader = loader()?;
    let bytes = undo_file(&native_catalog()?)?;

    let mut edited = loader.load_memory(bytes.clone())?;
    let mesh_id = find(&edited, ME, "CubeMesh")?;
    edited.graph.remove(mesh_id);
    let snapshot = loader.write_snapshot(&edited, None)?;

    // Session uids are assigned in read order, so a fresh load matches the edited state.
    let current = loader.load_memory(bytes)?;
    assert_eq!(find(&current, ME, "CubeMesh")?, mesh_id);
    let restored = loader.restore_undo(current, &snapshot)?;
    let stats = restored.report.stats.undo.clone().ok_or_else(missing)?;
    assert_eq!(stats.removed, 1);
    assert_eq!(stats.added, 0);

    assert!(restored.find_local(ME, "CubeMesh").is_none());
    assert!(!restored.graph.contains(mesh_id));
    let cube = find(&restored, OB, "Cube")?;
    let data = offset(&loader, "Object", "data")?;
    assert_eq!(restored.graph.get(cube).and_then(|e| e.link(data)), None);
    Ok(())
}

#[test]
fn test_no_undo_kind_is_moved_untouched() -> Result<()> {
    let loader = loader()?;
    let mut blend = loader.load_memory(undo_file(&native_catalog()?)?)?;
    let snapshot = loader.write_snapshot(&blend, None)?;

    // Runtime state changed after the snapshot was taken survives the restore.
    let wm = find(&blend, WM, "WinMan")?;
    let cube = find(&blend, OB, "Cube")?;
    let mut manager: WindowManager = decode(&loader, &blend, wm)?;
    manager.winactive = 5;
    let payload = manager.to_bytes(loader.memory_catalog())?;
    let handle: CacheHandle = Arc::new(String::from("window state"));
    {
        let entity = blend.graph.get_mut(wm).ok_or_else(missing)?;
        *entity.payload_mut() = payload;
        entity.caches_mut().insert(3, Arc::clone(&handle));
    }

    let restored = loader.restore_undo(blend, &snapshot)?;
    assert_eq!(restored.report.stats.undo.as_ref().map(|u| u.reused_noundo), Some(1));
    assert_eq!(find(&restored, WM, "WinMan")?, wm);

    let entity = restored.graph.get(wm).ok_or_else(missing)?;
    assert!(entity.tags().contains(EntityTags::UNDO_REUSED_NOUNDO));
    let manager: WindowManager = decode(&loader, &restored, wm)?;
    assert_eq!(manager.winactive, 5);
    assert!(entity.caches().get(&3).is_some_and(|h| Arc::ptr_eq(h, &handle)));
    assert_eq!(entity.link(offset(&loader, "WindowManager", "active")?), Some(cube));
    Ok(())
}

const EVALUATED: CacheKey = 1;
const RUNTIME: CacheKey = 2;

/// Objects keeping an evaluation cache across undo, plus runtime data carried by hand.
#[derive(Debug)]
struct CachedObjectKind;

impl EntityKind for CachedObjectKind {
    fn code(&self) -> IdCode {
        OB
    }

    fn name(&self) -> &str {
        "object"
    }

    fn struct_name(&self) -> &str {
        "Object"
    }

    fn foreach_cache_handle(&self, _entity: &Entity, visit: &mut dyn FnMut(CacheKey)) {
        visit(EVALUATED);
    }

    fn undo_preserve(&self, new: &mut Entity, old: &Entity) {
        if let Some(handle) = old.caches().get(&RUNTIME) {
            new.caches_mut().insert(RUNTIME, Arc::clone(handle));
        }
    }
}

#[test]
fn test_caches_survive_reread() -> Result<()> {
    init_logging();
    let loader = builder().kind(CachedObjectKind).build()?;
    let mut blend = loader.load_memory(undo_file(&native_catalog()?)?)?;
    let first = loader.write_snapshot(&blend, None)?;

    let cube = find(&blend, OB, "Cube")?;
    let child = find(&blend, OB, "Child")?;
    let evaluated: CacheHandle = Arc::new(vec![1.0f32, 2.0, 3.0]);
    let runtime: CacheHandle = Arc::new(42u64);
    let child_cache: CacheHandle = Arc::new(7u8);
    {
        let entity = blend.graph.get_mut(cube).ok_or_else(missing)?;
        entity.caches_mut().insert(EVALUATED, Arc::clone(&evaluated));
        entity.caches_mut().insert(RUNTIME, Arc::clone(&runtime));
    }
    if let Some(entity) = blend.graph.get_mut(child) {
        entity.caches_mut().insert(EVALUATED, Arc::clone(&child_cache));
    }
    set_loc(&loader, &mut blend, cube, [0.0, 0.0, 1.0])?;
    let second = loader.write_snapshot(&blend, Some(&first))?;

    let restored = loader.restore_undo(blend, &second)?;
    let stats = restored.report.stats.undo.clone().ok_or_else(missing)?;
    assert_eq!(stats.reread_in_place, 1);
    assert_eq!(stats.caches_restored, 1);

    let entity = restored.graph.get(cube).ok_or_else(missing)?;
    assert!(entity.caches().get(&EVALUATED).is_some_and(|h| Arc::ptr_eq(h, &evaluated)));
    assert!(entity.caches().get(&RUNTIME).is_some_and(|h| Arc::ptr_eq(h, &runtime)));

    // The unchanged child was handed over with its caches.
    let entity = restored.graph.get(child).ok_or_else(missing)?;
    assert!(entity.caches().get(&EVALUATED).is_some_and(|h| Arc::ptr_eq(h, &child_cache)));
    Ok(())
}

#[test]
fn test_library_documents_are_carried_over() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let catalog = native_catalog()?;

    let mut lib = start(&catalog, 405)?;
    entity(&mut lib, ME, 0x100, &mesh("MeshA", 0x300))?;
    entity(&mut lib, MA, 0x300, &material("Red", 1.0))?;
    let lib_path = write_file(dir.path(), "lib.blend", &lib.finish())?;

    let mut root = start(&catalog, 405)?;
    entity(
        &mut root,
        OB,
        0x100,
        &Object {
            data: 0x200,
            ..object("Cube")
        },
    )?;
    entity(&mut root, IdCode::LIBRARY, 0x900, &library("//lib.blend"))?;
    link(&mut root, 0x200, ME, "MeshA", false)?;
    let root_path = write_file(dir.path(), "root.blend", &root.finish())?;

    let loader = loader()?;
    let mut blend = loader.load_path(&root_path)?;
    let doc = only_library(&blend).ok_or_else(missing)?;
    let mesh_id = blend.graph.find(doc, ME, "MeshA").ok_or_else(missing)?;
    let cube = find(&blend, OB, "Cube")?;

    let first = loader.write_snapshot(&blend, None)?;
    set_loc(&loader, &mut blend, cube, [3.0, 3.0, 3.0])?;
    let second = loader.write_snapshot(&blend, Some(&first))?;

    // The library file is not read again.
    std::fs::remove_file(&lib_path)?;
    let restored = loader.restore_undo(blend, &second)?;
    assert_eq!(restored.report.stats.libraries_opened, 0);
    assert!(restored.report.missing_documents.is_empty(), "{}", restored.report);

    assert_eq!(only_library(&restored), Some(doc));
    let entity = restored.graph.get(mesh_id).ok_or_else(missing)?;
    assert!(entity.tags().contains(EntityTags::UNDO_REUSED_UNCHANGED));
    assert!(!entity.is_placeholder());
    let data = offset(&loader, "Object", "data")?;
    assert_eq!(restored.graph.get(cube).and_then(|e| e.link(data)), Some(mesh_id));
    Ok(())
}
