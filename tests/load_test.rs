#![allow(missing_docs)]

mod common;

use std::sync::{Arc, Mutex};

use blendloader::dna::{self, DnaStruct, FileGlobalStruct, IdHeader, StructFlag, builtin_catalog};
use blendloader::format::{BlockCode, Endian, IdCode, Layout, PointerWidth};
use blendloader::kind::{DataReader, EntityKind};
use blendloader::{Entity, Loader, LoaderError, Result, SessionUid, VersionInfo};
use common::*;

const CU: IdCode = IdCode::new(*b"CU");

/// An entity whose arrays live in raw data blocks.
#[derive(Debug, Clone, Default, PartialEq, DnaStruct)]
#[dna(name = "Curve")]
struct Curve {
    id: IdHeader,
    #[dna(pointer)]
    mats: u64,
    totcol: i32,
    #[dna(pointer)]
    weights: u64,
    totweight: i32,
}

type CurveArrays = (Vec<u64>, Vec<f32>);

/// Reads the material pointer array and the weights of every curve, keeping the last ones.
#[derive(Debug, Default)]
struct CurveKind {
    seen: Arc<Mutex<Option<CurveArrays>>>,
}

impl EntityKind for CurveKind {
    fn code(&self) -> IdCode {
        CU
    }

    fn name(&self) -> &str {
        "curve"
    }

    fn struct_name(&self) -> &str {
        "Curve"
    }

    fn decode_payload(&self, entity: &mut Entity, data: &mut DataReader<'_>) -> Result<()> {
        let curve = Curve::from_bytes(data.memory(), entity.payload())?;
        let count = |n: i32| usize::try_from(n).unwrap_or(0);
        let mats = data.read_pointer_array(curve.mats, count(curve.totcol))?;
        let weights = data.read_f32_array(curve.weights, count(curve.totweight))?;
        if let Ok(mut seen) = self.seen.lock() {
            *seen = Some((mats.unwrap_or_default(), weights.unwrap_or_default()));
        }
        Ok(())
    }
}

fn curve_file(layout: Layout, totcol: i32) -> Result<Vec<u8>> {
    let mut builder = builtin_catalog(layout)?;
    builder.define::<Material>()?.define::<Curve>()?;
    let catalog = builder.build()?;

    let mut w = start(&catalog, 405)?;
    entity(
        &mut w,
        CU,
        0x100,
        &Curve {
            id: header(CU, "Bezier"),
            mats: 0x180,
            totcol,
            weights: 0x190,
            totweight: 2,
        },
    )?;
    let mut mats = Vec::new();
    layout.put_i32(&mut mats, 0x300);
    layout.put_i32(&mut mats, 0);
    w.write_raw(BlockCode::DATA, 0x180, &mats)?;
    let mut weights = Vec::new();
    layout.put_i32(&mut weights, 0.5f32.to_bits() as i32);
    layout.put_i32(&mut weights, 2.0f32.to_bits() as i32);
    w.write_raw(BlockCode::DATA, 0x190, &weights)?;
    entity(&mut w, MA, 0x300, &material("Red", 1.0))?;
    Ok(w.finish())
}

#[test]
fn test_load_local_graph() -> Result<()> {
    init_logging();
    let loader = loader()?;
    let catalog = native_catalog()?;
    let blend = loader.load_memory(scene_file(&catalog)?)?;

    assert_eq!(blend.version.version, 405);
    assert_eq!(blend.graph.len(), 4);
    assert!(blend.report.is_clean(), "{}", blend.report);
    assert_eq!(blend.report.stats.entities_read, 4);

    let cube = blend.find_local(OB, "Cube").ok_or_else(missing)?;
    let child = blend.find_local(OB, "Child").ok_or_else(missing)?;
    let cube_mesh = blend.find_local(ME, "CubeMesh").ok_or_else(missing)?;
    let red = blend.find_local(MA, "Red").ok_or_else(missing)?;

    let object: Object = decode(&loader, &blend, cube)?;
    assert_eq!(object.loc, [1.0, 2.0, 3.0]);
    assert_eq!(object.layer, 4);

    let data = offset(&loader, "Object", "data")?;
    let parent = offset(&loader, "Object", "parent")?;
    let mat = offset(&loader, "Mesh", "mat")?;
    let graph = &blend.graph;
    assert_eq!(graph.get(cube).and_then(|e| e.link(data)), Some(cube_mesh));
    assert_eq!(graph.get(cube).and_then(|e| e.link(parent)), None);
    assert_eq!(graph.get(child).and_then(|e| e.link(parent)), Some(cube));
    assert_eq!(graph.get(cube_mesh).and_then(|e| e.link(mat)), Some(red));
    Ok(())
}

fn missing() -> LoaderError {
    LoaderError::Internal("entity not found".into())
}

#[test]
fn test_data_blocks_follow_their_owner() -> Result<()> {
    let loader = loader()?;
    let blend = loader.load_memory(scene_file(&native_catalog()?)?)?;
    let cube = blend.find_local(OB, "Cube").ok_or_else(missing)?;
    let entity = blend.graph.get(cube).ok_or_else(missing)?;

    // The referenced block is owned, the unreferenced one is dropped.
    assert_eq!(entity.data().len(), 1);
    let block = entity.data().get(&0x180).ok_or_else(missing)?;
    assert_eq!(block.bytes, vec![7u8; 16]);
    assert!(block.struct_name.is_none());
    assert!(!entity.data().contains_key(&0x190));
    Ok(())
}

#[test]
fn test_session_uids_follow_read_order() -> Result<()> {
    let loader = loader()?;
    let catalog = native_catalog()?;
    let first = loader.load_memory(scene_file(&catalog)?)?;
    let second = loader.load_memory(scene_file(&catalog)?)?;

    let mut uids: Vec<u32> = first
        .graph
        .entities()
        .map(|(_, e)| e.session_uid().as_u32())
        .collect();
    uids.sort_unstable();
    assert_eq!(uids, vec![1, 2, 3, 4]);

    for (id, entity) in first.graph.entities() {
        let other = second.graph.get(id).ok_or_else(missing)?;
        assert_eq!(entity.name(), other.name());
        assert_eq!(entity.session_uid(), other.session_uid());
        assert_ne!(entity.session_uid(), SessionUid::NONE);
    }
    Ok(())
}

#[test]
fn test_added_member_is_zero_filled() -> Result<()> {
    init_logging();
    let mut old = builtin_catalog(Layout::native())?;
    old.define::<ObjectV1>()?.define::<Mesh>()?.define::<Material>()?;
    let old = old.build()?;

    let mut w = start(&old, 300)?;
    entity(
        &mut w,
        OB,
        0x100,
        &ObjectV1 {
            id: header(OB, "Legacy"),
            data: 0x200,
            loc: [4.0, 5.0, 6.0],
            ..ObjectV1::default()
        },
    )?;
    entity(&mut w, ME, 0x200, &mesh("LegacyMesh", 0))?;
    let bytes = w.finish();

    let loader = loader()?;
    let reconciler = dna::reconcile(&old, loader.memory_catalog());
    let index = old.struct_index("Object").ok_or_else(missing)?;
    assert_eq!(reconciler.flag(index), StructFlag::Unequal);

    let blend = loader.load_memory(bytes)?;
    assert_eq!(blend.version.version, 300);
    let legacy = blend.find_local(OB, "Legacy").ok_or_else(missing)?;
    let object: Object = decode(&loader, &blend, legacy)?;
    assert_eq!(object.layer, 0);
    assert_eq!(object.loc, [4.0, 5.0, 6.0]);
    assert_eq!(object.id.name, "OBLegacy");

    let data = offset(&loader, "Object", "data")?;
    let mesh_id = blend.find_local(ME, "LegacyMesh");
    assert_eq!(blend.graph.get(legacy).and_then(|e| e.link(data)), mesh_id);
    Ok(())
}

#[test]
fn test_foreign_layouts_are_converted() -> Result<()> {
    let loader = loader()?;
    let layouts = [
        Layout::new(PointerWidth::Width32, Endian::Little),
        Layout::new(PointerWidth::Width32, Endian::Big),
        Layout::new(PointerWidth::Width64, Endian::Big),
    ];
    for layout in layouts {
        let catalog = catalog(layout)?;
        let blend = loader.load_memory(scene_file(&catalog)?)?;
        assert!(blend.report.is_clean(), "{layout:?}: {}", blend.report);

        let cube = blend.find_local(OB, "Cube").ok_or_else(missing)?;
        let object: Object = decode(&loader, &blend, cube)?;
        assert_eq!(object.loc, [1.0, 2.0, 3.0], "{layout:?}");
        assert_eq!(object.layer, 4, "{layout:?}");

        let red = blend.find_local(MA, "Red").ok_or_else(missing)?;
        let material: Material = decode(&loader, &blend, red)?;
        assert_eq!(material.g, 0.5, "{layout:?}");

        let data = offset(&loader, "Object", "data")?;
        assert_eq!(
            blend.graph.get(cube).and_then(|e| e.link(data)),
            blend.find_local(ME, "CubeMesh"),
            "{layout:?}"
        );
    }
    Ok(())
}

#[test]
fn test_global_block_and_current_scene() -> Result<()> {
    let catalog = native_catalog()?;
    let mut w = blendloader::writer::BlockWriter::new(&catalog, 405);
    w.write_struct(
        BlockCode::GLOB,
        0,
        &FileGlobalStruct {
            subversion: 3,
            curscene: 0x500,
            fileflags: 2,
            filename: "/projects/shot.blend".into(),
            ..FileGlobalStruct::default()
        },
    )?;
    entity(&mut w, OB, 0x100, &object("Camera"))?;
    entity(
        &mut w,
        SC,
        0x500,
        &Scene {
            id: header(SC, "Main"),
            camera: 0x100,
            frame: 12,
        },
    )?;

    let loader = loader()?;
    let blend = loader.load_memory(w.finish())?;
    assert_eq!(blend.version.subversion, 3);
    let global = blend.global.as_ref().ok_or_else(missing)?;
    assert_eq!(global.filename, "/projects/shot.blend");
    assert_eq!(global.fileflags, 2);
    assert_eq!(global.curscene, blend.find_local(SC, "Main"));

    let scene = blend.find_local(SC, "Main").ok_or_else(missing)?;
    let camera = offset(&loader, "Scene", "camera")?;
    assert_eq!(
        blend.graph.get(scene).and_then(|e| e.link(camera)),
        blend.find_local(OB, "Camera")
    );
    Ok(())
}

fn thumbnail_and_settings_file() -> Result<Vec<u8>> {
    let catalog = native_catalog()?;
    let layout = catalog.layout();
    let mut w = start(&catalog, 405)?;

    let mut thumb = Vec::new();
    layout.put_i32(&mut thumb, 2);
    layout.put_i32(&mut thumb, 1);
    thumb.extend_from_slice(&[255, 0, 0, 255, 0, 255, 0, 255]);
    w.write_raw(BlockCode::TEST, 0, &thumb)?;

    w.write_struct(
        BlockCode::USER,
        0,
        &UserDef {
            themes: 0x700,
            flag: 9,
        },
    )?;
    w.write_raw(BlockCode::DATA, 0x700, b"theme")?;
    w.write_raw(BlockCode::DATA, 0x710, b"stray")?;
    entity(&mut w, OB, 0x100, &object("Cube"))?;
    Ok(w.finish())
}

#[test]
fn test_thumbnail_and_user_settings() -> Result<()> {
    let loader = loader()?;
    let blend = loader.load_memory(thumbnail_and_settings_file()?)?;

    let thumbnail = blend.thumbnail.as_ref().ok_or_else(missing)?;
    assert_eq!((thumbnail.width, thumbnail.height), (2, 1));
    assert_eq!(thumbnail.pixels.len(), 8);

    let user = blend.user_settings.as_ref().ok_or_else(missing)?;
    assert_eq!(user.struct_name.as_deref(), Some("UserDef"));
    let settings = UserDef::from_bytes(loader.memory_catalog(), &user.payload)?;
    assert_eq!(settings.flag, 9);
    assert_eq!(user.data.len(), 1);
    assert_eq!(user.data.get(&0x700).map(|b| b.bytes.as_slice()), Some(&b"theme"[..]));

    assert!(blend.find_local(OB, "Cube").is_some());
    Ok(())
}

#[test]
fn test_skip_options() -> Result<()> {
    let bytes = thumbnail_and_settings_file()?;

    let no_settings = builder().skip_user_settings(true).build()?;
    let blend = no_settings.load_memory(bytes.clone())?;
    assert!(blend.user_settings.is_none());
    assert!(blend.find_local(OB, "Cube").is_some());

    let header_only = builder().skip_data(true).build()?;
    let blend = header_only.load_memory(bytes)?;
    assert!(blend.graph.is_empty());
    assert!(blend.thumbnail.is_some());
    assert!(blend.user_settings.is_some());
    assert_eq!(blend.version.version, 405);
    Ok(())
}

#[test]
fn test_load_from_disk_with_deferred_data() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_file(dir.path(), "scene.blend", &scene_file(&native_catalog()?)?)?;

    for defer in [true, false] {
        let loader = builder().defer_data_blocks(defer).build()?;
        let blend = loader.load_path(&path)?;
        let cube = blend.find_local(OB, "Cube").ok_or_else(missing)?;
        let entity = blend.graph.get(cube).ok_or_else(missing)?;
        assert_eq!(entity.data().get(&0x180).map(|b| b.bytes.len()), Some(16));
        assert!(blend.report.source.ends_with("scene.blend"));
    }
    Ok(())
}

#[cfg(feature = "lz4_flex")]
#[test]
fn test_compressed_sources() -> Result<()> {
    use blendloader::{Compressor, Lz4Compressor};

    let plain = scene_file(&native_catalog()?)?;
    let packed = Lz4Compressor.compress(&plain)?.into_owned();
    assert!(packed.starts_with(&blendloader::compression::LZ4_FRAME_MAGIC));

    let loader = loader()?;
    let from_memory = loader.load_memory(packed.clone())?;
    assert_eq!(from_memory.graph.len(), 4);

    let dir = tempfile::tempdir()?;
    let path = write_file(dir.path(), "packed.blend", &packed)?;
    let from_disk = loader.load_path(&path)?;
    assert!(from_disk.find_local(MA, "Red").is_some());
    Ok(())
}

#[test]
fn test_rejects_garbage() -> Result<()> {
    let loader = loader()?;
    let err = loader.load_memory(b"definitely not a document".to_vec());
    assert!(matches!(err, Err(LoaderError::Format(_))), "{err:?}");

    let err = loader.load_memory(Vec::new());
    assert!(matches!(err, Err(LoaderError::Format(_))), "{err:?}");
    Ok(())
}

#[test]
fn test_truncated_and_unterminated_documents() -> Result<()> {
    let loader = loader()?;
    let bytes = scene_file(&native_catalog()?)?;

    let mut truncated = bytes.clone();
    truncated.truncate(bytes.len() / 2);
    let err = loader.load_memory(truncated);
    assert!(matches!(err, Err(LoaderError::Corrupt(_))), "{err:?}");

    // Drop the ENDB record only.
    let mut unterminated = bytes;
    let end = unterminated.len() - Layout::native().block_header_size();
    unterminated.truncate(end);
    match loader.load_memory(unterminated) {
        Err(LoaderError::Corrupt(msg)) => assert!(msg.contains("ENDB"), "{msg}"),
        other => panic!("expected a corrupt document, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_newer_minimum_version_is_refused() -> Result<()> {
    let catalog = native_catalog()?;
    let mut w = blendloader::writer::BlockWriter::new(&catalog, 500);
    w.write_struct(
        BlockCode::GLOB,
        0,
        &FileGlobalStruct {
            minversion: 500,
            ..FileGlobalStruct::default()
        },
    )?;
    entity(&mut w, OB, 0x100, &object("Future"))?;
    let bytes = w.finish();

    match loader()?.load_memory(bytes.clone()) {
        Err(LoaderError::Format(msg)) => assert!(msg.contains("newer"), "{msg}"),
        other => panic!("expected a version error, got {other:?}"),
    }

    let newer = builder().program_version(500, 0).build()?;
    assert!(newer.load_memory(bytes)?.find_local(OB, "Future").is_some());
    Ok(())
}

#[test]
fn test_missing_file_is_an_io_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let err = loader()?.load_path(dir.path().join("absent.blend"));
    assert!(matches!(err, Err(LoaderError::Io(_))), "{err:?}");
    Ok(())
}

#[test]
fn test_snapshot_round_trip() -> Result<()> {
    let loader = loader()?;
    let blend = loader.load_memory(scene_file(&native_catalog()?)?)?;
    let snapshot = loader.write_snapshot(&blend, None)?;
    let reloaded = loader.load_memory(snapshot.to_bytes())?;

    assert_eq!(reloaded.graph.len(), blend.graph.len());
    for (id, entity) in blend.graph.entities() {
        let other = reloaded.graph.get(id).ok_or_else(missing)?;
        assert_eq!((entity.code(), entity.name()), (other.code(), other.name()));
        assert_eq!(entity.session_uid(), other.session_uid());
        assert_eq!(entity.data().len(), other.data().len());
        let targets: Vec<_> = entity.links().values().collect();
        let other_targets: Vec<_> = other.links().values().collect();
        assert_eq!(targets, other_targets);
    }

    let cube = reloaded.find_local(OB, "Cube").ok_or_else(missing)?;
    let object: Object = decode(&loader, &reloaded, cube)?;
    assert_eq!(object.loc, [1.0, 2.0, 3.0]);

    // Unchanged state produces chunks sharing storage with the previous snapshot.
    let again = loader.write_snapshot(&blend, Some(&snapshot))?;
    assert_eq!(again.chunks().len(), snapshot.chunks().len());
    for (chunk, previous) in again.chunks().iter().zip(snapshot.chunks()) {
        assert!(chunk.is_identical());
        assert!(chunk.shares_storage(previous));
    }
    Ok(())
}

#[test]
fn test_raw_arrays_are_converted_to_the_memory_layout() -> Result<()> {
    init_logging();
    let memory = Layout::new(PointerWidth::Width64, Endian::Little);
    let kind = CurveKind::default();
    let seen = Arc::clone(&kind.seen);
    let loader = Loader::builder()
        .memory_layout(memory)
        .define::<Material>()
        .define::<Curve>()
        .kind(blendloader::GenericKind::new(MA, "material", "Material"))
        .kind(kind)
        .build()?;

    let file = Layout::new(PointerWidth::Width32, Endian::Big);
    let blend = loader.load_memory(curve_file(file, 2)?)?;
    assert!(blend.report.is_clean(), "{}", blend.report);

    let arrays = seen.lock().ok().and_then(|s| s.clone()).ok_or_else(missing)?;
    assert_eq!(arrays.0, vec![0x300, 0]);
    assert_eq!(arrays.1, vec![0.5, 2.0]);

    let curve = blend.find_local(CU, "Bezier").ok_or_else(missing)?;
    let entity = blend.graph.get(curve).ok_or_else(missing)?;
    let mats = entity.data().get(&0x180).ok_or_else(missing)?;
    assert_eq!(mats.layout, memory);
    assert_eq!(mats.bytes, [0x300u64.to_le_bytes(), 0u64.to_le_bytes()].concat());
    let weights = entity.data().get(&0x190).ok_or_else(missing)?;
    assert_eq!(weights.layout.endian, Endian::Little);
    assert_eq!(weights.bytes, [0.5f32.to_le_bytes(), 2.0f32.to_le_bytes()].concat());

    // The converted address still names the material block.
    assert!(blend.find_local(MA, "Red").is_some());

    // An array longer than its block is refused.
    let err = loader.load_memory(curve_file(file, 3)?);
    assert!(matches!(err, Err(LoaderError::Corrupt(_))), "{err:?}");
    Ok(())
}

#[test]
fn test_negative_thumbnail_size_is_corrupt() -> Result<()> {
    let catalog = native_catalog()?;
    let layout = catalog.layout();
    let mut w = start(&catalog, 405)?;
    let mut thumb = Vec::new();
    layout.put_i32(&mut thumb, -2);
    layout.put_i32(&mut thumb, 1);
    thumb.extend_from_slice(&[0u8; 8]);
    w.write_raw(BlockCode::TEST, 0, &thumb)?;
    entity(&mut w, OB, 0x100, &object("Cube"))?;
    let bytes = w.finish();

    let loader = loader()?;
    let blend = loader.load_memory(bytes.clone())?;
    assert!(blend.thumbnail.is_none());
    assert!(
        blend.report.messages.iter().any(|m| m.text.contains("negative")),
        "{}",
        blend.report
    );
    assert!(blend.find_local(OB, "Cube").is_some());

    let dir = tempfile::tempdir()?;
    let path = write_file(dir.path(), "negative.blend", &bytes)?;
    let err = loader.thumbnail_from_path(&path);
    assert!(matches!(err, Err(LoaderError::Corrupt(_))), "{err:?}");
    Ok(())
}

#[test]
fn test_thumbnail_and_version_from_path() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_file(dir.path(), "thumb.blend", &thumbnail_and_settings_file()?)?;
    let loader = loader()?;

    let thumbnail = loader.thumbnail_from_path(&path)?.ok_or_else(missing)?;
    assert_eq!((thumbnail.width, thumbnail.height), (2, 1));
    assert_eq!(thumbnail.pixels, [255, 0, 0, 255, 0, 255, 0, 255]);
    assert_eq!(loader.version_from_path(&path)?, VersionInfo::new(405, 0));

    // No preview in front of the entities.
    let plain = write_file(dir.path(), "plain.blend", &scene_file(&native_catalog()?)?)?;
    assert!(loader.thumbnail_from_path(&plain)?.is_none());

    // A document from a newer program still reports its version.
    let catalog = native_catalog()?;
    let mut w = blendloader::writer::BlockWriter::new(&catalog, 500);
    w.write_struct(
        BlockCode::GLOB,
        0,
        &FileGlobalStruct {
            subversion: 3,
            minversion: 500,
            ..FileGlobalStruct::default()
        },
    )?;
    entity(&mut w, OB, 0x100, &object("Future"))?;
    let future = write_file(dir.path(), "future.blend", &w.finish())?;
    assert_eq!(loader.version_from_path(&future)?, VersionInfo::new(500, 3));
    assert!(loader.load_path(&future).is_err());
    Ok(())
}
