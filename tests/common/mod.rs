//! Shared fixtures: a small entity vocabulary and helpers writing documents with it.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use blendloader::dna::{
    Catalog, DnaStruct, FileGlobalStruct, IdHeader, LibraryStruct, builtin_catalog,
};
use blendloader::format::{BlockCode, IdCode, Layout};
use blendloader::kind::{GenericKind, KindFlags};
use blendloader::writer::BlockWriter;
use blendloader::{Blend, EntityId, Loader, LoaderBuilder, LoaderError, Result};

pub const OB: IdCode = IdCode::new(*b"OB");
pub const ME: IdCode = IdCode::new(*b"ME");
pub const MA: IdCode = IdCode::new(*b"MA");
pub const SC: IdCode = IdCode::new(*b"SC");
pub const WM: IdCode = IdCode::new(*b"WM");

#[derive(Debug, Clone, Default, PartialEq, DnaStruct)]
#[dna(name = "Object")]
pub struct Object {
    pub id: IdHeader,
    pub layer: i32,
    #[dna(pointer = "Object")]
    pub parent: u64,
    #[dna(pointer = "Mesh")]
    pub data: u64,
    #[dna(pointer = "Material")]
    pub mat: u64,
    #[dna(pointer)]
    pub props: u64,
    pub loc: [f32; 3],
}

/// `Object` as an older program wrote it: no `layer`, members in another order.
#[derive(Debug, Clone, Default, PartialEq, DnaStruct)]
#[dna(name = "Object")]
pub struct ObjectV1 {
    pub id: IdHeader,
    #[dna(pointer = "Object")]
    pub parent: u64,
    #[dna(pointer = "Mesh")]
    pub data: u64,
    #[dna(pointer = "Material")]
    pub mat: u64,
    #[dna(pointer)]
    pub props: u64,
    pub loc: [f32; 3],
}

#[derive(Debug, Clone, Default, PartialEq, DnaStruct)]
#[dna(name = "Mesh")]
pub struct Mesh {
    pub id: IdHeader,
    #[dna(pointer = "Material")]
    pub mat: u64,
    pub totvert: i32,
}

#[derive(Debug, Clone, Default, PartialEq, DnaStruct)]
#[dna(name = "Material")]
pub struct Material {
    pub id: IdHeader,
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

#[derive(Debug, Clone, Default, PartialEq, DnaStruct)]
#[dna(name = "Scene")]
pub struct Scene {
    pub id: IdHeader,
    #[dna(pointer = "Object")]
    pub camera: u64,
    pub frame: i32,
}

#[derive(Debug, Clone, Default, PartialEq, DnaStruct)]
#[dna(name = "WindowManager")]
pub struct WindowManager {
    pub id: IdHeader,
    #[dna(pointer = "Object")]
    pub active: u64,
    pub winactive: i32,
}

#[derive(Debug, Clone, Default, PartialEq, DnaStruct)]
#[dna(name = "UserDef")]
pub struct UserDef {
    #[dna(pointer)]
    pub themes: u64,
    pub flag: i32,
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn header(code: IdCode, name: &str) -> IdHeader {
    IdHeader {
        name: format!("{code}{name}"),
        ..IdHeader::default()
    }
}

pub fn object(name: &str) -> Object {
    Object {
        id: header(OB, name),
        ..Object::default()
    }
}

pub fn mesh(name: &str, mat: u64) -> Mesh {
    Mesh {
        id: header(ME, name),
        mat,
        totvert: 8,
    }
}

pub fn material(name: &str, r: f32) -> Material {
    Material {
        id: header(MA, name),
        r,
        g: 0.5,
        b: 0.25,
    }
}

pub fn library(path: &str) -> LibraryStruct {
    LibraryStruct {
        id: header(IdCode::LIBRARY, path.trim_start_matches("//")),
        filepath: path.to_owned(),
        packedfile: 0,
    }
}

/// Struct table of the fixture vocabulary in `layout`.
pub fn catalog(layout: Layout) -> Result<Catalog> {
    let mut builder = builtin_catalog(layout)?;
    builder
        .define::<Object>()?
        .define::<Mesh>()?
        .define::<Material>()?
        .define::<Scene>()?
        .define::<WindowManager>()?
        .define::<UserDef>()?;
    builder.build()
}

pub fn native_catalog() -> Result<Catalog> {
    catalog(Layout::native())
}

/// Loader knowing the fixture vocabulary.
pub fn builder() -> LoaderBuilder {
    Loader::builder()
        .define::<Object>()
        .define::<Mesh>()
        .define::<Material>()
        .define::<Scene>()
        .define::<WindowManager>()
        .define::<UserDef>()
        .kind(GenericKind::new(OB, "object", "Object"))
        .kind(GenericKind::new(ME, "mesh", "Mesh"))
        .kind(GenericKind::new(MA, "material", "Material"))
        .kind(GenericKind::new(SC, "scene", "Scene"))
        .kind(
            GenericKind::new(WM, "window manager", "WindowManager").with_flags(KindFlags {
                linkable: false,
                no_undo: true,
            }),
        )
}

pub fn loader() -> Result<Loader> {
    builder().build()
}

/// Starts a document written by `version` with a default global block.
pub fn start(catalog: &Catalog, version: u16) -> Result<BlockWriter<'_>> {
    let mut writer = BlockWriter::new(catalog, version);
    writer.write_struct(BlockCode::GLOB, 0, &FileGlobalStruct::default())?;
    Ok(writer)
}

/// Writes an entity block.
pub fn entity<T: DnaStruct>(writer: &mut BlockWriter<'_>, code: IdCode, old: u64, value: &T) -> Result<()> {
    writer.write_struct(BlockCode::entity(code), old, value)
}

/// Writes a link placeholder (`ID`) block.
pub fn link(writer: &mut BlockWriter<'_>, old: u64, code: IdCode, name: &str, weak: bool) -> Result<()> {
    let id = IdHeader {
        flag: blendloader::graph::StoredFlags::new(weak).as_raw(),
        ..header(code, name)
    };
    writer.write_struct(BlockCode::entity(IdCode::LINK_PLACEHOLDER), old, &id)
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, bytes)?;
    Ok(path)
}

/// Offset of a member in the loader's memory layout.
pub fn offset(loader: &Loader, struct_name: &str, member: &str) -> Result<usize> {
    loader
        .memory_catalog()
        .struct_info_by_name(struct_name)
        .and_then(|s| s.member(member))
        .map(|m| m.offset)
        .ok_or_else(|| LoaderError::Dna(format!("{struct_name}.{member} not declared")))
}

/// Decodes the payload of an entity.
pub fn decode<T: DnaStruct>(loader: &Loader, blend: &Blend, id: EntityId) -> Result<T> {
    let entity = blend
        .graph
        .get(id)
        .ok_or_else(|| LoaderError::Internal(format!("{id} not in the graph")))?;
    T::from_bytes(loader.memory_catalog(), entity.payload())
}

/// The only library document of a load.
pub fn only_library(blend: &Blend) -> Option<blendloader::DocumentId> {
    match blend.graph.library_documents().as_slice() {
        [doc] => Some(*doc),
        _ => None,
    }
}

/// A local object with its mesh and a material reached through the mesh.
pub fn scene_file(catalog: &Catalog) -> Result<Vec<u8>> {
    let mut w = start(catalog, 405)?;
    entity(
        &mut w,
        OB,
        0x100,
        &Object {
            data: 0x200,
            props: 0x180,
            loc: [1.0, 2.0, 3.0],
            layer: 4,
            ..object("Cube")
        },
    )?;
    w.write_raw(BlockCode::DATA, 0x180, &[7u8; 16])?;
    // Nobody points at this one.
    w.write_raw(BlockCode::DATA, 0x190, &[9u8; 4])?;
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
    Ok(w.finish())
}
