//! Block encoder.
//!
//! [`BlockWriter`] produces containers block by block: a file header, any number of blocks,
//! then the struct table and the end sentinel on [`finish`](BlockWriter::finish). Every
//! block becomes one chunk, so the output can also be turned into a [`MemFile`] whose chunk
//! identity flags line up with block boundaries.
//!
//! [`Loader::write_snapshot`](crate::Loader::write_snapshot) serializes a loaded graph with
//! it. Entities get synthetic addresses derived from their arena slot, so the same graph
//! always encodes to the same bytes.
//!
//! ```
//! use blendloader::dna::{FileGlobalStruct, builtin_catalog};
//! use blendloader::format::{BlockCode, Layout};
//! use blendloader::writer::BlockWriter;
//! use blendloader::Loader;
//!
//! let catalog = builtin_catalog(Layout::native())?.build()?;
//! let mut writer = BlockWriter::new(&catalog, 405);
//! writer.write_struct(BlockCode::GLOB, 0, &FileGlobalStruct::default())?;
//! let bytes = writer.finish();
//!
//! let blend = Loader::builder().build()?.load_memory(bytes)?;
//! assert_eq!(blend.version.version, 405);
//! # Ok::<(), blendloader::LoaderError>(())
//! ```

use rayon::prelude::*;

use crate::constants::SNAPSHOT_ADDRESS_BASE;
use crate::dna::{Catalog, DnaStruct, FileGlobalStruct, IdHeader, StructViewMut};
use crate::error::{LoaderError, Result};
use crate::format::{BlockCode, BlockHeader, FileHeader, IdCode, Layout};
use crate::graph::{DocumentId, Entity, EntityId, Graph};
use crate::loader::{Blend, Loader};
use crate::source::MemFile;

/// Writes a container in the layout of a struct catalog.
#[derive(Debug)]
pub struct BlockWriter<'c> {
    catalog: &'c Catalog,
    chunks: Vec<Vec<u8>>,
}

impl<'c> BlockWriter<'c> {
    /// Starts a container written by program `version`.
    pub fn new(catalog: &'c Catalog, version: u16) -> Self {
        let header = FileHeader::new(catalog.layout(), version);
        Self {
            catalog,
            chunks: vec![header.to_bytes().to_vec()],
        }
    }

    /// Layout of the output.
    pub fn layout(&self) -> Layout {
        self.catalog.layout()
    }

    /// Catalog the payloads are laid out with.
    pub fn catalog(&self) -> &'c Catalog {
        self.catalog
    }

    /// Appends a block of `count` instances of `struct_name` (`None`: raw bytes).
    pub fn write_block(
        &mut self,
        code: BlockCode,
        old: u64,
        struct_name: Option<&str>,
        count: usize,
        payload: &[u8],
    ) -> Result<()> {
        let sdna = sdna_index(self.catalog, struct_name)?;
        self.chunks
            .push(encode_block(self.layout(), code, old, sdna, count, payload)?);
        Ok(())
    }

    /// Appends one struct.
    pub fn write_struct<T: DnaStruct>(&mut self, code: BlockCode, old: u64, value: &T) -> Result<()> {
        let payload = value.to_bytes(self.catalog)?;
        self.write_block(code, old, Some(T::NAME), 1, &payload)
    }

    /// Appends raw bytes.
    pub fn write_raw(&mut self, code: BlockCode, old: u64, bytes: &[u8]) -> Result<()> {
        self.write_block(code, old, None, 1, bytes)
    }

    fn push_chunks(&mut self, chunks: Vec<Vec<u8>>) {
        self.chunks.extend(chunks);
    }

    fn into_chunks(mut self) -> Vec<Vec<u8>> {
        let layout = self.layout();
        let dna = self.catalog.encode();
        let tail = [
            (BlockCode::DNA1, dna.as_slice()),
            (BlockCode::ENDB, &[][..]),
        ];
        for (code, payload) in tail {
            let mut chunk = Vec::new();
            BlockHeader {
                code,
                len: payload.len() as i32,
                old: 0,
                sdna: 0,
                nr: 1,
            }
            .encode(&layout, &mut chunk);
            chunk.extend_from_slice(payload);
            self.chunks.push(chunk);
        }
        self.chunks
    }

    /// Appends the struct table and `ENDB` and returns the container.
    pub fn finish(self) -> Vec<u8> {
        self.into_chunks().concat()
    }

    /// Like [`finish`](Self::finish), but keeps the blocks as snapshot chunks compared
    /// against `previous`.
    pub fn into_memfile(self, previous: Option<&MemFile>) -> MemFile {
        MemFile::from_chunks(previous, self.into_chunks())
    }
}

fn sdna_index(catalog: &Catalog, struct_name: Option<&str>) -> Result<usize> {
    match struct_name {
        None => Ok(0),
        Some(name) => catalog
            .struct_index(name)
            .ok_or_else(|| LoaderError::Dna(format!("struct {name} is not declared"))),
    }
}

fn encode_block(
    layout: Layout,
    code: BlockCode,
    old: u64,
    sdna: usize,
    count: usize,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let len = i32::try_from(payload.len())
        .map_err(|_| LoaderError::Internal(format!("{code} block too large")))?;
    let sdna = i32::try_from(sdna)
        .map_err(|_| LoaderError::Internal(format!("{code} block: struct index {sdna} too large")))?;
    let nr = i32::try_from(count)
        .map_err(|_| LoaderError::Internal(format!("{code} block: {count} records")))?;
    let mut chunk = Vec::with_capacity(layout.block_header_size() + payload.len());
    BlockHeader {
        code,
        len,
        old,
        sdna,
        nr,
    }
    .encode(&layout, &mut chunk);
    chunk.extend_from_slice(payload);
    Ok(chunk)
}

/// Synthetic address of an entity in a snapshot.
pub fn entity_address(id: EntityId) -> u64 {
    SNAPSHOT_ADDRESS_BASE + (u64::from(id.as_u32()) << 4)
}

fn patch_header(view: &mut StructViewMut<'_>, entity: &Entity) -> Result<()> {
    let mut header = IdHeader::read(&view.as_view())?;
    header.name = format!("{}{}", entity.code, entity.name);
    header.flag = entity.flags.as_raw();
    header.session_uid = entity.session_uid.as_u32();
    header.next = 0;
    header.prev = 0;
    header.write(view)
}

/// Entity block followed by its data blocks, one chunk each.
fn encode_entity(memory: &Catalog, id: EntityId, entity: &Entity) -> Result<Vec<Vec<u8>>> {
    let Some(struct_name) = entity.struct_name.as_deref() else {
        return Ok(Vec::new());
    };
    let layout = memory.layout();
    let mut payload = entity.payload.clone();
    for (offset, target) in &entity.links {
        layout.write_ptr(&mut payload, *offset, target.map_or(0, entity_address))?;
    }
    {
        let mut view = StructViewMut::new(memory, struct_name, &mut payload)?;
        if struct_name == IdHeader::NAME {
            patch_header(&mut view, entity)?;
        } else if view.as_view().has("id") {
            patch_header(&mut view.substruct_mut("id")?, entity)?;
        }
    }

    let mut chunks = Vec::with_capacity(1 + entity.data.len());
    chunks.push(encode_block(
        layout,
        BlockCode::entity(entity.code),
        entity_address(id),
        sdna_index(memory, Some(struct_name))?,
        1,
        &payload,
    )?);
    for (old, block) in &entity.data {
        chunks.push(encode_block(
            layout,
            BlockCode::DATA,
            *old,
            sdna_index(memory, block.struct_name.as_deref())?,
            block.count,
            &block.bytes,
        )?);
    }
    Ok(chunks)
}

/// `ID` block standing for an entity of another document.
fn encode_link_placeholder(memory: &Catalog, id: EntityId, entity: &Entity) -> Result<Vec<u8>> {
    let header = IdHeader {
        name: format!("{}{}", entity.code, entity.name),
        flag: entity.flags.as_raw(),
        session_uid: entity.session_uid.as_u32(),
        ..IdHeader::default()
    };
    encode_block(
        memory.layout(),
        BlockCode::entity(IdCode::LINK_PLACEHOLDER),
        entity_address(id),
        sdna_index(memory, Some(IdHeader::NAME))?,
        1,
        &header.to_bytes(memory)?,
    )
}

fn local_entities(graph: &Graph) -> Vec<(EntityId, &Entity)> {
    graph
        .entities()
        .filter(|(_, e)| e.document == DocumentId::LOCAL && e.code != IdCode::LIBRARY)
        .collect()
}

pub(crate) fn write_graph(loader: &Loader, blend: &Blend, previous: Option<&MemFile>) -> Result<MemFile> {
    let memory = loader.memory_catalog();
    let program = loader.config().program_version;
    let graph = &blend.graph;
    let mut writer = BlockWriter::new(memory, program.version);

    // 1. Global block, user settings, thumbnail.
    let global = blend.global.as_ref();
    writer.write_struct(
        BlockCode::GLOB,
        0,
        &FileGlobalStruct {
            subversion: program.subversion,
            minversion: global.map_or(0, |g| g.minversion),
            minsubversion: global.map_or(0, |g| g.minsubversion),
            curscene: global.and_then(|g| g.curscene).map_or(0, entity_address),
            fileflags: global.map_or(0, |g| g.fileflags),
            globalf: global.map_or(0, |g| g.globalf),
            filename: global.map(|g| g.filename.clone()).unwrap_or_default(),
            ..FileGlobalStruct::default()
        },
    )?;
    if let Some(user) = &blend.user_settings
        && let Some(struct_name) = user.struct_name.as_deref()
    {
        writer.write_block(BlockCode::USER, 0, Some(struct_name), 1, &user.payload)?;
        for (old, block) in &user.data {
            writer.write_block(
                BlockCode::DATA,
                *old,
                block.struct_name.as_deref(),
                block.count,
                &block.bytes,
            )?;
        }
    }
    if let Some(thumbnail) = &blend.thumbnail {
        let layout = writer.layout();
        let mut bytes = Vec::with_capacity(8 + thumbnail.pixels.len());
        let size = |v: u32| {
            i32::try_from(v).map_err(|_| LoaderError::Internal("thumbnail too large".into()))
        };
        layout.put_i32(&mut bytes, size(thumbnail.width)?);
        layout.put_i32(&mut bytes, size(thumbnail.height)?);
        bytes.extend_from_slice(&thumbnail.pixels);
        writer.write_raw(BlockCode::TEST, 0, &bytes)?;
    }

    // 2. Local entities in slot order, encoded in parallel.
    let encoded: Vec<Vec<Vec<u8>>> = local_entities(graph)
        .par_iter()
        .filter(|(_, e)| !e.is_placeholder())
        .map(|(id, entity)| encode_entity(memory, *id, entity))
        .collect::<Result<_>>()?;
    for chunks in encoded {
        writer.push_chunks(chunks);
    }

    // 3. Each library with the entities the local document uses from it.
    for doc in graph.library_documents() {
        let Some(document) = graph.document(doc) else {
            continue;
        };
        let Some((library_id, library)) = document
            .library
            .and_then(|id| graph.get(id).map(|e| (id, e)))
        else {
            continue;
        };
        writer.push_chunks(encode_entity(memory, library_id, library)?);
        let mut members: Vec<EntityId> = document.entities.clone();
        members.sort();
        for id in members {
            if let Some(entity) = graph.get(id) {
                writer.push_chunks(vec![encode_link_placeholder(memory, id, entity)?]);
            }
        }
    }

    let snapshot = writer.into_memfile(previous);
    log::debug!(
        "snapshot: {} chunks, {} bytes, {} shared with the previous one",
        snapshot.chunks().len(),
        snapshot.len(),
        snapshot.chunks().iter().filter(|c| c.is_identical()).count()
    );
    Ok(snapshot)
}
