//! Loading entry points.
//!
//! [`Loader`] holds what stays constant across loads: configuration, the memory struct
//! catalog, the kind registry and the versioning passes. Each call builds a [`LoadContext`]
//! owning the per-load state, threads it through the read, link and versioning phases, and
//! turns it into a [`Blend`].

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::address_map::{AddressMap, EntityMap, EntityRef};
use crate::compression::{Compressor, CompressorRegistry};
use crate::constants;
use crate::dna::{
    self, Catalog, CatalogBuilder, DnaStruct, FileGlobalStruct, IdHeader, LibraryStruct,
    MemberKind, Reconciler, StructFlag, StructView,
};
use crate::error::{LoaderError, Result};
use crate::format::{BlockCode, IdCode, Layout};
use crate::graph::{
    DataBlock, DocumentId, DocumentOrigin, Entity, EntityId, EntityTags, Graph, LinkState,
    SessionUid, StoredFlags,
};
use crate::kind::{DataReader, EntityKind, KindRegistry, ResolvedKinds};
use crate::report::{DocumentSummary, DuplicateLibrary, InvalidDocument, LoadReport, Severity};
use crate::source::{self, ByteSource, MemFile};
use crate::stream::{self, BlockRecord, BlockStream, StreamOptions};
use crate::versioning::{VersionInfo, Versioning};

/// Settings of a [`Loader`].
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Version of the running program; newer files are refused, older ones versioned.
    pub program_version: VersionInfo,
    /// Ignore the `USER` block.
    pub skip_user_settings: bool,
    /// Read only the global block, user settings and thumbnail.
    pub skip_data: bool,
    /// Read `DATA` payloads of seekable sources on demand instead of while scanning.
    pub defer_data_blocks: bool,
    /// Pointer width and byte order of reconstructed payloads.
    pub memory_layout: Layout,
    /// Directory relative library paths resolve against when loading from memory.
    pub base_dir: Option<PathBuf>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            program_version: VersionInfo::new(
                constants::PROGRAM_VERSION,
                constants::PROGRAM_SUBVERSION,
            ),
            skip_user_settings: false,
            skip_data: false,
            defer_data_blocks: true,
            memory_layout: Layout::native(),
            base_dir: None,
        }
    }
}

/// Contents of the global block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalInfo {
    /// Sub-version of the writing program.
    pub subversion: i16,
    /// Oldest program version able to read the file.
    pub minversion: i16,
    /// Sub-version paired with `minversion`.
    pub minsubversion: i16,
    /// File-level flags.
    pub fileflags: i32,
    /// Global flags.
    pub globalf: i32,
    /// Path the file was saved to.
    pub filename: String,
    /// Active scene, resolved.
    pub curscene: Option<EntityId>,
}

/// The `USER` block and the data it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSettings {
    /// Memory struct of the payload.
    pub struct_name: Option<String>,
    /// Reconstructed payload.
    pub payload: Vec<u8>,
    /// Data blocks referenced from the payload.
    pub data: BTreeMap<u64, DataBlock>,
}

/// Preview image stored in the `TEST` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// RGBA bytes, row by row.
    pub pixels: Vec<u8>,
}

/// The result of a load.
#[derive(Debug)]
pub struct Blend {
    /// Entities and documents.
    pub graph: Graph,
    /// Version of the loaded file.
    pub version: VersionInfo,
    /// Global block, if present.
    pub global: Option<GlobalInfo>,
    /// User settings, unless skipped or absent.
    pub user_settings: Option<UserSettings>,
    /// Preview image, if present.
    pub thumbnail: Option<Thumbnail>,
    /// Non-fatal problems.
    pub report: LoadReport,
}

impl Blend {
    /// True when versioning flagged any document as corrupt.
    pub fn is_read_invalid(&self) -> bool {
        self.graph.local().is_some_and(|d| d.is_read_invalid())
    }

    /// Finds a local entity by type and name.
    pub fn find_local(&self, code: IdCode, name: &str) -> Option<EntityId> {
        self.graph.find_local(code, name)
    }
}

/// Configures a [`Loader`].
#[derive(Debug, Default)]
pub struct LoaderBuilder {
    config: LoaderConfig,
    kinds: KindRegistry,
    catalog: Option<Catalog>,
    structs: Vec<fn(&mut CatalogBuilder) -> Result<usize>>,
    versioning: Versioning,
    compressors: CompressorRegistry,
}

impl LoaderBuilder {
    /// Replaces the whole configuration.
    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the running program version.
    pub fn program_version(mut self, version: u16, subversion: i16) -> Self {
        self.config.program_version = VersionInfo::new(version, subversion);
        self
    }

    /// Ignore the `USER` block.
    pub fn skip_user_settings(mut self, skip: bool) -> Self {
        self.config.skip_user_settings = skip;
        self
    }

    /// Skip every entity and library block.
    pub fn skip_data(mut self, skip: bool) -> Self {
        self.config.skip_data = skip;
        self
    }

    /// Read `DATA` payloads lazily where possible.
    pub fn defer_data_blocks(mut self, defer: bool) -> Self {
        self.config.defer_data_blocks = defer;
        self
    }

    /// Pointer width and byte order of reconstructed payloads.
    pub fn memory_layout(mut self, layout: Layout) -> Self {
        self.config.memory_layout = layout;
        self
    }

    /// Directory for relative library paths of memory loads.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.base_dir = Some(dir.into());
        self
    }

    /// Registers an entity kind.
    pub fn kind<K: EntityKind + 'static>(mut self, kind: K) -> Self {
        self.kinds.register(Arc::new(kind));
        self
    }

    /// Registers an already shared entity kind.
    pub fn kind_arc(mut self, kind: Arc<dyn EntityKind>) -> Self {
        self.kinds.register(kind);
        self
    }

    /// Adds a struct to the memory catalog.
    pub fn define<T: DnaStruct>(mut self) -> Self {
        self.structs.push(T::describe);
        self
    }

    /// Uses a prebuilt memory catalog. Its layout overrides the configured one.
    pub fn memory_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Sets the versioning passes.
    pub fn versioning(mut self, versioning: Versioning) -> Self {
        self.versioning = versioning;
        self
    }

    /// Registers a codec for compressed sources.
    pub fn compressor(mut self, compressor: Box<dyn Compressor>) -> Self {
        self.compressors.register(compressor);
        self
    }

    /// Builds the memory catalog and checks every kind against it.
    pub fn build(mut self) -> Result<Loader> {
        let memory = match self.catalog.take() {
            Some(catalog) => {
                self.config.memory_layout = catalog.layout();
                catalog
            }
            None => {
                let mut builder = dna::builtin_catalog(self.config.memory_layout)?;
                for describe in &self.structs {
                    describe(&mut builder)?;
                }
                builder.build()?
            }
        };

        for kind in self.kinds.iter() {
            if memory.struct_index(kind.struct_name()).is_none() {
                return Err(LoaderError::Dna(format!(
                    "kind {} reads struct {} which the memory catalog does not declare",
                    kind.code(),
                    kind.struct_name()
                )));
            }
        }

        Ok(Loader {
            config: self.config,
            memory,
            kinds: self.kinds,
            versioning: self.versioning,
            compressors: self.compressors,
        })
    }
}

/// Reads documents into object graphs.
///
/// ```
/// use blendloader::Loader;
///
/// let loader = Loader::builder().skip_user_settings(true).build()?;
/// assert!(loader.config().skip_user_settings);
/// # Ok::<(), blendloader::LoaderError>(())
/// ```
#[derive(Debug)]
pub struct Loader {
    config: LoaderConfig,
    memory: Catalog,
    kinds: KindRegistry,
    versioning: Versioning,
    compressors: CompressorRegistry,
}

impl Loader {
    /// Starts configuring a loader.
    pub fn builder() -> LoaderBuilder {
        LoaderBuilder::default()
    }

    /// Configuration in effect.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Catalog describing the memory layout of payloads.
    pub fn memory_catalog(&self) -> &Catalog {
        &self.memory
    }

    /// Registered kinds.
    pub fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    pub(crate) fn compressors(&self) -> &CompressorRegistry {
        &self.compressors
    }

    /// Loads a document from disk, following its references to other documents.
    pub fn load_path<P: AsRef<Path>>(&self, path: P) -> Result<Blend> {
        let path = path.as_ref();
        let absolute = std::path::absolute(path).map(|p| normalize_path(&p))?;
        let source = source::open_path(&absolute, &self.compressors)?;
        self.load_source(source, Some(&absolute))
    }

    /// Loads a document held in memory (plain or compressed).
    pub fn load_memory(&self, bytes: Vec<u8>) -> Result<Blend> {
        let source = source::open_memory(bytes, &self.compressors)?;
        self.load_source(source, None)
    }

    /// Loads from an arbitrary byte source. `path` is the document's own location, used to
    /// resolve relative library paths.
    pub fn load_source(&self, source: Box<dyn ByteSource>, path: Option<&Path>) -> Result<Blend> {
        let label = path.map_or_else(|| "<memory>".to_owned(), |p| p.display().to_string());
        let mut ctx = LoadContext::new(self, label);

        // 1. Header, struct table, global block; a newer file is refused here.
        let root = ctx.open_root(source, path.map(Path::to_path_buf))?;

        // 2. Entities, libraries and placeholders of the root file.
        ctx.read_root_blocks(root)?;

        // 3. Libraries, versioning and pointer resolution.
        ctx.resolve()?;
        ctx.finalize();

        Ok(ctx.into_blend(None, None))
    }

    /// Links the entity `code`/`name` of the document at `path` into an already loaded
    /// graph, together with everything it references.
    ///
    /// The library document is reused when `blend` already references the file. An entity
    /// the file does not hold stays a placeholder and is listed in the report.
    pub fn link_named<P: AsRef<Path>>(
        &self,
        blend: &mut Blend,
        path: P,
        code: IdCode,
        name: &str,
    ) -> Result<EntityId> {
        let absolute = std::path::absolute(path.as_ref()).map(|p| normalize_path(&p))?;
        crate::linker::link_named(self, blend, &absolute, code, name)
    }

    /// Reads the preview image of a document without parsing the rest of it.
    ///
    /// Only the blocks in front of the first entity are read.
    pub fn thumbnail_from_path<P: AsRef<Path>>(&self, path: P) -> Result<Option<Thumbnail>> {
        let source = source::open_path(path.as_ref(), &self.compressors)?;
        let (header, blocks) = stream::read_leading_blocks(source, |code| {
            code == BlockCode::REND || code == BlockCode::TEST || code == BlockCode::GLOB
        })?;
        blocks
            .iter()
            .find(|(block, _)| block.code == BlockCode::TEST)
            .map(|(_, payload)| parse_thumbnail(header.layout, payload))
            .transpose()
    }

    /// Reads the version and sub-version a document was written with. Documents from newer
    /// programs are reported, not refused.
    pub fn version_from_path<P: AsRef<Path>>(&self, path: P) -> Result<VersionInfo> {
        let path = path.as_ref();
        let source = source::open_path(path, &self.compressors)?;
        let file = FileData::read(source, Some(path), DocumentId::LOCAL, self)?;
        file.stream.close();
        Ok(file.version)
    }

    /// Rebuilds the state captured in `snapshot`, reusing what did not change since
    /// `previous`.
    pub fn restore_undo(&self, previous: Blend, snapshot: &MemFile) -> Result<Blend> {
        crate::undo::restore(self, previous, snapshot)
    }

    /// Serializes a loaded graph into an undo snapshot, sharing unchanged chunks with
    /// `previous`.
    pub fn write_snapshot(&self, blend: &Blend, previous: Option<&MemFile>) -> Result<MemFile> {
        crate::writer::write_graph(self, blend, previous)
    }
}

/// Name, flags and payload of an entity or placeholder block.
#[derive(Debug, Clone)]
pub(crate) struct BlockIdentity {
    pub(crate) code: IdCode,
    pub(crate) name: String,
    pub(crate) flags: StoredFlags,
    pub(crate) uid: SessionUid,
    pub(crate) payload: DataBlock,
}

/// One opened file and its per-file maps.
#[derive(Debug)]
pub(crate) struct FileData {
    pub(crate) document: DocumentId,
    pub(crate) base_dir: PathBuf,
    pub(crate) stream: BlockStream,
    pub(crate) catalog: Catalog,
    pub(crate) reconciler: Reconciler,
    pub(crate) entities: EntityMap,
    pub(crate) data: AddressMap<DataBlock>,
    pub(crate) version: VersionInfo,
    pub(crate) global: Option<FileGlobalStruct>,
    /// Payload bytes run through [`FileData::reconstruct`] since the header was read.
    pub(crate) decoded_bytes: Cell<usize>,
}

impl FileData {
    /// Reads a file and refuses it if a newer program wrote it.
    pub(crate) fn open(
        source: Box<dyn ByteSource>,
        path: Option<&Path>,
        document: DocumentId,
        loader: &Loader,
    ) -> Result<Self> {
        let file = Self::read(source, path, document, loader)?;
        let program = loader.config.program_version;
        if let Some(global) = &file.global
            && (i32::from(global.minversion), global.minsubversion)
                > (i32::from(program.version), program.subversion)
        {
            return Err(LoaderError::Format(format!(
                "not a valid document: saved by a newer version ({}.{}, this is {program})",
                global.minversion, global.minsubversion
            )));
        }
        Ok(file)
    }

    /// Scans the blocks, parses the struct table and decodes the global block.
    fn read(
        source: Box<dyn ByteSource>,
        path: Option<&Path>,
        document: DocumentId,
        loader: &Loader,
    ) -> Result<Self> {
        let config = &loader.config;
        let mut stream = BlockStream::open(
            source,
            StreamOptions {
                memory_width: loader.memory.layout().width,
                defer_data_blocks: config.defer_data_blocks,
            },
        )?;
        let header = *stream.file_header();

        let dna_block = stream
            .find_code(BlockCode::DNA1)
            .ok_or_else(|| LoaderError::Dna("document has no struct table".into()))?;
        let catalog = Catalog::parse(&stream.read_payload(dna_block)?, header.layout)?;
        let reconciler = dna::reconcile(&catalog, &loader.memory);
        if let Some((offset, len)) = catalog.id_name_slot() {
            stream.index_names(offset, len);
        }

        let base_dir = match path.and_then(Path::parent) {
            Some(dir) => dir.to_path_buf(),
            None => config
                .base_dir
                .clone()
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_default(),
        };

        let mut file = Self {
            document,
            base_dir,
            stream,
            catalog,
            reconciler,
            entities: EntityMap::new(),
            data: AddressMap::new(),
            version: VersionInfo::new(header.version, 0),
            global: None,
            decoded_bytes: Cell::new(0),
        };

        if let Some(glob) = file.stream.find_code(BlockCode::GLOB).cloned()
            && let Some(block) = file.reconstruct(&loader.memory, &glob)?
            && block.struct_name.as_deref() == Some(FileGlobalStruct::NAME)
        {
            let global = FileGlobalStruct::from_bytes(&loader.memory, &block.bytes)?;
            file.version.subversion = global.subversion;
            file.global = Some(global);
        }
        file.decoded_bytes.set(0);
        Ok(file)
    }

    /// Converts a block payload into the memory layout. `None` when the struct was removed.
    pub(crate) fn reconstruct(&self, memory: &Catalog, block: &BlockRecord) -> Result<Option<DataBlock>> {
        let raw = self.stream.read_payload(block)?;
        self.decoded_bytes.set(self.decoded_bytes.get() + raw.len());
        if block.sdna() == 0 {
            return Ok(Some(DataBlock {
                struct_name: None,
                count: block.count(),
                bytes: raw.into_owned(),
                layout: self.stream.file_header().layout,
            }));
        }
        let Some(bytes) =
            self.reconciler
                .reconstruct(&self.catalog, memory, block.sdna(), &raw, block.count())?
        else {
            return Ok(None);
        };
        let struct_name = self
            .reconciler
            .memory_struct(block.sdna())
            .and_then(|i| memory.struct_info(i))
            .map(|s| s.name.clone());
        Ok(Some(DataBlock {
            struct_name,
            count: block.count(),
            bytes,
            layout: memory.layout(),
        }))
    }

    /// Code and session uid of an entity block, read in place from its stored payload.
    ///
    /// `None` for placeholders, deferred payloads and structs without an `ID` header; callers
    /// fall back to [`FileData::identity`].
    pub(crate) fn peek_identity(&self, block: &BlockRecord) -> Option<(IdCode, SessionUid)> {
        let code = block
            .code()
            .id_code()
            .filter(|code| *code != IdCode::LINK_PLACEHOLDER)?;
        if self.reconciler.flag(block.sdna()) == StructFlag::Removed {
            return None;
        }
        let payload = self.stream.peek_payload(block)?;
        let id_info = self.catalog.struct_info_by_name(IdHeader::NAME)?;
        let info = self.catalog.struct_info(block.sdna())?;
        let id_offset = if info.name == IdHeader::NAME {
            0
        } else {
            let member = info.member("id")?;
            match member.kind {
                MemberKind::Struct(index)
                    if self.catalog.struct_info(index).is_some_and(|s| s.name == IdHeader::NAME) =>
                {
                    member.offset
                }
                _ => return None,
            }
        };
        let uid = id_info.member("session_uid").filter(|m| m.size() == 4)?;
        let raw = self
            .catalog
            .layout()
            .read_u32(payload, id_offset.checked_add(uid.offset)?)
            .ok()?;
        Some((code, SessionUid::new(raw)))
    }

    /// Decodes the `ID` header of an entity or placeholder block.
    pub(crate) fn identity(&self, memory: &Catalog, block: &BlockRecord) -> Result<Option<BlockIdentity>> {
        let Some(payload) = self.reconstruct(memory, block)? else {
            return Ok(None);
        };
        let Some(struct_name) = payload.struct_name.as_deref() else {
            return Ok(None);
        };
        let header = read_id_header(memory, struct_name, &payload.bytes)?;
        let Some((stored_code, name)) = split_stored_name(&header.name) else {
            return Ok(None);
        };
        let code = match block.code().id_code() {
            Some(IdCode::LINK_PLACEHOLDER) | None => stored_code,
            Some(code) => code,
        };
        Ok(Some(BlockIdentity {
            code,
            name,
            flags: StoredFlags::from_raw(header.flag),
            uid: SessionUid::new(header.session_uid),
            payload,
        }))
    }

    /// Index of the first block after the `DATA` run following `index`.
    pub(crate) fn data_run_end(&self, index: usize) -> usize {
        let blocks = self.stream.blocks();
        let mut next = index + 1;
        while blocks.get(next).is_some_and(|b| b.code() == BlockCode::DATA) {
            next += 1;
        }
        next
    }

    pub(crate) fn block(&self, index: usize) -> Result<BlockRecord> {
        self.stream
            .block(index)
            .cloned()
            .ok_or_else(|| LoaderError::Internal(format!("block {index} out of range")))
    }
}

/// Record count of a block as stored in the address map.
fn block_count(block: &BlockRecord) -> Result<i32> {
    i32::try_from(block.count()).map_err(|_| {
        LoaderError::Corrupt(format!(
            "corrupt document: block {} claims {} records",
            block.index(),
            block.count()
        ))
    })
}

/// Decodes a `TEST` payload: width and height as `i32`, then RGBA rows.
fn parse_thumbnail(layout: Layout, raw: &[u8]) -> Result<Thumbnail> {
    let width = layout.read_i32(raw, 0)?;
    let height = layout.read_i32(raw, 4)?;
    let (Ok(width), Ok(height)) = (u32::try_from(width), u32::try_from(height)) else {
        return Err(LoaderError::Corrupt(format!(
            "thumbnail has negative size {width}x{height}"
        )));
    };
    let size = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| LoaderError::Corrupt("thumbnail size overflows".into()))?;
    let pixels = raw
        .get(8..)
        .and_then(|rest| rest.get(..size))
        .ok_or_else(|| LoaderError::Corrupt("thumbnail shorter than its size".into()))?;
    Ok(Thumbnail {
        width,
        height,
        pixels: pixels.to_vec(),
    })
}

fn read_id_header(memory: &Catalog, struct_name: &str, bytes: &[u8]) -> Result<IdHeader> {
    let view = StructView::new(memory, struct_name, bytes)?;
    if struct_name == IdHeader::NAME {
        return IdHeader::read(&view);
    }
    IdHeader::read(&view.substruct("id")?)
}

/// Splits `"OBCube"` into its type tag and name.
pub(crate) fn split_stored_name(stored: &str) -> Option<(IdCode, String)> {
    let bytes = stored.as_bytes();
    if bytes.len() < 2 {
        return None;
    }
    let name = stored.get(2..)?.to_owned();
    Some((IdCode::new([bytes[0], bytes[1]]), name))
}

/// Lexically normalises a path: drops `.`, folds `..`.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolves a stored library path (`//` means relative to the referencing file).
pub(crate) fn resolve_library_path(base: &Path, stored: &str) -> PathBuf {
    let joined = match stored.strip_prefix("//") {
        Some(relative) => base.join(relative),
        None if Path::new(stored).is_absolute() => PathBuf::from(stored),
        None => base.join(stored),
    };
    normalize_path(&joined)
}

/// Per-load state, threaded through every phase.
pub(crate) struct LoadContext<'l> {
    pub(crate) loader: &'l Loader,
    pub(crate) kinds: ResolvedKinds,
    pub(crate) graph: Graph,
    pub(crate) files: Vec<FileData>,
    pub(crate) file_of: HashMap<DocumentId, usize>,
    pub(crate) report: LoadReport,
    pub(crate) keep_uids: bool,
    pub(crate) next_uid: u32,
    pub(crate) user_settings: Option<UserSettings>,
    pub(crate) thumbnail: Option<Thumbnail>,
}

impl<'l> LoadContext<'l> {
    pub(crate) fn new(loader: &'l Loader, label: String) -> Self {
        Self {
            loader,
            kinds: loader.kinds.resolve(&loader.memory),
            graph: Graph::new(),
            files: Vec::new(),
            file_of: HashMap::new(),
            report: LoadReport::new(label),
            keep_uids: false,
            next_uid: 1,
            user_settings: None,
            thumbnail: None,
        }
    }

    pub(crate) fn memory(&self) -> &'l Catalog {
        &self.loader.memory
    }

    /// Opens the root file and records its versions on the local document.
    pub(crate) fn open_root(
        &mut self,
        source: Box<dyn ByteSource>,
        path: Option<PathBuf>,
    ) -> Result<usize> {
        let file = FileData::open(source, path.as_deref(), DocumentId::LOCAL, self.loader)?;
        log::debug!(
            "root {}: version {}, {} blocks, {} structs ({} equal, {} changed, {} removed)",
            self.report.source,
            file.version,
            file.stream.blocks().len(),
            file.catalog.struct_count(),
            file.reconciler.count(dna::StructFlag::Equal),
            file.reconciler.count(dna::StructFlag::Unequal),
            file.reconciler.count(dna::StructFlag::Removed),
        );
        Ok(self.push_file(file))
    }

    pub(crate) fn push_file(&mut self, file: FileData) -> usize {
        self.report.stats.blocks += file.stream.blocks().len();
        let document = file.document;
        if let Some(doc) = self.graph.document_mut(document) {
            doc.version = file.version.version;
            doc.subversion = file.version.subversion;
            if let Some(global) = &file.global {
                doc.minversion = global.minversion;
                doc.minsubversion = global.minsubversion;
            }
            doc.opened = true;
        }
        let index = self.files.len();
        self.files.push(file);
        self.file_of.insert(document, index);
        index
    }

    pub(crate) fn file(&self, index: usize) -> Result<&FileData> {
        self.files
            .get(index)
            .ok_or_else(|| LoaderError::Internal(format!("file {index} not opened")))
    }

    pub(crate) fn assign_uid(&mut self, stored: SessionUid, previous: Option<SessionUid>) -> SessionUid {
        if self.keep_uids && !stored.is_none() {
            return stored;
        }
        if let Some(uid) = previous.filter(|u| !u.is_none()) {
            return uid;
        }
        let uid = SessionUid::new(self.next_uid);
        self.next_uid += 1;
        uid
    }

    /// Walks the blocks of the root file.
    pub(crate) fn read_root_blocks(&mut self, root: usize) -> Result<()> {
        let count = self.file(root)?.stream.blocks().len();
        let mut current_library: Option<DocumentId> = None;
        let mut index = 0;
        while index < count {
            let block = self.file(root)?.block(index)?;
            let code = block.code();
            index += 1;
            match code {
                BlockCode::TEST => self.read_thumbnail(root, &block),
                BlockCode::USER => {
                    index = self.read_user_settings(root, block.index())?;
                }
                BlockCode::GLOB | BlockCode::DNA1 | BlockCode::REND | BlockCode::DATA => {}
                _ if self.loader.config.skip_data => {}
                _ => match code.id_code() {
                    Some(IdCode::LIBRARY) => {
                        let (doc, next) = self.read_library_block(root, block.index())?;
                        current_library = doc.or(current_library);
                        index = next;
                    }
                    Some(IdCode::LINK_PLACEHOLDER) => match current_library {
                        Some(doc) => self.read_link_placeholder(root, block.index(), doc)?,
                        None => self.report.message(
                            Severity::Warning,
                            format!("placeholder block {} has no preceding library", block.index()),
                        ),
                    },
                    Some(_) => {
                        let (_, next) = self.read_entity(
                            root,
                            block.index(),
                            DocumentId::LOCAL,
                            EntityTags::NEW,
                            None,
                        )?;
                        index = next;
                    }
                    None => log::trace!("skipping {code} block"),
                },
            }
        }
        Ok(())
    }

    /// Decodes the entity block at `index` and claims the `DATA` blocks following it.
    ///
    /// With `slot`, the entity is written into that arena slot (placeholder replacement,
    /// undo re-read); otherwise it gets a fresh one. Returns the entity, if its struct still
    /// exists, and the index of the first block after its data.
    pub(crate) fn read_entity(
        &mut self,
        file: usize,
        index: usize,
        document: DocumentId,
        tags: EntityTags,
        slot: Option<EntityId>,
    ) -> Result<(Option<EntityId>, usize)> {
        let memory = self.memory();
        let fd = self.file(file)?;
        let block = fd.block(index)?;
        let next = fd.data_run_end(index);
        let Some(identity) = fd.identity(memory, &block)? else {
            self.report.message(
                Severity::Warning,
                format!("{} block {index}: struct no longer exists, entity skipped", block.code()),
            );
            return Ok((None, next));
        };
        let struct_name = identity.payload.struct_name.clone().unwrap_or_default();
        let kind = self.kinds.get_or_generic(identity.code, &struct_name, memory);

        let previous_uid = slot.and_then(|s| self.graph.get(s)).map(|e| e.session_uid);
        let mut entity = Entity::new(identity.code, identity.name, document);
        entity.session_uid = self.assign_uid(identity.uid, previous_uid);
        entity.flags = identity.flags;
        entity.tags = tags;
        entity.struct_name = Some(struct_name);
        entity.payload = identity.payload.bytes;
        entity.old_address = block.old();

        let fd = self
            .files
            .get_mut(file)
            .ok_or_else(|| LoaderError::Internal(format!("file {file} not opened")))?;
        fd.data.clear();
        for j in index + 1..next {
            let data_block = fd.block(j)?;
            if let Some(decoded) = fd.reconstruct(memory, &data_block)? {
                fd.data.insert(data_block.old(), decoded, block_count(&data_block)?);
            }
        }
        {
            let mut reader = DataReader::new(&mut fd.data, memory, &kind.data_slots);
            kind.kind.decode_payload(&mut entity, &mut reader)?;
        }
        let pending = fd.data.len();
        entity.data = fd.data.drain_used().into_iter().collect();
        if pending > entity.data.len() {
            log::trace!(
                "{}{}: dropped {} unclaimed data blocks",
                entity.code,
                entity.name,
                pending - entity.data.len()
            );
        }

        let code = entity.code;
        let id = match slot {
            Some(id) => {
                self.graph.replace(id, entity);
                id
            }
            None => self.graph.insert(entity),
        };
        fd.entities.insert_entity(
            block.old(),
            EntityRef {
                id,
                code,
                linked: document != DocumentId::LOCAL,
            },
        );
        self.report.stats.entities_read += 1;
        Ok((Some(id), next))
    }

    pub(crate) fn read_library_block(&mut self, file: usize, index: usize) -> Result<(Option<DocumentId>, usize)> {
        let (library, next) =
            self.read_entity(file, index, DocumentId::LOCAL, EntityTags::NEW, None)?;
        let Some(library) = library else {
            return Ok((None, next));
        };
        let doc = self.attach_library(file, library)?;
        Ok((Some(doc), next))
    }

    /// Creates the document referenced by a library entity, or merges the entity into an
    /// existing library pointing at the same file.
    pub(crate) fn attach_library(&mut self, file: usize, library: EntityId) -> Result<DocumentId> {
        let memory = self.memory();
        let payload = self
            .graph
            .get(library)
            .map(|e| e.payload.clone())
            .ok_or_else(|| LoaderError::Internal(format!("library {library} vanished")))?;
        let stored = LibraryStruct::from_bytes(memory, &payload)?.filepath;
        let absolute = resolve_library_path(&self.file(file)?.base_dir, &stored);

        if let Some(existing) = self.graph.find_document_by_path(&absolute) {
            self.report.duplicate_libraries.push(DuplicateLibrary {
                stored_path: stored.clone(),
                absolute_path: absolute.clone(),
            });
            self.report.message(
                Severity::Warning,
                format!("library '{stored}' duplicates {}", absolute.display()),
            );
            let existing_library = self.graph.document(existing).and_then(|d| d.library);
            if let Some(target) = existing_library
                && target != library
            {
                let to = EntityRef {
                    id: target,
                    code: IdCode::LIBRARY,
                    linked: false,
                };
                for fd in &mut self.files {
                    fd.entities.repoint(library, Some(to));
                }
                self.graph.remove(library);
                self.graph.retarget_links(library, Some(target));
            }
            return Ok(existing);
        }

        let doc = self.graph.add_document(DocumentOrigin {
            stored: stored.clone(),
            absolute: absolute.clone(),
        });
        if let Some(d) = self.graph.document_mut(doc) {
            d.library = Some(library);
        }
        log::debug!("library '{stored}' -> {} ({doc:?})", absolute.display());
        Ok(doc)
    }

    pub(crate) fn read_link_placeholder(&mut self, file: usize, index: usize, doc: DocumentId) -> Result<()> {
        let memory = self.memory();
        let fd = self.file(file)?;
        let block = fd.block(index)?;
        let Some(identity) = fd.identity(memory, &block)? else {
            self.report.message(
                Severity::Warning,
                format!("placeholder block {index} is unreadable"),
            );
            return Ok(());
        };
        let id = self.find_or_create_placeholder(
            doc,
            identity.code,
            &identity.name,
            identity.flags,
            identity.uid,
        );
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

    /// Reuses the entity `doc` holds under `name`, or creates a placeholder for it.
    pub(crate) fn find_or_create_placeholder(
        &mut self,
        doc: DocumentId,
        code: IdCode,
        name: &str,
        flags: StoredFlags,
        uid: SessionUid,
    ) -> EntityId {
        if let Some(existing) = self.graph.find(doc, code, name) {
            if !flags.is_weak_link()
                && let Some(entity) = self.graph.get_mut(existing)
                && entity.is_placeholder()
            {
                entity.flags = StoredFlags::new(false);
            }
            return existing;
        }
        let mut placeholder = Entity::placeholder(code, name, doc, flags);
        placeholder.session_uid = self.assign_uid(uid, None);
        self.report.stats.placeholders += 1;
        log::debug!(
            "placeholder {code}{name} in {doc:?}{}",
            if flags.is_weak_link() { " (weak)" } else { "" }
        );
        self.graph.insert(placeholder)
    }

    fn read_thumbnail(&mut self, file: usize, block: &BlockRecord) {
        let Ok(fd) = self.file(file) else {
            return;
        };
        let layout = fd.stream.file_header().layout;
        let parsed = fd
            .stream
            .read_payload(block)
            .and_then(|raw| parse_thumbnail(layout, &raw));
        match parsed {
            Ok(thumbnail) => self.thumbnail = Some(thumbnail),
            Err(err) => self
                .report
                .message(Severity::Warning, format!("thumbnail skipped: {err}")),
        }
    }

    fn read_user_settings(&mut self, file: usize, index: usize) -> Result<usize> {
        let memory = self.memory();
        let fd = self.file(file)?;
        let next = fd.data_run_end(index);
        if self.loader.config.skip_user_settings {
            return Ok(next);
        }
        let block = fd.block(index)?;
        let Some(payload) = fd.reconstruct(memory, &block)? else {
            return Ok(next);
        };

        let mut globals: AddressMap<DataBlock> = AddressMap::new();
        for j in index + 1..next {
            let data_block = fd.block(j)?;
            if let Some(decoded) = fd.reconstruct(memory, &data_block)? {
                globals.insert(data_block.old(), decoded, block_count(&data_block)?);
            }
        }
        if let Some(info) = payload
            .struct_name
            .as_deref()
            .and_then(|n| memory.struct_info_by_name(n))
        {
            let layout = memory.layout();
            for member in info.members.iter().filter(|m| m.kind == MemberKind::Pointer) {
                for e in 0..member.array_len {
                    let old = layout.read_ptr(&payload.bytes, member.offset + e * member.elem_size)?;
                    globals.lookup(old, true);
                }
            }
        }
        self.user_settings = Some(UserSettings {
            struct_name: payload.struct_name,
            payload: payload.bytes,
            data: globals.drain_used().into_iter().collect(),
        });
        Ok(next)
    }

    /// Flags a document (and the root) as unreadable.
    pub(crate) fn invalidate_document(&mut self, doc: DocumentId, reason: String) {
        let label = self.document_label(doc);
        for id in [doc, DocumentId::LOCAL] {
            if let Some(d) = self.graph.document_mut(id) {
                d.read_invalid = true;
            }
        }
        self.report.invalid_documents.push(InvalidDocument {
            document: label.clone(),
            reason: reason.clone(),
        });
        self.report
            .message(Severity::Error, format!("{label} flagged invalid: {reason}"));
    }

    pub(crate) fn document_label(&self, doc: DocumentId) -> String {
        self.graph
            .document(doc)
            .and_then(|d| d.absolute_path())
            .map_or_else(|| "<local>".to_owned(), |p| p.display().to_string())
    }

    fn is_invalid(&self, doc: DocumentId) -> bool {
        self.graph.document(doc).is_some_and(|d| d.read_invalid)
    }

    fn new_entities(&self, doc: DocumentId) -> Vec<EntityId> {
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
                    .is_some_and(|e| e.tags.contains(EntityTags::NEW) && !e.is_placeholder())
            })
            .collect()
    }

    pub(crate) fn version_pre_link(&mut self, doc: DocumentId) {
        if self.is_invalid(doc) {
            return;
        }
        let Some(version) = self.file_of.get(&doc).and_then(|f| self.files.get(*f)).map(|f| f.version) else {
            return;
        };
        let entities = self.new_entities(doc);
        let memory = self.memory();
        let outcome = self.loader.versioning.run_pre_link(
            &mut self.graph,
            &self.kinds,
            memory,
            doc,
            &entities,
            version,
        );
        if let Some(reason) = outcome {
            self.invalidate_document(doc, reason);
        }
    }

    fn version_post_link(&mut self, doc: DocumentId) {
        if self.is_invalid(doc) {
            return;
        }
        let Some(version) = self.file_of.get(&doc).and_then(|f| self.files.get(*f)).map(|f| f.version) else {
            return;
        };
        let entities = self.new_entities(doc);
        let outcome = self.loader.versioning.run_post_link(
            &mut self.graph,
            &self.kinds,
            doc,
            &entities,
            version,
        );
        if let Some(reason) = outcome {
            self.invalidate_document(doc, reason);
        }
    }

    /// Everything between reading the root blocks and the post-link phase.
    pub(crate) fn resolve(&mut self) -> Result<()> {
        self.version_pre_link(DocumentId::LOCAL);
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
        self.lib_link(DocumentId::LOCAL)
    }

    /// Post-link versioning, global links and cleanup.
    pub(crate) fn finalize(&mut self) {
        let mut docs = vec![DocumentId::LOCAL];
        docs.extend(self.graph.library_documents());
        for doc in docs {
            self.version_post_link(doc);
        }
        self.remove_unused_libraries();
        for id in self.graph.entity_ids() {
            if let Some(entity) = self.graph.get_mut(id) {
                entity.tags.remove(EntityTags::NEW);
            }
        }
        for fd in &self.files {
            self.report.stats.bytes_decoded += fd.decoded_bytes.get();
            fd.stream.close();
        }
    }

    /// Assembles the output.
    pub(crate) fn into_blend(
        mut self,
        user_settings: Option<UserSettings>,
        thumbnail: Option<Thumbnail>,
    ) -> Blend {
        let global = self.link_global();
        let version = self.files.first().map(|f| f.version).unwrap_or_default();

        self.report.documents = self
            .graph
            .documents()
            .map(|d| DocumentSummary {
                label: d
                    .absolute_path()
                    .map_or_else(|| "<local>".to_owned(), |p| p.display().to_string()),
                entities: d.entities.len(),
                placeholders: d
                    .entities
                    .iter()
                    .filter(|id| self.graph.get(**id).is_some_and(|e| e.state == LinkState::Placeholder))
                    .count(),
                missing: d.missing,
                invalid: d.read_invalid,
            })
            .collect();

        log::info!(
            "loaded {}: {} entities in {} documents",
            self.report.source,
            self.graph.len(),
            self.report.documents.len()
        );

        Blend {
            graph: self.graph,
            version,
            global,
            user_settings: self.user_settings.or(user_settings),
            thumbnail: self.thumbnail.or(thumbnail),
            report: self.report,
        }
    }
}
