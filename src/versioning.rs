//! Version-gated upgrade passes.
//!
//! A pass is registered with the program version that introduced it and runs on every
//! document whose stored version is older. Pre-link passes run on freshly decoded entities
//! before their pointers are resolved and may only touch those entities. Post-link passes
//! run once the whole graph is linked.
//!
//! ```
//! use blendloader::versioning::Versioning;
//!
//! let versioning = Versioning::new().pre_link(280, 1, "rename legacy flag", |ctx| {
//!     for id in ctx.entities().to_vec() {
//!         if let Some(entity) = ctx.entity_mut(id) {
//!             entity.payload_mut().fill(0);
//!         }
//!     }
//!     Ok(())
//! });
//! assert_eq!(versioning.len(), 1);
//! ```

use std::fmt;

use serde::Serialize;

use crate::dna::Catalog;
use crate::error::Result;
use crate::graph::{DocumentId, Entity, EntityId, Graph};
use crate::kind::ResolvedKinds;

/// Program version and sub-version a document was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct VersionInfo {
    /// Main version, from the file header.
    pub version: u16,
    /// Sub-version, from the global block.
    pub subversion: i16,
}

impl VersionInfo {
    /// Creates a version pair.
    pub fn new(version: u16, subversion: i16) -> Self {
        Self {
            version,
            subversion,
        }
    }

    /// True when this version predates `(version, subversion)`.
    pub fn is_older_than(&self, version: u16, subversion: i16) -> bool {
        (self.version, self.subversion) < (version, subversion)
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.version, self.subversion)
    }
}

/// What a pre-link pass sees: one document's newly read entities.
pub struct PreLinkContext<'a> {
    graph: &'a mut Graph,
    document: DocumentId,
    entities: &'a [EntityId],
    memory: &'a Catalog,
    version: VersionInfo,
    invalid: Option<String>,
}

impl PreLinkContext<'_> {
    /// Document being upgraded.
    pub fn document(&self) -> DocumentId {
        self.document
    }

    /// Version the document was written with.
    pub fn version(&self) -> VersionInfo {
        self.version
    }

    /// Memory catalog, for typed views over payloads.
    pub fn memory(&self) -> &Catalog {
        self.memory
    }

    /// Entities read in this pass.
    pub fn entities(&self) -> &[EntityId] {
        self.entities
    }

    /// One of [`entities`](Self::entities).
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        if !self.entities.contains(&id) {
            return None;
        }
        self.graph.get(id)
    }

    /// Mutable access to one of [`entities`](Self::entities). Other entities are off limits.
    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        if !self.entities.contains(&id) {
            return None;
        }
        self.graph.get_mut(id)
    }

    /// Flags the document as unreadable. No further pass runs on it.
    pub fn invalidate(&mut self, reason: impl Into<String>) {
        self.invalid = Some(reason.into());
    }
}

/// What a post-link pass sees: the resolved graph.
pub struct PostLinkContext<'a> {
    graph: &'a mut Graph,
    document: DocumentId,
    entities: &'a [EntityId],
    version: VersionInfo,
    invalid: Option<String>,
}

impl PostLinkContext<'_> {
    /// Document being upgraded.
    pub fn document(&self) -> DocumentId {
        self.document
    }

    /// Version the document was written with.
    pub fn version(&self) -> VersionInfo {
        self.version
    }

    /// Entities read from the document during this load.
    pub fn entities(&self) -> &[EntityId] {
        self.entities
    }

    /// The whole graph.
    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// The whole graph, mutably.
    pub fn graph_mut(&mut self) -> &mut Graph {
        self.graph
    }

    /// Flags the document as unreadable. No further pass runs on it.
    pub fn invalidate(&mut self, reason: impl Into<String>) {
        self.invalid = Some(reason.into());
    }
}

type PreLinkFn = Box<dyn Fn(&mut PreLinkContext<'_>) -> Result<()> + Send + Sync>;
type PostLinkFn = Box<dyn Fn(&mut PostLinkContext<'_>) -> Result<()> + Send + Sync>;

struct Pass<F> {
    introduced: VersionInfo,
    label: String,
    run: F,
}

/// Ordered set of upgrade passes.
#[derive(Default)]
pub struct Versioning {
    pre_link: Vec<Pass<PreLinkFn>>,
    post_link: Vec<Pass<PostLinkFn>>,
}

impl fmt::Debug for Versioning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn labels<F>(passes: &[Pass<F>]) -> Vec<String> {
            passes
                .iter()
                .map(|p| format!("{} ({})", p.label, p.introduced))
                .collect()
        }
        f.debug_struct("Versioning")
            .field("pre_link", &labels(&self.pre_link))
            .field("post_link", &labels(&self.post_link))
            .finish()
    }
}

fn insert_sorted<F>(passes: &mut Vec<Pass<F>>, pass: Pass<F>) {
    let at = passes.partition_point(|p| p.introduced <= pass.introduced);
    passes.insert(at, pass);
}

impl Versioning {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pre-link pass introduced in `(version, subversion)`.
    pub fn pre_link<F>(mut self, version: u16, subversion: i16, label: &str, run: F) -> Self
    where
        F: Fn(&mut PreLinkContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        insert_sorted(
            &mut self.pre_link,
            Pass {
                introduced: VersionInfo::new(version, subversion),
                label: label.to_owned(),
                run: Box::new(run),
            },
        );
        self
    }

    /// Adds a post-link pass introduced in `(version, subversion)`.
    pub fn post_link<F>(mut self, version: u16, subversion: i16, label: &str, run: F) -> Self
    where
        F: Fn(&mut PostLinkContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        insert_sorted(
            &mut self.post_link,
            Pass {
                introduced: VersionInfo::new(version, subversion),
                label: label.to_owned(),
                run: Box::new(run),
            },
        );
        self
    }

    /// Number of registered passes.
    pub fn len(&self) -> usize {
        self.pre_link.len() + self.post_link.len()
    }

    /// True when no pass is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs kind hooks then the applicable pre-link passes. Returns the reason when the
    /// document was invalidated.
    pub(crate) fn run_pre_link(
        &self,
        graph: &mut Graph,
        kinds: &ResolvedKinds,
        memory: &Catalog,
        document: DocumentId,
        entities: &[EntityId],
        version: VersionInfo,
    ) -> Option<String> {
        for id in entities {
            let Some(entity) = graph.get_mut(*id) else {
                continue;
            };
            let Some(kind) = kinds.get(entity.code()) else {
                continue;
            };
            if let Err(err) = kind.kind.pre_link(entity, version, memory) {
                return Some(format!("{} pre-link hook failed: {err}", kind.kind.name()));
            }
        }

        let mut ctx = PreLinkContext {
            graph,
            document,
            entities,
            memory,
            version,
            invalid: None,
        };
        for pass in &self.pre_link {
            if !version.is_older_than(pass.introduced.version, pass.introduced.subversion) {
                continue;
            }
            log::debug!("pre-link pass '{}' on {document:?} ({version})", pass.label);
            if let Err(err) = (pass.run)(&mut ctx) {
                return Some(format!("pass '{}' failed: {err}", pass.label));
            }
            if let Some(reason) = ctx.invalid.take() {
                return Some(reason);
            }
        }
        None
    }

    /// Runs kind hooks then the applicable post-link passes.
    pub(crate) fn run_post_link(
        &self,
        graph: &mut Graph,
        kinds: &ResolvedKinds,
        document: DocumentId,
        entities: &[EntityId],
        version: VersionInfo,
    ) -> Option<String> {
        for id in entities {
            let Some(code) = graph.get(*id).map(|e| e.code()) else {
                continue;
            };
            let Some(kind) = kinds.get(code) else {
                continue;
            };
            if let Err(err) = kind.kind.post_link(graph, *id, version) {
                return Some(format!("{} post-link hook failed: {err}", kind.kind.name()));
            }
        }

        let mut ctx = PostLinkContext {
            graph,
            document,
            entities,
            version,
            invalid: None,
        };
        for pass in &self.post_link {
            if !version.is_older_than(pass.introduced.version, pass.introduced.subversion) {
                continue;
            }
            log::debug!("post-link pass '{}' on {document:?} ({version})", pass.label);
            if let Err(err) = (pass.run)(&mut ctx) {
                return Some(format!("pass '{}' failed: {err}", pass.label));
            }
            if let Some(reason) = ctx.invalid.take() {
                return Some(reason);
            }
        }
        None
    }
}
