//! What went wrong (or merely noteworthy) during a load.
//!
//! Non-fatal problems never abort a load; they are collected here and handed back with the
//! result. The report serializes with serde and prints as a tree.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

/// How serious a message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    /// Informational.
    Info,
    /// Something was dropped or substituted.
    Warning,
    /// Part of the data could not be read.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARN",
            Severity::Error => "ERROR",
        })
    }
}

/// A free-form report line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportMessage {
    /// Severity.
    pub severity: Severity,
    /// Text.
    pub text: String,
}

/// An external document that could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingDocument {
    /// Path as stored in the referencing file.
    pub stored_path: String,
    /// Resolved absolute path.
    pub absolute_path: PathBuf,
    /// Why opening failed.
    pub reason: String,
}

/// A referenced entity absent from its external document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingEntity {
    /// Document that should have held it.
    pub document: PathBuf,
    /// Type tag.
    pub code: String,
    /// Name without the type prefix.
    pub name: String,
}

/// Two library references resolving to the same file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateLibrary {
    /// Path of the later reference, as stored.
    pub stored_path: String,
    /// Path both references resolve to.
    pub absolute_path: PathBuf,
}

/// A document flagged unreadable by versioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidDocument {
    /// Document label (path, or `<local>`).
    pub document: String,
    /// Reason given by the pass.
    pub reason: String,
}

/// Final state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSummary {
    /// Path, or `<local>`.
    pub label: String,
    /// Live entities, placeholders included.
    pub entities: usize,
    /// Placeholders left unresolved.
    pub placeholders: usize,
    /// File could not be opened.
    pub missing: bool,
    /// Versioning flagged it.
    pub invalid: bool,
}

/// How an undo restore treated the previous state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UndoStats {
    /// Entities reused without decoding.
    pub reused_unchanged: usize,
    /// Entities decoded again into their previous slot.
    pub reread_in_place: usize,
    /// Entities of kinds excluded from undo.
    pub reused_noundo: usize,
    /// Entities with no previous counterpart.
    pub added: usize,
    /// Previous entities absent from the snapshot.
    pub removed: usize,
    /// Runtime caches handed to restored entities.
    pub caches_restored: usize,
}

/// Counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    /// Blocks scanned across every file.
    pub blocks: usize,
    /// Entity blocks decoded.
    pub entities_read: usize,
    /// Payload bytes converted into the memory layout.
    pub bytes_decoded: usize,
    /// Placeholders created.
    pub placeholders: usize,
    /// External documents opened.
    pub libraries_opened: usize,
    /// Iterations of the library read loop.
    pub link_passes: usize,
    /// Undo classification, for restores.
    pub undo: Option<UndoStats>,
}

/// Everything noteworthy about one load.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Path or description of the loaded input.
    pub source: String,
    /// Final document table.
    pub documents: Vec<DocumentSummary>,
    /// Documents that could not be opened.
    pub missing_documents: Vec<MissingDocument>,
    /// Entities absent from their documents.
    pub missing_entities: Vec<MissingEntity>,
    /// Duplicate library references that were merged.
    pub duplicate_libraries: Vec<DuplicateLibrary>,
    /// Documents flagged by versioning.
    pub invalid_documents: Vec<InvalidDocument>,
    /// Other messages, in emission order.
    pub messages: Vec<ReportMessage>,
    /// Counters.
    pub stats: LoadStats,
}

impl LoadReport {
    pub(crate) fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    /// Folds the findings of a later pass over the same graph into this report.
    pub(crate) fn merge(&mut self, other: LoadReport) {
        self.missing_documents.extend(other.missing_documents);
        self.missing_entities.extend(other.missing_entities);
        self.duplicate_libraries.extend(other.duplicate_libraries);
        self.invalid_documents.extend(other.invalid_documents);
        self.messages.extend(other.messages);
        let stats = other.stats;
        self.stats.blocks += stats.blocks;
        self.stats.entities_read += stats.entities_read;
        self.stats.bytes_decoded += stats.bytes_decoded;
        self.stats.placeholders += stats.placeholders;
        self.stats.libraries_opened += stats.libraries_opened;
        self.stats.link_passes += stats.link_passes;
    }

    /// Appends a message and mirrors it to the log.
    pub fn message(&mut self, severity: Severity, text: impl Into<String>) {
        let text = text.into();
        match severity {
            Severity::Info => log::info!("{text}"),
            Severity::Warning => log::warn!("{text}"),
            Severity::Error => log::error!("{text}"),
        }
        self.messages.push(ReportMessage { severity, text });
    }

    /// True when nothing was missing, invalid or worth a warning.
    pub fn is_clean(&self) -> bool {
        self.missing_documents.is_empty()
            && self.missing_entities.is_empty()
            && self.invalid_documents.is_empty()
            && self.messages.iter().all(|m| m.severity == Severity::Info)
    }

    /// Number of messages at or above `severity`.
    pub fn count(&self, severity: Severity) -> usize {
        self.messages.iter().filter(|m| m.severity >= severity).count()
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== LOAD REPORT ===")?;
        writeln!(f, "Source:         {}", self.source)?;
        writeln!(f, "Blocks:         {}", self.stats.blocks)?;
        writeln!(f, "Entities read:  {}", self.stats.entities_read)?;
        writeln!(f, "Libraries:      {}", self.stats.libraries_opened)?;
        if let Some(undo) = &self.stats.undo {
            writeln!(
                f,
                "Undo:           {} unchanged | {} re-read | {} no-undo | {} added | {} removed",
                undo.reused_unchanged,
                undo.reread_in_place,
                undo.reused_noundo,
                undo.added,
                undo.removed
            )?;
        }

        writeln!(f, "\n[DOCUMENTS]")?;
        for (i, doc) in self.documents.iter().enumerate() {
            let is_last = i == self.documents.len() - 1;
            self.fmt_document(f, doc, is_last)?;
        }

        if !self.messages.is_empty() {
            writeln!(f, "\n[MESSAGES]")?;
            for m in &self.messages {
                writeln!(f, "{:<5} {}", m.severity.to_string(), m.text)?;
            }
        }
        Ok(())
    }
}

impl LoadReport {
    fn fmt_document(
        &self,
        f: &mut fmt::Formatter<'_>,
        doc: &DocumentSummary,
        is_last: bool,
    ) -> fmt::Result {
        let connector = if is_last { "└── " } else { "├── " };
        let child_prefix = if is_last { "    " } else { "│   " };
        let mut status = Vec::new();
        if doc.missing {
            status.push("MISSING");
        }
        if doc.invalid {
            status.push("INVALID");
        }
        let status = if status.is_empty() {
            String::new()
        } else {
            format!(" [{}]", status.join(", "))
        };
        writeln!(
            f,
            "{}{} | Entities: {} | Placeholders: {}{}",
            connector, doc.label, doc.entities, doc.placeholders, status
        )?;

        let missing: Vec<&MissingEntity> = self
            .missing_entities
            .iter()
            .filter(|m| m.document.display().to_string() == doc.label)
            .collect();
        for (i, m) in missing.iter().enumerate() {
            let connector = if i == missing.len() - 1 { "└── " } else { "├── " };
            writeln!(f, "{}{}missing {}{}", child_prefix, connector, m.code, m.name)?;
        }
        Ok(())
    }
}
