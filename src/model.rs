//! Document model shared by the local store and the remote replica.
//!
//! Every entity lives in a single id namespace: content-addressed leaves,
//! note metadata documents referencing them, and the two singleton
//! documents (node identity, fleet milestone).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Singleton document carrying this replica's identity.
pub const NODE_INFO_DOC_ID: &str = "_local/nodeinfo";

/// Singleton document on the remote carrying fleet chunk-version state.
pub const MILESTONE_DOC_ID: &str = "_local/milestone";

/// Prefix of every content-addressed leaf id.
pub const LEAF_ID_PREFIX: &str = "h:";

/// Opaque document id. The path↔id mapping is owned by the host.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Content-addressed leaf ids share the `h:` prefix.
    pub fn is_leaf(&self) -> bool {
        self.0.starts_with(LEAF_ID_PREFIX)
    }

    /// `_local/` documents never replicate and never appear in feeds.
    pub fn is_internal(&self) -> bool {
        self.0.starts_with("_local/")
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({:?})", self.0)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Immutable content-addressed chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafDoc {
    #[serde(rename = "_id")]
    pub id: DocId,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub data: String,
}

/// Chunked note metadata. `children` is ordered; concatenating the
/// referenced leaf payloads reconstitutes the note body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteDoc {
    #[serde(rename = "_id")]
    pub id: DocId,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub ctime: u64,
    pub mtime: u64,
    pub size: u64,
    pub children: Vec<DocId>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

/// Legacy flat note with an inline body and no children. Read-only: the
/// store understands these but never writes one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyNoteDoc {
    #[serde(rename = "_id")]
    pub id: DocId,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub ctime: u64,
    pub mtime: u64,
    pub size: u64,
    pub data: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

/// Replica identity, created once per local database generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfoDoc {
    #[serde(rename = "_id")]
    pub id: DocId,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub nodeid: String,
    pub v20220607: bool,
}

/// Supported chunk-format versions advertised by one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkVersionRange {
    pub min: i32,
    pub max: i32,
    pub current: i32,
}

impl ChunkVersionRange {
    pub fn admits(&self, version: i32) -> bool {
        version >= self.min && version <= self.max
    }
}

/// Fleet-wide negotiation document stored on the remote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneDoc {
    #[serde(rename = "_id")]
    pub id: DocId,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub created: u64,
    pub locked: bool,
    #[serde(default)]
    pub accepted_nodes: BTreeSet<String>,
    #[serde(default)]
    pub node_chunk_info: BTreeMap<String, ChunkVersionRange>,
}

impl MilestoneDoc {
    pub fn new(created: u64) -> Self {
        Self {
            id: DocId::from(MILESTONE_DOC_ID),
            rev: None,
            created,
            locked: false,
            accepted_nodes: BTreeSet::new(),
            node_chunk_info: BTreeMap::new(),
        }
    }
}

/// Tagged union of every document the store reads or writes.
///
/// `Unknown` absorbs discriminators introduced by newer nodes; readers
/// treat such documents as absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EntryDoc {
    #[serde(rename = "leaf")]
    Leaf(LeafDoc),
    #[serde(rename = "notes")]
    Legacy(LegacyNoteDoc),
    #[serde(rename = "newnote")]
    Note(NoteDoc),
    #[serde(rename = "plain")]
    Plain(NoteDoc),
    #[serde(rename = "nodeinfo")]
    NodeInfo(NodeInfoDoc),
    #[serde(rename = "milestoneinfo")]
    Milestone(MilestoneDoc),
    #[serde(other)]
    Unknown,
}

impl EntryDoc {
    pub fn id(&self) -> Option<&DocId> {
        match self {
            EntryDoc::Leaf(doc) => Some(&doc.id),
            EntryDoc::Legacy(doc) => Some(&doc.id),
            EntryDoc::Note(doc) | EntryDoc::Plain(doc) => Some(&doc.id),
            EntryDoc::NodeInfo(doc) => Some(&doc.id),
            EntryDoc::Milestone(doc) => Some(&doc.id),
            EntryDoc::Unknown => None,
        }
    }

    pub fn rev(&self) -> Option<&str> {
        match self {
            EntryDoc::Leaf(doc) => doc.rev.as_deref(),
            EntryDoc::Legacy(doc) => doc.rev.as_deref(),
            EntryDoc::Note(doc) | EntryDoc::Plain(doc) => doc.rev.as_deref(),
            EntryDoc::NodeInfo(doc) => doc.rev.as_deref(),
            EntryDoc::Milestone(doc) => doc.rev.as_deref(),
            EntryDoc::Unknown => None,
        }
    }

    pub fn set_rev(&mut self, rev: Option<String>) {
        match self {
            EntryDoc::Leaf(doc) => doc.rev = rev,
            EntryDoc::Legacy(doc) => doc.rev = rev,
            EntryDoc::Note(doc) | EntryDoc::Plain(doc) => doc.rev = rev,
            EntryDoc::NodeInfo(doc) => doc.rev = rev,
            EntryDoc::Milestone(doc) => doc.rev = rev,
            EntryDoc::Unknown => {}
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, EntryDoc::Leaf(_))
    }

    /// Any of the three note shapes, current or legacy.
    pub fn is_note(&self) -> bool {
        matches!(
            self,
            EntryDoc::Legacy(_) | EntryDoc::Note(_) | EntryDoc::Plain(_)
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            EntryDoc::Leaf(_) => "leaf",
            EntryDoc::Legacy(_) => "notes",
            EntryDoc::Note(_) => "newnote",
            EntryDoc::Plain(_) => "plain",
            EntryDoc::NodeInfo(_) => "nodeinfo",
            EntryDoc::Milestone(_) => "milestoneinfo",
            EntryDoc::Unknown => "unknown",
        }
    }
}

/// Storage form of a note body, chosen from the id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoteForm {
    /// Structured text, split at line and paragraph boundaries.
    Plain,
    /// Opaque payload, split at fixed sizes.
    Binary,
}

/// Logical note: the assembled read/write surface over the chunked form.
#[derive(Clone, Debug, PartialEq)]
pub struct Note {
    pub id: DocId,
    pub data: String,
    pub ctime: u64,
    pub mtime: u64,
    pub size: u64,
    pub children: Vec<DocId>,
    pub deleted: bool,
    pub rev: Option<String>,
    pub form: NoteForm,
}

impl Note {
    pub fn new(id: impl Into<DocId>, data: impl Into<String>, ctime: u64, mtime: u64) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self {
            id: id.into(),
            data,
            ctime,
            mtime,
            size,
            children: Vec::new(),
            deleted: false,
            rev: None,
            form: NoteForm::Plain,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_classification() {
        assert!(DocId::from("h:abc0").is_leaf());
        assert!(!DocId::from("notes/a.md").is_leaf());
        assert!(DocId::from(NODE_INFO_DOC_ID).is_internal());
        assert!(!DocId::from("h:abc0").is_internal());
    }

    #[test]
    fn tagged_docs_round_trip() {
        let doc = EntryDoc::Plain(NoteDoc {
            id: DocId::from("a.md"),
            rev: Some("1-aa".to_string()),
            ctime: 1,
            mtime: 2,
            size: 5,
            children: vec![DocId::from("h:00ff0")],
            deleted: false,
        });
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"type\":\"plain\""));
        let back: EntryDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn unknown_discriminator_is_tolerated() {
        let json = r#"{"type":"hologram","_id":"x","payload":1}"#;
        let doc: EntryDoc = serde_json::from_str(json).unwrap();
        assert_eq!(doc, EntryDoc::Unknown);
        assert!(doc.id().is_none());
    }

    #[test]
    fn tombstone_flag_is_omitted_when_clear() {
        let doc = EntryDoc::Note(NoteDoc {
            id: DocId::from("b.md"),
            rev: None,
            ctime: 0,
            mtime: 0,
            size: 0,
            children: Vec::new(),
            deleted: false,
        });
        let json = serde_json::to_string(&doc).unwrap();
        assert!(!json.contains("deleted"));
    }
}
