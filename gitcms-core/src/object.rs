//! Core object model for GitCMS
//!
//! Blob, Tree and Commit objects as the remote Git host exposes them.
//! Identifiers are git SHA-1 ids so the in-memory host and the GitHub
//! backend agree on blob ids for identical content.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// File mode for regular blobs
pub const FILE_MODE: u32 = 0o100644;
/// File mode for sub-trees
pub const DIR_MODE: u32 = 0o040000;

/// Unique identifier for any stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Compute a git object id: `sha1("<kind> <len>\0" ++ body)`
    pub fn for_object(kind: ObjectKind, body: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("{} {}\0", kind.as_str(), body.len()).as_bytes());
        hasher.update(body);
        Self(hasher.finalize().into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 20 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> String {
        self.to_hex()[..7].to_string()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for ObjectId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Object type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }
}

/// File content object
#[derive(Debug, Clone)]
pub struct Blob {
    /// Raw content data
    pub data: Vec<u8>,
}

impl Blob {
    /// Create a new blob from data
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Compute the git blob id
    pub fn id(&self) -> ObjectId {
        ObjectId::for_object(ObjectKind::Blob, &self.data)
    }
}

/// Tree entry. In a single tree level `path` is the entry name; in a
/// recursive listing it is the full slash-separated path from the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Entry path
    pub path: String,
    /// Object ID (points to Blob or Tree)
    pub id: ObjectId,
    /// Entry type
    pub kind: ObjectKind,
    /// File permissions (git mode)
    pub mode: u32,
}

impl TreeEntry {
    /// Create a new tree entry
    pub fn new(path: impl Into<String>, id: ObjectId, kind: ObjectKind, mode: u32) -> Self {
        Self {
            path: path.into(),
            id,
            kind,
            mode,
        }
    }

    /// Create a regular file entry
    pub fn blob(path: impl Into<String>, id: ObjectId) -> Self {
        Self::new(path, id, ObjectKind::Blob, FILE_MODE)
    }

    /// Create a directory entry
    pub fn tree(path: impl Into<String>, id: ObjectId) -> Self {
        Self::new(path, id, ObjectKind::Tree, DIR_MODE)
    }

    /// Mode rendered the way git hosts serialize it (`100644`, `040000`)
    pub fn mode_string(&self) -> String {
        format!("{:06o}", self.mode)
    }
}

/// Parse a git mode string such as `100644`
pub fn parse_mode(mode: &str) -> Option<u32> {
    u32::from_str_radix(mode, 8).ok()
}

/// Directory object, or a flat recursive listing of one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    /// Entries keyed by path, sorted for deterministic hashing
    pub entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Build from entries; later duplicates replace earlier ones
    pub fn from_entries(entries: impl IntoIterator<Item = TreeEntry>) -> Self {
        let mut tree = Self::new();
        for entry in entries {
            tree.insert(entry);
        }
        tree
    }

    /// Add or update an entry
    pub fn insert(&mut self, entry: TreeEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Remove an entry
    pub fn remove(&mut self, path: &str) -> Option<TreeEntry> {
        self.entries.remove(path)
    }

    /// Get an entry
    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.entries.get(path)
    }

    /// Check for an entry of the given kind
    pub fn contains(&self, path: &str, kind: ObjectKind) -> bool {
        self.get(path).is_some_and(|e| e.kind == kind)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.values()
    }

    /// Canonical git tree body: `<mode> <name>\0<20-byte id>` per entry
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for entry in self.entries.values() {
            body.extend_from_slice(format!("{:o} {}\0", entry.mode, entry.path).as_bytes());
            body.extend_from_slice(entry.id.as_bytes());
        }
        body
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
        ObjectId::for_object(ObjectKind::Tree, &self.to_bytes())
    }
}

/// Commit object. Merges are never created, so `parents` holds at most one id
/// except for commits authored elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Tree object ID for this commit
    pub tree_id: ObjectId,
    /// Parent commit IDs (empty for initial commit)
    pub parents: Vec<ObjectId>,
    /// Author name
    pub author: String,
    /// Commit message
    pub message: String,
    /// Commit timestamp (Unix seconds)
    pub timestamp: i64,
}

impl Commit {
    /// Create a new commit
    pub fn new(
        tree_id: ObjectId,
        parents: Vec<ObjectId>,
        author: String,
        message: String,
        timestamp: i64,
    ) -> Self {
        Self {
            tree_id,
            parents,
            author,
            message,
            timestamp,
        }
    }

    /// Canonical commit body
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = format!("tree {}\n", self.tree_id);
        for parent in &self.parents {
            body.push_str(&format!("parent {}\n", parent));
        }
        body.push_str(&format!("author {} {} +0000\n", self.author, self.timestamp));
        body.push_str(&format!("committer {} {} +0000\n\n", self.author, self.timestamp));
        body.push_str(&self.message);
        body.into_bytes()
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
        ObjectId::for_object(ObjectKind::Commit, &self.to_bytes())
    }
}

/// Head of a branch: the current commit and its root tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoState {
    pub commit: ObjectId,
    pub tree: ObjectId,
}
