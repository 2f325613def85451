//! Merkle tree over a project's files.
//!
//! Leaves hash file content, directories hash their children sorted by
//! name. Two trees can be compared top-down, skipping every subtree whose
//! hash matches. Nodes live in an arena (`Vec<MerkleNode>` addressed by
//! index) and every traversal uses an explicit stack, so directory depth
//! never translates into call-stack depth.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::debug;

use crate::detector::ChangeSet;
use crate::error::{IndexError, Result};
use crate::fingerprint::write_atomic;

/// A SHA-256 digest.
pub type Digest = [u8; 32];

/// Snapshot format version written by [`MerkleTree::save`].
pub const SNAPSHOT_VERSION: u32 = 1;

/// A file (leaf) or directory (internal node).
#[derive(Debug, Clone)]
pub struct MerkleNode {
    /// Path relative to the project root; empty for the root.
    pub path: String,
    pub hash: Digest,
    pub is_leaf: bool,
    /// Child name to arena index. Empty for leaves.
    pub children: BTreeMap<String, usize>,
    parent: Option<usize>,
}

impl MerkleNode {
    fn dir(path: String, parent: Option<usize>) -> Self {
        Self {
            path,
            hash: empty_dir_hash(),
            is_leaf: false,
            children: BTreeMap::new(),
            parent,
        }
    }

    fn leaf(path: String, hash: Digest, parent: usize) -> Self {
        Self {
            path,
            hash,
            is_leaf: true,
            children: BTreeMap::new(),
            parent: Some(parent),
        }
    }
}

/// Counters from one [`MerkleTree::diff`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    /// Node pairs whose hashes were compared.
    pub nodes_compared: usize,
    /// Subtrees skipped because their hashes matched.
    pub subtrees_pruned: usize,
}

/// Arena-backed Merkle tree.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    nodes: Vec<MerkleNode>,
    root: usize,
    leaf_count: usize,
    /// Arena slots no longer reachable from the root.
    detached: usize,
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MerkleTree {
    /// An empty tree: a root directory with no children.
    pub fn new() -> Self {
        Self {
            nodes: vec![MerkleNode::dir(String::new(), None)],
            root: 0,
            leaf_count: 0,
            detached: 0,
        }
    }

    /// Build a tree from `(path, content digest)` pairs.
    ///
    /// Fails when two paths conflict (a file that is also a directory
    /// prefix of another path) or a path is malformed.
    pub fn from_leaves<I>(leaves: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Digest)>,
    {
        let mut tree = Self::new();
        for (path, hash) in leaves {
            tree.insert_leaf(&path, hash)?;
        }
        tree.recompute_all();
        Ok(tree)
    }

    pub fn root_hash(&self) -> Digest {
        self.nodes[self.root].hash
    }

    pub fn root_hash_hex(&self) -> String {
        hex::encode(self.root_hash())
    }

    /// Number of files in the tree.
    pub fn len(&self) -> usize {
        self.leaf_count
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_count == 0
    }

    pub fn node(&self, path: &str) -> Option<&MerkleNode> {
        self.find(path).map(|idx| &self.nodes[idx])
    }

    /// Digest of the file at `path`, if it is a leaf of this tree.
    pub fn leaf_hash(&self, path: &str) -> Option<Digest> {
        self.node(path).filter(|n| n.is_leaf).map(|n| n.hash)
    }

    /// All leaves in path order.
    pub fn leaves(&self) -> Vec<(String, Digest)> {
        let mut out = Vec::with_capacity(self.leaf_count);
        let mut stack = vec![self.root];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if node.is_leaf {
                out.push((node.path.clone(), node.hash));
            } else {
                // Reverse so the smallest name is popped first.
                stack.extend(node.children.values().rev().copied());
            }
        }
        out
    }

    /// Insert or update a leaf and rehash its ancestors.
    pub fn upsert_leaf(&mut self, path: &str, hash: Digest) -> Result<()> {
        let idx = self.insert_leaf(path, hash)?;
        self.rehash_ancestors(idx);
        Ok(())
    }

    /// Remove a leaf, drop directories left empty, and rehash ancestors.
    /// Returns `false` if `path` was not a leaf.
    pub fn remove_leaf(&mut self, path: &str) -> bool {
        let Some(idx) = self.find(path) else {
            return false;
        };
        if !self.nodes[idx].is_leaf {
            return false;
        }

        let mut child = idx;
        let mut parent = self.nodes[idx].parent;
        self.leaf_count -= 1;
        while let Some(p) = parent {
            let name = last_segment(&self.nodes[child].path).to_string();
            self.nodes[p].children.remove(&name);
            self.detached += 1;
            if p != self.root && self.nodes[p].children.is_empty() {
                child = p;
                parent = self.nodes[p].parent;
            } else {
                self.rehash_from(p);
                break;
            }
        }

        if self.detached > 64 && self.detached > self.nodes.len() / 2 {
            self.compact();
        }
        true
    }

    /// Compare `self` (current state) against `previous` (a snapshot).
    ///
    /// Matching subtree hashes are skipped without descending. Leaves only
    /// in `self` are added, leaves only in `previous` are deleted, leaves in
    /// both with different hashes are modified.
    pub fn diff(&self, previous: &MerkleTree) -> (ChangeSet, DiffStats) {
        let mut changes = ChangeSet::default();
        let mut stats = DiffStats::default();
        let mut stack: Vec<(Option<usize>, Option<usize>)> =
            vec![(Some(self.root), Some(previous.root))];

        while let Some(pair) = stack.pop() {
            match pair {
                (Some(c), Some(p)) => {
                    stats.nodes_compared += 1;
                    let cur = &self.nodes[c];
                    let prev = &previous.nodes[p];
                    if cur.is_leaf == prev.is_leaf && cur.hash == prev.hash {
                        stats.subtrees_pruned += 1;
                        continue;
                    }
                    match (cur.is_leaf, prev.is_leaf) {
                        (true, true) => changes.modified.push(cur.path.clone()),
                        (false, false) => {
                            for (name, &ci) in &cur.children {
                                stack.push((Some(ci), prev.children.get(name).copied()));
                            }
                            for (name, &pi) in &prev.children {
                                if !cur.children.contains_key(name) {
                                    stack.push((None, Some(pi)));
                                }
                            }
                        }
                        // A file replaced a directory or the other way round.
                        _ => {
                            stack.push((Some(c), None));
                            stack.push((None, Some(p)));
                        }
                    }
                }
                (Some(c), None) => self.collect_leaves(c, &mut changes.added),
                (None, Some(p)) => previous.collect_leaves(p, &mut changes.deleted),
                (None, None) => {}
            }
        }

        changes.sort();
        (changes, stats)
    }

    /// Serialise to the persisted snapshot form.
    pub fn to_snapshot(&self) -> SnapshotFile {
        SnapshotFile {
            version: SNAPSHOT_VERSION,
            root_hash: self.root_hash_hex(),
            leaves: self
                .leaves()
                .into_iter()
                .map(|(path, hash)| SnapshotLeaf {
                    path,
                    hash: hex::encode(hash),
                })
                .collect(),
        }
    }

    /// Rebuild a tree from a snapshot, validating its structure.
    pub fn from_snapshot(snapshot: SnapshotFile) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(IndexError::SnapshotCorrupt(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut tree = Self::new();
        for leaf in snapshot.leaves {
            let hash = decode_digest(&leaf.hash).ok_or_else(|| {
                IndexError::SnapshotCorrupt(format!("bad hash for {}", leaf.path))
            })?;
            if tree.find(&leaf.path).is_some() {
                return Err(IndexError::SnapshotCorrupt(format!(
                    "duplicate path {}",
                    leaf.path
                )));
            }
            tree.insert_leaf(&leaf.path, hash)?;
        }
        tree.recompute_all();

        if tree.root_hash_hex() != snapshot.root_hash {
            return Err(IndexError::SnapshotCorrupt(
                "root hash does not match leaves".to_string(),
            ));
        }
        Ok(tree)
    }

    /// Load a snapshot. `Ok(None)` if the file does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: SnapshotFile = serde_json::from_str(&content)
            .map_err(|e| IndexError::SnapshotCorrupt(e.to_string()))?;
        let tree = Self::from_snapshot(snapshot)?;
        debug!("Loaded snapshot with {} leaves from {:?}", tree.len(), path);
        Ok(Some(tree))
    }

    /// Persist as a snapshot (write-to-temp + rename).
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(&self.to_snapshot())?;
        write_atomic(path, &json).await?;
        Ok(())
    }

    fn find(&self, path: &str) -> Option<usize> {
        let mut idx = self.root;
        if path.is_empty() {
            return Some(idx);
        }
        for segment in path.split('/') {
            idx = *self.nodes[idx].children.get(segment)?;
        }
        Some(idx)
    }

    /// Insert without rehashing. Returns the leaf's arena index.
    fn insert_leaf(&mut self, path: &str, hash: Digest) -> Result<usize> {
        validate_path(path)?;
        let segments: Vec<&str> = path.split('/').collect();
        let (file_name, dirs) = segments
            .split_last()
            .ok_or_else(|| IndexError::SnapshotCorrupt("empty path".to_string()))?;

        let mut idx = self.root;
        let mut prefix = String::new();
        for dir in dirs {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(dir);
            idx = match self.nodes[idx].children.get(*dir).copied() {
                Some(child) if self.nodes[child].is_leaf => {
                    return Err(IndexError::SnapshotCorrupt(format!(
                        "{prefix} is both a file and a directory"
                    )));
                }
                Some(child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(MerkleNode::dir(prefix.clone(), Some(idx)));
                    self.nodes[idx].children.insert(dir.to_string(), child);
                    child
                }
            };
        }

        match self.nodes[idx].children.get(*file_name).copied() {
            Some(existing) if !self.nodes[existing].is_leaf => Err(IndexError::SnapshotCorrupt(
                format!("{path} is both a file and a directory"),
            )),
            Some(existing) => {
                self.nodes[existing].hash = hash;
                Ok(existing)
            }
            None => {
                let leaf = self.nodes.len();
                self.nodes.push(MerkleNode::leaf(path.to_string(), hash, idx));
                self.nodes[idx].children.insert(file_name.to_string(), leaf);
                self.leaf_count += 1;
                Ok(leaf)
            }
        }
    }

    fn rehash_ancestors(&mut self, idx: usize) {
        if let Some(parent) = self.nodes[idx].parent {
            self.rehash_from(parent);
        }
    }

    /// Recompute directory hashes from `idx` up to the root.
    fn rehash_from(&mut self, mut idx: usize) {
        loop {
            self.nodes[idx].hash = self.dir_hash(idx);
            match self.nodes[idx].parent {
                Some(p) => idx = p,
                None => break,
            }
        }
    }

    /// Recompute every directory hash bottom-up (iterative post-order).
    fn recompute_all(&mut self) {
        let mut order = Vec::new();
        let mut stack = vec![self.root];
        while let Some(idx) = stack.pop() {
            if !self.nodes[idx].is_leaf {
                order.push(idx);
                stack.extend(self.nodes[idx].children.values().copied());
            }
        }
        // Children always appear after their parent in `order`.
        for &idx in order.iter().rev() {
            self.nodes[idx].hash = self.dir_hash(idx);
        }
    }

    fn dir_hash(&self, idx: usize) -> Digest {
        let mut hasher = Sha256::new();
        for (name, &child) in &self.nodes[idx].children {
            let node = &self.nodes[child];
            hasher.update([if node.is_leaf { b'f' } else { b'd' }]);
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(node.hash);
        }
        hasher.finalize().into()
    }

    fn collect_leaves(&self, start: usize, out: &mut Vec<String>) {
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if node.is_leaf {
                out.push(node.path.clone());
            } else {
                stack.extend(node.children.values().copied());
            }
        }
    }

    fn compact(&mut self) {
        let leaves = self.leaves();
        let mut fresh = Self::new();
        for (path, hash) in leaves {
            // Paths came out of a valid tree, so re-insertion cannot conflict.
            if let Err(e) = fresh.insert_leaf(&path, hash) {
                debug!("Dropping leaf {} during compaction: {}", path, e);
            }
        }
        fresh.recompute_all();
        *self = fresh;
    }
}

fn empty_dir_hash() -> Digest {
    Sha256::new().finalize().into()
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn validate_path(path: &str) -> Result<()> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path
            .split('/')
            .any(|s| s.is_empty() || s == "." || s == "..");
    if bad {
        return Err(IndexError::SnapshotCorrupt(format!("invalid path {path:?}")));
    }
    Ok(())
}

/// Decode a 64-character hex digest.
pub fn decode_digest(hex_str: &str) -> Option<Digest> {
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

/// Persisted form of a [`MerkleTree`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub version: u32,
    pub root_hash: String,
    pub leaves: Vec<SnapshotLeaf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotLeaf {
    pub path: String,
    pub hash: String,
}
