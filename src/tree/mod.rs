//! Merkle tree construction over an exec root.
//!
//! [`build_tree`] turns an [`InputSpec`] into an immutable tree of [`Node`]s
//! and the map of blobs (file contents and directory listings) the remote
//! side needs. A directory's digest depends only on its children's names and
//! digests, never on the order in which the filesystem was walked.

pub mod ignore;
pub mod walker;

use crate::blob::Blob;
use crate::digest::Digest;
use crate::error::{MemoExecError, Result};
use crate::remote_exec::{self, base64_bytes, SymlinkTarget};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument};

pub use ignore::{ExclusionKind, ExclusionRules, InputExclusion};
use walker::WalkEntry;

/// Content supplied in memory instead of read from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualInput {
    /// Relative to the exec root
    pub path: String,
    #[serde(default, with = "base64_bytes")]
    pub contents: Vec<u8>,
    #[serde(default)]
    pub is_executable: bool,
    #[serde(default)]
    pub is_empty_directory: bool,
}

impl VirtualInput {
    pub fn file(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            ..Default::default()
        }
    }

    pub fn empty_directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_empty_directory: true,
            ..Default::default()
        }
    }
}

/// What goes into an action's input root.
///
/// Disk inputs are applied first, then virtual inputs in list order; a
/// virtual input replaces whatever occupies its path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Files or directories relative to the exec root; `""` or `"."` is the whole root
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub exclusions: Vec<InputExclusion>,
    #[serde(default)]
    pub virtual_inputs: Vec<VirtualInput>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub digest: Digest,
    pub is_executable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkEntry {
    pub target: String,
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub children: BTreeMap<String, Node>,
    pub digest: Digest,
}

/// A node of the input tree. The set of kinds is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(FileEntry),
    Directory(DirectoryEntry),
    Symlink(SymlinkEntry),
}

impl Node {
    pub fn digest(&self) -> &Digest {
        match self {
            Node::File(f) => &f.digest,
            Node::Directory(d) => &d.digest,
            Node::Symlink(s) => &s.digest,
        }
    }
}

/// Output of [`build_tree`].
#[derive(Debug, Clone)]
pub struct InputTree {
    pub root_digest: Digest,
    pub root: DirectoryEntry,
    /// Every file content and directory listing reachable from the root
    pub blobs: HashMap<Digest, Blob>,
    pub file_count: usize,
    pub total_file_bytes: u64,
}

impl InputTree {
    /// All nodes with their `/`-joined paths, depth first, children by name.
    pub fn entries(&self) -> Vec<(String, &Node)> {
        fn visit<'a>(prefix: &str, dir: &'a DirectoryEntry, out: &mut Vec<(String, &'a Node)>) {
            for (name, node) in &dir.children {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", prefix, name)
                };
                out.push((path.clone(), node));
                if let Node::Directory(child) = node {
                    visit(&path, child, out);
                }
            }
        }
        let mut out = Vec::new();
        visit("", &self.root, &mut out);
        out
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        let mut current = &self.root;
        let mut parts = path.split('/').filter(|p| !p.is_empty()).peekable();
        while let Some(part) = parts.next() {
            let node = current.children.get(part)?;
            if parts.peek().is_none() {
                return Some(node);
            }
            match node {
                Node::Directory(dir) => current = dir,
                _ => return None,
            }
        }
        None
    }
}

/// Mutable staging form used while paths are still being inserted.
enum Staged {
    File {
        digest: Digest,
        is_executable: bool,
        blob: Blob,
    },
    Dir(BTreeMap<String, Staged>),
    Symlink(String),
}

/// Split a relative path into components, rejecting anything that escapes the root.
pub fn normalize_path(path: &str) -> Result<Vec<String>> {
    if path.starts_with('/') {
        return Err(MemoExecError::Local(format!(
            "input path {:?} must be relative to the exec root",
            path
        )));
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(MemoExecError::Local(format!(
                    "input path {:?} escapes the exec root",
                    path
                )))
            }
            other => parts.push(other.to_string()),
        }
    }
    Ok(parts)
}

/// Descend to the directory that holds `parents`, creating directories along
/// the way. A non-directory in the way is replaced when `replace` is set.
fn dir_at<'a>(
    root: &'a mut BTreeMap<String, Staged>,
    parents: &[String],
    replace: bool,
) -> Result<&'a mut BTreeMap<String, Staged>> {
    let mut current = root;
    for part in parents {
        let slot = current
            .entry(part.clone())
            .or_insert_with(|| Staged::Dir(BTreeMap::new()));
        if !matches!(slot, Staged::Dir(_)) {
            if !replace {
                return Err(MemoExecError::Local(format!(
                    "input path component {:?} is not a directory",
                    part
                )));
            }
            *slot = Staged::Dir(BTreeMap::new());
        }
        current = match slot {
            Staged::Dir(children) => children,
            _ => unreachable!("slot was just made a directory"),
        };
    }
    Ok(current)
}

fn insert(
    root: &mut BTreeMap<String, Staged>,
    parts: &[String],
    node: Staged,
    replace: bool,
) -> Result<()> {
    let Some((name, parents)) = parts.split_last() else {
        return Err(MemoExecError::Local(
            "cannot replace the input root with a non-directory".to_string(),
        ));
    };
    dir_at(root, parents, replace)?.insert(name.clone(), node);
    Ok(())
}

/// Make sure a directory exists at `parts`, keeping any children it already has.
fn ensure_dir(root: &mut BTreeMap<String, Staged>, parts: &[String], replace: bool) -> Result<()> {
    dir_at(root, parts, replace).map(|_| ())
}

fn stage_file(abs: &Path, is_executable: bool) -> Result<Staged> {
    let digest = Digest::of_file(abs)?;
    Ok(Staged::File {
        blob: Blob::from_file(digest.clone(), abs.to_path_buf()),
        digest,
        is_executable,
    })
}

fn stage_disk_input(
    exec_root: &Path,
    input: &str,
    rules: &ExclusionRules,
    staging: &mut BTreeMap<String, Staged>,
) -> Result<()> {
    let parts = normalize_path(input)?;
    let rel = parts.join("/");
    let abs: PathBuf = if rel.is_empty() {
        exec_root.to_path_buf()
    } else {
        exec_root.join(&rel)
    };

    // Symlinks are recorded, never followed, so none may sit above the input.
    for depth in 1..parts.len() {
        let ancestor = exec_root.join(parts[..depth].join("/"));
        match std::fs::symlink_metadata(&ancestor) {
            Ok(m) if m.file_type().is_symlink() => {
                return Err(MemoExecError::Local(format!(
                    "input {:?} passes through symlink {:?}",
                    rel,
                    parts[..depth].join("/")
                )));
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    let metadata = match std::fs::symlink_metadata(&abs) {
        Ok(m) => m,
        Err(_) if rules.is_excluded(&rel, false) && rules.is_excluded(&rel, true) => {
            return Ok(());
        }
        Err(e) => return Err(MemoExecError::filesystem(abs, e)),
    };
    let file_type = metadata.file_type();
    if rules.is_excluded(&rel, file_type.is_dir()) {
        debug!(path = %rel, "Declared input excluded");
        return Ok(());
    }

    if file_type.is_symlink() {
        let target = walker::read_symlink(&abs)?;
        return insert(staging, &parts, Staged::Symlink(target), false);
    }
    if !file_type.is_dir() {
        let staged = stage_file(&abs, walker::is_executable(&metadata))?;
        return insert(staging, &parts, staged, false);
    }

    ensure_dir(staging, &parts, false)?;
    for entry in walker::walk_dir(exec_root, &abs, rules)? {
        let entry_parts = normalize_path(entry.rel())?;
        match entry {
            WalkEntry::Directory { .. } => ensure_dir(staging, &entry_parts, false)?,
            WalkEntry::File {
                abs, is_executable, ..
            } => insert(staging, &entry_parts, stage_file(&abs, is_executable)?, false)?,
            WalkEntry::Symlink { target, .. } => {
                insert(staging, &entry_parts, Staged::Symlink(target), false)?
            }
        }
    }
    Ok(())
}

fn stage_virtual_input(input: &VirtualInput, staging: &mut BTreeMap<String, Staged>) -> Result<()> {
    let parts = normalize_path(&input.path)?;
    if input.is_empty_directory {
        if let Some((name, parents)) = parts.split_last() {
            let parent = dir_at(staging, parents, true)?;
            if !matches!(parent.get(name), Some(Staged::Dir(_))) {
                parent.insert(name.clone(), Staged::Dir(BTreeMap::new()));
            }
        }
        return Ok(());
    }
    let blob = Blob::from_bytes(input.contents.clone());
    let staged = Staged::File {
        digest: blob.digest().clone(),
        is_executable: input.is_executable,
        blob,
    };
    insert(staging, &parts, staged, true)
}

struct SealStats {
    file_count: usize,
    total_file_bytes: u64,
}

/// Freeze a staged directory bottom-up, computing digests and collecting blobs.
fn seal(
    children: BTreeMap<String, Staged>,
    blobs: &mut HashMap<Digest, Blob>,
    stats: &mut SealStats,
) -> Result<DirectoryEntry> {
    let mut message = remote_exec::Directory::default();
    let mut sealed = BTreeMap::new();

    for (name, staged) in children {
        let node = match staged {
            Staged::File {
                digest,
                is_executable,
                blob,
            } => {
                stats.file_count += 1;
                stats.total_file_bytes += digest.size_bytes() as u64;
                blobs.entry(digest.clone()).or_insert(blob);
                message.files.push(remote_exec::FileNode {
                    name: name.clone(),
                    digest: digest.clone(),
                    is_executable,
                });
                Node::File(FileEntry {
                    digest,
                    is_executable,
                })
            }
            Staged::Dir(grandchildren) => {
                let dir = seal(grandchildren, blobs, stats)?;
                message.directories.push(remote_exec::DirectoryNode {
                    name: name.clone(),
                    digest: dir.digest.clone(),
                });
                Node::Directory(dir)
            }
            Staged::Symlink(target) => {
                let (digest, _) = Digest::of_message(&SymlinkTarget {
                    target: target.clone(),
                })?;
                message.symlinks.push(remote_exec::SymlinkNode {
                    name: name.clone(),
                    target: target.clone(),
                });
                Node::Symlink(SymlinkEntry { target, digest })
            }
        };
        sealed.insert(name, node);
    }

    message.canonicalize();
    let (digest, bytes) = Digest::of_message(&message)?;
    blobs
        .entry(digest.clone())
        .or_insert_with(|| Blob::from_bytes(bytes));
    Ok(DirectoryEntry {
        children: sealed,
        digest,
    })
}

/// Build the input Merkle tree for `spec` rooted at `exec_root`.
#[instrument(skip(spec), fields(exec_root = %exec_root.display()))]
pub fn build_tree(exec_root: &Path, spec: &InputSpec) -> Result<InputTree> {
    let start = Instant::now();
    let rules = ExclusionRules::new(&spec.exclusions)?;
    let mut staging: BTreeMap<String, Staged> = BTreeMap::new();

    for input in &spec.inputs {
        stage_disk_input(exec_root, input, &rules, &mut staging)?;
    }
    for input in &spec.virtual_inputs {
        stage_virtual_input(input, &mut staging)?;
    }

    let mut blobs = HashMap::new();
    let mut stats = SealStats {
        file_count: 0,
        total_file_bytes: 0,
    };
    let root = seal(staging, &mut blobs, &mut stats)?;

    info!(
        root = %root.digest,
        blobs = blobs.len(),
        files = stats.file_count,
        duration_ms = start.elapsed().as_millis() as u64,
        "Input tree built"
    );

    Ok(InputTree {
        root_digest: root.digest.clone(),
        root,
        blobs,
        file_count: stats.file_count,
        total_file_bytes: stats.total_file_bytes,
    })
}
