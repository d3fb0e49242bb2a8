use crate::error::{MemoExecError, Result};
use crate::tree::ignore::ExclusionRules;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One filesystem entry found under a declared input directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEntry {
    File {
        rel: String,
        abs: PathBuf,
        is_executable: bool,
    },
    Directory {
        rel: String,
    },
    Symlink {
        rel: String,
        target: String,
    },
}

impl WalkEntry {
    pub fn rel(&self) -> &str {
        match self {
            WalkEntry::File { rel, .. } => rel,
            WalkEntry::Directory { rel } => rel,
            WalkEntry::Symlink { rel, .. } => rel,
        }
    }
}

/// `/`-joined path of `path` relative to `root`.
pub fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        MemoExecError::Local(format!(
            "{} is outside the exec root {}",
            path.display(),
            root.display()
        ))
    })?;
    let mut parts = Vec::new();
    for component in rel.components() {
        let part = component.as_os_str().to_str().ok_or_else(|| {
            MemoExecError::Local(format!("non UTF-8 path: {}", path.display()))
        })?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}

#[cfg(unix)]
pub fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
pub fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

pub fn read_symlink(path: &Path) -> Result<String> {
    let target = std::fs::read_link(path).map_err(|e| MemoExecError::filesystem(path, e))?;
    target
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| MemoExecError::Local(format!("non UTF-8 symlink target at {}", path.display())))
}

/// Walk a declared input directory and return every non-excluded entry below it.
///
/// Symlinks are recorded, never followed. Entries come back sorted by name at
/// each level, and an unreadable entry is an error instead of being skipped.
pub fn walk_dir(exec_root: &Path, dir: &Path, rules: &ExclusionRules) -> Result<Vec<WalkEntry>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match relative_path(exec_root, entry.path()) {
            Ok(rel) => !rules.is_excluded(&rel, entry.file_type().is_dir()),
            // Keep it so the error surfaces below.
            Err(_) => true,
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| dir.to_path_buf());
            let io = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop"));
            MemoExecError::filesystem(path, io)
        })?;
        let rel = relative_path(exec_root, entry.path())?;
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            entries.push(WalkEntry::Symlink {
                target: read_symlink(entry.path())?,
                rel,
            });
        } else if file_type.is_dir() {
            entries.push(WalkEntry::Directory { rel });
        } else {
            let metadata = entry
                .metadata()
                .map_err(|e| {
                    let io = e.into_io_error().unwrap_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::Other, "metadata unavailable")
                    });
                    MemoExecError::filesystem(entry.path(), io)
                })?;
            entries.push(WalkEntry::File {
                rel,
                abs: entry.path().to_path_buf(),
                is_executable: is_executable(&metadata),
            });
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ignore::{ExclusionKind, InputExclusion};
    use std::fs;
    use tempfile::TempDir;

    fn make_temp_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::write(dir.path().join("b.txt"), "world").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("c.txt"), "nested").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        dir
    }

    #[test]
    fn test_walk_finds_all_entries() {
        let dir = make_temp_tree();
        let entries = walk_dir(dir.path(), dir.path(), &ExclusionRules::empty()).unwrap();
        let rels: Vec<_> = entries.iter().map(|e| e.rel().to_string()).collect();
        assert_eq!(rels, vec!["a.txt", "b.txt", "empty", "sub", "sub/c.txt"]);
    }

    #[test]
    fn test_walk_respects_exclusions() {
        let dir = make_temp_tree();
        let rules =
            ExclusionRules::new(&[InputExclusion::new("sub", ExclusionKind::All)]).unwrap();
        let entries = walk_dir(dir.path(), dir.path(), &rules).unwrap();
        assert!(entries.iter().all(|e| !e.rel().starts_with("sub")));
        assert_eq!(entries.len(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_recorded_not_followed() {
        let dir = make_temp_tree();
        std::os::unix::fs::symlink("sub", dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink("/does/not/exist", dir.path().join("dangling")).unwrap();
        let entries = walk_dir(dir.path(), dir.path(), &ExclusionRules::empty()).unwrap();
        assert!(entries.contains(&WalkEntry::Symlink {
            rel: "link".into(),
            target: "sub".into()
        }));
        assert!(entries.contains(&WalkEntry::Symlink {
            rel: "dangling".into(),
            target: "/does/not/exist".into()
        }));
        assert!(!entries.iter().any(|e| e.rel() == "link/c.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_bit() {
        use std::os::unix::fs::PermissionsExt;
        let dir = make_temp_tree();
        let script = dir.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let entries = walk_dir(dir.path(), dir.path(), &ExclusionRules::empty()).unwrap();
        let exec = entries.iter().find(|e| e.rel() == "run.sh").unwrap();
        assert!(matches!(exec, WalkEntry::File { is_executable: true, .. }));
    }
}
