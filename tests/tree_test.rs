use memoexec::tree::{ExclusionKind, InputExclusion};
use memoexec::{build_tree, Digest, InputSpec, Node, VirtualInput};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn whole_root() -> InputSpec {
    InputSpec {
        inputs: vec![".".to_string()],
        ..Default::default()
    }
}

#[test]
fn test_same_content_same_root_regardless_of_creation_order() {
    let _ = tracing_subscriber::fmt::try_init();
    let files = [
        ("src/lib.rs", "pub fn f() {}"),
        ("src/util/mod.rs", "mod x;"),
        ("README.md", "# readme"),
        ("build/out.txt", "out"),
        ("a.txt", "a"),
    ];

    let first = tempdir().unwrap();
    for (rel, contents) in files {
        write(first.path(), rel, contents);
    }
    let second = tempdir().unwrap();
    for (rel, contents) in files.iter().rev() {
        write(second.path(), rel, contents);
    }

    let tree_1 = build_tree(first.path(), &whole_root()).unwrap();
    let tree_2 = build_tree(second.path(), &whole_root()).unwrap();
    assert_eq!(tree_1.root_digest, tree_2.root_digest);
    assert_eq!(tree_1.file_count, 5);
    assert_eq!(tree_1.blobs.len(), tree_2.blobs.len());

    // Declaring the same inputs in another order changes nothing either.
    let listed = InputSpec {
        inputs: vec!["src".into(), "a.txt".into(), "README.md".into(), "build".into()],
        ..Default::default()
    };
    let reversed = InputSpec {
        inputs: listed.inputs.iter().rev().cloned().collect(),
        ..Default::default()
    };
    assert_eq!(
        build_tree(first.path(), &listed).unwrap().root_digest,
        build_tree(second.path(), &reversed).unwrap().root_digest
    );
}

#[test]
fn test_content_change_changes_only_its_ancestors() {
    let dir = tempdir().unwrap();
    write(dir.path(), "lib/a.rs", "a");
    write(dir.path(), "bin/main.rs", "main");

    let before = build_tree(dir.path(), &whole_root()).unwrap();
    write(dir.path(), "lib/a.rs", "a2");
    let after = build_tree(dir.path(), &whole_root()).unwrap();

    assert_ne!(before.root_digest, after.root_digest);
    assert_ne!(
        before.get("lib").unwrap().digest(),
        after.get("lib").unwrap().digest()
    );
    assert_eq!(
        before.get("bin").unwrap().digest(),
        after.get("bin").unwrap().digest()
    );
}

#[test]
fn test_exclusions_remove_matching_paths() {
    let dir = tempdir().unwrap();
    write(dir.path(), "src/main.rs", "fn main() {}");
    write(dir.path(), "src/main.rs.bak", "old");
    write(dir.path(), "target/debug/app", "binary");

    let spec = InputSpec {
        inputs: vec![".".to_string()],
        exclusions: vec![
            InputExclusion::new("target", ExclusionKind::Directories),
            InputExclusion::new("**/*.bak", ExclusionKind::Files),
        ],
        ..Default::default()
    };
    let tree = build_tree(dir.path(), &spec).unwrap();
    assert!(tree.get("src/main.rs").is_some());
    assert!(tree.get("src/main.rs.bak").is_none());
    assert!(tree.get("target").is_none());
    assert_eq!(tree.file_count, 1);

    // Excluding the only differing file makes two roots identical.
    let other = tempdir().unwrap();
    write(other.path(), "src/main.rs", "fn main() {}");
    assert_eq!(
        build_tree(other.path(), &spec).unwrap().root_digest,
        tree.root_digest
    );
}

#[test]
fn test_virtual_inputs_need_no_disk_files() {
    let dir = tempdir().unwrap();
    let spec = InputSpec {
        virtual_inputs: vec![
            VirtualInput::file("gen/config.h", "#define X 1"),
            VirtualInput::empty_directory("out"),
        ],
        ..Default::default()
    };
    let tree = build_tree(dir.path(), &spec).unwrap();

    match tree.get("gen/config.h") {
        Some(Node::File(file)) => {
            assert_eq!(file.digest, Digest::of_bytes(b"#define X 1"));
            assert!(!file.is_executable);
        }
        other => panic!("unexpected node {:?}", other),
    }
    match tree.get("out") {
        Some(Node::Directory(out)) => assert!(out.children.is_empty()),
        other => panic!("unexpected node {:?}", other),
    }
    assert!(tree.blobs.contains_key(&Digest::of_bytes(b"#define X 1")));
}

#[test]
fn test_virtual_input_replaces_disk_file() {
    let dir = tempdir().unwrap();
    write(dir.path(), "version.txt", "dev");
    let spec = InputSpec {
        inputs: vec!["version.txt".to_string()],
        virtual_inputs: vec![VirtualInput::file("version.txt", "1.2.3")],
        ..Default::default()
    };
    let tree = build_tree(dir.path(), &spec).unwrap();
    assert_eq!(
        tree.get("version.txt").unwrap().digest(),
        &Digest::of_bytes(b"1.2.3")
    );
    assert_eq!(tree.file_count, 1);
}

#[cfg(unix)]
#[test]
fn test_symlinks_and_executable_bits() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    write(dir.path(), "tools/run.sh", "#!/bin/sh");
    fs::set_permissions(
        dir.path().join("tools/run.sh"),
        fs::Permissions::from_mode(0o755),
    )
    .unwrap();
    std::os::unix::fs::symlink("tools/run.sh", dir.path().join("run")).unwrap();

    let tree = build_tree(dir.path(), &whole_root()).unwrap();
    match tree.get("tools/run.sh") {
        Some(Node::File(file)) => assert!(file.is_executable),
        other => panic!("unexpected node {:?}", other),
    }
    match tree.get("run") {
        Some(Node::Symlink(link)) => assert_eq!(link.target, "tools/run.sh"),
        other => panic!("unexpected node {:?}", other),
    }

    // The executable bit is part of the tree's identity.
    let plain = tempdir().unwrap();
    write(plain.path(), "tools/run.sh", "#!/bin/sh");
    fs::set_permissions(
        plain.path().join("tools/run.sh"),
        fs::Permissions::from_mode(0o644),
    )
    .unwrap();
    std::os::unix::fs::symlink("tools/run.sh", plain.path().join("run")).unwrap();
    assert_ne!(
        build_tree(plain.path(), &whole_root()).unwrap().root_digest,
        tree.root_digest
    );
}

#[cfg(unix)]
#[test]
fn test_input_below_symlinked_directory_is_rejected() {
    let dir = tempdir().unwrap();
    write(dir.path(), "real/c.txt", "c");
    std::os::unix::fs::symlink("real", dir.path().join("link")).unwrap();

    let spec = InputSpec {
        inputs: vec!["link/c.txt".to_string()],
        ..Default::default()
    };
    let err = build_tree(dir.path(), &spec).unwrap_err();
    assert!(err.to_string().contains("link"));

    // Declaring the link itself records it as a symlink.
    let spec = InputSpec {
        inputs: vec!["link".to_string()],
        ..Default::default()
    };
    let tree = build_tree(dir.path(), &spec).unwrap();
    assert!(matches!(tree.get("link"), Some(Node::Symlink(_))));
}

#[test]
fn test_entries_are_depth_first_and_sorted() {
    let dir = tempdir().unwrap();
    write(dir.path(), "b/z.txt", "z");
    write(dir.path(), "b/a.txt", "a");
    write(dir.path(), "a.txt", "top");

    let tree = build_tree(dir.path(), &whole_root()).unwrap();
    let paths: Vec<String> = tree.entries().into_iter().map(|(p, _)| p).collect();
    assert_eq!(paths, vec!["a.txt", "b", "b/a.txt", "b/z.txt"]);
    assert_eq!(tree.total_file_bytes, 5);
}

#[test]
fn test_escaping_input_is_rejected() {
    let dir = tempdir().unwrap();
    let spec = InputSpec {
        inputs: vec!["../etc/passwd".to_string()],
        ..Default::default()
    };
    assert!(build_tree(dir.path(), &spec).is_err());
}
