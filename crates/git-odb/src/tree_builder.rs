//! Build tree objects from a flat list of paths.
//!
//! Takes index-shaped input (`path`, `oid`, `mode`) and materializes the
//! directory structure as a trie, writing one tree object per directory
//! (bottom-up, content-deduplicated) and returning the root tree's OID.

use std::collections::BTreeMap;

use bstr::{BString, ByteSlice};
use git_hash::ObjectId;
use git_object::{FileMode, Object, ObjectError, ObjectType, Tree, TreeEntry};

use crate::{ObjectDatabase, OdbError};

/// One flat entry as it would appear in an index: a path plus the blob
/// (or gitlink) it points at.
#[derive(Debug, Clone)]
pub struct FlatEntry {
    pub path: BString,
    pub mode: FileMode,
    pub oid: ObjectId,
}

/// Summary of a build: how many tree objects were actually written to
/// the object database versus how many were reused because an
/// identical directory had already been built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub trees_written: usize,
    pub trees_deduplicated: usize,
}

/// Result of [`TreeBuilder::build`].
#[derive(Debug, Clone, Copy)]
pub struct BuildResult {
    pub root: ObjectId,
    pub stats: BuildStats,
}

enum Node {
    Blob { mode: FileMode, oid: ObjectId },
    Dir(BTreeMap<BString, Node>),
}

/// Materializes a directory trie from flat paths and writes git tree
/// objects for it.
pub struct TreeBuilder<'a> {
    odb: &'a ObjectDatabase,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(odb: &'a ObjectDatabase) -> Self {
        Self { odb }
    }

    /// Validate and insert `entries`, write the resulting tree objects,
    /// and return the OID of the root tree.
    ///
    /// Returns [`ObjectError::InvalidTreeEntry`] for a forbidden path:
    /// empty, leading `/`, an empty component (`//`), or a component
    /// equal to `.` or `..`.
    pub fn build(&self, entries: &[FlatEntry]) -> Result<BuildResult, TreeBuilderError> {
        let mut root: BTreeMap<BString, Node> = BTreeMap::new();

        for entry in entries {
            let components = split_and_validate(&entry.path)?;
            insert(&mut root, &components, entry.mode, entry.oid);
        }

        let mut dedup: std::collections::HashMap<Vec<u8>, ObjectId> = std::collections::HashMap::new();
        let mut stats = BuildStats::default();
        let root_oid = write_dir(self.odb, &root, &mut dedup, &mut stats)?;
        Ok(BuildResult {
            root: root_oid,
            stats,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TreeBuilderError {
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error(transparent)]
    Odb(#[from] OdbError),
}

fn split_and_validate(path: &BString) -> Result<Vec<BString>, ObjectError> {
    if path.is_empty() || path.starts_with(b"/") {
        return Err(ObjectError::InvalidTreeEntry {
            offset: 0,
            reason: "empty or absolute path".into(),
        });
    }
    let mut components = Vec::new();
    for part in path.as_bytes().split(|&b| b == b'/') {
        if part.is_empty() {
            return Err(ObjectError::InvalidTreeEntry {
                offset: 0,
                reason: "empty path component".into(),
            });
        }
        if part == b"." || part == b".." {
            return Err(ObjectError::InvalidTreeEntry {
                offset: 0,
                reason: "'.' or '..' path component".into(),
            });
        }
        components.push(BString::from(part));
    }
    Ok(components)
}

fn insert(root: &mut BTreeMap<BString, Node>, components: &[BString], mode: FileMode, oid: ObjectId) {
    let (name, rest) = components.split_first().expect("validated non-empty path");
    if rest.is_empty() {
        root.insert(name.clone(), Node::Blob { mode, oid });
        return;
    }
    let child = root
        .entry(name.clone())
        .or_insert_with(|| Node::Dir(BTreeMap::new()));
    match child {
        Node::Dir(children) => insert(children, rest, mode, oid),
        Node::Blob { .. } => {
            // A path collides with a previously-inserted file at a
            // shallower depth; replace it with a directory rather than
            // silently dropping data.
            let mut children = BTreeMap::new();
            insert(&mut children, rest, mode, oid);
            *child = Node::Dir(children);
        }
    }
}

fn write_dir(
    odb: &ObjectDatabase,
    children: &BTreeMap<BString, Node>,
    dedup: &mut std::collections::HashMap<Vec<u8>, ObjectId>,
    stats: &mut BuildStats,
) -> Result<ObjectId, TreeBuilderError> {
    let mut entries = Vec::with_capacity(children.len());
    for (name, node) in children {
        match node {
            Node::Blob { mode, oid } => entries.push(TreeEntry {
                mode: *mode,
                name: name.clone(),
                oid: *oid,
            }),
            Node::Dir(sub) => {
                let oid = write_dir(odb, sub, dedup, stats)?;
                entries.push(TreeEntry {
                    mode: FileMode::Tree,
                    name: name.clone(),
                    oid,
                });
            }
        }
    }

    let tree = Tree { entries };
    let content = tree.serialize_content();
    if let Some(existing) = dedup.get(&content) {
        stats.trees_deduplicated += 1;
        return Ok(*existing);
    }

    let oid = odb.write_raw(ObjectType::Tree, &content)?;
    dedup.insert(content, oid);
    stats.trees_written += 1;
    Ok(oid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use git_hash::ObjectId;
    use tempfile::tempdir;

    fn oid(n: u8) -> ObjectId {
        let mut hex = format!("{:02x}", n);
        hex.push_str(&"0".repeat(40 - hex.len()));
        ObjectId::from_hex(&hex).unwrap()
    }

    #[test]
    fn rejects_forbidden_paths() {
        for bad in ["", "/abs", "a//b", "a/./b", "a/../b"] {
            assert!(split_and_validate(&BString::from(bad)).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn builds_nested_tree() {
        let dir = tempdir().unwrap();
        let odb = ObjectDatabase::open(dir.path()).unwrap();
        let builder = TreeBuilder::new(&odb);

        let entries = vec![
            FlatEntry {
                path: BString::from("README.md"),
                mode: FileMode::Regular,
                oid: oid(1),
            },
            FlatEntry {
                path: BString::from("src/main.rs"),
                mode: FileMode::Regular,
                oid: oid(2),
            },
            FlatEntry {
                path: BString::from("src/lib.rs"),
                mode: FileMode::Regular,
                oid: oid(3),
            },
        ];

        let result = builder.build(&entries).unwrap();
        assert_eq!(result.stats.trees_written, 2); // root + src
        assert_eq!(result.stats.trees_deduplicated, 0);

        let root = match odb.read(&result.root).unwrap().unwrap() {
            Object::Tree(t) => t,
            _ => panic!("expected tree"),
        };
        assert_eq!(root.len(), 2);
        let src_entry = root.find(bstr::BStr::new("src")).unwrap();
        assert!(src_entry.mode.is_tree());
    }

    #[test]
    fn identical_subtrees_are_deduplicated() {
        let dir = tempdir().unwrap();
        let odb = ObjectDatabase::open(dir.path()).unwrap();
        let builder = TreeBuilder::new(&odb);

        let entries = vec![
            FlatEntry {
                path: BString::from("a/x.txt"),
                mode: FileMode::Regular,
                oid: oid(1),
            },
            FlatEntry {
                path: BString::from("b/x.txt"),
                mode: FileMode::Regular,
                oid: oid(1),
            },
        ];

        let result = builder.build(&entries).unwrap();
        // a/ and b/ have identical content -> one written, one deduplicated, plus root.
        assert_eq!(result.stats.trees_written, 2);
        assert_eq!(result.stats.trees_deduplicated, 1);
    }
}
