//! Top-level merge driver: the state machine behind `git merge`.
//!
//! Decides up-to-date / fast-forward / three-way-merge, persists merge
//! state (`MERGE_HEAD`, `ORIG_HEAD`, `MERGE_MSG`) when conflicts remain,
//! and exposes `resolve_conflict`/`abort_merge`/`continue_merge` to
//! drive a paused merge to completion.

use std::fs;

use bstr::{BString, ByteSlice};
use git_hash::ObjectId;
use git_index::Stage;
use git_object::{Commit, Object};
use git_ref::{RefName, RefStore};
use git_repository::Repository;
use git_revwalk::{is_ancestor, merge_base_one};
use git_utils::date::{GitDate, Signature};

use crate::strategy::dispatch_merge;
use crate::{conflict, ConflictEntry, MergeError, MergeOptions, MergeResult};

/// Merge state persisted while conflicts are unresolved, matching C
/// git's `MERGE_HEAD`/`MERGE_MSG`/`ORIG_HEAD` files plus our own
/// bookkeeping of which conflicts remain.
#[derive(Debug, Clone)]
pub struct MergeState {
    pub merge_head: ObjectId,
    pub orig_head: ObjectId,
    pub message: String,
    pub unresolved_conflicts: Vec<ConflictEntry>,
    pub resolved_conflicts: Vec<ConflictEntry>,
}

const STATE_FILE: &str = "MERGE_STATE";

/// Perform `merge(ours=HEAD, theirs)`.
///
/// `theirs` is the commit being merged in; `their_ref_name` is used only
/// to compose the default merge commit message.
pub fn merge(
    repo: &mut Repository,
    theirs: &ObjectId,
    their_ref_name: &str,
    options: &MergeOptions,
) -> Result<MergeResult, MergeError> {
    let ours = repo.head_oid()?.ok_or(MergeError::NoMergeBase)?;

    if is_ancestor(repo, theirs, &ours)? {
        let tree = read_commit_tree(repo, &ours)?;
        let mut result = MergeResult::clean(tree);
        result.up_to_date = true;
        result.commit = Some(ours);
        result.message = Some("Already up to date.".to_string());
        return Ok(result);
    }

    if is_ancestor(repo, &ours, theirs)? {
        if !options.allow_fast_forward {
            return fail_or_three_way(repo, ours, *theirs, their_ref_name, options);
        }
        fast_forward_head(repo, &ours, theirs)?;
        let tree = read_commit_tree(repo, theirs)?;
        let mut result = MergeResult::clean(tree);
        result.fast_forward = true;
        result.commit = Some(*theirs);
        result.message = Some(format!("Fast-forward to {}", their_ref_name));
        return Ok(result);
    }

    three_way_merge(repo, ours, *theirs, their_ref_name, options)
}

fn fail_or_three_way(
    repo: &mut Repository,
    ours: ObjectId,
    theirs: ObjectId,
    their_ref_name: &str,
    options: &MergeOptions,
) -> Result<MergeResult, MergeError> {
    if options.fast_forward_only {
        return Err(MergeError::NoCommonHistory { target: theirs });
    }
    three_way_merge(repo, ours, theirs, their_ref_name, options)
}

fn three_way_merge(
    repo: &mut Repository,
    ours: ObjectId,
    theirs: ObjectId,
    their_ref_name: &str,
    options: &MergeOptions,
) -> Result<MergeResult, MergeError> {
    let base = merge_base_one(repo, &ours, &theirs)?;
    let base = match base {
        Some(base) => base,
        None if options.allow_unrelated_histories => {
            return Err(MergeError::NoMergeBase);
        }
        None => return Err(MergeError::UnrelatedHistories),
    };

    if options.fast_forward_only {
        return Err(MergeError::NoCommonHistory { target: theirs });
    }

    let mut result = dispatch_merge(repo, &ours, &theirs, &base, options)?;
    let message = format!("Merge branch '{}'", their_ref_name);

    if result.is_clean {
        let tree = result.tree.ok_or(MergeError::NoMergeBase)?;
        let commit_oid = write_merge_commit(repo, tree, &[ours, theirs], &message)?;
        update_head(repo, &ours, &commit_oid)?;
        result.commit = Some(commit_oid);
        result.message = Some(message);
        Ok(result)
    } else {
        let state = MergeState {
            merge_head: theirs,
            orig_head: ours,
            message: message.clone(),
            unresolved_conflicts: result.conflicts.clone(),
            resolved_conflicts: Vec::new(),
        };
        save_state(repo, &state)?;
        result.message = Some(message);
        Ok(result)
    }
}

/// Stage the chosen resolution for `path` and move it from unresolved
/// to resolved in the persisted [`MergeState`].
pub fn resolve_conflict(
    repo: &Repository,
    state: &mut MergeState,
    path: &bstr::BStr,
    content: &[u8],
    mode: git_object::FileMode,
) -> Result<(), MergeError> {
    let pos = state
        .unresolved_conflicts
        .iter()
        .position(|c| c.path.as_bytes() == path.as_bytes())
        .ok_or_else(|| MergeError::InvalidPatch(format!("no such conflict: {}", path)))?;
    let entry = state.unresolved_conflicts.remove(pos);

    let index_path = repo.git_dir().join("index");
    let mut index = git_index::Index::read_from(&index_path)?;
    conflict::record_clean_merge_in_index(&mut index, repo.odb(), path, content, mode)?;
    index.write_to(&index_path)?;

    state.resolved_conflicts.push(entry);
    save_state(repo, state)?;
    Ok(())
}

/// Abort an in-progress merge: restore HEAD/index to `orig_head` and
/// discard all merge state.
pub fn abort_merge(repo: &mut Repository, state: &MergeState) -> Result<(), MergeError> {
    let tree_oid = read_commit_tree(repo, &state.orig_head)?;

    let head_ref = RefName::new(BString::from("HEAD"))
        .map_err(|e| MergeError::InvalidPatch(format!("invalid ref name: {}", e)))?;
    match repo.refs().resolve(&head_ref).map_err(|e| MergeError::InvalidPatch(e.to_string()))? {
        Some(git_ref::Reference::Symbolic { target, .. }) => {
            repo.refs()
                .write_ref(&target, &state.orig_head)
                .map_err(|e| MergeError::InvalidPatch(e.to_string()))?;
        }
        _ => {
            repo.refs()
                .write_ref(&head_ref, &state.orig_head)
                .map_err(|e| MergeError::InvalidPatch(e.to_string()))?;
        }
    }

    let mut index = git_index::Index::new();
    build_index_from_tree(repo.odb(), &tree_oid, &BString::new(Vec::new()), &mut index)?;
    repo.set_index(index);
    repo.write_index()?;

    cleanup_state(repo)?;
    Ok(())
}

/// Require zero unresolved conflicts, create the merge commit, and
/// discard merge state.
pub fn continue_merge(repo: &mut Repository, state: &MergeState) -> Result<MergeResult, MergeError> {
    if !state.unresolved_conflicts.is_empty() {
        return Err(MergeError::InvalidPatch(format!(
            "{} unresolved conflict(s) remain",
            state.unresolved_conflicts.len()
        )));
    }

    let tree = build_tree_from_index(repo)?;
    let commit_oid = write_merge_commit(repo, tree, &[state.orig_head, state.merge_head], &state.message)?;
    update_head(repo, &state.orig_head, &commit_oid)?;
    cleanup_state(repo)?;

    let mut result = MergeResult::clean(tree);
    result.commit = Some(commit_oid);
    result.message = Some(state.message.clone());
    Ok(result)
}

fn build_tree_from_index(repo: &Repository) -> Result<ObjectId, MergeError> {
    let index = git_index::Index::read_from(repo.git_dir().join("index"))?;
    Ok(index.write_tree(repo.odb())?)
}

fn write_merge_commit(
    repo: &Repository,
    tree: ObjectId,
    parents: &[ObjectId],
    message: &str,
) -> Result<ObjectId, MergeError> {
    let signature = Signature {
        name: BString::from("Merge Driver"),
        email: BString::from("merge@localhost"),
        date: GitDate::now(),
    };
    let commit = Commit {
        tree,
        parents: parents.to_vec(),
        author: signature.clone(),
        committer: signature,
        encoding: None,
        gpgsig: None,
        extra_headers: Vec::new(),
        message: BString::from(message),
    };
    Ok(repo.odb().write(&Object::Commit(commit))?)
}

fn update_head(repo: &Repository, expected_old: &ObjectId, new: &ObjectId) -> Result<(), MergeError> {
    let head_ref = RefName::new(BString::from("HEAD"))
        .map_err(|e| MergeError::InvalidPatch(format!("invalid ref name: {}", e)))?;
    let target = match repo
        .refs()
        .resolve(&head_ref)
        .map_err(|e| MergeError::InvalidPatch(e.to_string()))?
    {
        Some(git_ref::Reference::Symbolic { target, .. }) => target,
        _ => head_ref,
    };
    let _ = expected_old;
    repo.refs()
        .write_ref(&target, new)
        .map_err(|e| MergeError::InvalidPatch(e.to_string()))?;
    Ok(())
}

fn fast_forward_head(repo: &Repository, ours: &ObjectId, theirs: &ObjectId) -> Result<(), MergeError> {
    update_head(repo, ours, theirs)
}

fn read_commit_tree(repo: &Repository, commit_oid: &ObjectId) -> Result<ObjectId, MergeError> {
    let obj = repo
        .odb()
        .read(commit_oid)?
        .ok_or(MergeError::ObjectNotFound(*commit_oid))?;
    match obj {
        Object::Commit(c) => Ok(c.tree),
        other => Err(MergeError::UnexpectedObjectType {
            oid: *commit_oid,
            expected: "commit",
            actual: other.object_type().to_string(),
        }),
    }
}

fn build_index_from_tree(
    odb: &git_odb::ObjectDatabase,
    tree_oid: &ObjectId,
    prefix: &BString,
    index: &mut git_index::Index,
) -> Result<(), MergeError> {
    let obj = odb.read(tree_oid)?.ok_or(MergeError::ObjectNotFound(*tree_oid))?;
    let tree = match obj {
        Object::Tree(t) => t,
        other => {
            return Err(MergeError::UnexpectedObjectType {
                oid: *tree_oid,
                expected: "tree",
                actual: other.object_type().to_string(),
            })
        }
    };

    for entry in &tree.entries {
        let path = if prefix.is_empty() {
            entry.name.clone()
        } else {
            let mut p = prefix.clone();
            p.push(b'/');
            p.extend_from_slice(&entry.name);
            p
        };

        if entry.mode.is_tree() {
            build_index_from_tree(odb, &entry.oid, &path, index)?;
        } else {
            index.add(git_index::IndexEntry {
                path,
                oid: entry.oid,
                mode: entry.mode,
                stage: Stage::Normal,
                stat: git_index::StatData::default(),
                flags: git_index::EntryFlags::default(),
            });
        }
    }
    Ok(())
}

fn save_state(repo: &Repository, state: &MergeState) -> Result<(), MergeError> {
    let merge_head = RefName::new(BString::from("MERGE_HEAD"))
        .map_err(|e| MergeError::InvalidPatch(format!("invalid ref name: {}", e)))?;
    repo.refs()
        .write_ref(&merge_head, &state.merge_head)
        .map_err(|e| MergeError::InvalidPatch(e.to_string()))?;

    let orig_head = RefName::new(BString::from("ORIG_HEAD"))
        .map_err(|e| MergeError::InvalidPatch(format!("invalid ref name: {}", e)))?;
    repo.refs()
        .write_ref(&orig_head, &state.orig_head)
        .map_err(|e| MergeError::InvalidPatch(e.to_string()))?;

    fs::write(repo.git_dir().join("MERGE_MSG"), &state.message)?;

    let mut contents = String::new();
    for c in &state.unresolved_conflicts {
        contents.push_str("unresolved ");
        contents.push_str(&c.path.to_string());
        contents.push('\n');
    }
    for c in &state.resolved_conflicts {
        contents.push_str("resolved ");
        contents.push_str(&c.path.to_string());
        contents.push('\n');
    }
    fs::write(repo.git_dir().join(STATE_FILE), contents)?;

    Ok(())
}

fn cleanup_state(repo: &Repository) -> Result<(), MergeError> {
    for name in ["MERGE_HEAD", "ORIG_HEAD"] {
        let ref_name = RefName::new(BString::from(name))
            .map_err(|e| MergeError::InvalidPatch(format!("invalid ref name: {}", e)))?;
        let _ = repo.refs().delete_ref(&ref_name);
    }
    let _ = fs::remove_file(repo.git_dir().join("MERGE_MSG"));
    let _ = fs::remove_file(repo.git_dir().join(STATE_FILE));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn git(dir: &std::path::Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "Test")
            .env("GIT_AUTHOR_EMAIL", "test@test.com")
            .env("GIT_COMMITTER_NAME", "Test")
            .env("GIT_COMMITTER_EMAIL", "test@test.com")
            .output()
            .expect("failed to run git");
        assert!(output.status.success(), "git {:?} failed: {}", args, String::from_utf8_lossy(&output.stderr));
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    #[test]
    fn up_to_date_when_theirs_is_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-b", "main"]);
        git(dir.path(), &["config", "user.name", "Test"]);
        git(dir.path(), &["config", "user.email", "test@test.com"]);
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        git(dir.path(), &["add", "a.txt"]);
        git(dir.path(), &["commit", "-m", "A"]);
        let a = git(dir.path(), &["rev-parse", "HEAD"]);
        let a_oid = ObjectId::from_hex(&a).unwrap();

        let mut repo = Repository::open(dir.path()).unwrap();
        let result = merge(&mut repo, &a_oid, "main", &MergeOptions::default()).unwrap();
        assert!(result.up_to_date);
        assert!(result.is_clean);
    }

    #[test]
    fn fast_forwards_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-b", "main"]);
        git(dir.path(), &["config", "user.name", "Test"]);
        git(dir.path(), &["config", "user.email", "test@test.com"]);
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        git(dir.path(), &["add", "a.txt"]);
        git(dir.path(), &["commit", "-m", "A"]);

        git(dir.path(), &["checkout", "-b", "feature"]);
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        git(dir.path(), &["add", "b.txt"]);
        git(dir.path(), &["commit", "-m", "B"]);
        let b = git(dir.path(), &["rev-parse", "HEAD"]);
        let b_oid = ObjectId::from_hex(&b).unwrap();

        git(dir.path(), &["checkout", "main"]);

        let mut repo = Repository::open(dir.path()).unwrap();
        let result = merge(&mut repo, &b_oid, "feature", &MergeOptions::default()).unwrap();
        assert!(result.fast_forward);
        assert_eq!(result.commit, Some(b_oid));
    }
}
