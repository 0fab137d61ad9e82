//! Per-line authorship attribution ("blame").
//!
//! Walks commit ancestry from a starting commit, diffing a file's content
//! against each parent's version to decide whether each line already
//! existed in that parent (and so should be attributed further back) or
//! was introduced at the current commit. Lines survive as long as a
//! parent's diff marks them `Equal`; once no parent can explain a line,
//! it is attributed to the commit being processed. Renames are followed
//! by diffing the parent and child trees and matching the tracked path
//! against a detected rename's new path.

use std::collections::{HashSet, VecDeque};

use bstr::{BString, ByteSlice};

use git_diff::algorithm::{diff_edits, split_lines, EditOp};
use git_diff::tree::diff_trees;
use git_diff::{DiffOptions, FileStatus};
use git_hash::ObjectId;
use git_object::{FileMode, Object, Tree};
use git_odb::ObjectDatabase;
use git_utils::date::Signature;

#[derive(Debug, thiserror::Error)]
pub enum BlameError {
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),
    #[error("path not found in starting commit: {0}")]
    PathNotFound(BString),
    #[error("{0} is not a commit")]
    NotACommit(ObjectId),
    #[error(transparent)]
    Odb(#[from] git_odb::OdbError),
    #[error(transparent)]
    Object(#[from] git_object::ObjectError),
    #[error(transparent)]
    Diff(#[from] git_diff::DiffError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Options controlling a blame run.
#[derive(Debug, Clone, Default)]
pub struct BlameOptions {
    /// Compare lines ignoring whitespace differences when deciding
    /// whether a line survived unchanged from a parent.
    pub ignore_whitespace: bool,
    /// Commits to treat as transparent: their changes are never the
    /// final attribution for a line, which instead keeps searching
    /// through the ignored commit's parents.
    pub ignore_revisions: HashSet<ObjectId>,
    /// Restrict output to this 1-based, inclusive line range of the
    /// starting commit's content.
    pub line_range: Option<(usize, usize)>,
    /// Stop walking history after this many commits have been visited,
    /// attributing any lines still unresolved to the last commit seen.
    pub max_commits: Option<usize>,
    /// Only follow the first parent of merge commits.
    pub first_parent_only: bool,
}

/// One attributed source line.
#[derive(Debug, Clone)]
pub struct BlameLine {
    /// 1-based line number in the starting commit's content.
    pub final_line: usize,
    /// 1-based line number in the originating commit's content.
    pub orig_line: usize,
    pub commit: ObjectId,
    pub path: BString,
    pub content: BString,
}

#[derive(Debug, Clone)]
pub struct BlameResult {
    pub lines: Vec<BlameLine>,
}

/// A line still being tracked backward through history: which final-line
/// slot it fills, and its current line number in the commit/path pair
/// being processed.
#[derive(Clone, Copy)]
struct TrackedLine {
    final_index: usize,
    current_line: usize,
}

struct QueueEntry {
    commit: ObjectId,
    path: BString,
    tracked: Vec<TrackedLine>,
}

/// Run blame on `path` as of `start_commit`.
pub fn blame(
    odb: &ObjectDatabase,
    start_commit: ObjectId,
    path: &BString,
    options: &BlameOptions,
) -> Result<BlameResult, BlameError> {
    let start = read_commit(odb, &start_commit)?;
    let start_blob_oid = resolve_blob(odb, &start.tree, path)?
        .ok_or_else(|| BlameError::PathNotFound(path.clone()))?;
    let final_lines = split_lines(&read_blob(odb, &start_blob_oid)?)
        .into_iter()
        .map(BString::from)
        .collect::<Vec<_>>();

    let (range_start, range_end) = options
        .line_range
        .unwrap_or((1, final_lines.len().max(1)));

    let mut attribution: Vec<Option<(ObjectId, usize, BString)>> = vec![None; final_lines.len()];

    let initial_tracked: Vec<TrackedLine> = (0..final_lines.len())
        .map(|i| TrackedLine {
            final_index: i,
            current_line: i,
        })
        .collect();

    let mut queue = VecDeque::new();
    queue.push_back(QueueEntry {
        commit: start_commit,
        path: path.clone(),
        tracked: initial_tracked,
    });

    let mut visited: HashSet<(ObjectId, BString)> = HashSet::new();
    let mut commits_processed = 0usize;

    while let Some(entry) = queue.pop_front() {
        if !visited.insert((entry.commit, entry.path.clone())) {
            continue;
        }
        if let Some(max) = options.max_commits {
            if commits_processed >= max {
                attribute_remaining(&mut attribution, &entry, &entry.commit, &entry.path);
                continue;
            }
        }
        commits_processed += 1;

        let still_unresolved: Vec<TrackedLine> = entry
            .tracked
            .iter()
            .copied()
            .filter(|t| attribution[t.final_index].is_none())
            .collect();
        if still_unresolved.is_empty() {
            continue;
        }

        let commit = read_commit(odb, &entry.commit)?;
        let treat_as_transparent = options.ignore_revisions.contains(&entry.commit);

        let mut remaining = still_unresolved.clone();
        let parents = if options.first_parent_only {
            commit.parents.iter().take(1).collect::<Vec<_>>()
        } else {
            commit.parents.iter().collect::<Vec<_>>()
        };

        if parents.is_empty() {
            if !treat_as_transparent {
                attribute_lines(&mut attribution, &remaining, &entry.commit, &entry.path);
            }
            continue;
        }

        for &parent_oid in &parents {
            if remaining.is_empty() {
                break;
            }
            let parent_commit = read_commit(odb, parent_oid)?;
            let (parent_path, parent_blob) =
                match resolve_blob(odb, &parent_commit.tree, &entry.path)? {
                    Some(blob_oid) => (entry.path.clone(), blob_oid),
                    None => match find_rename_source(odb, &parent_commit.tree, &commit.tree, &entry.path)? {
                        Some((old_path, blob_oid)) => (old_path, blob_oid),
                        None => continue,
                    },
                };

            let current_blob_oid = resolve_blob(odb, &commit.tree, &entry.path)?;
            let current_bytes = match current_blob_oid {
                Some(oid) => read_blob(odb, &oid)?,
                None => continue,
            };
            let parent_bytes = read_blob(odb, &parent_blob)?;

            let edits = diff_lines_for_blame(&parent_bytes, &current_bytes, options.ignore_whitespace);

            let mut current_to_parent = vec![None; split_lines(&current_bytes).len()];
            for edit in &edits {
                if edit.op == EditOp::Equal {
                    current_to_parent[edit.new_index] = Some(edit.old_index);
                }
            }

            let mut carried = Vec::new();
            let mut still_remaining = Vec::new();
            for t in remaining {
                match current_to_parent.get(t.current_line).copied().flatten() {
                    Some(parent_line) => carried.push(TrackedLine {
                        final_index: t.final_index,
                        current_line: parent_line,
                    }),
                    None => still_remaining.push(t),
                }
            }
            remaining = still_remaining;

            if !carried.is_empty() {
                queue.push_back(QueueEntry {
                    commit: *parent_oid,
                    path: parent_path,
                    tracked: carried,
                });
            }
        }

        if !remaining.is_empty() {
            if treat_as_transparent {
                if let Some(&first_parent) = parents.first() {
                    queue.push_back(QueueEntry {
                        commit: *first_parent,
                        path: entry.path.clone(),
                        tracked: remaining,
                    });
                } else {
                    attribute_lines(&mut attribution, &remaining, &entry.commit, &entry.path);
                }
            } else {
                attribute_lines(&mut attribution, &remaining, &entry.commit, &entry.path);
            }
        }
    }

    let mut lines = Vec::new();
    for (i, line) in final_lines.iter().enumerate() {
        let final_line_no = i + 1;
        if final_line_no < range_start || final_line_no > range_end {
            continue;
        }
        let (commit, orig_line, orig_path) = attribution[i]
            .clone()
            .unwrap_or((start_commit, final_line_no, path.clone()));
        lines.push(BlameLine {
            final_line: final_line_no,
            orig_line: orig_line + 1,
            commit,
            path: orig_path,
            content: line.clone(),
        });
    }

    Ok(BlameResult { lines })
}

fn attribute_lines(
    attribution: &mut [Option<(ObjectId, usize, BString)>],
    tracked: &[TrackedLine],
    commit: &ObjectId,
    path: &BString,
) {
    for t in tracked {
        attribution[t.final_index] = Some((*commit, t.current_line, path.clone()));
    }
}

fn attribute_remaining(
    attribution: &mut [Option<(ObjectId, usize, BString)>],
    entry: &QueueEntry,
    commit: &ObjectId,
    path: &BString,
) {
    for t in &entry.tracked {
        if attribution[t.final_index].is_none() {
            attribution[t.final_index] = Some((*commit, t.current_line, path.clone()));
        }
    }
}

fn diff_lines_for_blame(old: &[u8], new: &[u8], ignore_whitespace: bool) -> Vec<git_diff::algorithm::Edit> {
    if !ignore_whitespace {
        return diff_edits(old, new, git_diff::DiffAlgorithm::Histogram);
    }
    let normalize = |data: &[u8]| -> Vec<u8> {
        split_lines(data)
            .into_iter()
            .flat_map(|line| {
                let trimmed: Vec<u8> = line.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
                let mut out = trimmed;
                out.push(b'\n');
                out
            })
            .collect()
    };
    diff_edits(&normalize(old), &normalize(new), git_diff::DiffAlgorithm::Histogram)
}

fn read_commit(odb: &ObjectDatabase, oid: &ObjectId) -> Result<git_object::Commit, BlameError> {
    match odb.read(oid)? {
        Some(Object::Commit(c)) => Ok(c),
        Some(_) => Err(BlameError::NotACommit(*oid)),
        None => Err(BlameError::ObjectNotFound(*oid)),
    }
}

fn read_blob(odb: &ObjectDatabase, oid: &ObjectId) -> Result<Vec<u8>, BlameError> {
    match odb.read(oid)? {
        Some(Object::Blob(b)) => Ok(b.data.to_vec()),
        Some(_) => Err(BlameError::ObjectNotFound(*oid)),
        None => Err(BlameError::ObjectNotFound(*oid)),
    }
}

fn read_tree(odb: &ObjectDatabase, oid: &ObjectId) -> Result<Tree, BlameError> {
    match odb.read(oid)? {
        Some(Object::Tree(t)) => Ok(t),
        Some(_) => Err(BlameError::ObjectNotFound(*oid)),
        None => Err(BlameError::ObjectNotFound(*oid)),
    }
}

/// Walk `path` (slash-separated) through nested trees starting at
/// `tree_oid`, returning the blob id at the leaf if every component
/// resolves and the leaf is a non-tree entry.
fn resolve_blob(
    odb: &ObjectDatabase,
    tree_oid: &ObjectId,
    path: &BString,
) -> Result<Option<ObjectId>, BlameError> {
    let mut current = *tree_oid;
    let components: Vec<&[u8]> = path.split(|&b| b == b'/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        return Ok(None);
    }
    for (i, component) in components.iter().enumerate() {
        let tree = read_tree(odb, &current)?;
        let entry = match tree.find(component.as_bstr()) {
            Some(e) => e,
            None => return Ok(None),
        };
        if i == components.len() - 1 {
            if entry.mode.is_tree() {
                return Ok(None);
            }
            return Ok(Some(entry.oid));
        }
        if !entry.mode.is_tree() {
            return Ok(None);
        }
        current = entry.oid;
    }
    Ok(None)
}

/// When `path` doesn't exist in `parent_tree`, check whether the
/// parent-to-child tree diff explains it as a rename, returning the
/// source path and blob id in the parent tree.
fn find_rename_source(
    odb: &ObjectDatabase,
    parent_tree: &ObjectId,
    child_tree: &ObjectId,
    path: &BString,
) -> Result<Option<(BString, ObjectId)>, BlameError> {
    let options = DiffOptions {
        detect_renames: true,
        rename_threshold: 50,
        ..Default::default()
    };
    let mut result = diff_trees(odb, Some(parent_tree), Some(child_tree), &options)?;
    git_diff::rename::detect_renames(odb, &mut result, options.rename_threshold)?;
    for file in &result.files {
        if file.status == FileStatus::Renamed {
            if file.new_path.as_deref() == Some(path.as_bstr()) {
                if let (Some(old_path), Some(old_oid)) = (&file.old_path, file.old_oid) {
                    return Ok(Some((old_path.clone(), old_oid)));
                }
            }
        }
    }
    Ok(None)
}

/// Render a blame result in `git blame --porcelain` format.
pub fn write_porcelain<W: std::io::Write>(
    result: &BlameResult,
    odb: &ObjectDatabase,
    writer: &mut W,
) -> Result<(), BlameError> {
    let mut seen_commits: HashSet<ObjectId> = HashSet::new();
    for line in &result.lines {
        writeln!(
            writer,
            "{} {} {}",
            line.commit, line.orig_line, line.final_line
        )?;
        if seen_commits.insert(line.commit) {
            let commit = read_commit(odb, &line.commit)?;
            write_header(writer, &commit, &line.path)?;
        }
        writer.write_all(b"\t")?;
        writer.write_all(&line.content)?;
        if !line.content.ends_with(b"\n") {
            writer.write_all(b"\n")?;
        }
    }
    Ok(())
}

fn write_header<W: std::io::Write>(
    writer: &mut W,
    commit: &git_object::Commit,
    path: &BString,
) -> Result<(), BlameError> {
    write_signature_line(writer, "author", &commit.author)?;
    write_signature_line(writer, "committer", &commit.committer)?;
    let summary = commit.message.lines().next().unwrap_or(b"");
    writer.write_all(b"summary ")?;
    writer.write_all(summary)?;
    writer.write_all(b"\n")?;
    writer.write_all(b"filename ")?;
    writer.write_all(path)?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn write_signature_line<W: std::io::Write>(
    writer: &mut W,
    role: &str,
    sig: &Signature,
) -> Result<(), BlameError> {
    writeln!(writer, "{} {}", role, sig.name)?;
    writeln!(writer, "{}-mail <{}>", role, sig.email)?;
    writeln!(writer, "{}-time {}", role, sig.date.timestamp)?;
    writeln!(writer, "{}-tz {:+05}", role, tz_as_hhmm(sig.date.tz_offset))?;
    Ok(())
}

fn tz_as_hhmm(tz_offset_minutes: i32) -> i32 {
    let sign = if tz_offset_minutes < 0 { -1 } else { 1 };
    let abs = tz_offset_minutes.abs();
    sign * (abs / 60 * 100 + abs % 60)
}
