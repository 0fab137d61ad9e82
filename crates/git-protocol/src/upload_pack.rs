//! Server side of the `upload-pack` service (fetch/clone).
//!
//! Drives ref advertisement, want/have negotiation, shallow handling, and
//! pack generation for a single fetch/clone request.

use std::collections::{HashSet, VecDeque};
use std::io::Write;

use git_hash::ObjectId;
use git_object::{Object, ObjectType};
use git_pack::generate::{generate_pack, ObjectResolver};
use git_pack::PackedObject;
use git_ref::RefStore;
use git_repository::Repository;

use crate::capability::Capabilities;
use crate::pktline::{PktLineReader, PktLineWriter};
use crate::sideband::{write_sideband_data, Band};
use crate::ProtocolError;

/// Capabilities this server advertises for `upload-pack`.
pub const SERVER_CAPABILITIES: &[&str] = &[
    "side-band-64k",
    "side-band",
    "thin-pack",
    "include-tag",
    "ofs-delta",
    "shallow",
    "deepen-since",
    "deepen-not",
    "deepen-relative",
    "no-progress",
    "multi_ack_detailed",
    "allow-reachable-sha1-in-want",
    "allow-any-sha1-in-want",
    "object-format=sha1",
];

/// A parsed `want`/`have` negotiation request from the client.
#[derive(Debug, Default)]
pub struct FetchRequest {
    pub wants: Vec<ObjectId>,
    pub haves: Vec<ObjectId>,
    pub shallow: Vec<ObjectId>,
    pub deepen: Option<u32>,
    pub deepen_since: Option<i64>,
    pub deepen_not: Vec<String>,
    pub capabilities: Capabilities,
    pub done: bool,
    pub filter: Option<String>,
}

/// Outcome of negotiation, before pack generation.
#[derive(Debug, Default)]
pub struct NegotiationResult {
    /// Commits the client already has that we acknowledged.
    pub common: Vec<ObjectId>,
    /// Whether any `have` was acknowledged at all.
    pub ack_sent: bool,
    /// New shallow boundary commits to report.
    pub new_shallow: Vec<ObjectId>,
    /// Previously-shallow commits now fully reachable.
    pub unshallow: Vec<ObjectId>,
}

/// Write the ref advertisement for `upload-pack`.
///
/// Format: one HEAD line carrying capabilities (first line), then every ref
/// sorted lexicographically. Annotated tags get a second `<peeled> <name>^{}`
/// line. Terminated by flush.
pub fn advertise_refs<W: std::io::Write>(
    repo: &Repository,
    writer: &mut PktLineWriter<W>,
) -> Result<(), ProtocolError> {
    let mut refs: Vec<(String, ObjectId)> = repo
        .refs()
        .iter(None)?
        .filter_map(|r| r.ok())
        .filter_map(|r| r.target_oid().map(|oid| (r.name().as_str().to_string(), oid)))
        .collect();
    refs.sort_by(|a, b| a.0.cmp(&b.0));

    let head_oid = repo.head_oid().ok().flatten();
    let head_line_oid = head_oid.unwrap_or(ObjectId::NULL_SHA1);

    let mut caps = SERVER_CAPABILITIES.join(" ");
    if let Ok(Some(branch)) = repo.current_branch() {
        caps.push_str(&format!(" symref=HEAD:refs/heads/{}", branch));
    }
    caps.push_str(" agent=gitr-server/0.1");

    let first_line = format!("{} HEAD\0{}\n", head_line_oid, caps);
    writer.write_line(first_line.as_bytes())?;

    for (name, oid) in &refs {
        writer.write_text(&format!("{} {}", oid, name))?;
        if let Some(peeled) = peeled_target(repo, oid)? {
            writer.write_text(&format!("{} {}^{{}}", peeled, name))?;
        }
    }

    writer.write_flush()?;
    Ok(())
}

fn peeled_target(repo: &Repository, oid: &ObjectId) -> Result<Option<ObjectId>, ProtocolError> {
    match repo.odb().read(oid)? {
        Some(Object::Tag(tag)) => Ok(Some(tag.target)),
        _ => Ok(None),
    }
}

/// Read the want/have negotiation section up to `done` or a flush.
pub fn read_fetch_request<R: std::io::Read>(
    reader: &mut PktLineReader<R>,
) -> Result<FetchRequest, ProtocolError> {
    let mut req = FetchRequest::default();
    let mut first = true;

    loop {
        let line = match reader.read_line()? {
            Some(l) => l,
            None => break,
        };
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches('\n');

        if text == "done" {
            req.done = true;
            break;
        } else if let Some(rest) = text.strip_prefix("want ") {
            let (oid_str, caps) = split_first_line_caps(rest);
            let oid = ObjectId::from_hex(oid_str.trim())
                .map_err(|e| ProtocolError::Protocol(format!("bad want oid: {}", e)))?;
            if first {
                req.capabilities = Capabilities::parse_v1(caps);
                first = false;
            }
            req.wants.push(oid);
        } else if let Some(rest) = text.strip_prefix("have ") {
            let oid = ObjectId::from_hex(rest.trim())
                .map_err(|e| ProtocolError::Protocol(format!("bad have oid: {}", e)))?;
            req.haves.push(oid);
        } else if let Some(rest) = text.strip_prefix("shallow ") {
            let oid = ObjectId::from_hex(rest.trim())
                .map_err(|e| ProtocolError::Protocol(format!("bad shallow oid: {}", e)))?;
            req.shallow.push(oid);
        } else if let Some(rest) = text.strip_prefix("deepen ") {
            req.deepen = rest.trim().parse().ok();
        } else if let Some(rest) = text.strip_prefix("deepen-since ") {
            req.deepen_since = rest.trim().parse().ok();
        } else if let Some(rest) = text.strip_prefix("deepen-not ") {
            req.deepen_not.push(rest.trim().to_string());
        } else if let Some(rest) = text.strip_prefix("filter ") {
            req.filter = Some(rest.trim().to_string());
        }
    }

    Ok(req)
}

fn split_first_line_caps(s: &str) -> (&str, &str) {
    match s.split_once('\0') {
        Some((oid, caps)) => (oid, caps),
        None => (s, ""),
    }
}

/// Negotiate common ancestors for a fetch request, writing ACK/NAK lines.
///
/// For every `have` the server recognizes as an ancestor reachable from
/// the repository's refs, respond `ACK <sha> continue`; once `done` is
/// observed, the last acknowledged `have` (if any) is re-announced as
/// `ACK <sha> common`, otherwise `NAK`.
pub fn negotiate<W: std::io::Write>(
    repo: &Repository,
    req: &FetchRequest,
    writer: &mut PktLineWriter<W>,
) -> Result<NegotiationResult, ProtocolError> {
    let mut result = NegotiationResult::default();

    for have in &req.haves {
        if repo.odb().contains(have) {
            writer.write_text(&format!("ACK {} continue", have))?;
            result.common.push(*have);
            result.ack_sent = true;
        }
    }

    if req.done {
        if let Some(last) = result.common.last() {
            writer.write_text(&format!("ACK {} common", last))?;
        } else {
            writer.write_text("NAK")?;
        }
    } else if !result.ack_sent {
        writer.write_text("NAK")?;
    }

    for want in &req.wants {
        if let Some(depth) = req.deepen {
            let boundary = shallow_boundary(repo, want, depth)?;
            for oid in boundary {
                if !req.shallow.contains(&oid) {
                    writer.write_text(&format!("shallow {}", oid))?;
                    result.new_shallow.push(oid);
                }
            }
        }
    }
    for prev in &req.shallow {
        if req.deepen.is_none() || !result.new_shallow.contains(prev) {
            writer.write_text(&format!("unshallow {}", prev))?;
            result.unshallow.push(*prev);
        }
    }

    Ok(result)
}

/// Walk parents of `want` up to `depth` levels and return the boundary
/// commits (the commits at exactly `depth` hops whose own parents would be
/// excluded by the shallow clone).
fn shallow_boundary(
    repo: &Repository,
    want: &ObjectId,
    depth: u32,
) -> Result<Vec<ObjectId>, ProtocolError> {
    let mut frontier = vec![*want];
    let mut boundary = Vec::new();
    for _ in 0..depth {
        let mut next = Vec::new();
        for oid in &frontier {
            if let Some(Object::Commit(c)) = repo.odb().read(oid)? {
                next.extend(c.parents);
            }
        }
        if next.is_empty() {
            return Ok(Vec::new());
        }
        frontier = next;
    }
    boundary.extend(frontier);
    Ok(boundary)
}

struct OdbResolver<'a>(&'a Repository);

impl ObjectResolver for OdbResolver<'_> {
    fn read_object(&self, oid: &ObjectId) -> Result<Option<PackedObject>, git_pack::PackError> {
        match self.0.odb().read(oid)? {
            Some(obj) => Ok(Some(PackedObject {
                obj_type: obj.object_type(),
                data: obj.serialize_content(),
            })),
            None => Ok(None),
        }
    }
}

/// Compute the closure of objects reachable from `wants` but not from
/// `haves`/`common`, walking commits → trees → blobs (and tags, if
/// `include_tag` is set), then build and write the resulting pack.
pub fn generate_fetch_pack<W: std::io::Write>(
    repo: &Repository,
    wants: &[ObjectId],
    common: &[ObjectId],
    include_tag: bool,
    sideband: bool,
    pkt_writer: &mut PktLineWriter<W>,
) -> Result<(), ProtocolError> {
    let objects = object_closure(repo, wants, common, include_tag)?;

    let mut pack_bytes = Vec::new();
    generate_pack(&objects, &mut pack_bytes)?;

    if sideband {
        for chunk in pack_bytes.chunks(crate::pktline::MAX_PKT_DATA_LEN - 1) {
            write_sideband_data(pkt_writer, Band::Data, chunk)?;
        }
        pkt_writer.write_flush()?;
    } else {
        pkt_writer.inner_mut().write_all(&pack_bytes)?;
    }

    Ok(())
}

fn object_closure(
    repo: &Repository,
    wants: &[ObjectId],
    have: &[ObjectId],
    include_tag: bool,
) -> Result<Vec<(ObjectId, ObjectType, Vec<u8>)>, ProtocolError> {
    let excluded = ancestors_closure(repo, have)?;

    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut queue: VecDeque<ObjectId> = wants.iter().copied().collect();
    let mut objects = Vec::new();

    while let Some(oid) = queue.pop_front() {
        if excluded.contains(&oid) || !seen.insert(oid) {
            continue;
        }
        let resolver = OdbResolver(repo);
        let Some(packed) = resolver.read_object(&oid)? else {
            continue;
        };
        match packed.obj_type {
            ObjectType::Commit => {
                if let Some(Object::Commit(c)) = repo.odb().read(&oid)? {
                    for parent in &c.parents {
                        queue.push_back(*parent);
                    }
                    queue.push_back(c.tree);
                }
            }
            ObjectType::Tree => {
                if let Some(Object::Tree(t)) = repo.odb().read(&oid)? {
                    for entry in t.iter() {
                        queue.push_back(entry.oid);
                    }
                }
            }
            ObjectType::Tag => {
                if include_tag {
                    if let Some(Object::Tag(tag)) = repo.odb().read(&oid)? {
                        queue.push_back(tag.target);
                    }
                }
            }
            ObjectType::Blob => {}
        }
        objects.push((oid, packed.obj_type, packed.data));
    }

    Ok(objects)
}

/// Commits/trees/blobs reachable from `haves` — the exclusion set for
/// incremental fetch pack generation.
fn ancestors_closure(
    repo: &Repository,
    have: &[ObjectId],
) -> Result<HashSet<ObjectId>, ProtocolError> {
    let mut closure = HashSet::new();
    let mut queue: VecDeque<ObjectId> = have.iter().copied().collect();
    while let Some(oid) = queue.pop_front() {
        if !closure.insert(oid) {
            continue;
        }
        if let Some(Object::Commit(c)) = repo.odb().read(&oid)? {
            queue.push_back(c.tree);
            for parent in &c.parents {
                queue.push_back(*parent);
            }
        } else if let Some(Object::Tree(t)) = repo.odb().read(&oid)? {
            for entry in t.iter() {
                queue.push_back(entry.oid);
            }
        }
    }
    Ok(closure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_capabilities_present() {
        assert!(SERVER_CAPABILITIES.contains(&"side-band-64k"));
        assert!(SERVER_CAPABILITIES.contains(&"multi_ack_detailed"));
    }

    #[test]
    fn split_caps_handles_missing_nul() {
        assert_eq!(split_first_line_caps("deadbeef"), ("deadbeef", ""));
        assert_eq!(
            split_first_line_caps("deadbeef\0side-band"),
            ("deadbeef", "side-band")
        );
    }
}
