//! Server side of the `receive-pack` service (push).
//!
//! Parses command lines, validates them against protected-ref policy and
//! fast-forward rules, unpacks the incoming packfile, and applies refs
//! atomically with a report-status reply.

use git_hash::ObjectId;
use git_object::{Commit, Object};
use git_ref::{RefName, RefStore, RefTransaction};
use git_repository::Repository;
use git_revwalk::is_ancestor;

use crate::pktline::{PktLineReader, PktLineWriter};
use crate::ProtocolError;

/// Capabilities this server advertises for `receive-pack`.
pub const SERVER_CAPABILITIES: &[&str] = &[
    "report-status",
    "report-status-v2",
    "delete-refs",
    "quiet",
    "atomic",
    "ofs-delta",
    "side-band-64k",
];

/// One `<old> <new> <ref>` push command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushCommand {
    pub old_oid: ObjectId,
    pub new_oid: ObjectId,
    pub ref_name: String,
}

impl PushCommand {
    pub fn kind(&self) -> PushCommandKind {
        if self.old_oid.is_null() {
            PushCommandKind::Create
        } else if self.new_oid.is_null() {
            PushCommandKind::Delete
        } else {
            PushCommandKind::Update
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushCommandKind {
    Create,
    Update,
    Delete,
}

/// The result of validating (but not yet applying) a single command.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Ok,
    Rejected(String),
}

/// A parsed push request: commands plus push-options, before the pack.
#[derive(Debug, Default)]
pub struct PushRequest {
    pub commands: Vec<PushCommand>,
    pub push_options: Vec<String>,
    pub atomic: bool,
    pub report_status: bool,
}

/// Write the ref advertisement for `receive-pack`. Same shape as
/// upload-pack's, using the receive-pack capability set.
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

    let caps = format!("{} agent=gitr-server/0.1", SERVER_CAPABILITIES.join(" "));

    if refs.is_empty() {
        let first_line = format!("{} capabilities^{{}}\0{}\n", ObjectId::NULL_SHA1, caps);
        writer.write_line(first_line.as_bytes())?;
    } else {
        let (name, oid) = &refs[0];
        writer.write_line(format!("{} {}\0{}\n", oid, name, caps).as_bytes())?;
        for (name, oid) in &refs[1..] {
            writer.write_text(&format!("{} {}", oid, name))?;
        }
    }
    writer.write_flush()?;
    Ok(())
}

/// Read push commands (and optional push-options section) up to the
/// flush that precedes the packfile.
pub fn read_push_request<R: std::io::Read>(
    reader: &mut PktLineReader<R>,
) -> Result<PushRequest, ProtocolError> {
    let mut req = PushRequest::default();
    let mut first = true;

    loop {
        let line = match reader.read_line()? {
            Some(l) => l,
            None => break,
        };
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches('\n').to_string();

        let (body, caps) = match text.split_once('\0') {
            Some((b, c)) => (b.to_string(), Some(c.to_string())),
            None => (text, None),
        };

        if first {
            if let Some(caps) = &caps {
                let parsed = crate::capability::Capabilities::parse_v1(caps);
                req.atomic = parsed.has("atomic");
                req.report_status = parsed.has("report-status") || parsed.has("report-status-v2");
            }
            first = false;
        }

        let mut parts = body.splitn(3, ' ');
        let old = parts.next().unwrap_or_default();
        let new = parts.next().unwrap_or_default();
        let name = parts.next().unwrap_or_default();
        if name.is_empty() {
            continue;
        }
        req.commands.push(PushCommand {
            old_oid: ObjectId::from_hex(old)
                .map_err(|e| ProtocolError::Protocol(format!("bad old oid: {}", e)))?,
            new_oid: ObjectId::from_hex(new)
                .map_err(|e| ProtocolError::Protocol(format!("bad new oid: {}", e)))?,
            ref_name: name.to_string(),
        });
    }

    Ok(req)
}

/// Validate ref-name syntax, protected-ref policy, and fast-forward rules
/// for one command. Does not mutate anything.
///
/// Order (per the spec): ref-name validity, permission/protection check,
/// then fast-forward-or-force verification against the current value.
pub fn validate_command(
    repo: &Repository,
    cmd: &PushCommand,
    protected_globs: &[String],
    force_allowed: bool,
) -> Result<CommandOutcome, ProtocolError> {
    let ref_name = match RefName::new(cmd.ref_name.as_str()) {
        Ok(n) => n,
        Err(e) => return Ok(CommandOutcome::Rejected(format!("invalid ref name: {}", e))),
    };

    let is_protected = protected_globs
        .iter()
        .any(|glob| glob_match(glob, &cmd.ref_name));

    if is_protected {
        return Ok(CommandOutcome::Rejected("protected".into()));
    }

    let current = repo.refs().resolve_to_oid(&ref_name)?;
    match current {
        Some(current_oid) if current_oid != cmd.old_oid => {
            return Ok(CommandOutcome::Rejected(format!(
                "expected old oid {}, found {}",
                cmd.old_oid, current_oid
            )));
        }
        None if !cmd.old_oid.is_null() => {
            return Ok(CommandOutcome::Rejected("remote ref does not exist".into()));
        }
        _ => {}
    }

    if cmd.kind() == PushCommandKind::Update {
        let ff = is_ancestor(repo, &cmd.old_oid, &cmd.new_oid).unwrap_or(false);
        if !ff && !force_allowed {
            return Ok(CommandOutcome::Rejected("non-fast-forward".into()));
        }
    }

    Ok(CommandOutcome::Ok)
}

/// Minimal glob matcher supporting a single trailing `*` (e.g. `refs/heads/release-*`).
fn glob_match(glob: &str, candidate: &str) -> bool {
    if let Some(prefix) = glob.strip_suffix('*') {
        candidate.starts_with(prefix)
    } else {
        glob == candidate
    }
}

/// Apply validated commands to the ref store as a single atomic
/// transaction. On any underlying failure, no ref is left modified.
pub fn apply_commands(
    repo: &Repository,
    commands: &[(PushCommand, CommandOutcome)],
) -> Result<(), ProtocolError> {
    let mut tx = RefTransaction::new();
    for (cmd, outcome) in commands {
        if !matches!(outcome, CommandOutcome::Ok) {
            continue;
        }
        let name = RefName::new(cmd.ref_name.as_str())?;
        match cmd.kind() {
            PushCommandKind::Create => tx.create(name, cmd.new_oid, "push"),
            PushCommandKind::Update => tx.update(name, cmd.old_oid, cmd.new_oid, "push"),
            PushCommandKind::Delete => tx.delete(name, cmd.old_oid, "push"),
        }
    }
    repo.refs().commit_transaction(tx)?;
    Ok(())
}

/// Write the `report-status` reply: `unpack ok|unpack <err>`, then one
/// `ok <ref>` or `ng <ref> <reason>` per command, terminated by flush.
pub fn write_report_status<W: std::io::Write>(
    writer: &mut PktLineWriter<W>,
    unpack_ok: bool,
    results: &[(String, CommandOutcome)],
) -> Result<(), ProtocolError> {
    if unpack_ok {
        writer.write_text("unpack ok")?;
    } else {
        writer.write_text("unpack failed")?;
    }
    for (ref_name, outcome) in results {
        match outcome {
            CommandOutcome::Ok => writer.write_text(&format!("ok {}", ref_name))?,
            CommandOutcome::Rejected(reason) => {
                writer.write_text(&format!("ng {} {}", ref_name, reason))?
            }
        }
    }
    writer.write_flush()?;
    Ok(())
}

/// Verify that a commit object referenced by a non-delete command exists
/// and parses as a commit, as part of structural packfile validation.
pub fn verify_commit_object(repo: &Repository, oid: &ObjectId) -> Result<Commit, ProtocolError> {
    match repo.odb().read(oid)? {
        Some(Object::Commit(c)) => Ok(c),
        Some(_) => Err(ProtocolError::Protocol(format!("{} is not a commit", oid))),
        None => Err(ProtocolError::Protocol(format!("missing object {}", oid))),
    }
}
