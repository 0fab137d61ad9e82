//! Smart-HTTP server harness.
//!
//! Owns the two endpoints a Smart-HTTP transport needs: `GET info/refs`
//! (advertisement) and `POST git-upload-pack`/`git-receive-pack`
//! (service RPC). The actual HTTP plumbing (routing, TLS, request
//! bodies) is left to whatever web framework the deployment picks;
//! this crate only needs a repository, a byte body, and somewhere to
//! write a byte response.

pub mod config;

use std::io::Cursor;

use git_protocol::pktline::{PktLineReader, PktLineWriter};
use git_protocol::{receive_pack, upload_pack, ProtocolError};
use git_repository::Repository;

pub use config::ServerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Repo(#[from] git_repository::RepoError),
}

/// The two services a Smart-HTTP server answers requests for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    pub fn from_query_param(value: &str) -> Option<Self> {
        match value {
            "git-upload-pack" => Some(Service::UploadPack),
            "git-receive-pack" => Some(Service::ReceivePack),
            _ => None,
        }
    }

    pub fn content_type_advertisement(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-advertisement",
            Service::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    pub fn content_type_result(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-result",
            Service::ReceivePack => "application/x-git-receive-pack-result",
        }
    }
}

/// Handle `GET /<repo>/info/refs?service=<service>`.
///
/// Writes the service announcement (`# service=git-upload-pack\n` framed
/// as a pkt-line, then a flush) followed by the ref advertisement for
/// that service.
pub fn handle_info_refs(repo: &Repository, service: Service) -> Result<Vec<u8>, ServerError> {
    let mut out = Vec::new();
    {
        let mut writer = PktLineWriter::new(&mut out);
        let service_name = match service {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        };
        writer.write_line(format!("# service={}\n", service_name).as_bytes())?;
        writer.write_flush()?;
        match service {
            Service::UploadPack => upload_pack::advertise_refs(repo, &mut writer)?,
            Service::ReceivePack => receive_pack::advertise_refs(repo, &mut writer)?,
        }
    }
    Ok(out)
}

/// Handle `POST /<repo>/git-upload-pack` (fetch/clone negotiation and
/// pack generation). `body` is the full request payload.
pub fn handle_upload_pack(repo: &Repository, body: &[u8]) -> Result<Vec<u8>, ServerError> {
    let mut reader = PktLineReader::new(Cursor::new(body));
    let request = upload_pack::read_fetch_request(&mut reader)?;

    let mut out = Vec::new();
    {
        let mut writer = PktLineWriter::new(&mut out);
        let negotiation = upload_pack::negotiate(repo, &request, &mut writer)?;
        if request.done {
            let sideband = request.capabilities.has("side-band-64k")
                || request.capabilities.has("side-band");
            upload_pack::generate_fetch_pack(
                repo,
                &request.wants,
                &negotiation.common,
                request.capabilities.has("include-tag"),
                sideband,
                &mut writer,
            )?;
        }
    }
    Ok(out)
}

/// Handle `POST /<repo>/git-receive-pack` (push). `body` is the full
/// request payload (commands, optional push-options, then packfile).
/// `protected_globs`/`force_allowed` come from server policy
/// (`ServerConfig`), not from the request itself.
pub fn handle_receive_pack(
    repo: &Repository,
    body: &[u8],
    protected_globs: &[String],
    force_allowed: bool,
) -> Result<Vec<u8>, ServerError> {
    let mut reader = PktLineReader::new(Cursor::new(body));
    let request = receive_pack::read_push_request(&mut reader)?;

    let mut outcomes = Vec::with_capacity(request.commands.len());
    for cmd in &request.commands {
        let outcome =
            receive_pack::validate_command(repo, cmd, protected_globs, force_allowed)?;
        outcomes.push((cmd.clone(), outcome));
    }

    receive_pack::apply_commands(repo, &outcomes)?;

    let mut out = Vec::new();
    {
        let mut writer = PktLineWriter::new(&mut out);
        let results: Vec<(String, receive_pack::CommandOutcome)> = outcomes
            .into_iter()
            .map(|(cmd, outcome)| (cmd.ref_name, outcome))
            .collect();
        receive_pack::write_report_status(&mut writer, true, &results)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_round_trips_through_query_param() {
        assert_eq!(Service::from_query_param("git-upload-pack"), Some(Service::UploadPack));
        assert_eq!(Service::from_query_param("git-receive-pack"), Some(Service::ReceivePack));
        assert_eq!(Service::from_query_param("nonsense"), None);
    }

    #[test]
    fn content_types_distinguish_services() {
        assert_ne!(
            Service::UploadPack.content_type_advertisement(),
            Service::ReceivePack.content_type_advertisement()
        );
    }
}
