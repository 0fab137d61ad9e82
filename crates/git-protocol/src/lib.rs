//! Git smart-HTTP wire protocol implementation.
//!
//! This crate implements the server side of the git wire protocol: pkt-line
//! framing, side-band multiplexing, capability negotiation, and the
//! `upload-pack` (fetch/clone) and `receive-pack` (push) state machines.

pub mod capability;
pub mod pktline;
pub mod receive_pack;
pub mod sideband;
pub mod upload_pack;

/// Errors that can occur during protocol operations.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("push rejected: {0}")]
    PushRejected(String),

    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),

    #[error("invalid refspec: {0}")]
    InvalidRefSpec(String),

    #[error(transparent)]
    Pack(#[from] git_pack::PackError),

    #[error(transparent)]
    Ref(#[from] git_ref::RefError),

    #[error(transparent)]
    RevWalk(#[from] git_revwalk::RevWalkError),

    #[error(transparent)]
    Odb(#[from] git_odb::OdbError),

    #[error(transparent)]
    Config(#[from] git_config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
