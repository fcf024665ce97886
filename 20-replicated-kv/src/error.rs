//! Typed errors that callers match on. Plumbing failures use `anyhow`.

use thiserror::Error;

/// Why the consensus module refused a proposal.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },

    #[error("consensus module stopped")]
    Stopped,

    #[error("proposal rejected: {0}")]
    Rejected(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is empty")]
    Empty,

    #[error("unsupported snapshot format version {0}")]
    UnsupportedVersion(u8),

    #[error("snapshot encoding failed: {0}")]
    Codec(#[from] bincode::Error),
}

#[derive(Debug, Error)]
pub enum ClerkError {
    #[error("no replica accepted the request within {0:?}")]
    Unavailable(std::time::Duration),

    #[error("clerk has no servers")]
    NoServers,
}
