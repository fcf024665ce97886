use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub type ClientId = u64;
pub type Seq = u64;

/// Identity of a logical client request.
///
/// Operation content is immutable per `(client, seq)`, so waiters are keyed by
/// this pair rather than by the full operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    pub client: ClientId,
    pub seq: Seq,
}

impl RequestId {
    pub fn new(client: ClientId, seq: Seq) -> Self {
        Self { client, seq }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Put,
    Append,
}

/// A client write as it travels through the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub key: String,
    pub value: String,
    pub client: ClientId,
    pub seq: Seq,
}

impl Operation {
    pub fn id(&self) -> RequestId {
        RequestId::new(self.client, self.seq)
    }
}

/// Identity of a read barrier: the proposing server plus a per-server nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BarrierId {
    pub origin: u64,
    pub nonce: u64,
}

/// Commands that flow through the Raft replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandPayload {
    Op(Operation),
    /// No-op entry used to push a new leader's term to commit before a read.
    Barrier(BarrierId),
}

impl CommandPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("encode command failed")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("decode command failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_and_barrier_survive_the_log_encoding() -> Result<()> {
        let op = CommandPayload::Op(Operation {
            kind: OpKind::Append,
            key: "x".into(),
            value: "2".into(),
            client: 7,
            seq: 3,
        });
        assert_eq!(CommandPayload::decode(&op.encode()?)?, op);

        let barrier = CommandPayload::Barrier(BarrierId { origin: 2, nonce: 9 });
        assert_eq!(CommandPayload::decode(&barrier.encode()?)?, barrier);
        Ok(())
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(CommandPayload::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn request_id_ignores_content() {
        let a = Operation {
            kind: OpKind::Put,
            key: "k".into(),
            value: "v".into(),
            client: 1,
            seq: 1,
        };
        let mut b = a.clone();
        b.value = "other".into();
        assert_eq!(a.id(), b.id());
    }
}
