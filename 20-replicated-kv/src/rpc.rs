//! Request and reply types of the client-facing API.

use serde::{Deserialize, Serialize};

use crate::command::{ClientId, OpKind, Operation, Seq};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    ErrNoKey,
    ErrWrongLeader,
    ErrTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReply {
    pub status: Status,
    /// Empty unless `status` is `Ok`.
    pub value: String,
    pub leader_hint: Option<u64>,
}

impl GetReply {
    pub fn found(value: String) -> Self {
        Self {
            status: Status::Ok,
            value,
            leader_hint: None,
        }
    }

    pub fn failed(status: Status, leader_hint: Option<u64>) -> Self {
        Self {
            status,
            value: String::new(),
            leader_hint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub op: OpKind,
    pub client_id: ClientId,
    pub seq: Seq,
}

impl PutAppendArgs {
    pub fn to_operation(&self) -> Operation {
        Operation {
            kind: self.op,
            key: self.key.clone(),
            value: self.value.clone(),
            client: self.client_id,
            seq: self.seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub status: Status,
    pub leader_hint: Option<u64>,
}

impl PutAppendReply {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            leader_hint: None,
        }
    }

    pub fn wrong_leader(leader_hint: Option<u64>) -> Self {
        Self {
            status: Status::ErrWrongLeader,
            leader_hint,
        }
    }
}
