//! In-process client for a replica group.
//!
//! A [`Clerk`] tags every write with its client id and a fresh sequence
//! number, then keeps retrying the same request against replicas until one
//! accepts it. Because the sequence number is reused across retries, the
//! dedup ledger turns at-least-once delivery into exactly-once application.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::command::{ClientId, OpKind, Seq};
use crate::consensus::Consensus;
use crate::error::ClerkError;
use crate::rpc::{GetArgs, PutAppendArgs, Status};
use crate::server::KvServer;

const DEFAULT_RETRY_DEADLINE: Duration = Duration::from_secs(10);
const ROUND_BACKOFF: Duration = Duration::from_millis(20);

pub struct Clerk<C: Consensus> {
    servers: Vec<Arc<KvServer<C>>>,
    client_id: ClientId,
    next_seq: Seq,
    /// Index into `servers` of the replica that last answered.
    leader: usize,
    retry_deadline: Duration,
}

impl<C: Consensus> Clerk<C> {
    pub fn new(servers: Vec<Arc<KvServer<C>>>) -> Self {
        Self {
            servers,
            client_id: rand::random(),
            next_seq: 1,
            leader: 0,
            retry_deadline: DEFAULT_RETRY_DEADLINE,
        }
    }

    pub fn with_retry_deadline(mut self, deadline: Duration) -> Self {
        self.retry_deadline = deadline;
        self
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Returns the value of `key`, or an empty string if it does not exist.
    pub fn get(&mut self, key: &str) -> Result<String, ClerkError> {
        let args = GetArgs {
            key: key.to_string(),
        };
        self.retry(|server| {
            let reply = server.get(&args);
            match reply.status {
                Status::Ok => Attempt::Done(reply.value),
                Status::ErrNoKey => Attempt::Done(String::new()),
                _ => Attempt::Retry(reply.leader_hint),
            }
        })
    }

    pub fn put(&mut self, key: &str, value: &str) -> Result<(), ClerkError> {
        self.put_append(key, value, OpKind::Put)
    }

    pub fn append(&mut self, key: &str, value: &str) -> Result<(), ClerkError> {
        self.put_append(key, value, OpKind::Append)
    }

    fn put_append(&mut self, key: &str, value: &str, op: OpKind) -> Result<(), ClerkError> {
        let args = PutAppendArgs {
            key: key.to_string(),
            value: value.to_string(),
            op,
            client_id: self.client_id,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.retry(|server| {
            let reply = server.put_append(&args);
            match reply.status {
                Status::Ok => Attempt::Done(()),
                _ => Attempt::Retry(reply.leader_hint),
            }
        })
    }

    /// Tries the remembered leader first, then follows hints or walks the
    /// ring, backing off after each full round.
    fn retry<T>(&mut self, mut call: impl FnMut(&KvServer<C>) -> Attempt<T>) -> Result<T, ClerkError> {
        if self.servers.is_empty() {
            return Err(ClerkError::NoServers);
        }
        let started = Instant::now();
        let mut tried = 0;
        loop {
            let server = &self.servers[self.leader];
            match call(server.as_ref()) {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry(hint) => {
                    debug!(client = self.client_id, server = server.id(), ?hint, "retrying");
                    self.leader = hint
                        .and_then(|id| self.servers.iter().position(|s| s.id() == id))
                        .unwrap_or((self.leader + 1) % self.servers.len());
                }
            }

            tried += 1;
            if started.elapsed() >= self.retry_deadline {
                return Err(ClerkError::Unavailable(self.retry_deadline));
            }
            if tried % self.servers.len() == 0 {
                thread::sleep(ROUND_BACKOFF);
            }
        }
    }
}

enum Attempt<T> {
    Done(T),
    Retry(Option<u64>),
}
