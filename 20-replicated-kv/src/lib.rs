//! Raft-replicated key-value state machine.
//!
//! Clients send `Get`, `Put` and `Append` to whichever replica they believe
//! leads. Writes go through the Raft log and are applied by every replica in
//! commit order; a per-client ledger makes retried writes idempotent, and the
//! log is periodically folded into a snapshot so it stays bounded.
//!
//! # Architecture
//!
//! - **Request gateway** ([`server`]): leader gating, dedup check, submit, then
//!   block until the write is applied or leadership for its term is lost
//! - **Apply loop** ([`apply`]): the only writer of the store; resolves waiters
//!   and triggers snapshots
//! - **Snapshot installer** ([`apply`]): replaces state with a leader's snapshot
//! - **Raft worker** ([`runtime`]): drives tikv/raft and publishes commits,
//!   snapshots and leadership
//! - **Network listener** ([`transport`]): forwards peer messages to the worker
//!
//! Threads talk over crossbeam channels. Replica state sits behind one
//! `parking_lot::Mutex` that is never held while blocking or while talking to
//! the Raft worker.
//!
//! # Modules
//!
//! - [`command`]: what travels through the Raft log
//! - [`store`], [`ledger`], [`pending`], [`state`]: replica state
//! - [`snapshot`]: versioned snapshot codec
//! - [`consensus`]: the contract the state machine needs from consensus
//! - [`node`], [`log_store`], [`runtime`], [`transport`]: the Raft-backed implementation
//! - [`client`]: retrying in-process clerk
//! - [`protocol`]: REPL command parsing

pub mod apply;
pub mod client;
pub mod command;
pub mod config;
pub mod consensus;
pub mod error;
pub mod ledger;
pub mod log_store;
pub mod node;
pub mod pending;
pub mod protocol;
pub mod rpc;
pub mod runtime;
pub mod server;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod topology;
pub mod transport;
