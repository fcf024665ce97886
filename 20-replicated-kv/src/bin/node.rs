//! CLI entry point for running one replica with a line-oriented REPL.
//!
//! Commands typed at the prompt go to this replica's request gateway; writes
//! and reads only succeed on the leader. Logs go to stderr, filtered by
//! `RUST_LOG` (default `info`).
//!
//! # Example usage
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin node -- \
//!   --id 1 --listen 127.0.0.1:7101 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! # Terminals 2 and 3: same peers, --id 2/3 and their own --listen
//! ```

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};

use replicated_kv::command::OpKind;
use replicated_kv::config::{ServerConfig, SnapshotPolicy};
use replicated_kv::protocol::{ConsoleCommand, HELP_TEXT};
use replicated_kv::rpc::{GetArgs, PutAppendArgs, Status};
use replicated_kv::server::KvServer;
use replicated_kv::runtime::RaftHandle;

/// Command-line arguments for a replica.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run one replica of the replicated key-value store")]
struct Args {
    /// Numeric node ID (must match one entry in --peer)
    #[arg(long)]
    id: u64,

    /// Address this node should listen on for Raft messages, e.g. 127.0.0.1:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    listen: String,

    /// Comma-separated peer map: id=addr,id=addr,... (must include self)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,

    /// Snapshot once the raft log exceeds this many bytes; negative disables
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    max_raft_state: i64,

    /// How long a read waits for its barrier entry before answering anyway
    #[arg(long, default_value_t = 100)]
    read_barrier_ms: u64,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

/// A REPL session writes as one client with its own sequence numbers.
struct Session {
    server: KvServer<RaftHandle>,
    client_id: u64,
    next_seq: u64,
}

impl Session {
    /// Returns `false` when the user asked to exit.
    fn execute(&mut self, line: &str) -> Result<bool> {
        match ConsoleCommand::parse(line) {
            Ok(ConsoleCommand::Put { key, value }) => self.write(key, value, OpKind::Put),
            Ok(ConsoleCommand::Append { key, value }) => self.write(key, value, OpKind::Append),
            Ok(ConsoleCommand::Get { key }) => {
                let reply = self.server.get(&GetArgs { key: key.clone() });
                match reply.status {
                    Status::Ok => println!("{key} = {}", reply.value),
                    Status::ErrNoKey => println!("{key} not found"),
                    other => println!("{other:?} (leader: {})", describe_leader(reply.leader_hint)),
                }
            }
            Ok(ConsoleCommand::Status) => {
                let raft = match self.server.raft_status() {
                    Ok(raft) => raft,
                    Err(err) => {
                        println!("ERROR: {err:#}");
                        return Ok(true);
                    }
                };
                let status = self.server.status();
                println!(
                    "Node {} | Term: {} | Role: {:?} | Leader: {} | Applied: {} | Snapshot: {} | Log: {} bytes",
                    raft.node_id,
                    raft.term,
                    raft.role,
                    raft.leader_id,
                    status.applied_index,
                    raft.snapshot_index,
                    raft.log_bytes
                );
                if status.entries.is_empty() {
                    println!("  Store: empty");
                }
                for (k, v) in &status.entries {
                    println!("  {k} = {v}");
                }
            }
            Ok(ConsoleCommand::Campaign) => match self.server.campaign() {
                Ok(()) => println!("Campaign started"),
                Err(err) => println!("ERROR: {err:#}"),
            },
            Ok(ConsoleCommand::Help) => println!("{HELP_TEXT}"),
            Ok(ConsoleCommand::Exit) => return Ok(false),
            Err(err) => println!("ERROR: {err}"),
        }
        Ok(true)
    }

    fn write(&mut self, key: String, value: String, op: OpKind) {
        let args = PutAppendArgs {
            key: key.clone(),
            value,
            op,
            client_id: self.client_id,
            seq: self.next_seq,
        };
        // Every typed command is a new request, even after a failed attempt.
        self.next_seq += 1;
        let reply = self.server.put_append(&args);
        match reply.status {
            Status::Ok => println!("OK: {op:?} {key}"),
            other => println!("{other:?} (leader: {})", describe_leader(reply.leader_hint)),
        }
    }
}

fn describe_leader(hint: Option<u64>) -> String {
    hint.map_or_else(|| "unknown".to_string(), |id| id.to_string())
}

fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let peers = parse_peers(&args.peer)?;

    // Validate that this node's ID maps to its listen address
    if peers.get(&args.id).map(String::as_str) != Some(args.listen.as_str()) {
        return Err(anyhow::anyhow!(
            "self id {} must map to listen addr {} via --peer entries",
            args.id,
            args.listen
        ));
    }

    let config = ServerConfig::new(args.id, args.listen.clone(), peers)
        .with_snapshot(SnapshotPolicy::from_max_raft_state(args.max_raft_state))
        .with_read_barrier_grace(Duration::from_millis(args.read_barrier_ms));
    let server = KvServer::start(&config)?;

    let mut session = Session {
        server,
        client_id: rand::random(),
        next_seq: 1,
    };

    println!("Node {} ready. Type HELP for commands.", args.id);
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("{}> ", args.id);
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        if !session.execute(&line)? {
            break;
        }
    }

    session.server.kill();
    Ok(())
}

/// Parses command-line peer entries in the form "id=addr".
fn parse_peers(entries: &[String]) -> Result<HashMap<u64, String>> {
    let mut peers = HashMap::new();
    for entry in entries {
        let Some((id_str, addr)) = entry.split_once('=') else {
            return Err(anyhow::anyhow!(
                "invalid peer entry '{entry}', expected id=addr"
            ));
        };
        let id: u64 = id_str
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        peers.insert(id, addr.to_string());
    }
    if peers.is_empty() {
        return Err(anyhow::anyhow!(
            "at least one --peer entry is required (include self)"
        ));
    }
    Ok(peers)
}
