//! Peer-to-peer transport for Raft messages.
//!
//! Messages are length-prefixed on a fresh TCP connection each:
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: protobuf-encoded `raft::prelude::Message`
//!
//! One listener thread accepts connections and hands each to a short-lived
//! thread that reads one message and forwards it to the worker.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use prost::Message as ProstMessage;
use raft::prelude::Message;
use tracing::{debug, warn};

/// Upper bound on a single frame. Snapshots travel inside `MsgSnapshot`, so
/// this caps the snapshot size as well.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Handle to the background listener; `stop` unblocks and ends it.
pub struct PeerListener {
    addr: String,
    stopped: Arc<AtomicBool>,
}

impl PeerListener {
    /// Binds `addr` and spawns the accept loop.
    ///
    /// Binding happens on the caller's thread so that an unusable address is
    /// reported as an error rather than a dead node.
    pub fn spawn(node_id: u64, addr: &str, tx: Sender<Message>) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("failed to bind {addr}"))?;
        let stopped = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stopped);

        thread::Builder::new()
            .name(format!("raft-net-listener-{node_id}"))
            .spawn(move || accept_loop(node_id, listener, tx, stop_flag))
            .context("failed to spawn network listener")?;

        Ok(Self {
            addr: addr.to_string(),
            stopped,
        })
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            // Wake the blocking accept so the loop can observe the flag.
            let _ = TcpStream::connect(&self.addr);
        }
    }
}

fn accept_loop(node_id: u64, listener: TcpListener, tx: Sender<Message>, stopped: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let tx = tx.clone();
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, tx) {
                        debug!(node = node_id, error = %err, "peer connection error");
                    }
                });
            }
            Err(err) => warn!(node = node_id, error = %err, "accept error"),
        }
    }
    debug!(node = node_id, "network listener stopped");
}

/// Reads a single Raft message from a TCP connection and forwards it to the worker.
fn handle_connection(mut stream: TcpStream, tx: Sender<Message>) -> io::Result<()> {
    let msg = read_frame(&mut stream)?;
    tx.send(msg)
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Message> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Message::decode(&buf[..]).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

pub fn write_frame<W: Write>(writer: &mut W, msg: &Message) -> io::Result<()> {
    let bytes = msg.encode_to_vec();
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()
}

/// Sends a Raft message to a peer on a fresh connection.
///
/// Raft tolerates lost messages, so failures are only logged.
pub fn send_message(addr: &str, msg: &Message) {
    let result = TcpStream::connect(addr).and_then(|mut stream| write_frame(&mut stream, msg));
    if let Err(err) = result {
        debug!(to = msg.to, addr, error = %err, "failed to send raft message");
    }
}
