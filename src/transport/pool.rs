//! Bulk Socket Pool
//!
//! Large payloads bypass the batched path and borrow a persistent stream
//! connection from a small fixed-size pool per destination. Claimants block
//! with periodic wake-ups when every slot is checked out, so concurrent bulk
//! traffic can never spawn unbounded sockets. Sockets found dead are retired
//! and the live-connection counter decremented exactly once.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

use crate::cluster::node::Node;

use super::framing;

pub struct SocketPool {
    state: Mutex<PoolState>,
    freed: Notify,
    live: AtomicUsize,
}

struct PoolState {
    slots: Vec<Option<TcpStream>>,
    avail: usize,
}

impl SocketPool {
    pub fn new(size: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                slots: (0..size).map(|_| None).collect(),
                avail: size,
            }),
            freed: Notify::new(),
            live: AtomicUsize::new(0),
        }
    }

    /// Claim a pool slot. Returns an existing open socket to reuse, or
    /// `None` when the caller must dial a fresh one (and report it via
    /// `note_opened`). Blocks with 1-second wake-ups while the pool is
    /// exhausted. Every claim must be paired with exactly one `release`.
    pub async fn claim(&self) -> Option<TcpStream> {
        loop {
            {
                let mut state = self.state.lock().await;
                if state.avail > 0 {
                    state.avail -= 1;
                    let idx = state.avail;
                    return match state.slots[idx].take() {
                        Some(sock) if socket_is_open(&sock) => Some(sock),
                        Some(_) => {
                            // Died while pooled: retire it, caller dials fresh.
                            self.live.fetch_sub(1, Ordering::SeqCst);
                            None
                        }
                        None => None,
                    };
                }
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), self.freed.notified()).await;
        }
    }

    /// Return a claimed slot, with or without a socket to pool. A socket
    /// found closed on release is retired instead of pooled.
    pub async fn release(&self, sock: Option<TcpStream>) {
        let sock = match sock {
            Some(sock) if socket_is_open(&sock) => Some(sock),
            Some(_) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                None
            }
            None => None,
        };
        let mut state = self.state.lock().await;
        let idx = state.avail;
        state.slots[idx] = sock;
        state.avail += 1;
        self.freed.notify_one();
    }

    /// Count a freshly dialed socket against the live-connection total.
    pub fn note_opened(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
    }

    /// Retire the socket held by the current claim without pooling it.
    pub fn discard_claimed(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Cheap liveness probe: an idle outbound socket has nothing to read, so
/// readable EOF (or any pending bytes at all) means it is no longer usable.
fn socket_is_open(sock: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match sock.try_read(&mut probe) {
        Ok(0) => false,
        Ok(_) => false,
        Err(e) if e.kind() == ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}

/// Ship one bulk frame to `node`, borrowing a pooled socket or dialing a
/// fresh one when the pool has no live socket to offer.
pub async fn send_bulk(node: &Node, self_port: u16, payload: &[u8]) -> Result<()> {
    let mut sock = match node.pool.claim().await {
        Some(sock) => sock,
        None => match open_bulk_channel(node, self_port).await {
            Ok(sock) => {
                node.pool.note_opened();
                sock
            }
            Err(e) => {
                node.pool.release(None).await;
                return Err(e);
            }
        },
    };
    let frame = framing::make_bulk_frame(payload);
    match sock.write_all(&frame).await {
        Ok(()) => {
            node.pool.release(Some(sock)).await;
            Ok(())
        }
        Err(e) => {
            drop(sock);
            node.pool.discard_claimed();
            node.pool.release(None).await;
            Err(e).with_context(|| format!("bulk send to {} failed", node.identity))
        }
    }
}

async fn open_bulk_channel(node: &Node, self_port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((node.identity.addr, node.identity.port))
        .await
        .with_context(|| format!("failed to connect to {}", node.identity))?;
    stream.set_nodelay(true)?;
    stream
        .write_all(&framing::make_handshake(framing::KIND_BULK, self_port))
        .await?;
    Ok(stream)
}
