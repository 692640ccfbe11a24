//! Batched Small-Message Sender
//!
//! Small messages are never shipped individually. They queue per destination
//! in priority order, and one sender task per node drains the queue,
//! concatenating as many frames as fit into a fixed-size buffer before
//! writing the whole buffer over a single persistent stream connection. The
//! connection is established lazily and re-established with capped
//! exponential backoff when it drops; transient faults never propagate to
//! the enqueuing caller.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::cluster::node::Node;
use crate::config::Config;

use super::framing;

/// Log every Nth consecutive connect/write failure at full volume.
const FAILURE_WARN_EVERY: u32 = 10;

/// One encoded frame awaiting batched transmission.
pub struct SmallMessage {
    priority: i32,
    seq: u64,
    pub frame: Vec<u8>,
}

impl SmallMessage {
    pub fn priority(&self) -> i32 {
        self.priority
    }
}

impl PartialEq for SmallMessage {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for SmallMessage {}

impl Ord for SmallMessage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority drains first; equal priority drains in enqueue
        // order.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for SmallMessage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority-biased queue feeding one destination's sender task.
pub struct MessageQueue {
    heap: Mutex<BinaryHeap<SmallMessage>>,
    pushed: Notify,
    next_seq: AtomicU64,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            pushed: Notify::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn push(&self, frame: Vec<u8>, priority: i32) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.heap.lock().unwrap().push(SmallMessage {
            priority,
            seq,
            frame,
        });
        self.pushed.notify_one();
    }

    /// Wait until a message is available and take the highest-priority one.
    pub async fn take(&self) -> SmallMessage {
        loop {
            if let Some(msg) = self.try_take() {
                return msg;
            }
            self.pushed.notified().await;
        }
    }

    pub fn try_take(&self) -> Option<SmallMessage> {
        self.heap.lock().unwrap().pop()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().unwrap().is_empty()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazily start the sender task for a node. Idempotent.
pub(crate) fn ensure_sender(node: &Arc<Node>, self_port: u16, cfg: Arc<Config>) {
    let mut slot = node.sender_slot().lock().unwrap();
    if slot.is_none() {
        let node = node.clone();
        *slot = Some(tokio::spawn(sender_loop(node, self_port, cfg)));
    }
}

async fn sender_loop(node: Arc<Node>, self_port: u16, cfg: Arc<Config>) {
    let mut conn: Option<TcpStream> = None;
    let mut buf: Vec<u8> = Vec::with_capacity(cfg.send_buffer_bytes);
    let mut failures: u32 = 0;
    loop {
        let mut next = Some(node.outgoing.take().await);
        while let Some(msg) = next {
            assert!(
                msg.frame.len() <= cfg.send_buffer_bytes,
                "small message larger than the send buffer; route it via the bulk path"
            );
            if buf.len() + msg.frame.len() > cfg.send_buffer_bytes {
                flush(&node, &mut conn, &mut buf, self_port, &cfg, &mut failures).await;
            }
            buf.extend_from_slice(&msg.frame);
            next = node.outgoing.try_take();
        }
        flush(&node, &mut conn, &mut buf, self_port, &cfg, &mut failures).await;
    }
}

/// Write the buffered frames out, (re)connecting as needed. Retries forever
/// with capped exponential backoff; the messages are already accepted, so
/// there is no caller to report to.
async fn flush(
    node: &Arc<Node>,
    conn: &mut Option<TcpStream>,
    buf: &mut Vec<u8>,
    self_port: u16,
    cfg: &Config,
    failures: &mut u32,
) {
    if buf.is_empty() {
        return;
    }
    let mut sleep_ms = 0u64;
    loop {
        if conn.is_none() {
            match open_small_channel(node, self_port).await {
                Ok(stream) => {
                    *conn = Some(stream);
                    *failures = 0;
                }
                Err(e) => {
                    *failures += 1;
                    if *failures == 1 || *failures % FAILURE_WARN_EVERY == 0 {
                        warn!(
                            "Failed to connect to {} ({} attempts): {}",
                            node.identity, failures, e
                        );
                    } else {
                        debug!("Failed to connect to {}: {}", node.identity, e);
                    }
                    sleep_ms = backoff(sleep_ms, cfg).await;
                    continue;
                }
            }
        }
        if let Some(stream) = conn.as_mut() {
            match stream.write_all(buf).await {
                Ok(()) => {
                    buf.clear();
                    return;
                }
                Err(e) => {
                    *conn = None;
                    *failures += 1;
                    if *failures == 1 || *failures % FAILURE_WARN_EVERY == 0 {
                        warn!(
                            "IO error sending batched bytes to {}, reconnecting: {}",
                            node.identity, e
                        );
                    } else {
                        debug!("IO error sending batched bytes to {}: {}", node.identity, e);
                    }
                    sleep_ms = backoff(sleep_ms, cfg).await;
                }
            }
        }
    }
}

async fn open_small_channel(node: &Node, self_port: u16) -> anyhow::Result<TcpStream> {
    let mut stream = TcpStream::connect((node.identity.addr, node.identity.port)).await?;
    stream.set_nodelay(true)?;
    stream
        .write_all(&framing::make_handshake(framing::KIND_SMALL, self_port))
        .await?;
    Ok(stream)
}

/// Sleep for the next backoff step and return it. Jitter avoids a thundering
/// herd of reconnecting peers.
async fn backoff(prev_ms: u64, cfg: &Config) -> u64 {
    let next = ((prev_ms + 1) * 2).min(cfg.reconnect_cap_ms);
    let jitter = rand::random::<u64>() % 50;
    tokio::time::sleep(Duration::from_millis(next + jitter)).await;
    next
}
