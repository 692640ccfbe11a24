//! In-Flight Call State
//!
//! `PendingCall` tracks a call this process issued and is awaiting an answer
//! for; `WorkItem` tracks a call a peer issued to this process. Both live in
//! the task tables of the `Node` handle that represents the remote side.

use serde_json::Value;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::oneshot;

use crate::cluster::types::NodeIdentity;

use super::types::TaskOutcome;

/// A call this process issued, awaiting a reply.
///
/// Lifecycle: created when the caller issues the call, fulfilled when an ack
/// is parsed, failed when the destination is confirmed gone. The encoded
/// request is kept so timeouts and nacks can resend it verbatim.
pub struct PendingCall {
    pub task_id: u64,
    pub target: NodeIdentity,
    /// Encoded request message, kept for resends.
    pub message: Vec<u8>,
    pub priority: i32,
    completer: Mutex<Option<oneshot::Sender<TaskOutcome>>>,
    started_at: AtomicU64,
    retry_ms: u64,
}

impl PendingCall {
    pub fn new(
        task_id: u64,
        target: NodeIdentity,
        message: Vec<u8>,
        priority: i32,
        now: u64,
        retry_ms: u64,
        completer: oneshot::Sender<TaskOutcome>,
    ) -> Self {
        Self {
            task_id,
            target,
            message,
            priority,
            completer: Mutex::new(Some(completer)),
            started_at: AtomicU64::new(now),
            retry_ms,
        }
    }

    /// Deliver the outcome to the waiting caller. Only the first delivery
    /// lands; later duplicates are dropped. Returns whether a caller was
    /// actually unblocked.
    pub fn fulfill(&self, outcome: TaskOutcome) -> bool {
        match self.completer.lock().unwrap().take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn fail(&self, reason: String) -> bool {
        self.fulfill(Err(reason))
    }

    pub fn started_at(&self) -> u64 {
        self.started_at.load(Ordering::SeqCst)
    }

    pub fn touch(&self, now: u64) {
        self.started_at.store(now, Ordering::SeqCst);
    }

    pub fn deadline_passed(&self, now: u64) -> bool {
        now.saturating_sub(self.started_at()) >= self.retry_ms
    }
}

/// An inbound task: in progress, or completed and awaiting confirmation.
///
/// The `computed` flag is monotonic; it never transitions back to false.
/// After the final confirmation (or abandonment) the recorded answer is
/// released exactly once and the item only survives until the watermark
/// rolls over it.
pub struct WorkItem {
    pub task_id: u64,
    pub caller: NodeIdentity,
    pub handler: String,
    computed: AtomicBool,
    replied: AtomicBool,
    released: AtomicBool,
    reply: Mutex<Option<TaskOutcome>>,
    started_at: AtomicU64,
    retry_ms: AtomicU64,
    ack_resends: AtomicU32,
    nack_resends: AtomicU32,
}

impl WorkItem {
    pub fn new(task_id: u64, caller: NodeIdentity, handler: String, now: u64, retry_ms: u64) -> Self {
        Self {
            task_id,
            caller,
            handler,
            computed: AtomicBool::new(false),
            replied: AtomicBool::new(false),
            released: AtomicBool::new(false),
            reply: Mutex::new(None),
            started_at: AtomicU64::new(now),
            retry_ms: AtomicU64::new(retry_ms),
            ack_resends: AtomicU32::new(0),
            nack_resends: AtomicU32::new(0),
        }
    }

    /// The shared placeholder standing in for every task already rolled into
    /// a node's watermark.
    pub(crate) fn golden(caller: NodeIdentity) -> Self {
        let item = Self::new(0, caller, String::new(), 0, 0);
        item.computed.store(true, Ordering::SeqCst);
        item.replied.store(true, Ordering::SeqCst);
        item.released.store(true, Ordering::SeqCst);
        item
    }

    /// Record the final answer. Happens once, after execution; the answer is
    /// kept so a missed ack can be resent without re-executing.
    pub fn record_answer(&self, outcome: TaskOutcome, now: u64, retry_ms: u64) {
        *self.reply.lock().unwrap() = Some(outcome);
        self.computed.store(true, Ordering::Release);
        self.started_at.store(now, Ordering::SeqCst);
        self.retry_ms.store(retry_ms, Ordering::SeqCst);
    }

    pub fn mark_replied(&self) {
        self.replied.store(true, Ordering::Release);
    }

    pub fn is_computed(&self) -> bool {
        self.computed.load(Ordering::Acquire)
    }

    pub fn is_replied(&self) -> bool {
        self.replied.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Atomically release the tracked answer. The winner (exactly one caller)
    /// gets `true` and must run the one-time acknowledgment hook.
    pub fn release(&self) -> bool {
        let won = self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.reply.lock().unwrap().take();
        }
        won
    }

    /// The answer to resend for a duplicate delivery, if any. Released items
    /// answer with a bare completion status: the caller provably consumed the
    /// real result before roll-up.
    pub fn resend_outcome(&self) -> Option<TaskOutcome> {
        if self.is_released() {
            return Some(Ok(Value::Null));
        }
        if self.is_computed() && self.is_replied() {
            return self.reply.lock().unwrap().clone();
        }
        None
    }

    pub fn started_at(&self) -> u64 {
        self.started_at.load(Ordering::SeqCst)
    }

    pub fn touch(&self, now: u64) {
        self.started_at.store(now, Ordering::SeqCst);
    }

    pub fn deadline_passed(&self, now: u64) -> bool {
        now.saturating_sub(self.started_at()) >= self.retry_ms.load(Ordering::SeqCst)
    }

    pub fn bump_ack_resend(&self) -> u32 {
        self.ack_resends.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn ack_resends(&self) -> u32 {
        self.ack_resends.load(Ordering::SeqCst)
    }

    pub fn bump_nack_resend(&self) -> u32 {
        self.nack_resends.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn nack_resends(&self) -> u32 {
        self.nack_resends.load(Ordering::SeqCst)
    }
}
