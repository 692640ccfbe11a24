//! Per-Peer Node Handle
//!
//! One `Node` exists for every distinct identity this process has ever seen,
//! interned by the `NodeRegistry`. The handle carries all per-peer protocol
//! state: the outgoing task table, the incoming work ledger with its
//! completion watermark, the monotonic task-id counter, the bulk socket pool,
//! and the batched small-message queue with its sender task.
//!
//! ## Task Tables
//! Both tables are keyed by **node-local** task ids: the same integer means
//! different things depending on which node's table it lives in. Ids at or
//! below the completion watermark are complete-and-acknowledged and are no
//! longer tracked individually; a shared "golden completed" placeholder
//! stands in for all of them.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::rpc::call::{PendingCall, WorkItem};
use crate::rpc::types::now_ms;
use crate::transport::pool::SocketPool;
use crate::transport::sender::MessageQueue;

use super::types::{HeartBeat, NodeIdentity};

pub struct Node {
    pub identity: NodeIdentity,
    /// Dense integer index assigned at first sight. Unique within this
    /// process's view only; peers do not agree on indexes.
    pub local_index: u16,
    last_heard_from: AtomicU64,
    heartbeat: RwLock<HeartBeat>,
    /// Calls this process issued to this peer, keyed by task id.
    pub outgoing_tasks: DashMap<u64, Arc<PendingCall>>,
    /// Calls this peer issued to this process, keyed by task id.
    pub incoming_work: DashMap<u64, Arc<WorkItem>>,
    completion_watermark: AtomicU64,
    next_outgoing_task_id: AtomicU64,
    /// Small outbound frames awaiting batched transmission.
    pub outgoing: MessageQueue,
    /// Reusable bulk stream connections to this peer.
    pub pool: SocketPool,
    sender_task: Mutex<Option<JoinHandle<()>>>,
    golden: Arc<WorkItem>,
}

impl Node {
    pub(crate) fn new(identity: NodeIdentity, local_index: u16, cfg: &Config) -> Self {
        Self {
            identity,
            local_index,
            last_heard_from: AtomicU64::new(now_ms()),
            heartbeat: RwLock::new(HeartBeat::default()),
            outgoing_tasks: DashMap::new(),
            incoming_work: DashMap::new(),
            completion_watermark: AtomicU64::new(0),
            next_outgoing_task_id: AtomicU64::new(1),
            outgoing: MessageQueue::new(),
            pool: SocketPool::new(cfg.socket_pool_size),
            sender_task: Mutex::new(None),
            golden: Arc::new(WorkItem::golden(identity)),
        }
    }

    /// Record that we heard from this peer.
    pub fn touch(&self, now: u64) {
        self.last_heard_from.fetch_max(now, Ordering::SeqCst);
    }

    pub fn last_heard_from(&self) -> u64 {
        self.last_heard_from.load(Ordering::SeqCst)
    }

    pub fn heartbeat(&self) -> HeartBeat {
        self.heartbeat.read().unwrap().clone()
    }

    /// Replace the health snapshot wholesale. Returns true when the boot id
    /// changed, meaning the peer restarted and its task-id history is void.
    pub fn observe_heartbeat(&self, heartbeat: HeartBeat) -> bool {
        let mut slot = self.heartbeat.write().unwrap();
        let rebooted = slot.boot_millis != 0
            && heartbeat.boot_millis != 0
            && slot.boot_millis != heartbeat.boot_millis;
        *slot = heartbeat;
        rebooted
    }

    /// The next task id for a call sent *to* this peer. Ids are unique per
    /// destination, not globally, and start at 1.
    pub fn next_task_id(&self) -> u64 {
        self.next_outgoing_task_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn watermark(&self) -> u64 {
        self.completion_watermark.load(Ordering::Acquire)
    }

    /// Look up inbound work by task id. Ids at or below the watermark answer
    /// with the shared golden placeholder.
    pub fn has_work(&self, task_id: u64) -> Option<Arc<WorkItem>> {
        if task_id <= self.watermark() {
            return Some(self.golden.clone());
        }
        self.incoming_work.get(&task_id).map(|item| item.clone())
    }

    /// Record inbound work, or return the prior record if one exists.
    ///
    /// Returns `None` when the item is genuinely new work the caller must
    /// execute. First writer wins; a racing duplicate gets the winner's
    /// record back. The insert happens before the watermark check so that a
    /// task id is always either findable in the ledger or covered by the
    /// watermark, never neither; a very late duplicate packet can therefore
    /// never resurrect completed work.
    pub fn record_work(&self, item: Arc<WorkItem>) -> Option<Arc<WorkItem>> {
        use dashmap::mapref::entry::Entry;
        match self.incoming_work.entry(item.task_id) {
            Entry::Occupied(existing) => return Some(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(item.clone());
            }
        }
        if item.task_id > self.watermark() {
            return None;
        }
        // Bogus insert below the watermark: undo it and answer golden.
        self.incoming_work.remove(&item.task_id);
        Some(self.golden.clone())
    }

    /// Stop tracking inbound work after its final confirmation arrived.
    ///
    /// Releases the recorded answer exactly once (the winner runs
    /// `on_release`, which fires the payload's acknowledgment hook), then
    /// advances the watermark over every finished id contiguous with it.
    /// Gaps stop the advance: a finished-but-untracked hole could otherwise
    /// be mistaken for unknown work by a later duplicate.
    pub fn remove_work_tracking(&self, task_id: u64, on_release: impl FnOnce(&WorkItem)) {
        let Some(work) = self.incoming_work.get(&task_id).map(|item| item.clone()) else {
            return;
        };
        if work.release() {
            on_release(&work);
        }
        loop {
            let mark = self.completion_watermark.load(Ordering::Acquire);
            let next = match self.incoming_work.get(&(mark + 1)) {
                Some(item) => item.clone(),
                None => break,
            };
            if !next.is_released() {
                break;
            }
            if self
                .completion_watermark
                .compare_exchange(mark, mark + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                break;
            }
            self.incoming_work.remove(&(mark + 1));
        }
    }

    pub fn is_golden(&self, item: &Arc<WorkItem>) -> bool {
        Arc::ptr_eq(item, &self.golden)
    }

    /// Fail every pending outbound call to this peer. Returns how many were
    /// actually unblocked.
    pub fn fail_pending(&self, reason: &str) -> usize {
        let ids: Vec<u64> = self.outgoing_tasks.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, call)) = self.outgoing_tasks.remove(&id)
                && call.fail(reason.to_string())
            {
                failed += 1;
            }
        }
        failed
    }

    /// This peer restarted: task ids are only locally unique and a restarted
    /// process remembers nothing, so all tracked history is invalid.
    pub fn rebooted(&self) {
        self.incoming_work.clear();
        self.completion_watermark.store(0, Ordering::SeqCst);
    }

    pub(crate) fn sender_slot(&self) -> &Mutex<Option<JoinHandle<()>>> {
        &self.sender_task
    }

    /// Stop this node's sender task, if one was ever started.
    pub fn abort_background(&self) {
        if let Some(handle) = self.sender_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}
