//! Mesh Service
//!
//! Assembles the engine: node registry, transport, task dispatch, and the
//! retry scanner, behind one explicitly constructed service object.
//!
//! ## Call Flow
//! 1. **Submission**: the caller allocates a task id from the destination
//!    node's counter, records a `PendingCall`, and hands the encoded request
//!    to the transport (batched small-message path, or bulk for large
//!    payloads).
//! 2. **Execution**: the receiving side records the task in the caller's
//!    work ledger (first writer wins), executes it exactly once via the
//!    handler registry, and acks with the result.
//! 3. **Confirmation**: the caller consumes the result and ackacks; the
//!    receiver then releases the answer and rolls the task into the
//!    watermark. Lost packets at any step are repaired by the retry scanner.

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::cluster::membership::ClusterMembership;
use crate::cluster::node::Node;
use crate::cluster::registry::NodeRegistry;
use crate::cluster::types::NodeIdentity;
use crate::config::Config;
use crate::transport::{framing, listener, pool, sender};

use super::call::{PendingCall, WorkItem};
use super::registry::TaskHandlerRegistry;
use super::scanner;
use super::types::{
    PRIORITY_ACK, PRIORITY_ACKACK, PRIORITY_REQUEST, TaskOutcome, WireMessage, decode_outcome,
    encode_outcome, now_ms,
};

pub struct MeshService {
    pub registry: Arc<NodeRegistry>,
    pub handlers: Arc<TaskHandlerRegistry>,
    membership: Arc<dyn ClusterMembership>,
    cfg: Arc<Config>,
    self_node: Arc<Node>,
    tcp: Mutex<Option<TcpListener>>,
    udp: Arc<UdpSocket>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshService {
    /// Bind the node's sockets, register the self identity, and assemble the
    /// engine. Passing `addr: None` discovers the reachable address. Port 0
    /// binds an ephemeral port; the actually bound port becomes part of the
    /// self identity.
    pub async fn bind(
        addr: Option<Ipv4Addr>,
        port: u16,
        membership: Arc<dyn ClusterMembership>,
        handlers: Arc<TaskHandlerRegistry>,
        cfg: Config,
    ) -> Result<Arc<Self>> {
        let addr = match addr {
            Some(addr) => addr,
            None => NodeRegistry::discover_local_addr()?,
        };
        let tcp = TcpListener::bind((addr, port))
            .await
            .with_context(|| format!("failed to bind {}:{}", addr, port))?;
        let port = tcp.local_addr()?.port();
        let udp = UdpSocket::bind((addr, port))
            .await
            .with_context(|| format!("failed to bind udp {}:{}", addr, port))?;

        let cfg = Arc::new(cfg);
        let registry = Arc::new(NodeRegistry::new(cfg.clone()));
        let self_node = registry.register_self(addr, port)?;
        info!(
            "Node {} registered (local index {})",
            self_node.identity, self_node.local_index
        );

        Ok(Arc::new(Self {
            registry,
            handlers,
            membership,
            cfg,
            self_node,
            tcp: Mutex::new(Some(tcp)),
            udp: Arc::new(udp),
            background: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the background loops: TCP accept, UDP receive, retry scanner.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let tcp = self
            .tcp
            .lock()
            .unwrap()
            .take()
            .context("service already started")?;
        let mut background = self.background.lock().unwrap();
        background.push(tokio::spawn(listener::run_tcp(tcp, self.clone())));
        background.push(tokio::spawn(listener::run_udp(self.udp.clone(), self.clone())));
        background.push(tokio::spawn(scanner::run(self.clone())));
        info!("All background tasks started");
        Ok(())
    }

    /// Abort every background loop and per-node sender task. The background
    /// tasks hold the service alive, so this must be called for teardown.
    pub fn shutdown(&self) {
        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
        for node in self.registry.nodes() {
            node.abort_background();
        }
    }

    pub fn identity(&self) -> NodeIdentity {
        self.self_node.identity
    }

    pub fn self_node(&self) -> Arc<Node> {
        self.self_node.clone()
    }

    pub(crate) fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub(crate) fn membership(&self) -> &Arc<dyn ClusterMembership> {
        &self.membership
    }

    /// Fire a request without waiting for its result. Non-blocking for the
    /// caller; delivery and execution are still exactly-once. Returns the
    /// task id assigned to the call.
    pub fn send(&self, target: NodeIdentity, handler: &str, body: Value, priority: i32) -> Result<u64> {
        let node = self.registry.intern(target);
        let task_id = node.next_task_id();
        let msg = WireMessage::Request {
            task_id,
            sender: self.identity(),
            handler: handler.to_string(),
            body_json: body.to_string(),
        };
        self.transmit(&node, &msg, priority)?;
        Ok(task_id)
    }

    /// Submit a request and await the remote result. Resolves with an error
    /// when the destination is confirmed to have left the cluster; transient
    /// packet loss is absorbed by the retry machinery.
    pub async fn submit_and_await(
        &self,
        target: NodeIdentity,
        handler: &str,
        body: Value,
    ) -> Result<Value> {
        let node = self.registry.intern(target);
        let task_id = node.next_task_id();
        let msg = WireMessage::Request {
            task_id,
            sender: self.identity(),
            handler: handler.to_string(),
            body_json: body.to_string(),
        };
        let encoded = bincode::serialize(&msg)?;
        let (tx, rx) = oneshot::channel();
        let call = Arc::new(PendingCall::new(
            task_id,
            target,
            encoded.clone(),
            PRIORITY_REQUEST,
            now_ms(),
            self.cfg.retry_base_ms,
            tx,
        ));
        node.outgoing_tasks.insert(task_id, call);
        self.transmit_encoded(&node, encoded, PRIORITY_REQUEST);

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(anyhow!("call {} to {} failed: {}", task_id, target, reason)),
            Err(_) => Err(anyhow!("call {} to {} was dropped", task_id, target)),
        }
    }

    /// Best-effort single-datagram path. No framing, no retry, no delivery
    /// guarantee.
    pub async fn send_datagram(&self, target: NodeIdentity, msg: &WireMessage) -> Result<()> {
        let encoded = bincode::serialize(msg)?;
        self.udp
            .send_to(&encoded, (target.addr, target.port))
            .await?;
        Ok(())
    }

    pub(crate) fn transmit(&self, node: &Arc<Node>, msg: &WireMessage, priority: i32) -> Result<()> {
        let encoded = bincode::serialize(msg)?;
        self.transmit_encoded(node, encoded, priority);
        Ok(())
    }

    /// Route encoded bytes by size: the batched small-message path, or the
    /// pooled bulk path for anything above the small-message limit.
    pub(crate) fn transmit_encoded(&self, node: &Arc<Node>, encoded: Vec<u8>, priority: i32) {
        if encoded.len() <= self.cfg.small_message_limit {
            node.outgoing.push(framing::make_small_frame(&encoded), priority);
            sender::ensure_sender(node, self.identity().port, self.cfg.clone());
        } else {
            let node = node.clone();
            let self_port = self.identity().port;
            tokio::spawn(async move {
                if let Err(e) = pool::send_bulk(&node, self_port, &encoded).await {
                    tracing::warn!("Bulk send to {} failed: {}", node.identity, e);
                }
            });
        }
    }

    /// Hand a decoded inbound message to the protocol state machine.
    pub(crate) fn dispatch(self: &Arc<Self>, msg: WireMessage) {
        match msg {
            WireMessage::Request {
                task_id,
                sender,
                handler,
                body_json,
            } => self.handle_request(task_id, sender, handler, body_json),
            WireMessage::Ack {
                task_id,
                sender,
                result,
            } => self.handle_ack(task_id, sender, decode_outcome(result)),
            WireMessage::AckAck { task_id, sender } => self.handle_ackack(task_id, sender),
            WireMessage::Nack { task_id, sender } => self.handle_nack(task_id, sender),
        }
    }

    fn handle_request(self: &Arc<Self>, task_id: u64, sender: NodeIdentity, handler: String, body_json: String) {
        let node = self.registry.intern(sender);
        node.touch(now_ms());
        let item = Arc::new(WorkItem::new(
            task_id,
            sender,
            handler.clone(),
            now_ms(),
            self.cfg.retry_base_ms,
        ));
        match node.record_work(item.clone()) {
            None => {
                trace!("New task {} from {}", task_id, sender);
                let service = self.clone();
                tokio::spawn(async move {
                    let outcome: TaskOutcome = match serde_json::from_str::<Value>(&body_json) {
                        Ok(body) => service
                            .handlers
                            .execute(&handler, body)
                            .await
                            .map_err(|e| e.to_string()),
                        Err(e) => Err(format!("invalid request payload: {}", e)),
                    };
                    item.record_answer(outcome.clone(), now_ms(), service.cfg.retry_base_ms);
                    let node = service.registry.intern(sender);
                    service.send_ack(&node, task_id, &outcome);
                    item.mark_replied();
                });
            }
            Some(prior) => {
                // Duplicate delivery. Resend the recorded answer if there is
                // one; an in-flight computation replies on its own.
                match prior.resend_outcome() {
                    Some(outcome) => {
                        debug!("Re-acking duplicate task {} from {}", task_id, sender);
                        self.send_ack(&node, task_id, &outcome);
                    }
                    None => {
                        trace!("Duplicate task {} from {} is still computing", task_id, sender);
                    }
                }
            }
        }
    }

    pub(crate) fn send_ack(&self, node: &Arc<Node>, task_id: u64, outcome: &TaskOutcome) {
        let ack = WireMessage::Ack {
            task_id,
            sender: self.identity(),
            result: encode_outcome(outcome),
        };
        if let Err(e) = self.transmit(node, &ack, PRIORITY_ACK) {
            error!("Failed to encode ack for task {}: {}", task_id, e);
        }
    }

    fn handle_ack(&self, task_id: u64, sender: NodeIdentity, outcome: TaskOutcome) {
        let node = self.registry.intern(sender);
        node.touch(now_ms());
        if let Some((_, call)) = node.outgoing_tasks.remove(&task_id) {
            call.fulfill(outcome);
        } else {
            trace!("Ack for unknown call {} from {}", task_id, sender);
        }
        // Always confirm, duplicates included: the ackack is what licenses
        // the peer to forget the task.
        let ackack = WireMessage::AckAck {
            task_id,
            sender: self.identity(),
        };
        if let Err(e) = self.transmit(&node, &ackack, PRIORITY_ACKACK) {
            error!("Failed to encode ackack for task {}: {}", task_id, e);
        }
    }

    fn handle_ackack(&self, task_id: u64, sender: NodeIdentity) {
        let node = self.registry.intern(sender);
        node.touch(now_ms());
        let handlers = self.handlers.clone();
        node.remove_work_tracking(task_id, |work| handlers.acknowledge(&work.handler, work.task_id));
    }

    fn handle_nack(&self, task_id: u64, sender: NodeIdentity) {
        let node = self.registry.intern(sender);
        node.touch(now_ms());
        if let Some(call) = node.outgoing_tasks.get(&task_id).map(|c| c.clone()) {
            debug!("Nack for call {} from {}, resending request", task_id, sender);
            call.touch(now_ms());
            self.transmit_encoded(&node, call.message.clone(), call.priority);
        }
    }
}
