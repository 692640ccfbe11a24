//! Retry Scanner
//!
//! A single periodic pass across every known node, roughly once per second,
//! re-arming whatever the network dropped: unconfirmed acks are resent at a
//! constant interval, stalled inbound work gets one nack, timed-out outbound
//! requests are resent, and calls to departed peers are failed. The pass also
//! refreshes each node's heartbeat snapshot from the membership oracle, which
//! is where peer reboots are detected.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, trace, warn};

use crate::cluster::node::Node;
use crate::rpc::call::{PendingCall, WorkItem};

use super::service::MeshService;
use super::types::{PRIORITY_NACK, WireMessage, now_ms};

/// Warn about repeated ack resends only this often, to avoid log storms
/// under a partition.
const ACK_RESEND_WARN_EVERY: u32 = 5;

pub(crate) async fn run(service: Arc<MeshService>) {
    loop {
        let started = now_ms();
        scan_once(&service, started);
        // Keep a steady cadence: sleep whatever the scan itself left over.
        let elapsed = now_ms().saturating_sub(started);
        let interval = service.cfg().scanner_interval_ms;
        if elapsed < interval {
            tokio::time::sleep(Duration::from_millis(interval - elapsed)).await;
        }
    }
}

/// One full pass. Split out from the loop so tests can drive it with an
/// explicit clock.
pub(crate) fn scan_once(service: &Arc<MeshService>, now: u64) {
    let self_node = service.self_node();
    for node in service.registry.nodes() {
        if Arc::ptr_eq(&node, &self_node) {
            continue;
        }
        if let Some(heartbeat) = service.membership().heartbeat_of(&node.identity)
            && node.observe_heartbeat(heartbeat)
        {
            warn!("Node {} rebooted, discarding task history", node.identity);
            node.fail_pending("node rebooted");
            node.rebooted();
        }
        let member = service.membership().is_member(&node.identity);
        let client = node.heartbeat().client;
        scan_incoming(service, &node, now, member, client);
        scan_outgoing(service, &node, now, member, client);
    }
}

fn scan_incoming(service: &Arc<MeshService>, node: &Arc<Node>, now: u64, member: bool, client: bool) {
    let items: Vec<Arc<WorkItem>> = node
        .incoming_work
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    for item in items {
        if !item.deadline_passed(now) {
            continue;
        }
        let abandoned = if client {
            now.saturating_sub(item.started_at()) >= service.cfg().client_grace_ms
        } else {
            !member
        };
        if abandoned {
            info!(
                "Dropping task {} from departed peer {}",
                item.task_id, node.identity
            );
            let handlers = service.handlers.clone();
            node.remove_work_tracking(item.task_id, |work| {
                handlers.acknowledge(&work.handler, work.task_id)
            });
        } else if item.is_computed() {
            if item.is_replied()
                && let Some(outcome) = item.resend_outcome()
            {
                let resends = item.bump_ack_resend();
                if resends % ACK_RESEND_WARN_EVERY == 0 {
                    warn!(
                        "Got {} resends on ack for task {} to {}",
                        resends, item.task_id, node.identity
                    );
                }
                item.touch(now);
                service.send_ack(node, item.task_id, &outcome);
            }
        } else if item.nack_resends() == 0 {
            // Not computed and the caller has gone quiet: nack once to
            // prompt a fresh request rather than silently stalling.
            item.bump_nack_resend();
            item.touch(now);
            let nack = WireMessage::Nack {
                task_id: item.task_id,
                sender: service.identity(),
            };
            if let Err(e) = service.transmit(node, &nack, PRIORITY_NACK) {
                error!("Failed to encode nack for task {}: {}", item.task_id, e);
            }
        }
    }
}

fn scan_outgoing(service: &Arc<MeshService>, node: &Arc<Node>, now: u64, member: bool, client: bool) {
    let calls: Vec<Arc<PendingCall>> = node
        .outgoing_tasks
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    for call in calls {
        let lost = if client {
            now.saturating_sub(call.started_at()) >= service.cfg().client_grace_ms
        } else {
            !member
        };
        if lost {
            if let Some((_, call)) = node.outgoing_tasks.remove(&call.task_id) {
                warn!(
                    "Failing call {} to {}: peer left the cluster",
                    call.task_id, node.identity
                );
                call.fail(format!("node {} left the cluster", node.identity));
            }
        } else if call.deadline_passed(now) {
            trace!("Resending request {} to {}", call.task_id, node.identity);
            call.touch(now);
            service.transmit_encoded(node, call.message.clone(), call.priority);
        }
    }
}
