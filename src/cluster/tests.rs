//! Cluster Module Tests
//!
//! Validates identities, the interning registry, and the per-node task
//! bookkeeping.
//!
//! ## Test Scopes
//! - **Identity**: canonical ordering, equality, wire round-trips.
//! - **Registry**: handle identity under interning, dense index stability,
//!   self registration.
//! - **Node Ledger**: idempotent work recording, watermark roll-up, reboot
//!   semantics.

#[cfg(test)]
mod tests {
    use crate::cluster::node::Node;
    use crate::cluster::registry::NodeRegistry;
    use crate::cluster::types::{HeartBeat, NodeIdentity};
    use crate::config::Config;
    use crate::rpc::call::{PendingCall, WorkItem};
    use crate::rpc::types::PRIORITY_REQUEST;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn identity(last_octet: u8, port: u16) -> NodeIdentity {
        NodeIdentity::new(Ipv4Addr::new(10, 0, 0, last_octet), port)
    }

    fn test_node() -> Node {
        Node::new(identity(1, 5000), 1, &Config::default())
    }

    fn work(task_id: u64) -> Arc<WorkItem> {
        Arc::new(WorkItem::new(task_id, identity(1, 5000), "echo".to_string(), 0, 200))
    }

    // ============================================================
    // NODE IDENTITY
    // ============================================================

    #[test]
    fn test_identity_equality() {
        assert_eq!(identity(1, 5000), identity(1, 5000));
        assert_ne!(identity(1, 5000), identity(1, 5001));
        assert_ne!(identity(1, 5000), identity(2, 5000));
    }

    #[test]
    fn test_identity_ordering_is_address_then_port() {
        // Address dominates, port breaks ties.
        assert!(identity(1, 9000) < identity(2, 1));
        assert!(identity(1, 5000) < identity(1, 5001));

        // High unsigned octets must not compare as negative.
        let high = NodeIdentity::new(Ipv4Addr::new(200, 0, 0, 1), 1);
        let low = NodeIdentity::new(Ipv4Addr::new(10, 0, 0, 1), 9000);
        assert!(low < high);
    }

    #[test]
    fn test_identity_wire_round_trip() {
        let original = identity(7, 54321);

        let encoded = bincode::serialize(&original).expect("Serialization failed");
        let restored: NodeIdentity =
            bincode::deserialize(&encoded).expect("Deserialization failed");

        assert_eq!(original, restored);
    }

    // ============================================================
    // REGISTRY: INTERNING AND DENSE INDEX
    // ============================================================

    #[test]
    fn test_intern_returns_same_handle() {
        let registry = NodeRegistry::new(Arc::new(Config::default()));

        let first = registry.intern(identity(1, 5000));
        let second = registry.intern(identity(1, 5000));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_intern_assigns_distinct_indices() {
        let registry = NodeRegistry::new(Arc::new(Config::default()));

        let mut seen = HashSet::new();
        for i in 0..20u16 {
            let node = registry.intern(identity(1, 5000 + i));
            assert!(node.local_index > 0, "index 0 is never assigned");
            assert!(seen.insert(node.local_index), "index reused");
        }
        assert_eq!(registry.len(), 20);
    }

    #[test]
    fn test_by_local_index_resolves_interned_nodes() {
        let registry = NodeRegistry::new(Arc::new(Config::default()));

        let node = registry.intern(identity(3, 7000));
        let resolved = registry.by_local_index(node.local_index).unwrap();

        assert!(Arc::ptr_eq(&node, &resolved));
        assert!(registry.by_local_index(0).is_none());
        assert!(registry.by_local_index(999).is_none());
    }

    #[test]
    fn test_concurrent_interning_is_stable() {
        let registry = Arc::new(NodeRegistry::new(Arc::new(Config::default())));

        let mut threads = vec![];
        for _ in 0..8 {
            let registry = registry.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..100u16 {
                    registry.intern(identity((i % 50) as u8 + 1, 4000 + i));
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }

        // Every thread interned the same 100 identities.
        assert_eq!(registry.len(), 100);

        let mut seen = HashSet::new();
        for node in registry.nodes() {
            assert!(seen.insert(node.local_index), "index reused across nodes");
            let resolved = registry.by_local_index(node.local_index).unwrap();
            assert!(Arc::ptr_eq(&node, &resolved));
        }
    }

    #[test]
    fn test_register_self_is_one_time() {
        let registry = NodeRegistry::new(Arc::new(Config::default()));

        let own = registry.register_self(Ipv4Addr::new(10, 0, 0, 1), 5000).unwrap();
        assert!(Arc::ptr_eq(&own, &registry.self_node().unwrap()));

        let again = registry.register_self(Ipv4Addr::new(10, 0, 0, 1), 5001);
        assert!(again.is_err());
    }

    // ============================================================
    // NODE: TASK ID COUNTER AND HEARTBEAT
    // ============================================================

    #[test]
    fn test_task_ids_start_at_one_and_increase() {
        let node = test_node();

        assert_eq!(node.next_task_id(), 1);
        assert_eq!(node.next_task_id(), 2);
        assert_eq!(node.next_task_id(), 3);
    }

    #[test]
    fn test_heartbeat_replaced_wholesale_and_reboot_detected() {
        let node = test_node();

        // First report is never a reboot, whatever the boot stamp.
        let first = HeartBeat {
            boot_millis: 100,
            load: 0.5,
            task_capacity: 8,
            client: false,
        };
        assert!(!node.observe_heartbeat(first.clone()));
        assert_eq!(node.heartbeat(), first);

        // Same boot stamp: same incarnation.
        assert!(!node.observe_heartbeat(first.clone()));

        // Changed boot stamp: the peer restarted.
        let restarted = HeartBeat {
            boot_millis: 200,
            ..first
        };
        assert!(node.observe_heartbeat(restarted));
    }

    // ============================================================
    // NODE: WORK LEDGER AND WATERMARK
    // ============================================================

    #[test]
    fn test_record_work_is_first_writer_wins() {
        let node = test_node();

        let first = work(1);
        assert!(node.record_work(first.clone()).is_none());

        // A racing duplicate gets the winner's record back.
        let duplicate = work(1);
        let prior = node.record_work(duplicate).unwrap();
        assert!(Arc::ptr_eq(&prior, &first));
    }

    #[test]
    fn test_rolled_up_ids_answer_golden() {
        let node = test_node();

        assert!(node.record_work(work(1)).is_none());
        node.remove_work_tracking(1, |_| {});
        assert_eq!(node.watermark(), 1);
        assert!(node.incoming_work.get(&1).is_none());

        // A very late duplicate of the rolled-up task must not look new.
        let resurrected = node.record_work(work(1)).unwrap();
        assert!(node.is_golden(&resurrected));
        assert!(node.incoming_work.get(&1).is_none(), "bogus insert must be undone");

        let looked_up = node.has_work(1).unwrap();
        assert!(node.is_golden(&looked_up));
    }

    #[test]
    fn test_watermark_never_skips_a_gap() {
        let node = test_node();

        for id in 1..=3 {
            assert!(node.record_work(work(id)).is_none());
        }

        // Finishing 2 first cannot advance past the unfinished 1.
        node.remove_work_tracking(2, |_| {});
        assert_eq!(node.watermark(), 0);
        assert!(node.incoming_work.get(&2).is_some());

        // Finishing 1 rolls the contiguous prefix 1..=2.
        node.remove_work_tracking(1, |_| {});
        assert_eq!(node.watermark(), 2);
        assert!(node.incoming_work.get(&1).is_none());
        assert!(node.incoming_work.get(&2).is_none());
        assert!(node.incoming_work.get(&3).is_some());

        node.remove_work_tracking(3, |_| {});
        assert_eq!(node.watermark(), 3);
    }

    #[test]
    fn test_release_hook_fires_exactly_once() {
        let node = test_node();
        assert!(node.record_work(work(1)).is_none());

        let mut calls = 0;
        node.remove_work_tracking(1, |_| calls += 1);
        assert_eq!(calls, 1);

        // Recreate a tracking lookup via the golden path; no second release.
        let mut more_calls = 0;
        node.remove_work_tracking(1, |_| more_calls += 1);
        assert_eq!(more_calls, 0);
    }

    #[test]
    fn test_reboot_resets_ledger_and_watermark() {
        let node = test_node();

        assert!(node.record_work(work(1)).is_none());
        node.remove_work_tracking(1, |_| {});
        assert!(node.record_work(work(2)).is_none());
        assert_eq!(node.watermark(), 1);

        node.rebooted();

        assert_eq!(node.watermark(), 0);
        assert!(node.incoming_work.is_empty());
    }

    // ============================================================
    // NODE: PENDING CALLS
    // ============================================================

    #[tokio::test]
    async fn test_fail_pending_unblocks_every_caller() {
        let node = test_node();

        let mut receivers = vec![];
        for task_id in 1..=3u64 {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let call = Arc::new(PendingCall::new(
                task_id,
                node.identity,
                vec![],
                PRIORITY_REQUEST,
                0,
                200,
                tx,
            ));
            node.outgoing_tasks.insert(task_id, call);
            receivers.push(rx);
        }

        assert_eq!(node.fail_pending("node left the cluster"), 3);
        assert!(node.outgoing_tasks.is_empty());

        for rx in receivers {
            let outcome = rx.await.expect("caller must be unblocked");
            assert!(outcome.is_err());
        }
    }

    #[test]
    fn test_pending_call_fulfills_only_once() {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        let call = PendingCall::new(1, identity(1, 5000), vec![], PRIORITY_REQUEST, 0, 200, tx);

        assert!(call.fulfill(Ok(serde_json::json!(42))));
        assert!(!call.fulfill(Ok(serde_json::json!(43))));
        assert!(!call.fail("too late".to_string()));

        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.unwrap(), serde_json::json!(42));
    }
}
