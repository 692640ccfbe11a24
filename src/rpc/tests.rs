//! Delivery Protocol Tests
//!
//! Unit tests for the handler registry and outcome encoding, protocol-level
//! tests driving the dispatcher and scanner with an explicit clock, and an
//! end-to-end round trip between two engines on the loopback interface.
//!
//! ## Test Scopes
//! - **Registry**: handler registration, lookup, execution, ack hooks.
//! - **Exactly-Once**: duplicate and very-late deliveries never re-execute.
//! - **Retry Machinery**: ack resends, one-shot nacks, membership-loss
//!   failures, reboot resets.
//! - **End-to-End**: a real call across two bound services.

#[cfg(test)]
mod tests {
    use crate::cluster::membership::{ClusterMembership, StaticMembership};
    use crate::cluster::types::{HeartBeat, NodeIdentity};
    use crate::config::Config;
    use crate::rpc::registry::TaskHandlerRegistry;
    use crate::rpc::scanner;
    use crate::rpc::service::MeshService;
    use crate::rpc::types::{WireMessage, decode_outcome, encode_outcome, now_ms};
    use serde_json::json;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// A routable-but-dead peer: nothing listens on this port.
    fn dead_peer() -> NodeIdentity {
        NodeIdentity::new(Ipv4Addr::LOCALHOST, 9)
    }

    async fn bind_service(
        membership: Arc<StaticMembership>,
        handlers: Arc<TaskHandlerRegistry>,
    ) -> Arc<MeshService> {
        MeshService::bind(
            Some(Ipv4Addr::LOCALHOST),
            0,
            membership as Arc<dyn ClusterMembership>,
            handlers,
            Config::default(),
        )
        .await
        .expect("Failed to bind service")
    }

    /// Poll until `check` passes or the timeout elapses.
    async fn wait_for(check: impl Fn() -> bool, what: &str) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Timed out waiting for {}", what);
    }

    // ============================================================
    // TEST 1: TaskHandlerRegistry
    // ============================================================

    #[tokio::test]
    async fn test_registry_register_and_execute() {
        // ARRANGE: Create registry and call counter
        let registry = TaskHandlerRegistry::new();
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        // ACT: Register handler
        registry.register("test_handler", move |_body| {
            let count = call_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(json!("done"))
            }
        });

        // ASSERT: Handler is registered
        assert!(registry.has_handler("test_handler"));
        assert_eq!(registry.handler_count(), 1);

        // ACT: Execute
        let result = registry.execute("test_handler", json!({"x": 1})).await;

        // ASSERT: Handler was called
        assert_eq!(result.unwrap(), json!("done"));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registry_unknown_handler_returns_error() {
        let registry = TaskHandlerRegistry::new();

        let result = registry.execute("non_existent_handler", json!({})).await;

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Unknown task handler")
        );
    }

    #[tokio::test]
    async fn test_registry_ack_hook_fires_by_name() {
        let registry = TaskHandlerRegistry::new();
        let acked = Arc::new(AtomicUsize::new(0));
        let acked_clone = acked.clone();

        registry.register("job", |_body| async { Ok(json!(null)) });
        registry.on_acknowledged("job", move |_task_id| {
            acked_clone.fetch_add(1, Ordering::SeqCst);
        });

        registry.acknowledge("job", 7);
        registry.acknowledge("unregistered", 8);

        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    // ============================================================
    // TEST 2: Outcome encoding
    // ============================================================

    #[test]
    fn test_outcome_round_trip() {
        let ok = Ok(json!({"rows": [1, 2, 3]}));
        assert_eq!(decode_outcome(encode_outcome(&ok)), ok);

        let err = Err("boom".to_string());
        assert_eq!(decode_outcome(encode_outcome(&err)), err);
    }

    // ============================================================
    // TEST 3: End-to-end round trip over loopback
    // ============================================================

    #[tokio::test]
    async fn test_submit_and_await_round_trip() {
        let membership = StaticMembership::new();

        let a_handlers = TaskHandlerRegistry::new();
        let b_handlers = TaskHandlerRegistry::new();
        let executions = Arc::new(AtomicUsize::new(0));
        let executions_clone = executions.clone();
        b_handlers.register("echo", move |body| {
            let count = executions_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(body)
            }
        });

        let a = bind_service(membership.clone(), a_handlers).await;
        let b = bind_service(membership.clone(), b_handlers).await;
        membership.join(a.identity(), HeartBeat::default());
        membership.join(b.identity(), HeartBeat::default());
        a.start().unwrap();
        b.start().unwrap();

        // ACT: Round-trip a call
        let reply = tokio::time::timeout(
            Duration::from_secs(10),
            a.submit_and_await(b.identity(), "echo", json!({"n": 7})),
        )
        .await
        .expect("call timed out")
        .expect("call failed");

        // ASSERT: Result and exactly-once execution
        assert_eq!(reply, json!({"n": 7}));
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        // ASSERT: The ackack eventually rolls the task into B's watermark
        let caller = b.registry.intern(a.identity());
        wait_for(|| caller.watermark() >= 1, "watermark roll-up").await;
        assert!(caller.incoming_work.is_empty());

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_remote_handler_surfaces_error() {
        let membership = StaticMembership::new();
        let a = bind_service(membership.clone(), TaskHandlerRegistry::new()).await;
        let b = bind_service(membership.clone(), TaskHandlerRegistry::new()).await;
        membership.join(a.identity(), HeartBeat::default());
        membership.join(b.identity(), HeartBeat::default());
        a.start().unwrap();
        b.start().unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            a.submit_and_await(b.identity(), "nope", json!({})),
        )
        .await
        .expect("call timed out");

        let error = result.unwrap_err().to_string();
        assert!(error.contains("Unknown task handler"), "got: {}", error);

        a.shutdown();
        b.shutdown();
    }

    // ============================================================
    // TEST 4: Exactly-once under duplicate delivery
    // ============================================================

    #[tokio::test]
    async fn test_duplicate_request_never_reexecutes() {
        let membership = StaticMembership::new();
        let handlers = TaskHandlerRegistry::new();
        let executions = Arc::new(AtomicUsize::new(0));
        let executions_clone = executions.clone();
        handlers.register("count", move |_body| {
            let count = executions_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        });

        let service = bind_service(membership.clone(), handlers).await;
        let caller = dead_peer();
        membership.join(caller, HeartBeat::default());

        let request = WireMessage::Request {
            task_id: 1,
            sender: caller,
            handler: "count".to_string(),
            body_json: json!({}).to_string(),
        };

        // ACT: Deliver the same request twice
        service.dispatch(request.clone());
        service.dispatch(request.clone());

        let node = service.registry.intern(caller);
        wait_for(
            || node.incoming_work.get(&1).map(|w| w.is_replied()) == Some(true),
            "task execution",
        )
        .await;

        // ASSERT
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        // ACT: Roll the task up, then redeliver it very late
        service.dispatch(WireMessage::AckAck {
            task_id: 1,
            sender: caller,
        });
        assert_eq!(node.watermark(), 1);
        service.dispatch(request);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // ASSERT: Answered from the golden placeholder, not re-run
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(node.incoming_work.is_empty());
        assert!(node.is_golden(&node.has_work(1).unwrap()));

        service.shutdown();
    }

    // ============================================================
    // TEST 5: Dropped ackack is repaired by the scanner
    // ============================================================

    #[tokio::test]
    async fn test_scanner_resends_ack_until_ackack_arrives() {
        let membership = StaticMembership::new();
        let handlers = TaskHandlerRegistry::new();
        handlers.register("echo", |body| async move { Ok(body) });
        let acked = Arc::new(AtomicUsize::new(0));
        let acked_clone = acked.clone();
        handlers.on_acknowledged("echo", move |_task_id| {
            acked_clone.fetch_add(1, Ordering::SeqCst);
        });

        let service = bind_service(membership.clone(), handlers).await;
        let caller = dead_peer();
        membership.join(caller, HeartBeat::default());

        // ACT: B computes and acks; the caller's ackack never arrives
        service.dispatch(WireMessage::Request {
            task_id: 1,
            sender: caller,
            handler: "echo".to_string(),
            body_json: json!({"x": 1}).to_string(),
        });
        let node = service.registry.intern(caller);
        wait_for(
            || node.incoming_work.get(&1).map(|w| w.is_replied()) == Some(true),
            "task execution",
        )
        .await;
        let item = node.incoming_work.get(&1).unwrap().clone();
        assert_eq!(item.ack_resends(), 0);

        // ACT: The retry interval elapses; the scanner resends the ack
        let retry = service.cfg().retry_base_ms;
        scanner::scan_once(&service, now_ms() + retry + 50);

        // ASSERT
        assert_eq!(item.ack_resends(), 1);
        assert_eq!(node.watermark(), 0);

        // ACT: The ackack finally arrives
        service.dispatch(WireMessage::AckAck {
            task_id: 1,
            sender: caller,
        });

        // ASSERT: Rolled up, forgotten, hook fired once
        assert_eq!(node.watermark(), 1);
        assert!(node.incoming_work.get(&1).is_none());
        assert_eq!(acked.load(Ordering::SeqCst), 1);

        service.shutdown();
    }

    // ============================================================
    // TEST 6: Stalled work gets exactly one nack
    // ============================================================

    #[tokio::test]
    async fn test_scanner_nacks_uncomputed_work_once() {
        let membership = StaticMembership::new();
        let handlers = TaskHandlerRegistry::new();
        handlers.register("stall", |_body| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!(null))
        });

        let service = bind_service(membership.clone(), handlers).await;
        let caller = dead_peer();
        membership.join(caller, HeartBeat::default());

        service.dispatch(WireMessage::Request {
            task_id: 1,
            sender: caller,
            handler: "stall".to_string(),
            body_json: json!({}).to_string(),
        });
        let node = service.registry.intern(caller);
        wait_for(|| node.incoming_work.get(&1).is_some(), "work recording").await;
        let item = node.incoming_work.get(&1).unwrap().clone();

        let retry = service.cfg().retry_base_ms;
        scanner::scan_once(&service, now_ms() + retry + 50);
        assert_eq!(item.nack_resends(), 1);

        // Later passes must not nack again.
        scanner::scan_once(&service, now_ms() + 3 * retry);
        assert_eq!(item.nack_resends(), 1);

        service.shutdown();
    }

    // ============================================================
    // TEST 7: Membership loss fails pending calls in one pass
    // ============================================================

    #[tokio::test]
    async fn test_membership_loss_fails_all_pending_calls() {
        let membership = StaticMembership::new();
        let service = bind_service(membership.clone(), TaskHandlerRegistry::new()).await;
        let gone = dead_peer();
        // Never joined: the oracle confirms the peer is not a member.

        let mut callers = vec![];
        for _ in 0..3 {
            let service = service.clone();
            callers.push(tokio::spawn(async move {
                service.submit_and_await(gone, "echo", json!({})).await
            }));
        }
        let node = service.registry.intern(gone);
        wait_for(|| node.outgoing_tasks.len() == 3, "call registration").await;

        // ACT: A single scanner pass
        scanner::scan_once(&service, now_ms());

        // ASSERT: All three resolve as failed
        for caller in callers {
            let outcome = caller.await.unwrap();
            let error = outcome.unwrap_err().to_string();
            assert!(error.contains("left the cluster"), "got: {}", error);
        }
        assert!(node.outgoing_tasks.is_empty());

        service.shutdown();
    }

    // ============================================================
    // TEST 8: Reboot detection voids history
    // ============================================================

    #[tokio::test]
    async fn test_reboot_fails_pending_and_resets_watermark() {
        let membership = StaticMembership::new();
        let handlers = TaskHandlerRegistry::new();
        handlers.register("echo", |body| async move { Ok(body) });

        let service = bind_service(membership.clone(), handlers).await;
        let peer = dead_peer();
        membership.join(
            peer,
            HeartBeat {
                boot_millis: 100,
                ..Default::default()
            },
        );

        // Learn the first incarnation.
        let node = service.registry.intern(peer);
        scanner::scan_once(&service, now_ms());

        // Complete one inbound task so the watermark is non-zero.
        service.dispatch(WireMessage::Request {
            task_id: 1,
            sender: peer,
            handler: "echo".to_string(),
            body_json: json!({}).to_string(),
        });
        wait_for(
            || node.incoming_work.get(&1).map(|w| w.is_replied()) == Some(true),
            "task execution",
        )
        .await;
        service.dispatch(WireMessage::AckAck {
            task_id: 1,
            sender: peer,
        });
        assert_eq!(node.watermark(), 1);

        // Register a pending outbound call.
        let pending = {
            let service = service.clone();
            tokio::spawn(async move { service.submit_and_await(peer, "echo", json!({})).await })
        };
        wait_for(|| !node.outgoing_tasks.is_empty(), "call registration").await;

        // ACT: The peer comes back with a different boot stamp
        membership.set_heartbeat(
            peer,
            HeartBeat {
                boot_millis: 200,
                ..Default::default()
            },
        );
        scanner::scan_once(&service, now_ms());

        // ASSERT: History is void
        let error = pending.await.unwrap().unwrap_err().to_string();
        assert!(error.contains("rebooted"), "got: {}", error);
        assert_eq!(node.watermark(), 0);
        assert!(node.incoming_work.is_empty());
        assert!(node.outgoing_tasks.is_empty());

        service.shutdown();
    }
}
