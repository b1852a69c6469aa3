// ABOUTME: Integration tests for signal and poll correlation through execution contexts
// ABOUTME: Exercises duplicate signals, the missing-signal window, backend outages and aggregation

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use waypoint::backends::{BackendRegistry, ProbeStatus};
use waypoint::engine::{ContextStatus, ContextStore, ExecutionContext};
use waypoint::operation::{OperationId, FORCE_FAILED_EXIT_CODE};
use waypoint::signal::{
    Correlator, CorrelatorConfig, InMemorySignalTransport, Signal, SignalQueue, SignalTransport,
};

fn setup(window_secs: u64) -> (Correlator, BackendRegistry, Arc<ScriptedBackend>) {
    let backend = ScriptedBackend::new();
    let registry = BackendRegistry::new().with_backend(backend.clone());
    let correlator = Correlator::new(CorrelatorConfig {
        missing_signal_window: Duration::from_secs(window_secs),
        stall_wakeups: 0,
    });
    (correlator, registry, backend)
}

fn context_with(ids: &[(&str, u32)]) -> ExecutionContext {
    let mut context = ExecutionContext::new("wait");
    for (host, pid) in ids {
        context
            .add_operation(scripted_operation(host, *pid, START_TIME, "task-1"))
            .unwrap();
    }
    context
}

#[tokio::test]
async fn test_duplicate_signal_is_applied_once() {
    let (correlator, registry, _) = setup(600);
    let id: OperationId = "server1:42@1000".parse().unwrap();
    let mut context = context_with(&[("server1", 42)]);
    let mut queue = SignalQueue::new();

    let signal = Signal::completion("task-1", id.clone(), 0, 1_010);
    assert!(queue.enqueue(signal.clone()));
    assert_eq!(context.process_signals(&mut queue), 1);

    assert!(!queue.enqueue(signal));
    queue.enqueue(Signal::completion("task-1", id.clone(), 1, 1_020));
    assert_eq!(context.process_signals(&mut queue), 0);

    let status = context.get_status(&correlator, &registry, 1_030).await.unwrap();
    assert_eq!(status, ContextStatus::Success);
    assert_eq!(context.result(&id).unwrap().exit_code().unwrap(), 0);
}

#[tokio::test]
async fn test_missing_signal_window_forces_failure() {
    let (correlator, registry, backend) = setup(60);
    let id = OperationId::remote("server1", 42, START_TIME);
    let mut context = context_with(&[("server1", 42)]);
    backend.set_status(&id, ProbeStatus::Unknown);

    for now in [1_000, 1_030, 1_060] {
        let status = context.get_status(&correlator, &registry, now).await.unwrap();
        assert_eq!(status, ContextStatus::Wait, "still inside the window at {}", now);
    }

    let status = context.get_status(&correlator, &registry, 1_061).await.unwrap();
    assert_eq!(status, ContextStatus::Fail);
    let result = context.result(&id).unwrap();
    assert_eq!(result.exit_code().unwrap(), FORCE_FAILED_EXIT_CODE);
    assert!(result.exit_message().unwrap().contains("server1:42@1000"));
}

#[tokio::test]
async fn test_backend_outage_keeps_waiting() {
    let (correlator, registry, backend) = setup(60);
    let id = OperationId::remote("server1", 42, START_TIME);
    let mut context = context_with(&[("server1", 42)]);

    backend.set_unavailable(true);
    for now in [1_000, 2_000, 3_000] {
        let status = context.get_status(&correlator, &registry, now).await.unwrap();
        assert_eq!(status, ContextStatus::Wait);
    }
    assert_eq!(context.wait().polls, 3);
    assert_eq!(context.wait().started_at, Some(1_000));

    backend.set_unavailable(false);
    backend.finish(&id, 0);
    let status = context.get_status(&correlator, &registry, 3_010).await.unwrap();
    assert_eq!(status, ContextStatus::Success);
}

#[tokio::test]
async fn test_failure_dominates_outstanding_work() {
    let (correlator, registry, backend) = setup(600);
    let mut context = context_with(&[("server1", 1), ("server2", 2)]);
    backend.finish(&OperationId::remote("server2", 2, START_TIME), 2);

    let status = context.get_status(&correlator, &registry, 1_010).await.unwrap();
    assert_eq!(status, ContextStatus::Fail);
    assert_eq!(context.outstanding(), 1);

    // Repeated checks never convert the finished operation twice
    let again = context.get_status(&correlator, &registry, 1_020).await.unwrap();
    assert_eq!(again, ContextStatus::Fail);
    assert_eq!(context.results().count(), 1);
}

#[tokio::test]
async fn test_transport_feeds_only_its_owner() {
    let transport = InMemorySignalTransport::new();
    let id = OperationId::remote("server1", 42, START_TIME);
    let mine = Signal::completion("task-1", id.clone(), 0, 1_001);
    let theirs = Signal::completion("task-2", id, 0, 1_002);
    let mine_id = mine.signal_id;

    transport.deliver(mine.clone()).await;
    transport.deliver(mine).await;
    transport.deliver(theirs).await;
    assert_eq!(transport.len().await, 2);

    let pending = transport.pending_for_owner("task-1").await.unwrap();
    assert_eq!(pending.len(), 1);

    assert!(transport.mark_consumed(mine_id).await.unwrap());
    assert!(!transport.mark_consumed(mine_id).await.unwrap());
    assert!(transport.pending_for_owner("task-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_linked_contexts_share_operations() {
    let (correlator, registry, backend) = setup(600);
    let id = OperationId::remote("server1", 42, START_TIME);
    let mut store = ContextStore::new();

    store
        .get_mut("launch")
        .unwrap()
        .add_operation(scripted_operation("server1", 42, START_TIME, "task-1"))
        .unwrap();
    store.link("verify", "launch").unwrap();

    backend.finish(&id, 0);
    let status = store
        .get_mut("verify")
        .unwrap()
        .get_status(&correlator, &registry, 1_010)
        .await
        .unwrap();
    assert_eq!(status, ContextStatus::Success);
    assert!(store.get("launch").unwrap().result(&id).is_some());
    assert_eq!(store.tracked_ids().len(), 1);
}
