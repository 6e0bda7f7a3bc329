//! Execute-on (active message) behavior: inline and large payloads,
//! blocking completion, fast inline bodies, liveness, and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Recorder, bring_up, cfgs_for};
use weft::fabric::mem::MemFabric;
use weft::types::LivenessIntervalSecs;
use weft::{CommConfig, NodeId, NopDispatch};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocking_execute_on_with_inline_payload() {
    let fabric = MemFabric::builder().nodes(2).build();
    let recorder = Arc::new(Recorder::default());
    let comms = bring_up(&fabric, cfgs_for("mem-dc", 2), recorder.clone()).await;

    let payload = vec![9u8; 100];
    comms[0]
        .execute_on(NodeId::from_usize(1), 42, &payload, true)
        .await
        .unwrap();
    // Blocking means the body ran before the call returned.
    let calls = recorder.calls();
    assert!(calls.contains(&(42, payload)));
}

/// Blocking execute-on whose payload exceeds the inline cap.
/// The target pulls the payload over RMA, runs the body, and writes the
/// done byte back.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocking_execute_on_with_large_payload() {
    let fabric = MemFabric::builder().nodes(4).build();
    let recorder = Arc::new(Recorder::default());
    let comms = bring_up(&fabric, cfgs_for("mem-mo", 4), recorder.clone()).await;

    let payload: Vec<u8> = (0..2048u32).map(|i| (i % 253) as u8).collect();
    comms[0]
        .execute_on(NodeId::from_usize(3), 7, &payload, true)
        .await
        .unwrap();
    let calls = recorder.calls();
    assert!(calls.contains(&(7, payload)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nonblocking_large_payload_copy_is_freed_by_op_free() {
    let fabric = MemFabric::builder().nodes(2).build();
    let recorder = Arc::new(Recorder::default());
    let comms = bring_up(&fabric, cfgs_for("mem-dc", 2), recorder.clone()).await;

    let payload = vec![0xC3u8; 4096];
    comms[0]
        .execute_on(NodeId::from_usize(1), 11, &payload, false)
        .await
        .unwrap();
    assert_eq!(comms[0].pending_payload_copies(), 1);

    // The handler pulls the payload, sends opFree back, runs the body.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if comms[0].pending_payload_copies() == 0 && recorder.calls().iter().any(|(f, _)| *f == 11)
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "opFree never came");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(recorder.calls().contains(&(11, payload)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fast_execute_on_runs_inline_and_self_target_short_circuits() {
    let fabric = MemFabric::builder().nodes(2).build();
    let recorder = Arc::new(Recorder::default());
    let comms = bring_up(&fabric, cfgs_for("mem-dc", 2), recorder.clone()).await;

    comms[0]
        .execute_on_fast(NodeId::from_usize(1), 1, b"fast", true)
        .await
        .unwrap();
    comms[0]
        .execute_on(NodeId::from_usize(0), 2, b"self", true)
        .await
        .unwrap();
    let calls = recorder.calls();
    assert!(calls.contains(&(1, b"fast".to_vec())));
    assert!(calls.contains(&(2, b"self".to_vec())));

    // Oversized fast payloads are refused outright.
    let too_big = vec![0u8; 2000];
    assert!(
        comms[0]
            .execute_on_fast(NodeId::from_usize(1), 3, &too_big, false)
            .await
            .is_err()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn node_zero_paces_liveness_probes() {
    let fabric = MemFabric::builder().nodes(2).build();
    let cfgs: Vec<CommConfig> = (0..2)
        .map(|_| {
            let mut cfg = common::cfg_for("mem-dc");
            cfg.enable_liveness = true;
            cfg.liveness_interval_secs = LivenessIntervalSecs::try_new(1).unwrap();
            cfg
        })
        .collect();
    let comms = bring_up(&fabric, cfgs, Arc::new(NopDispatch)).await;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(comms[0].liveness_probes_sent() >= 1);
    // Only node 0 probes.
    assert_eq!(comms[1].liveness_probes_sent(), 0);
}

/// Shutdown propagates by opcode, everyone meets the barrier,
/// handlers exit.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_propagates_and_tears_down_handlers() {
    let fabric = MemFabric::builder().nodes(3).build();
    let comms = bring_up(&fabric, cfgs_for("mem-dc", 3), Arc::new(NopDispatch)).await;

    let handles: Vec<_> = comms
        .iter()
        .map(|c| {
            let c = Arc::clone(c);
            tokio::spawn(async move { c.shutdown().await })
        })
        .collect();
    for h in handles {
        h.await.unwrap().unwrap();
    }
    for c in &comms {
        assert!(!c.am_alive());
    }
}
