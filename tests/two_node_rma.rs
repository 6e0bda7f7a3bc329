//! Two-node RMA behavior: round trips, ordering flushes, chunking, and
//! the degenerate transfer shapes.

mod common;

use std::sync::Arc;

use common::{bring_up, cfgs_for};
use weft::fabric::mem::{MemFabric, TraceOp};
use weft::types::ConcurrencyCap;
use weft::{CommConfig, NodeId, NopDispatch};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn put_then_get_round_trips_bytewise() {
    let fabric = MemFabric::builder().nodes(2).build();
    let comms = bring_up(&fabric, cfgs_for("mem-dc", 2), Arc::new(NopDispatch)).await;

    let remote = vec![0u8; 512];
    let raddr = remote.as_ptr() as usize;
    let src: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
    let mut back = vec![0u8; 512];

    let c0 = Arc::clone(&comms[0]);
    let node1 = NodeId::from_usize(1);
    c0.put(src.as_ptr() as usize, node1, raddr, 512).await.unwrap();
    c0.get(back.as_mut_ptr() as usize, node1, raddr, 512)
        .await
        .unwrap();
    assert_eq!(back, src);
    // Misaligned slice of the same region.
    let mut odd = vec![0u8; 17];
    c0.get(odd.as_mut_ptr() as usize, node1, raddr + 3, 17)
        .await
        .unwrap();
    assert_eq!(odd, &src[3..20]);
    drop(remote);
}

/// Message-order provider, bound context: the injected PUT must
/// be followed by a one-byte dummy GET before the dependent GET runs.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ordering_layer_issues_dummy_get_between_put_and_get() {
    let fabric = MemFabric::builder().nodes(2).build();
    let cfgs: Vec<CommConfig> = (0..2)
        .map(|_| {
            CommConfig::builder()
                .provider_name("mem-mo")
                .max_parallelism(4)
                .fixed_threads(1)
                .build()
                .unwrap()
        })
        .collect();
    let comms = bring_up(&fabric, cfgs, Arc::new(NopDispatch)).await;

    let remote = vec![0u8; 8];
    let raddr = remote.as_ptr() as usize;
    fabric.clear_trace();

    let c0 = Arc::clone(&comms[0]);
    let node1 = NodeId::from_usize(1);
    c0.clone().spawn_task(async move {
        let x = [0xAAu8; 8];
        let mut y = [0u8; 8];
        c0.put(x.as_ptr() as usize, node1, raddr, 8).await.unwrap();
        c0.get(y.as_mut_ptr() as usize, node1, raddr, 8).await.unwrap();
        assert_eq!(y, [0xAA; 8]);
    })
    .await
    .unwrap();

    let ops: Vec<(TraceOp, usize)> = fabric
        .trace()
        .into_iter()
        .filter(|r| r.from == NodeId::from_usize(0) && r.to == NodeId::from_usize(1))
        .map(|r| (r.op, r.len))
        .collect();
    let inject_at = ops
        .iter()
        .position(|&(op, len)| op == TraceOp::InjectWrite && len == 8)
        .expect("bound context injects the small put");
    let dummy_at = ops
        .iter()
        .position(|&(op, len)| op == TraceOp::Read && len == 1)
        .expect("ordering layer issues a dummy get");
    let get_at = ops
        .iter()
        .position(|&(op, len)| op == TraceOp::Read && len == 8)
        .expect("the dependent get runs");
    assert!(inject_at < dummy_at && dummy_at < get_at);
    drop(remote);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transfers_chunk_at_max_msg_size() {
    let fabric = MemFabric::builder().nodes(2).max_msg_size(256).build();
    let comms = bring_up(&fabric, cfgs_for("mem-dc", 2), Arc::new(NopDispatch)).await;
    let node1 = NodeId::from_usize(1);

    let remote = vec![0u8; 1024];
    let raddr = remote.as_ptr() as usize;

    // Exactly the maximum: one chunk.
    let src = vec![7u8; 256];
    fabric.clear_trace();
    comms[0]
        .put(src.as_ptr() as usize, node1, raddr, 256)
        .await
        .unwrap();
    let writes: Vec<usize> = fabric
        .trace()
        .into_iter()
        .filter(|r| matches!(r.op, TraceOp::Write | TraceOp::InjectWrite))
        .map(|r| r.len)
        .collect();
    assert_eq!(writes, vec![256]);

    // One byte over: two chunks, the second of size 1.
    let src = vec![8u8; 257];
    fabric.clear_trace();
    comms[0]
        .put(src.as_ptr() as usize, node1, raddr, 257)
        .await
        .unwrap();
    let writes: Vec<usize> = fabric
        .trace()
        .into_iter()
        .filter(|r| matches!(r.op, TraceOp::Write | TraceOp::InjectWrite))
        .map(|r| r.len)
        .collect();
    assert_eq!(writes, vec![256, 1]);
    assert_eq!(remote[..257], vec![8u8; 257][..]);
    drop(remote);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_size_rma_performs_no_transfer() {
    let fabric = MemFabric::builder().nodes(2).build();
    let comms = bring_up(&fabric, cfgs_for("mem-dc", 2), Arc::new(NopDispatch)).await;
    fabric.clear_trace();
    let buf = [0u8; 8];
    comms[0]
        .put(buf.as_ptr() as usize, NodeId::from_usize(1), 0x1000, 0)
        .await
        .unwrap();
    comms[0]
        .get(buf.as_ptr() as usize, NodeId::from_usize(1), 0x1000, 0)
        .await
        .unwrap();
    assert!(fabric.trace().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn self_directed_rma_is_a_local_move() {
    let fabric = MemFabric::builder().nodes(2).build();
    let comms = bring_up(&fabric, cfgs_for("mem-dc", 2), Arc::new(NopDispatch)).await;
    fabric.clear_trace();
    let src = [3u8; 32];
    let dst = [0u8; 32];
    comms[0]
        .put(
            src.as_ptr() as usize,
            NodeId::from_usize(0),
            dst.as_ptr() as usize,
            32,
        )
        .await
        .unwrap();
    assert_eq!(dst, [3u8; 32]);
    assert!(fabric.trace().is_empty());
}

/// Basic-mode provider: user memory is unregistered, so PUT/GET stage
/// through bounce buffers or fall back to AM-mediated transfer.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn basic_mode_uses_registered_heap_and_am_fallback() {
    let fabric = MemFabric::builder().nodes(2).build();
    let cfgs: Vec<CommConfig> = (0..2)
        .map(|_| {
            CommConfig::builder()
                .provider_name("mem-basic")
                .max_parallelism(4)
                .concurrency(ConcurrencyCap::try_new(2).unwrap())
                .build()
                .unwrap()
        })
        .collect();
    let comms = bring_up(&fabric, cfgs, Arc::new(NopDispatch)).await;
    let node1 = NodeId::from_usize(1);

    // Remote address inside node 1's registered heap: the local side is a
    // plain Vec, so the engine bounces.
    let raddr = comms[1].alloc_registered(128, 8).unwrap();
    let src: Vec<u8> = (0..128u8).collect();
    comms[0]
        .put(src.as_ptr() as usize, node1, raddr, 128)
        .await
        .unwrap();
    let mut back = vec![0u8; 128];
    comms[0]
        .get(back.as_mut_ptr() as usize, node1, raddr, 128)
        .await
        .unwrap();
    assert_eq!(back, src);

    // Remote address outside any registered region: AM-mediated path, the
    // target does the transfer in the opposite direction.
    let target_side = vec![0u8; 64];
    let unregistered_raddr = target_side.as_ptr() as usize;
    let payload = vec![0x5Au8; 64];
    comms[0]
        .put(payload.as_ptr() as usize, node1, unregistered_raddr, 64)
        .await
        .unwrap();
    assert_eq!(target_side, vec![0x5A; 64]);

    let mut read_back = vec![0u8; 64];
    comms[0]
        .get(read_back.as_mut_ptr() as usize, node1, unregistered_raddr, 64)
        .await
        .unwrap();
    assert_eq!(read_back, vec![0x5A; 64]);
    comms[1].free_registered(raddr);
}
