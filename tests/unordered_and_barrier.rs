//! Task-local batching and the split-phase tree barrier.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::{bring_up, cfgs_for};
use weft::batch::BatchKinds;
use weft::fabric::mem::MemFabric;
use weft::{AmoOp, AmoType, NodeId, NopDispatch};

/// A batch of 64 x 256 B unordered PUTs spread over three
/// target nodes; after the fence, the owners' memory holds the values.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unordered_put_batch_lands_after_fence() {
    let fabric = MemFabric::builder().nodes(4).build();
    let comms = bring_up(&fabric, cfgs_for("mem-mo", 4), Arc::new(NopDispatch)).await;

    // One region per target node, each receiving a third of the batch.
    let regions: Vec<Vec<u8>> = (0..3).map(|_| vec![0u8; 64 * 256]).collect();
    let raddrs: Vec<usize> = regions.iter().map(|r| r.as_ptr() as usize).collect();

    let c0 = Arc::clone(&comms[0]);
    let raddrs_clone = raddrs.clone();
    c0.clone().spawn_task(async move {
        for i in 0..64usize {
            let target = i % 3;
            let src = vec![(i + 1) as u8; 256];
            c0.put_unordered(
                src.as_ptr() as usize,
                NodeId::from_usize(target + 1),
                raddrs_clone[target] + (i / 3) * 256,
                256,
            )
            .await
            .unwrap();
        }
        c0.task_fence(BatchKinds::PUT).await.unwrap();
    })
    .await
    .unwrap();

    // Owning-node reads observe the batched values.
    for i in 0..64usize {
        let target = i % 3;
        let off = (i / 3) * 256;
        assert_eq!(
            regions[target][off..off + 256],
            vec![(i + 1) as u8; 256][..],
            "batched put {i} must be visible at its owner"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unordered_amo_batch_accumulates() {
    let fabric = MemFabric::builder().nodes(2).build();
    let comms = bring_up(&fabric, cfgs_for("mem-dc", 2), Arc::new(NopDispatch)).await;

    let obj = Box::new(0u64);
    let obj_addr = &*obj as *const u64 as usize;
    let c0 = Arc::clone(&comms[0]);
    c0.clone().spawn_task(async move {
        for _ in 0..64 {
            c0.amo_unordered(NodeId::from_usize(1), obj_addr, AmoOp::Add, AmoType::U64, 1)
                .await
                .unwrap();
        }
        c0.task_fence(BatchKinds::AMO).await.unwrap();
    })
    .await
    .unwrap();
    assert_eq!(*obj, 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unordered_get_batch_fills_local_buffers() {
    let fabric = MemFabric::builder().nodes(2).build();
    let comms = bring_up(&fabric, cfgs_for("mem-dc", 2), Arc::new(NopDispatch)).await;

    let remote: Vec<u8> = (0..1024u32).map(|i| (i % 241) as u8).collect();
    let raddr = remote.as_ptr() as usize;
    let c0 = Arc::clone(&comms[0]);
    let expected = remote.clone();
    c0.clone().spawn_task(async move {
        let mut locals = vec![vec![0u8; 64]; 16];
        for (i, l) in locals.iter_mut().enumerate() {
            c0.get_unordered(
                l.as_mut_ptr() as usize,
                NodeId::from_usize(1),
                raddr + i * 64,
                64,
            )
            .await
            .unwrap();
        }
        c0.task_fence(BatchKinds::GET).await.unwrap();
        for (i, l) in locals.iter().enumerate() {
            assert_eq!(&l[..], &expected[i * 64..(i + 1) * 64]);
        }
    })
    .await
    .unwrap();
    drop(remote);
}

/// Task end flushes and frees every buffer even without an explicit
/// fence.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn task_end_drains_pending_batches() {
    let fabric = MemFabric::builder().nodes(2).build();
    let comms = bring_up(&fabric, cfgs_for("mem-mo", 2), Arc::new(NopDispatch)).await;

    let region = vec![0u8; 256];
    let raddr = region.as_ptr() as usize;
    let c0 = Arc::clone(&comms[0]);
    c0.clone().spawn_task(async move {
        let src = vec![0xEEu8; 256];
        // Buffered, never explicitly fenced; spawn_task ends the task.
        c0.put_unordered(src.as_ptr() as usize, NodeId::from_usize(1), raddr, 256)
            .await
            .unwrap();
    })
    .await
    .unwrap();
    assert_eq!(region, vec![0xEE; 256]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tree_barrier_synchronizes_rounds() {
    let fabric = MemFabric::builder().nodes(3).build();
    let comms = bring_up(&fabric, cfgs_for("mem-mo", 3), Arc::new(NopDispatch)).await;

    let counter = Arc::new(AtomicU64::new(0));
    let handles: Vec<_> = comms
        .iter()
        .map(|c| {
            let c = Arc::clone(c);
            let counter = Arc::clone(&counter);
            c.clone().spawn_task(async move {
                for round in 0..5u64 {
                    if c.node().as_usize() == 0 {
                        counter.fetch_add(1, Ordering::AcqRel);
                    }
                    c.barrier().await.unwrap();
                    // Every node observes node 0's increment for this
                    // round before anyone starts the next.
                    assert_eq!(counter.load(Ordering::Acquire), round + 1);
                    c.barrier().await.unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(counter.load(Ordering::Acquire), 5);
}
