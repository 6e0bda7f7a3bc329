//! Ordering and visibility (the memory-consistency core)
//!
//! On a delivery-complete provider a PUT's completion implies the target
//! can see it, and this module has nothing to do. On a message-order
//! provider injected PUTs are only ordered, not visible, so each task
//! records the target node in its put bitmap; before any operation that
//! depends on those PUTs, a one-byte dummy GET from the target's ordering
//! ghost word, issued on the same transmit context, exploits
//! read-after-write ordering to force them into visibility, and the bit
//! is cleared.
//!
//! Everything else in the crate is written as if it may issue operations
//! freely and call the flush entry points at the designated program
//! points.

use tokio::task::yield_now;
use tracing::trace;

use crate::error::{CommError, CommResult};
use crate::runtime::Comm;
use crate::tci::{Tci, TciGuard, ride_out_eagain, wait_tx_done};
use crate::types::NodeId;

impl Comm {
    /// Records an injected PUT whose visibility has not been forced.
    pub(crate) fn record_put(&self, node: NodeId) {
        if self.have_dc {
            return;
        }
        self.tasks.with_put_bitmap(|bm| bm.set(node));
    }

    pub(crate) fn clear_put_bit(&self, node: NodeId) {
        self.tasks.with(|t| {
            if let Some(bm) = &mut t.put_bitmap {
                bm.clear(node);
            }
        });
    }

    fn put_bit_set(&self, node: NodeId) -> bool {
        self.tasks
            .with(|t| t.put_bitmap.as_ref().is_some_and(|bm| bm.test(node)))
    }

    /// Waits out a delayed nonblocking-AMO done parked in task state.
    pub(crate) async fn retire_delayed_done(&self) -> CommResult<()> {
        let Some(done) = self.tasks.with(|t| t.am_done_pending.take()) else {
            return Ok(());
        };
        trace!("retiring delayed amo done");
        while !done.is_set() {
            yield_now().await;
        }
        self.free_done(done);
        Ok(())
    }

    /// Forces visibility of prior PUTs to `node`, if any.
    pub(crate) async fn flush_one(&self, tci: &Tci, node: NodeId) -> CommResult<()> {
        self.retire_delayed_done().await?;
        if self.have_dc || !self.put_bit_set(node) {
            return Ok(());
        }
        self.dummy_get(tci, node).await?;
        self.clear_put_bit(node);
        Ok(())
    }

    /// Forces visibility of every outstanding PUT this task issued.
    pub(crate) async fn flush_all(&self, tci: &Tci) -> CommResult<()> {
        self.retire_delayed_done().await?;
        if self.have_dc {
            return Ok(());
        }
        let nodes: Vec<NodeId> = self.tasks.with(|t| {
            t.put_bitmap
                .as_ref()
                .map(|bm| bm.for_each_set().collect())
                .unwrap_or_default()
        });
        for node in nodes {
            self.dummy_get(tci, node).await?;
            self.clear_put_bit(node);
        }
        Ok(())
    }

    /// Acquires a context and fences one node; for callers that do not
    /// already hold one.
    pub(crate) async fn flush_node(&self, node: NodeId) -> CommResult<()> {
        let tci = self.alloc_tci().await?;
        self.flush_one(&tci, node).await
    }

    /// One-byte GET from `node`'s ghost word. Read-after-write ordering on
    /// the endpoint pair makes every earlier PUT visible before this
    /// completes. The fetched contents are meaningless.
    async fn dummy_get(&self, tci: &Tci, node: NodeId) -> CommResult<()> {
        let ghost = self.ghost_addrs[node.as_usize()];
        let (key, offset) = self
            .resolve_remote(node, ghost, 1)
            .ok_or_else(|| CommError::BadState("ghost word is not remotely addressable".into()))?;
        let scratch = self.heap.alloc(1, 1)?;
        let dest = self.eps.rx_rma_addr(node);
        trace!(node = %node, "dummy get");
        let (ctx, flag) = tci.post_waiter();
        // A full CQ yields and retries, driving progress in between.
        ride_out_eagain(tci, || tci.tx.read(dest, scratch, 1, key, offset, ctx, false)).await?;
        wait_tx_done(tci, &flag).await?;
        self.heap.free(scratch);
        Ok(())
    }

    /// Allocates a worker transmit context for the calling task.
    pub(crate) async fn alloc_tci(&self) -> CommResult<TciGuard> {
        self.tcis.alloc(&self.tasks).await
    }
}
