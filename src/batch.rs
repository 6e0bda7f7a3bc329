//! Task-local batching of unordered operations
//!
//! The `_unordered` entry points coalesce small RMA/AMO requests into
//! per-task buffers and submit them vectorised on a single transmit
//! context, chaining with the provider's "more to come" hint. Operations
//! that cannot be buffered (too big, unresolvable remote address,
//! self-directed) are issued directly.
//!
//! The engine calls `task_local_buff_end` at task termination and
//! `task_fence` at fence points; a PUT batch carries a node bitmap and
//! restores the consistency invariant with a full flush after submission.

use bitflags::bitflags;
use tracing::trace;

use crate::bitmap::NodeBitmap;
use crate::error::CommResult;
use crate::fabric::AtomicDesc;
use crate::runtime::Comm;
use crate::tci::{ride_out_eagain, wait_tx_done};
use crate::types::{AmoOp, AmoType, NodeId};

/// Most operations one batch holds before it self-flushes.
pub(crate) const MAX_CHAINED: usize = 64;

/// Largest transfer the unordered paths buffer.
pub(crate) const MAX_UNORDERED_TRANS_SZ: usize = 1024;

bitflags! {
    /// Which task-local buffers an operation applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BatchKinds: u8 {
        const AMO = 1 << 0;
        const GET = 1 << 1;
        const PUT = 1 << 2;
    }
}

pub(crate) struct PutEntry {
    node: NodeId,
    key: u64,
    offset: u64,
    data_off: usize,
    len: usize,
}

/// Buffered PUTs plus their inline source data in registered memory.
pub(crate) struct PutBatch {
    pub(crate) data_addr: usize,
    used: usize,
    entries: Vec<PutEntry>,
    nodes: NodeBitmap,
}

impl PutBatch {
    fn new(data_addr: usize, num_nodes: usize) -> Self {
        Self {
            data_addr,
            used: 0,
            entries: Vec::with_capacity(MAX_CHAINED),
            nodes: NodeBitmap::new(num_nodes),
        }
    }

    fn full(&self) -> bool {
        self.entries.len() >= MAX_CHAINED
    }
}

pub(crate) struct GetEntry {
    local: usize,
    node: NodeId,
    key: u64,
    offset: u64,
    len: usize,
}

#[derive(Default)]
pub(crate) struct GetBatch {
    entries: Vec<GetEntry>,
}

#[derive(Default)]
pub(crate) struct AmoBatch {
    entries: Vec<(NodeId, AtomicDesc)>,
}

impl Comm {
    /// PUT with no ordering promise until the next fence.
    pub async fn put_unordered(
        &self,
        local: usize,
        node: NodeId,
        raddr: usize,
        len: usize,
    ) -> CommResult<()> {
        if len == 0 {
            return Ok(());
        }
        let resolved = self.resolve_remote(node, raddr, len);
        let (key, offset) = match resolved {
            Some(pair) if len <= MAX_UNORDERED_TRANS_SZ && node != self.node => pair,
            _ => return self.put(local, node, raddr, len).await,
        };

        let data_addr = self.ensure_put_batch().await?;
        let flush_now = self.tasks.with(|t| {
            let batch = t.put_batch.as_mut().expect("put batch just ensured");
            let data_off = batch.used;
            // SAFETY: the inline area is live arena memory sized for
            // MAX_CHAINED full-size entries; the source is caller-owned.
            unsafe {
                std::ptr::copy(
                    local as *const u8,
                    (batch.data_addr + data_off) as *mut u8,
                    len,
                );
            }
            batch.used += len;
            batch.entries.push(PutEntry {
                node,
                key,
                offset,
                data_off,
                len,
            });
            batch.nodes.set(node);
            batch.full()
        });
        if flush_now {
            self.flush_put_batch().await?;
        }
        Ok(())
    }

    /// GET with no ordering promise until the next fence.
    pub async fn get_unordered(
        &self,
        local: usize,
        node: NodeId,
        raddr: usize,
        len: usize,
    ) -> CommResult<()> {
        if len == 0 {
            return Ok(());
        }
        let resolved = self.resolve_remote(node, raddr, len);
        let (key, offset) = match resolved {
            Some(pair)
                if len <= MAX_UNORDERED_TRANS_SZ
                    && node != self.node
                    && self.local_desc(local, len) =>
            {
                pair
            }
            _ => return self.get(local, node, raddr, len).await,
        };

        let flush_now = self.tasks.with(|t| {
            let batch = t.get_batch.get_or_insert_with(GetBatch::default);
            batch.entries.push(GetEntry {
                local,
                node,
                key,
                offset,
                len,
            });
            batch.entries.len() >= MAX_CHAINED
        });
        if flush_now {
            self.flush_get_batch().await?;
        }
        Ok(())
    }

    /// Non-fetching AMO with no ordering promise until the next fence.
    pub async fn amo_unordered(
        &self,
        node: NodeId,
        obj: usize,
        op: AmoOp,
        ty: AmoType,
        opnd: u64,
    ) -> CommResult<()> {
        let bufferable = self.amo_valid[ty as usize]
            && node != self.node
            && self.resolve_remote(node, obj, ty.size()).is_some();
        if !bufferable {
            return self.amo(node, obj, op, ty, opnd).await;
        }
        let (key, offset) = self
            .resolve_remote(node, obj, ty.size())
            .expect("resolved above");
        let (mut op, mut opnd) = (op, opnd);
        if op == AmoOp::Sub {
            opnd = crate::amo::neg_pattern(ty, opnd);
            op = AmoOp::Add;
        }
        let desc = AtomicDesc {
            key,
            offset,
            ty,
            op,
            opnd,
            cmpr: 0,
            fetch_addr: None,
        };
        let flush_now = self.tasks.with(|t| {
            let batch = t.amo_batch.get_or_insert_with(AmoBatch::default);
            batch.entries.push((node, desc));
            batch.entries.len() >= MAX_CHAINED
        });
        if flush_now {
            self.flush_amo_batch().await?;
        }
        Ok(())
    }

    /// Submits the selected buffers; called at task fence points.
    pub async fn task_fence(&self, kinds: BatchKinds) -> CommResult<()> {
        if kinds.contains(BatchKinds::AMO) {
            self.flush_amo_batch().await?;
        }
        if kinds.contains(BatchKinds::GET) {
            self.flush_get_batch().await?;
        }
        if kinds.contains(BatchKinds::PUT) {
            self.flush_put_batch().await?;
        }
        Ok(())
    }

    /// Flushes and frees the selected buffers; required at task end.
    pub async fn task_local_buff_end(&self, kinds: BatchKinds) -> CommResult<()> {
        self.task_fence(kinds).await?;
        self.tasks.with(|t| {
            if kinds.contains(BatchKinds::AMO) {
                t.amo_batch = None;
            }
            if kinds.contains(BatchKinds::GET) {
                t.get_batch = None;
            }
            if kinds.contains(BatchKinds::PUT) {
                t.put_batch.take()
            } else {
                None
            }
        })
        .map(|pb| self.heap.free(pb.data_addr));
        Ok(())
    }

    async fn ensure_put_batch(&self) -> CommResult<usize> {
        if let Some(addr) = self.tasks.with(|t| t.put_batch.as_ref().map(|b| b.data_addr)) {
            return Ok(addr);
        }
        let data_addr = self.heap.alloc(MAX_CHAINED * MAX_UNORDERED_TRANS_SZ, 8)?;
        let num_nodes = self.num_nodes;
        self.tasks
            .with(|t| t.put_batch = Some(PutBatch::new(data_addr, num_nodes)));
        Ok(data_addr)
    }

    async fn flush_put_batch(&self) -> CommResult<()> {
        let Some(mut batch) = self.tasks.with(|t| t.put_batch.take()) else {
            return Ok(());
        };
        if batch.entries.is_empty() {
            self.tasks.with(|t| t.put_batch = Some(batch));
            return Ok(());
        }
        trace!(entries = batch.entries.len(), "flushing put batch");
        let tci = self.alloc_tci().await?;
        let last = batch.entries.len() - 1;
        for (i, e) in batch.entries.iter().enumerate() {
            let dest = self.eps.rx_rma_addr(e.node);
            let ctx = tci.fire_and_forget_ctx();
            let local = batch.data_addr + e.data_off;
            ride_out_eagain(&tci, || {
                tci.tx
                    .write(dest, local, e.len, e.key, e.offset, ctx, i < last)
            })
            .await?;
        }
        // Restore the consistency invariant over everything just written.
        for node in batch.nodes.for_each_set() {
            self.record_put(node);
        }
        self.flush_all(&tci).await?;
        drop(tci);

        batch.entries.clear();
        batch.nodes.zero();
        batch.used = 0;
        self.tasks.with(|t| t.put_batch = Some(batch));
        Ok(())
    }

    async fn flush_get_batch(&self) -> CommResult<()> {
        let Some(mut batch) = self.tasks.with(|t| t.get_batch.take()) else {
            return Ok(());
        };
        if batch.entries.is_empty() {
            self.tasks.with(|t| t.get_batch = Some(batch));
            return Ok(());
        }
        trace!(entries = batch.entries.len(), "flushing get batch");
        let tci = self.alloc_tci().await?;
        let last = batch.entries.len() - 1;
        let mut flags = Vec::with_capacity(batch.entries.len());
        for (i, e) in batch.entries.iter().enumerate() {
            let dest = self.eps.rx_rma_addr(e.node);
            let (ctx, flag) = tci.post_waiter();
            ride_out_eagain(&tci, || {
                tci.tx
                    .read(dest, e.local, e.len, e.key, e.offset, ctx, i < last)
            })
            .await?;
            flags.push(flag);
        }
        for flag in &flags {
            wait_tx_done(&tci, flag).await?;
        }
        drop(tci);
        batch.entries.clear();
        self.tasks.with(|t| t.get_batch = Some(batch));
        Ok(())
    }

    async fn flush_amo_batch(&self) -> CommResult<()> {
        let Some(mut batch) = self.tasks.with(|t| t.amo_batch.take()) else {
            return Ok(());
        };
        if batch.entries.is_empty() {
            self.tasks.with(|t| t.amo_batch = Some(batch));
            return Ok(());
        }
        trace!(entries = batch.entries.len(), "flushing amo batch");
        let tci = self.alloc_tci().await?;
        let last = batch.entries.len() - 1;
        for (i, (node, desc)) in batch.entries.iter().enumerate() {
            let dest = self.eps.rx_rma_addr(*node);
            let ctx = tci.fire_and_forget_ctx();
            ride_out_eagain(&tci, || tci.tx.atomic(dest, desc, ctx, i < last)).await?;
            if desc.op.is_write() && !self.have_dc {
                self.record_put(*node);
            }
        }
        drop(tci);
        batch.entries.clear();
        self.tasks.with(|t| t.amo_batch = Some(batch));
        Ok(())
    }
}
