//! RMA engine: PUT and GET for arbitrary sizes
//!
//! Transfers above the provider's maximum message size are chunked. A
//! local buffer outside the registered set is staged through a bounce
//! buffer in the registered heap. A remote address that no peer region
//! covers falls back to an AM-mediated transfer in the opposite direction
//! (the target performs the RMA against this node's registered memory).

use tracing::trace;

use crate::am::AmRequest;
use crate::error::CommResult;
use crate::runtime::Comm;
use crate::tci::{ride_out_eagain, wait_tx_done};
use crate::types::NodeId;

/// Granularity of bounce-buffer staging.
pub(crate) const BOUNCE_CHUNK: usize = 8192;

impl Comm {
    /// Writes `len` bytes at `local` into `raddr` on `node`.
    pub async fn put(&self, local: usize, node: NodeId, raddr: usize, len: usize) -> CommResult<()> {
        if len == 0 {
            return Ok(());
        }
        if node == self.node {
            self.retire_delayed_done().await?;
            // SAFETY: both ranges are local memory owned by the caller;
            // overlap is allowed.
            unsafe {
                std::ptr::copy(local as *const u8, raddr as *mut u8, len);
            }
            return Ok(());
        }
        // A PUT is MCM-significant for any parked delayed done.
        self.retire_delayed_done().await?;
        let max = self.info.max_msg_size;
        let mut off = 0;
        while off < len {
            let chunk = (len - off).min(max);
            self.put_chunk(local + off, node, raddr + off, chunk).await?;
            off += chunk;
        }
        Ok(())
    }

    /// Reads `len` bytes at `raddr` on `node` into `local`.
    pub async fn get(&self, local: usize, node: NodeId, raddr: usize, len: usize) -> CommResult<()> {
        if len == 0 {
            return Ok(());
        }
        if node == self.node {
            self.retire_delayed_done().await?;
            // SAFETY: both ranges are local memory owned by the caller.
            unsafe {
                std::ptr::copy(raddr as *const u8, local as *mut u8, len);
            }
            return Ok(());
        }
        let max = self.info.max_msg_size;
        let mut off = 0;
        while off < len {
            let chunk = (len - off).min(max);
            self.get_chunk(local + off, node, raddr + off, chunk).await?;
            off += chunk;
        }
        Ok(())
    }

    async fn put_chunk(
        &self,
        local: usize,
        node: NodeId,
        raddr: usize,
        len: usize,
    ) -> CommResult<()> {
        let Some((key, offset)) = self.resolve_remote(node, raddr, len) else {
            return self.put_via_am(local, node, raddr, len).await;
        };
        if self.local_desc(local, len) {
            return self.put_native(local, node, key, offset, len).await;
        }
        // Stage unregistered local memory through registered scratch.
        let bounce = self.heap.alloc(BOUNCE_CHUNK.min(len), 8)?;
        let mut off = 0;
        while off < len {
            let n = (len - off).min(BOUNCE_CHUNK);
            // SAFETY: the bounce extent is live arena memory; the source
            // is caller-owned.
            unsafe {
                std::ptr::copy((local + off) as *const u8, bounce as *mut u8, n);
            }
            self.put_native(bounce, node, key, offset + off as u64, n)
                .await?;
            off += n;
        }
        self.heap.free(bounce);
        Ok(())
    }

    async fn put_native(
        &self,
        local: usize,
        node: NodeId,
        key: u64,
        offset: u64,
        len: usize,
    ) -> CommResult<()> {
        let tci = self.alloc_tci().await?;
        let dest = self.eps.rx_rma_addr(node);
        if !self.have_dc && tci.is_bound() && len <= self.info.inject_size {
            trace!(node = %node, len, "put: inject");
            ride_out_eagain(&tci, || tci.tx.inject_write(dest, local, len, key, offset)).await?;
            self.record_put(node);
        } else {
            trace!(node = %node, len, "put: completion-waited write");
            let (ctx, flag) = tci.post_waiter();
            ride_out_eagain(&tci, || {
                tci.tx.write(dest, local, len, key, offset, ctx, false)
            })
            .await?;
            wait_tx_done(&tci, &flag).await?;
        }
        Ok(())
    }

    async fn get_chunk(
        &self,
        local: usize,
        node: NodeId,
        raddr: usize,
        len: usize,
    ) -> CommResult<()> {
        let Some((key, offset)) = self.resolve_remote(node, raddr, len) else {
            return self.get_via_am(local, node, raddr, len).await;
        };
        if self.local_desc(local, len) {
            return self.get_native(local, node, key, offset, len).await;
        }
        let bounce = self.heap.alloc(BOUNCE_CHUNK.min(len), 8)?;
        let mut off = 0;
        while off < len {
            let n = (len - off).min(BOUNCE_CHUNK);
            self.get_native(bounce, node, key, offset + off as u64, n)
                .await?;
            // SAFETY: the bounce extent is live arena memory; the
            // destination is caller-owned.
            unsafe {
                std::ptr::copy(bounce as *const u8, (local + off) as *mut u8, n);
            }
            off += n;
        }
        self.heap.free(bounce);
        Ok(())
    }

    async fn get_native(
        &self,
        local: usize,
        node: NodeId,
        key: u64,
        offset: u64,
        len: usize,
    ) -> CommResult<()> {
        let tci = self.alloc_tci().await?;
        // Force prior PUTs to this node visible first; the flush clears
        // the bitmap bit, so the GET itself needs no second fence.
        self.flush_one(&tci, node).await?;
        let dest = self.eps.rx_rma_addr(node);
        trace!(node = %node, len, "get: native read");
        let (ctx, flag) = tci.post_waiter();
        ride_out_eagain(&tci, || {
            tci.tx.read(dest, local, len, key, offset, ctx, false)
        })
        .await?;
        wait_tx_done(&tci, &flag).await?;
        Ok(())
    }

    /// PUT fallback when `raddr` resolves to no region on `node`: ask the
    /// target to GET from this node's (registered) memory instead.
    async fn put_via_am(
        &self,
        local: usize,
        node: NodeId,
        raddr: usize,
        len: usize,
    ) -> CommResult<()> {
        trace!(node = %node, len, "put: am-mediated");
        if self.local_desc(local, len) {
            let req = AmRequest::Get {
                initiator: self.node,
                done: 0,
                remote_src: local as u64,
                local_dst: raddr as u64,
                len: len as u64,
            };
            return self.am_request(node, req, true).await;
        }
        let bounce = self.heap.alloc(BOUNCE_CHUNK.min(len), 8)?;
        let mut off = 0;
        while off < len {
            let n = (len - off).min(BOUNCE_CHUNK);
            // SAFETY: bounce is live arena memory; source is caller-owned.
            unsafe {
                std::ptr::copy((local + off) as *const u8, bounce as *mut u8, n);
            }
            let req = AmRequest::Get {
                initiator: self.node,
                done: 0,
                remote_src: bounce as u64,
                local_dst: (raddr + off) as u64,
                len: n as u64,
            };
            self.am_request(node, req, true).await?;
            off += n;
        }
        self.heap.free(bounce);
        Ok(())
    }

    /// GET fallback: ask the target to PUT into this node's memory.
    async fn get_via_am(
        &self,
        local: usize,
        node: NodeId,
        raddr: usize,
        len: usize,
    ) -> CommResult<()> {
        trace!(node = %node, len, "get: am-mediated");
        if self.local_desc(local, len) {
            let req = AmRequest::Put {
                initiator: self.node,
                done: 0,
                local_src: raddr as u64,
                remote_dst: local as u64,
                len: len as u64,
            };
            return self.am_request(node, req, true).await;
        }
        let bounce = self.heap.alloc(BOUNCE_CHUNK.min(len), 8)?;
        let mut off = 0;
        while off < len {
            let n = (len - off).min(BOUNCE_CHUNK);
            let req = AmRequest::Put {
                initiator: self.node,
                done: 0,
                local_src: (raddr + off) as u64,
                remote_dst: bounce as u64,
                len: n as u64,
            };
            self.am_request(node, req, true).await?;
            // SAFETY: bounce is live arena memory; destination is
            // caller-owned.
            unsafe {
                std::ptr::copy(bounce as *const u8, (local + off) as *mut u8, n);
            }
            off += n;
        }
        self.heap.free(bounce);
        Ok(())
    }
}
