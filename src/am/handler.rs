//! Active message handler and initiator send path
//!
//! One dedicated handler task per node runs the loop: with a poll/wait
//! set it blocks (bounded) until the AM receive CQ, the RMA-target
//! completion object, or its own transmit CQ has work; without one it
//! polls all three and yields. Request processing reads a small burst of
//! CQ entries and dispatches on the opcode; draining a landing zone
//! reposts the other buffer immediately.
//!
//! Node 0's handler also paces nonce-carrying `Nop` probes round-robin to
//! the other nodes so transport failures surface before the next real
//! operation.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio::task::yield_now;
use tracing::{debug, error, trace, warn};

use crate::am::{AmRequest, DoneByte, FenceScope};
use crate::error::{CommError, CommResult, FabricError};
use crate::fabric::{CqFlags, PollEvent, RxCqEntry};
use crate::runtime::Comm;
use crate::tci::{Tci, ride_out_eagain};
use crate::types::NodeId;

/// CQ entries one request-processing pass reads at most.
const RX_BURST: usize = 8;

/// Upper bound on one blocking wait in the handler; exists to give the
/// liveness pacing a chance to run, not for correctness.
const WAIT_TIMEOUT: Duration = Duration::from_millis(100);

struct Liveness {
    target: Duration,
    interval: Duration,
    last: Instant,
    next_peer: usize,
}

impl Liveness {
    fn new(target: Duration) -> Self {
        Self {
            target,
            interval: target,
            last: Instant::now(),
            next_peer: 1,
        }
    }
}

impl Comm {
    /// Spawns the handler; stored by init, joined by shutdown.
    pub(crate) fn spawn_am_handler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let comm = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = comm.am_handler().await {
                error!(%err, "am handler failed");
                if comm.cfg.abort_on_error {
                    std::process::abort();
                }
            }
        })
    }

    async fn am_handler(self: &Arc<Self>) -> CommResult<()> {
        let tci = self.tcis.alloc_for_handler();
        self.am_alive.store(true, Ordering::Release);
        debug!(node = %self.node, "am handler running");

        let mut liveness = Liveness::new(Duration::from_secs(
            self.cfg.liveness_interval_secs.as_secs(),
        ));

        while !self.exit_flag.load(Ordering::Acquire) {
            if let Some(wait_set) = &self.eps.wait_set {
                let mut events = wait_set.poll();
                if events.is_empty() {
                    wait_set.wait(WAIT_TIMEOUT).await;
                    events = wait_set.poll();
                }
                for event in events {
                    match event {
                        PollEvent::AmRx => self.process_rx_am_req(&tci).await?,
                        PollEvent::HandlerTx => {
                            tci.check_tx_completions()?;
                        }
                        // RMA-target progress is a side effect of polling
                        // the completion object.
                        PollEvent::RmaRx => {
                            (self.rx_rma_check)(self.eps.rx_rma.as_ref());
                        }
                    }
                }
            } else {
                self.process_rx_am_req(&tci).await?;
                tci.check_tx_completions()?;
                (self.rx_rma_check)(self.eps.rx_rma.as_ref());
                yield_now().await;
            }

            if self.node.as_usize() == 0 && self.cfg.enable_liveness && self.num_nodes > 1 {
                self.maybe_probe(&tci, &mut liveness).await?;
            }
        }
        debug!(node = %self.node, "am handler exiting");
        Ok(())
    }

    async fn process_rx_am_req(self: &Arc<Self>, tci: &Tci) -> CommResult<()> {
        let mut entries: Vec<RxCqEntry> = Vec::with_capacity(RX_BURST);
        match self.eps.rx_msg.poll_cq(&mut entries, RX_BURST) {
            Ok(_) => {}
            Err(FabricError::Truncated {
                cq_flags,
                offset,
                len,
            }) => {
                return Err(CommError::Truncation {
                    cq_flags,
                    offset,
                    len,
                });
            }
            Err(other) => return Err(other.into()),
        }
        for entry in entries {
            if entry.flags.contains(CqFlags::RECV) {
                // SAFETY: the fabric deposited `len` bytes at this address
                // inside a landing zone this node owns.
                let raw =
                    unsafe { std::slice::from_raw_parts(entry.buf_addr as *const u8, entry.len) };
                let req = AmRequest::decode(raw)?;
                self.handle_am(req, tci).await?;
            }
            if entry.flags.contains(CqFlags::MULTI_RECV) {
                // This zone is spent: the other one goes up right away.
                self.repost_landing_zone()?;
            }
        }
        Ok(())
    }

    async fn handle_am(self: &Arc<Self>, req: AmRequest, tci: &Tci) -> CommResult<()> {
        trace!(node = %self.node, opcode = req.opcode(), "am request");
        match req {
            AmRequest::ExecOn {
                initiator,
                done,
                fid,
                fast,
                payload,
            } => {
                if fast {
                    // Fast bodies run right here on the handler.
                    self.dispatch.execute(fid, &payload);
                    if done != 0 {
                        self.send_am_done(tci, initiator, done).await?;
                    }
                } else {
                    let comm = Arc::clone(self);
                    spawn_am_task(self, async move {
                        comm.dispatch.execute(fid, &payload);
                        if done != 0 {
                            comm.am_task_done(initiator, done).await?;
                        }
                        Ok(())
                    });
                }
            }
            AmRequest::ExecOnLarge {
                initiator,
                done,
                fid,
                payload_addr,
                payload_len,
                needs_free,
            } => {
                let comm = Arc::clone(self);
                spawn_am_task(self, async move {
                    // Pull the payload from the initiator first; it knows
                    // the size, we did not until now.
                    let mut payload = vec![0u8; payload_len as usize];
                    comm.get(
                        payload.as_mut_ptr() as usize,
                        initiator,
                        payload_addr as usize,
                        payload_len as usize,
                    )
                    .await?;
                    if needs_free {
                        let free = AmRequest::Free {
                            initiator: comm.node,
                            addr: payload_addr,
                            len: payload_len,
                        };
                        comm.am_request(initiator, free, false).await?;
                    }
                    comm.dispatch.execute(fid, &payload);
                    if done != 0 {
                        comm.am_task_done(initiator, done).await?;
                    }
                    Ok(())
                });
            }
            AmRequest::Get {
                initiator,
                done,
                remote_src,
                local_dst,
                len,
            } => {
                let comm = Arc::clone(self);
                spawn_am_task(self, async move {
                    comm.get(local_dst as usize, initiator, remote_src as usize, len as usize)
                        .await?;
                    comm.am_task_done(initiator, done).await
                });
            }
            AmRequest::Put {
                initiator,
                done,
                local_src,
                remote_dst,
                len,
            } => {
                let comm = Arc::clone(self);
                spawn_am_task(self, async move {
                    comm.put(local_src as usize, initiator, remote_dst as usize, len as usize)
                        .await?;
                    comm.am_task_done(initiator, done).await
                });
            }
            AmRequest::Amo {
                initiator,
                done,
                obj,
                op,
                ty,
                opnd,
                cmpr,
                result_addr,
            } => {
                let old = self.cpu_amo_for_am(obj, op, ty, opnd, cmpr);
                if result_addr != 0 {
                    // The result lands before the done byte: both go on
                    // this context, write-after-write keeps the order.
                    let (key, offset) = self
                        .resolve_remote(initiator, result_addr as usize, ty.size())
                        .ok_or_else(|| {
                            CommError::BadState("amo result address is not registered".into())
                        })?;
                    let bytes = old.to_le_bytes();
                    let dest = self.eps.rx_rma_addr(initiator);
                    ride_out_eagain(tci, || {
                        tci.tx.inject_write(
                            dest,
                            bytes.as_ptr() as usize,
                            ty.size(),
                            key,
                            offset,
                        )
                    })
                    .await?;
                }
                if done != 0 {
                    self.send_am_done(tci, initiator, done).await?;
                }
            }
            AmRequest::Free { addr, len, .. } => {
                if self.payload_copies.remove(&(addr as usize)).is_some() {
                    self.heap.free(addr as usize);
                } else {
                    warn!(addr, len, "free request for an unknown payload copy");
                }
            }
            AmRequest::Nop {
                initiator,
                done,
                nonce,
            } => {
                trace!(nonce, from = %initiator, "liveness probe");
                if done != 0 {
                    self.send_am_done(tci, initiator, done).await?;
                }
            }
            AmRequest::Shutdown { initiator } => {
                debug!(from = %initiator, "shutdown request");
                self.shutdown_flag.store(true, Ordering::Release);
                self.shutdown_notify.notify_waiters();
            }
        }
        Ok(())
    }

    fn repost_landing_zone(&self) -> CommResult<()> {
        let next = 1 - self.landing_posted.load(Ordering::Acquire);
        self.eps
            .rx_msg
            .post_multi_recv(self.landing_addrs[next], self.landing_len)?;
        self.landing_posted.store(next, Ordering::Release);
        Ok(())
    }

    async fn maybe_probe(&self, tci: &Tci, liveness: &mut Liveness) -> CommResult<()> {
        let elapsed = liveness.last.elapsed();
        if elapsed < liveness.interval {
            return Ok(());
        }
        // Recalibrate toward the target from the cadence actually achieved.
        let ratio = liveness.target.as_secs_f64() / elapsed.as_secs_f64();
        liveness.interval = Duration::from_secs_f64(
            (liveness.interval.as_secs_f64() * ratio).clamp(1.0, 60.0),
        );

        let peer = NodeId::from_usize(liveness.next_peer);
        liveness.next_peer += 1;
        if liveness.next_peer >= self.num_nodes {
            liveness.next_peer = 1;
        }
        let req = AmRequest::Nop {
            initiator: self.node,
            done: 0,
            nonce: self.nonce.fetch_add(1, Ordering::AcqRel),
        };
        let wire = req.encode();
        let dest = self.eps.rx_msg_addr(peer);
        ride_out_eagain(tci, || tci.tx.inject_send(dest, &wire)).await?;
        self.probes_sent.fetch_add(1, Ordering::AcqRel);
        liveness.last = Instant::now();
        trace!(peer = %peer, "liveness probe sent");
        Ok(())
    }

    /// Initiator-side transmission of one request.
    ///
    /// Blocking requests get a registered done byte embedded, and the call
    /// spins (yielding) until the handler writes it.
    pub(crate) async fn am_request(
        &self,
        node: NodeId,
        mut req: AmRequest,
        blocking: bool,
    ) -> CommResult<()> {
        let done = if blocking {
            let d = self.alloc_done()?;
            req.set_done(d.addr as u64);
            Some(d)
        } else {
            None
        };

        let tci = self.alloc_tci().await?;
        self.fence_for(&tci, &req, node).await?;

        let wire = req.encode();
        let dest = self.eps.rx_msg_addr(node);
        if done.is_none() && wire.len() <= self.info.inject_size {
            // No completion wanted and it fits: no CQ event at all.
            ride_out_eagain(&tci, || tci.tx.inject_send(dest, &wire)).await?;
        } else {
            let ctx = tci.fire_and_forget_ctx();
            ride_out_eagain(&tci, || tci.tx.send(dest, &wire, ctx)).await?;
        }

        if let Some(d) = done {
            while !d.is_set() {
                tci.ensure_progress()?;
                yield_now().await;
            }
            self.free_done(d);
        }
        Ok(())
    }

    /// Sends a request whose done byte is handed back to the caller
    /// instead of being waited on (the delayed-blocking protocol).
    pub(crate) async fn am_request_delayed(
        &self,
        node: NodeId,
        mut req: AmRequest,
    ) -> CommResult<DoneByte> {
        let d = self.alloc_done()?;
        req.set_done(d.addr as u64);

        let tci = self.alloc_tci().await?;
        self.fence_for(&tci, &req, node).await?;

        let wire = req.encode();
        let dest = self.eps.rx_msg_addr(node);
        let ctx = tci.fire_and_forget_ctx();
        ride_out_eagain(&tci, || tci.tx.send(dest, &wire, ctx)).await?;
        Ok(d)
    }

    async fn fence_for(&self, tci: &Tci, req: &AmRequest, node: NodeId) -> CommResult<()> {
        match req.fence_scope() {
            FenceScope::All => self.flush_all(tci).await,
            FenceScope::Target => self.flush_one(tci, node).await,
            FenceScope::None => Ok(()),
        }
    }

    /// Writes 1 into the initiator's done byte over the handler's (or a
    /// task's) context and forces transmit progress so it lands.
    pub(crate) async fn send_am_done(
        &self,
        tci: &Tci,
        node: NodeId,
        done_addr: u64,
    ) -> CommResult<()> {
        let (key, offset) = self
            .resolve_remote(node, done_addr as usize, 1)
            .ok_or_else(|| CommError::BadState("done byte is not remotely addressable".into()))?;
        let one: u8 = 1;
        let dest = self.eps.rx_rma_addr(node);
        ride_out_eagain(tci, || {
            tci.tx
                .inject_write(dest, &one as *const u8 as usize, 1, key, offset)
        })
        .await?;
        tci.ensure_progress()?;
        Ok(())
    }

    /// Completion signalling from an AM-spawned task: acquire a context,
    /// write the done byte.
    pub(crate) async fn am_task_done(&self, node: NodeId, done_addr: u64) -> CommResult<()> {
        let tci = self.alloc_tci().await?;
        self.send_am_done(&tci, node, done_addr).await
    }
}

/// Runs an AM-spawned body as its own task, with the communication
/// layer's task lifecycle around it.
fn spawn_am_task<F>(comm: &Arc<Comm>, body: F)
where
    F: std::future::Future<Output = CommResult<()>> + Send + 'static,
{
    let comm = Arc::clone(comm);
    tokio::spawn(async move {
        let result = body.await;
        if let Err(err) = comm.task_end().await {
            warn!(%err, "am task teardown failed");
        }
        if let Err(err) = result {
            error!(%err, "am task body failed");
            if comm.cfg.abort_on_error {
                std::process::abort();
            }
        }
    });
}
