//! Runtime assembly and public surface
//!
//! `Comm::init` wires the whole stack in order: provider selection, the
//! registered heap and region exchange, endpoint/context construction,
//! the scheduler table, ghost/barrier flag exchange, atomic validity
//! probing, landing zones, and finally the AM handler; an out-of-band
//! barrier closes initialization so no node races ahead of a peer's
//! endpoints.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::yield_now;
use tracing::{debug, info};

use crate::am::{self, AmDispatch, AmRequest, DoneByte, MAX_EXECON_INLINE};
use crate::barrier::BAR_INFO_SIZE;
use crate::batch::BatchKinds;
use crate::config::CommConfig;
use crate::endpoint::{self, EndpointFabric};
use crate::error::{CommError, CommResult};
use crate::fabric::{Caps, Domain, Fabric, ProviderInfo, RxRmaEndpoint};
use crate::oob::OobChannel;
use crate::provider;
use crate::region::{RegionTable, RegisteredHeap};
use crate::tasking::TaskRegistry;
use crate::tci::TciTable;
use crate::types::NodeId;

fn check_rx_rma_cq(rx: &dyn RxRmaEndpoint) -> u64 {
    rx.poll_cq()
}

fn check_rx_rma_counter(rx: &dyn RxRmaEndpoint) -> u64 {
    rx.read_counter()
}

/// One node's communication runtime.
pub struct Comm {
    pub(crate) cfg: CommConfig,
    pub(crate) node: NodeId,
    pub(crate) num_nodes: usize,
    pub(crate) info: ProviderInfo,
    pub(crate) have_dc: bool,
    #[allow(dead_code)]
    domain: Arc<dyn Domain>,
    pub(crate) eps: EndpointFabric,
    pub(crate) tcis: Arc<TciTable>,
    pub(crate) regions: RegionTable,
    pub(crate) heap: RegisteredHeap,
    pub(crate) tasks: TaskRegistry,
    pub(crate) dispatch: Arc<dyn AmDispatch>,
    pub(crate) oob: Arc<dyn OobChannel>,

    /// Ordering ghost word per node; contents meaningless.
    pub(crate) ghost_addrs: Vec<usize>,
    /// Barrier flag block per node.
    pub(crate) bar_addrs: Vec<usize>,

    /// Payload copies parked for nonblocking large execute-ons, keyed by
    /// address; released by `Free` requests.
    pub(crate) payload_copies: DashMap<usize, usize>,

    /// RX-RMA completion checking backend, selected at init.
    pub(crate) rx_rma_check: fn(&dyn RxRmaEndpoint) -> u64,

    /// Native-atomic verdict per datatype, memoized from init probing.
    pub(crate) amo_valid: [bool; 6],

    pub(crate) nonce: AtomicU64,
    pub(crate) probes_sent: AtomicU64,

    pub(crate) shutdown_flag: AtomicBool,
    pub(crate) exit_flag: AtomicBool,
    pub(crate) shutdown_notify: Notify,
    pub(crate) am_alive: AtomicBool,

    pub(crate) landing_addrs: [usize; 2],
    pub(crate) landing_len: usize,
    pub(crate) landing_posted: AtomicUsize,

    handler: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Comm {
    /// Brings up the communication layer for this node and synchronizes
    /// with every peer.
    pub async fn init(
        cfg: CommConfig,
        fabric: Arc<dyn Fabric>,
        oob: Arc<dyn OobChannel>,
        dispatch: Arc<dyn AmDispatch>,
    ) -> CommResult<Arc<Comm>> {
        cfg.validate()?;
        let node = oob.node();
        let num_nodes = oob.num_nodes();

        let selected = provider::select_provider(fabric.as_ref(), &cfg)?;
        let domain = fabric.open(&selected.info, node)?;
        let info = domain.info().clone();
        let have_dc = selected.have_delivery_complete;

        let heap = RegisteredHeap::new(cfg.registered_heap_size.as_usize());
        let scalable_mr = info.caps.contains(Caps::SCALABLE_MR);
        let mut regions = RegionTable::register(
            domain.as_ref(),
            scalable_mr,
            Some((heap.base(), heap.len())),
        )?;
        regions.exchange(&oob).await?;

        let eps = endpoint::build(&domain, &cfg, &oob, am::MAX_REQ_WIRE_SIZE).await?;
        let tcis = Arc::new(TciTable::new(
            eps.txs.clone(),
            eps.num_workers,
            eps.fixed_binding,
        ));

        // Ghost word and barrier flags, then one gather for both.
        let ghost = heap.alloc(4, 4)?;
        let bar = heap.alloc(BAR_INFO_SIZE, 8)?;
        let mut wire = Vec::with_capacity(16);
        wire.extend_from_slice(&(ghost as u64).to_le_bytes());
        wire.extend_from_slice(&(bar as u64).to_le_bytes());
        let gathered = oob.all_gather(&wire).await?;
        let mut ghost_addrs = Vec::with_capacity(num_nodes);
        let mut bar_addrs = Vec::with_capacity(num_nodes);
        for raw in &gathered {
            ghost_addrs.push(u64::from_le_bytes(raw[..8].try_into().unwrap()) as usize);
            bar_addrs.push(u64::from_le_bytes(raw[8..16].try_into().unwrap()) as usize);
        }

        let amo_valid = crate::amo::probe_atomic_validity(domain.as_ref());
        debug!(?amo_valid, "atomic validity probed");

        let landing_len = cfg.multi_recv_buf_size.as_usize();
        let landing_addrs = [heap.alloc(landing_len, 64)?, heap.alloc(landing_len, 64)?];
        eps.rx_msg.post_multi_recv(landing_addrs[0], landing_len)?;

        let rx_rma_check = if cfg.rx_rma_counter {
            check_rx_rma_counter
        } else {
            check_rx_rma_cq
        };

        let comm = Arc::new(Comm {
            node,
            num_nodes,
            info,
            have_dc,
            domain,
            eps,
            tcis,
            regions,
            heap,
            tasks: TaskRegistry::new(num_nodes),
            dispatch,
            oob,
            ghost_addrs,
            bar_addrs,
            payload_copies: DashMap::new(),
            rx_rma_check,
            amo_valid,
            nonce: AtomicU64::new(1),
            probes_sent: AtomicU64::new(0),
            shutdown_flag: AtomicBool::new(false),
            exit_flag: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            am_alive: AtomicBool::new(false),
            landing_addrs,
            landing_len,
            landing_posted: AtomicUsize::new(0),
            handler: Mutex::new(None),
            cfg,
        });

        let handle = comm.spawn_am_handler();
        *comm.handler.lock().unwrap() = Some(handle);
        while !comm.am_alive() {
            yield_now().await;
        }

        // No node proceeds until every peer's handler is up.
        comm.oob.barrier().await?;
        info!(
            node = %comm.node,
            num_nodes,
            provider = %comm.info.name,
            have_delivery_complete = comm.have_dc,
            scalable_ep = comm.eps.scalable_ep,
            "communication layer up"
        );
        Ok(comm)
    }

    /// Runs `fid` on `node` with an inline-size payload.
    pub async fn execute_on(
        &self,
        node: NodeId,
        fid: u32,
        payload: &[u8],
        blocking: bool,
    ) -> CommResult<()> {
        if node == self.node {
            self.retire_delayed_done().await?;
            self.dispatch.execute(fid, payload);
            return Ok(());
        }
        if payload.len() <= MAX_EXECON_INLINE {
            let req = AmRequest::ExecOn {
                initiator: self.node,
                done: 0,
                fid,
                fast: false,
                payload: payload.to_vec(),
            };
            return self.am_request(node, req, blocking).await;
        }
        self.execute_on_large(node, fid, payload, blocking).await
    }

    /// Large execute-on: the handler pulls the payload from this node.
    async fn execute_on_large(
        &self,
        node: NodeId,
        fid: u32,
        payload: &[u8],
        blocking: bool,
    ) -> CommResult<()> {
        let len = payload.len();
        if blocking {
            // The caller's buffer outlives the call; use it directly when
            // the target can reach it.
            if self.local_desc(payload.as_ptr() as usize, len) {
                let req = AmRequest::ExecOnLarge {
                    initiator: self.node,
                    done: 0,
                    fid,
                    payload_addr: payload.as_ptr() as u64,
                    payload_len: len as u64,
                    needs_free: false,
                };
                return self.am_request(node, req, true).await;
            }
            let copy = self.heap.alloc(len, 8)?;
            // SAFETY: the copy extent is live arena memory.
            unsafe {
                std::ptr::copy(payload.as_ptr(), copy as *mut u8, len);
            }
            let req = AmRequest::ExecOnLarge {
                initiator: self.node,
                done: 0,
                fid,
                payload_addr: copy as u64,
                payload_len: len as u64,
                needs_free: false,
            };
            let result = self.am_request(node, req, true).await;
            self.heap.free(copy);
            return result;
        }

        // Nonblocking: park a registered copy; the handler frees it with
        // an opFree once its GET completes.
        let copy = self.heap.alloc(len, 8)?;
        // SAFETY: the copy extent is live arena memory.
        unsafe {
            std::ptr::copy(payload.as_ptr(), copy as *mut u8, len);
        }
        self.payload_copies.insert(copy, len);
        let req = AmRequest::ExecOnLarge {
            initiator: self.node,
            done: 0,
            fid,
            payload_addr: copy as u64,
            payload_len: len as u64,
            needs_free: true,
        };
        self.am_request(node, req, false).await
    }

    /// Runs `fid` inline on the target's handler thread. Only for bodies
    /// that are quick and never block; the payload must fit inline.
    pub async fn execute_on_fast(
        &self,
        node: NodeId,
        fid: u32,
        payload: &[u8],
        blocking: bool,
    ) -> CommResult<()> {
        if payload.len() > MAX_EXECON_INLINE {
            return Err(CommError::BadState(format!(
                "fast execute-on payload of {} bytes exceeds the inline cap",
                payload.len()
            )));
        }
        if node == self.node {
            self.retire_delayed_done().await?;
            self.dispatch.execute(fid, payload);
            return Ok(());
        }
        let req = AmRequest::ExecOn {
            initiator: self.node,
            done: 0,
            fid,
            fast: true,
            payload: payload.to_vec(),
        };
        self.am_request(node, req, blocking).await
    }

    /// Tears down the job: node 0 propagates shutdown to every peer, the
    /// rest block on the shutdown condition; everyone then meets at the
    /// out-of-band barrier and stops their handler.
    pub async fn shutdown(&self) -> CommResult<()> {
        debug!(node = %self.node, live_tasks = self.tasks.live(), "shutdown");
        if self.node.as_usize() == 0 {
            for n in 1..self.num_nodes {
                let req = AmRequest::Shutdown {
                    initiator: self.node,
                };
                self.am_request(NodeId::from_usize(n), req, false).await?;
            }
        } else {
            loop {
                if self.shutdown_flag.load(Ordering::Acquire) {
                    break;
                }
                let notified = self.shutdown_notify.notified();
                if self.shutdown_flag.load(Ordering::Acquire) {
                    break;
                }
                let _ = tokio::time::timeout(std::time::Duration::from_millis(100), notified).await;
            }
        }

        self.oob.barrier().await?;

        self.exit_flag.store(true, Ordering::Release);
        let handle = self.handler.lock().unwrap().take();
        if let Some(h) = handle {
            let _ = h.await;
        }
        self.am_alive.store(false, Ordering::Release);
        self.oob.fini().await?;
        info!(node = %self.node, "communication layer down");
        Ok(())
    }

    /// Spawns an application task with the communication lifecycle around
    /// it: fixed-thread marking at entry, `task_end` at exit.
    pub fn spawn_task<F>(self: &Arc<Self>, fut: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let comm = Arc::clone(self);
        tokio::spawn(async move {
            let fixed = comm.cfg.fixed_threads.is_some();
            comm.tasks.with(|t| t.is_fixed = fixed);
            let out = fut.await;
            if let Err(err) = comm.task_end().await {
                tracing::error!(%err, "task teardown failed");
                if comm.cfg.abort_on_error {
                    std::process::abort();
                }
            }
            out
        })
    }

    /// Ends the calling task's communication state: buffers flushed and
    /// freed, the delayed done retired, the put bitmap flushed, private
    /// state dropped.
    pub async fn task_end(&self) -> CommResult<()> {
        self.tasks.with(|t| t.task_is_ending = true);
        self.task_local_buff_end(BatchKinds::all()).await?;
        let needs_flush = self.tasks.with(|t| {
            t.am_done_pending.is_some()
                || t.put_bitmap.as_ref().is_some_and(|bm| !bm.is_empty())
        });
        if needs_flush {
            let tci = self.alloc_tci().await?;
            self.flush_all(&tci).await?;
        }
        if let Some(private) = self.tasks.remove_current() {
            if let Some(pb) = private.put_batch {
                self.heap.free(pb.data_addr);
            }
        }
        Ok(())
    }

    // Accessors and small helpers.

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Whether the AM handler is running.
    pub fn am_alive(&self) -> bool {
        self.am_alive.load(Ordering::Acquire)
    }

    /// Liveness probes node 0 has sent so far.
    pub fn liveness_probes_sent(&self) -> u64 {
        self.probes_sent.load(Ordering::Acquire)
    }

    /// Payload copies still parked for nonblocking large execute-ons.
    pub fn pending_payload_copies(&self) -> usize {
        self.payload_copies.len()
    }

    /// Allocates remotely-addressable memory from the registered heap;
    /// what basic-mode callers use for buffers peers must reach.
    pub fn alloc_registered(&self, len: usize, align: usize) -> CommResult<usize> {
        self.heap.alloc(len, align)
    }

    pub fn free_registered(&self, addr: usize) {
        self.heap.free(addr);
    }

    pub(crate) fn resolve_remote(&self, node: NodeId, addr: usize, len: usize) -> Option<(u64, u64)> {
        self.regions.get_remote_key(node, addr, len)
    }

    pub(crate) fn local_desc(&self, addr: usize, len: usize) -> bool {
        self.regions.get_local_desc(addr, len).is_some()
    }

    pub(crate) fn alloc_done(&self) -> CommResult<DoneByte> {
        let addr = self.heap.alloc(1, 1)?;
        let done = DoneByte { addr };
        done.reset();
        Ok(done)
    }

    pub(crate) fn free_done(&self, done: DoneByte) {
        self.heap.free(done.addr);
    }
}
