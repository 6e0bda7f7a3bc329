//! In-process fabric provider
//!
//! Connects the nodes of a single-process job over shared memory. Ships as
//! the test double for the real transport: it implements the whole trait
//! surface, including multi-receive landing zones, wait sets, counters, and
//! both completion personalities:
//!
//! - delivery-complete: an operation is applied to target memory before its
//!   completion is produced
//! - message-order: writes are buffered per endpoint pair and applied when
//!   a same-pair ordered operation (read, send, atomic) arrives or when
//!   transmit progress is driven, reproducing the read-after-write /
//!   write-after-write / send-after-write guarantees
//!
//! Every submitted operation is appended to a job-wide trace so tests can
//! assert ordering decisions (for example that a dummy GET was issued
//! between a PUT-inject and a dependent GET).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::trace;

use crate::amo::cpu;
use crate::error::FabricError;
use crate::fabric::{
    AtomicDesc, Caps, CompletionLevel, CqFlags, Domain, EpName, Fabric, FabricAddr, MsgOrder,
    OpFlags, PollEvent, ProviderHints, ProviderInfo, RxCompletionKind, RxCqEntry, RxMsgEndpoint,
    RxRmaEndpoint, TxContext, TxCqEntry, WaitSet,
};
use crate::types::{AmoOp, AmoType, NodeId};

/// Operations as they appear in the job-wide submission trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOp {
    InjectWrite,
    Write,
    Read,
    Send,
    InjectSend,
    Atomic,
}

/// One submitted operation.
#[derive(Debug, Clone, Copy)]
pub struct TraceRecord {
    pub from: NodeId,
    pub to: NodeId,
    pub op: TraceOp,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpKind {
    Msg,
    Rma,
}

struct Region {
    key: u64,
    base: usize,
    len: usize,
}

struct PostedBuf {
    base: usize,
    len: usize,
    used: usize,
}

#[derive(Default)]
struct AmRxState {
    posted: VecDeque<PostedBuf>,
    /// Messages held back while no landing zone is posted (resource
    /// management enabled).
    queued: VecDeque<Vec<u8>>,
    cq: VecDeque<RxCqEntry>,
    error: Option<FabricError>,
    min_multi_recv: usize,
}

struct NodeState {
    regions: Mutex<Vec<Region>>,
    next_key: AtomicU64,
    am_rx: Mutex<AmRxState>,
    rma_cq_events: AtomicU64,
    rma_counter: AtomicU64,
    notify: Notify,
}

impl NodeState {
    fn new() -> Self {
        Self {
            regions: Mutex::new(Vec::new()),
            next_key: AtomicU64::new(0),
            am_rx: Mutex::new(AmRxState::default()),
            rma_cq_events: AtomicU64::new(0),
            rma_counter: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn bump_rma(&self) {
        self.rma_cq_events.fetch_add(1, Ordering::AcqRel);
        self.rma_counter.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_one();
    }
}

/// Builder for [`MemFabric`].
pub struct MemFabricBuilder {
    nodes: usize,
    providers: Vec<ProviderInfo>,
    file_limit: Option<usize>,
    tx_cq_capacity: usize,
    amo_deny: Vec<AmoType>,
    max_msg_size: Option<usize>,
    inject_size: Option<usize>,
}

impl MemFabricBuilder {
    #[must_use]
    pub fn nodes(mut self, n: usize) -> Self {
        self.nodes = n;
        self
    }

    /// Replaces the advertised provider list entirely.
    #[must_use]
    pub fn providers(mut self, providers: Vec<ProviderInfo>) -> Self {
        self.providers = providers;
        self
    }

    /// Injects an open-file budget; endpoint creation charges against it.
    #[must_use]
    pub fn file_limit(mut self, limit: usize) -> Self {
        self.file_limit = Some(limit);
        self
    }

    /// Caps each transmit CQ, so back-pressure paths run.
    #[must_use]
    pub fn tx_cq_capacity(mut self, cap: usize) -> Self {
        self.tx_cq_capacity = cap;
        self
    }

    /// Makes the provider report the type as not natively atomic.
    #[must_use]
    pub fn deny_native_amo(mut self, ty: AmoType) -> Self {
        self.amo_deny.push(ty);
        self
    }

    #[must_use]
    pub fn max_msg_size(mut self, size: usize) -> Self {
        self.max_msg_size = Some(size);
        self
    }

    #[must_use]
    pub fn inject_size(mut self, size: usize) -> Self {
        self.inject_size = Some(size);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<MemFabric> {
        assert!(self.nodes > 0, "a job has at least one node");
        let mut providers = self.providers;
        for p in &mut providers {
            if let Some(m) = self.max_msg_size {
                p.max_msg_size = m;
            }
            if let Some(i) = self.inject_size {
                p.inject_size = i;
            }
        }
        Arc::new_cyclic(|weak| MemFabric {
            weak: weak.clone(),
            num_nodes: self.nodes,
            providers,
            nodes: (0..self.nodes).map(|_| NodeState::new()).collect(),
            registry: DashMap::new(),
            next_name: AtomicU64::new(1),
            next_token: AtomicUsize::new(1),
            trace: Mutex::new(Vec::new()),
            file_budget: self
                .file_limit
                .map(|limit| (AtomicI64::new(limit as i64), limit)),
            tx_cq_capacity: self.tx_cq_capacity,
            amo_deny: self.amo_deny,
        })
    }
}

/// The in-process fabric shared by every node of the job.
pub struct MemFabric {
    weak: Weak<MemFabric>,
    num_nodes: usize,
    providers: Vec<ProviderInfo>,
    nodes: Vec<NodeState>,
    registry: DashMap<u64, (usize, EpKind)>,
    next_name: AtomicU64,
    next_token: AtomicUsize,
    trace: Mutex<Vec<TraceRecord>>,
    file_budget: Option<(AtomicI64, usize)>,
    tx_cq_capacity: usize,
    amo_deny: Vec<AmoType>,
}

impl MemFabric {
    #[must_use]
    pub fn builder() -> MemFabricBuilder {
        MemFabricBuilder {
            nodes: 1,
            providers: default_providers(),
            file_limit: None,
            tx_cq_capacity: 1024,
            amo_deny: Vec::new(),
            max_msg_size: None,
            inject_size: None,
        }
    }

    /// Snapshot of every operation submitted so far, in submission order.
    #[must_use]
    pub fn trace(&self) -> Vec<TraceRecord> {
        self.trace.lock().unwrap().clone()
    }

    /// The raw advertised provider list, before any query filtering.
    #[must_use]
    pub fn available_providers(&self) -> Vec<ProviderInfo> {
        self.providers.clone()
    }

    pub fn clear_trace(&self) {
        self.trace.lock().unwrap().clear();
    }

    fn record(&self, from: usize, to: usize, op: TraceOp, len: usize) {
        self.trace.lock().unwrap().push(TraceRecord {
            from: NodeId::from_usize(from),
            to: NodeId::from_usize(to),
            op,
            len,
        });
    }

    fn charge_files(&self, n: usize) -> Result<(), FabricError> {
        if let Some((budget, limit)) = &self.file_budget {
            let left = budget.fetch_sub(n as i64, Ordering::AcqRel) - n as i64;
            if left < 0 {
                budget.fetch_add(n as i64, Ordering::AcqRel);
                return Err(FabricError::FileLimit { limit: *limit });
            }
        }
        Ok(())
    }

    fn mint_name(&self, node: usize, kind: EpKind) -> EpName {
        let raw = self.next_name.fetch_add(1, Ordering::AcqRel);
        self.registry.insert(raw, (node, kind));
        EpName(raw)
    }

    fn lookup(&self, name: EpName) -> Result<(usize, EpKind), FabricError> {
        self.registry
            .get(&name.0)
            .map(|e| *e)
            .ok_or(FabricError::BadAddress(name.0))
    }

    /// Maps a (key, offset, len) triple to a virtual address on `node`.
    fn resolve(
        &self,
        node: usize,
        key: u64,
        offset: u64,
        len: usize,
        virt_addr: bool,
    ) -> Result<usize, FabricError> {
        let regions = self.nodes[node].regions.lock().unwrap();
        let region = regions
            .iter()
            .find(|r| r.key == key)
            .ok_or_else(|| FabricError::Internal(format!("unknown mr key {key}")))?;
        let addr = if virt_addr {
            offset as usize
        } else {
            region.base.wrapping_add(offset as usize)
        };
        let end = addr
            .checked_add(len)
            .ok_or_else(|| FabricError::Internal(format!("address overflow at {addr:#x}+{len}")))?;
        if addr < region.base || end > region.base.saturating_add(region.len) {
            return Err(FabricError::Internal(format!(
                "access {addr:#x}+{len} outside region key {key}"
            )));
        }
        Ok(addr)
    }

    /// Deposits a message into `node`'s currently posted landing zone, or
    /// queues it when none is posted.
    fn deliver_msg(&self, node: usize, msg: &[u8]) {
        let state = &self.nodes[node];
        let mut rx = state.am_rx.lock().unwrap();
        if rx.posted.is_empty() {
            rx.queued.push_back(msg.to_vec());
        } else {
            Self::deposit(&mut rx, msg);
        }
        drop(rx);
        state.notify.notify_one();
    }

    fn deposit(rx: &mut AmRxState, msg: &[u8]) {
        let min_multi_recv = rx.min_multi_recv;
        let buf = rx.posted.front_mut().expect("a landing zone is posted");
        let remaining = buf.len - buf.used;
        if msg.len() > remaining {
            rx.error = Some(FabricError::Truncated {
                cq_flags: CqFlags::RECV.bits(),
                offset: buf.used,
                len: msg.len(),
            });
            return;
        }
        let dst = buf.base + buf.used;
        // SAFETY: the landing zone was posted by its owner and stays alive
        // until the endpoint reposts or tears down.
        unsafe {
            std::ptr::copy(msg.as_ptr(), dst as *mut u8, msg.len());
        }
        let mut flags = CqFlags::RECV;
        buf.used += msg.len();
        if buf.len - buf.used < min_multi_recv {
            flags |= CqFlags::MULTI_RECV;
            rx.posted.pop_front();
        }
        rx.cq.push_back(RxCqEntry {
            flags,
            buf_addr: dst,
            len: msg.len(),
        });
    }
}

fn default_providers() -> Vec<ProviderInfo> {
    let full_caps = Caps::MSG
        | Caps::RMA
        | Caps::ATOMIC
        | Caps::MULTI_RECV
        | Caps::LOCAL_COMM
        | Caps::REMOTE_COMM
        | Caps::WAIT_SETS
        | Caps::SCALABLE_MR
        | Caps::SCALABLE_EP;
    vec![
        ProviderInfo {
            name: "mem-dc".into(),
            caps: full_caps,
            op_flags: OpFlags::DELIVERY_COMPLETE,
            tx_order: MsgOrder::empty(),
            max_msg_size: 1 << 20,
            inject_size: 4096,
            max_tx_ctxs: 16,
            min_multi_recv: 2048,
            mr_virt_addr: false,
            utility_stacked: false,
        },
        ProviderInfo {
            name: "mem-mo".into(),
            caps: full_caps,
            op_flags: OpFlags::empty(),
            tx_order: MsgOrder::RAW | MsgOrder::WAW | MsgOrder::SAW,
            max_msg_size: 1 << 20,
            inject_size: 4096,
            max_tx_ctxs: 16,
            min_multi_recv: 2048,
            mr_virt_addr: false,
            utility_stacked: false,
        },
        // Registration-required personality: no scalable MR, no wait sets,
        // so the basic-mode and explicit-polling paths get exercised.
        ProviderInfo {
            name: "mem-basic".into(),
            caps: Caps::MSG
                | Caps::RMA
                | Caps::ATOMIC
                | Caps::MULTI_RECV
                | Caps::LOCAL_COMM
                | Caps::REMOTE_COMM,
            op_flags: OpFlags::empty(),
            tx_order: MsgOrder::RAW | MsgOrder::WAW | MsgOrder::SAW,
            max_msg_size: 1 << 20,
            inject_size: 4096,
            max_tx_ctxs: 16,
            min_multi_recv: 2048,
            mr_virt_addr: false,
            utility_stacked: false,
        },
        // Utility-stacked provider that advertises delivery-complete but is
        // on the known-broken list.
        ProviderInfo {
            name: "tcp;ofi_rxd".into(),
            caps: full_caps,
            op_flags: OpFlags::DELIVERY_COMPLETE,
            tx_order: MsgOrder::RAW | MsgOrder::WAW | MsgOrder::SAW,
            max_msg_size: 1 << 20,
            inject_size: 4096,
            max_tx_ctxs: 16,
            min_multi_recv: 2048,
            mr_virt_addr: false,
            utility_stacked: true,
        },
        ProviderInfo {
            name: "lo".into(),
            caps: full_caps,
            op_flags: OpFlags::DELIVERY_COMPLETE,
            tx_order: MsgOrder::RAW | MsgOrder::WAW | MsgOrder::SAW,
            max_msg_size: 1 << 16,
            inject_size: 512,
            max_tx_ctxs: 4,
            min_multi_recv: 2048,
            mr_virt_addr: false,
            utility_stacked: false,
        },
    ]
}

impl Fabric for MemFabric {
    fn query(&self, hints: &ProviderHints) -> Vec<ProviderInfo> {
        self.providers
            .iter()
            .filter(|p| {
                if let Some(name) = &hints.provider_name {
                    if &p.name != name {
                        return false;
                    }
                }
                if !p.caps.contains(hints.caps & !Caps::WAIT_SETS) {
                    return false;
                }
                if hints.completion == Some(CompletionLevel::DeliveryComplete)
                    && !p.op_flags.contains(OpFlags::DELIVERY_COMPLETE)
                {
                    return false;
                }
                p.tx_order.contains(hints.tx_order)
            })
            .map(|p| {
                let mut granted = p.clone();
                // Completion semantics follow the request: a provider only
                // runs delivery-complete when asked to.
                if hints.completion != Some(CompletionLevel::DeliveryComplete) {
                    granted.op_flags &= !OpFlags::DELIVERY_COMPLETE;
                }
                granted
            })
            .collect()
    }

    fn open(&self, info: &ProviderInfo, node: NodeId) -> Result<Arc<dyn Domain>, FabricError> {
        let fabric = self.weak.upgrade().expect("fabric alive during open");
        if node.as_usize() >= self.num_nodes {
            return Err(FabricError::BadAddress(node.as_usize() as u64));
        }
        trace!(node = %node, provider = %info.name, "opening mem domain");
        Ok(Arc::new(MemDomain {
            fabric,
            node: node.as_usize(),
            info: info.clone(),
            av: Arc::new(Mutex::new(Vec::new())),
            txs: Mutex::new(Vec::new()),
        }))
    }
}

/// One node's view of the in-process fabric.
pub struct MemDomain {
    fabric: Arc<MemFabric>,
    node: usize,
    info: ProviderInfo,
    av: Arc<Mutex<Vec<EpName>>>,
    txs: Mutex<Vec<Arc<MemTx>>>,
}

impl Domain for MemDomain {
    fn info(&self) -> &ProviderInfo {
        &self.info
    }

    fn register(&self, base: usize, len: usize) -> Result<u64, FabricError> {
        let state = &self.fabric.nodes[self.node];
        let key = state.next_key.fetch_add(1, Ordering::AcqRel);
        state.regions.lock().unwrap().push(Region { key, base, len });
        Ok(key)
    }

    fn query_atomic(&self, ty: AmoType, _op: AmoOp) -> bool {
        self.info.caps.contains(Caps::ATOMIC) && !self.fabric.amo_deny.contains(&ty)
    }

    fn create_tx(&self) -> Result<Arc<dyn TxContext>, FabricError> {
        // A transmit context keeps per-peer state; its file cost is one
        // descriptor per node.
        self.fabric.charge_files(self.fabric.num_nodes)?;
        let tx = Arc::new(MemTx {
            fabric: Arc::clone(&self.fabric),
            av: Arc::clone(&self.av),
            node: self.node,
            token: self.fabric.next_token.fetch_add(1, Ordering::AcqRel),
            delivery_complete: self.info.have_delivery_complete(),
            inject_size: self.info.inject_size,
            cq_capacity: self.fabric.tx_cq_capacity,
            mr_virt_addr: self.info.mr_virt_addr,
            inner: Mutex::new(TxInner::default()),
        });
        self.txs.lock().unwrap().push(Arc::clone(&tx));
        Ok(tx)
    }

    fn create_rx_msg(&self, min_multi_recv: usize) -> Result<Arc<dyn RxMsgEndpoint>, FabricError> {
        self.fabric.charge_files(1)?;
        let name = self.fabric.mint_name(self.node, EpKind::Msg);
        self.fabric.nodes[self.node]
            .am_rx
            .lock()
            .unwrap()
            .min_multi_recv = min_multi_recv;
        Ok(Arc::new(MemRxMsg {
            fabric: Arc::clone(&self.fabric),
            node: self.node,
            name,
        }))
    }

    fn create_rx_rma(
        &self,
        _kind: RxCompletionKind,
    ) -> Result<Arc<dyn RxRmaEndpoint>, FabricError> {
        self.fabric.charge_files(1)?;
        let name = self.fabric.mint_name(self.node, EpKind::Rma);
        Ok(Arc::new(MemRxRma {
            fabric: Arc::clone(&self.fabric),
            node: self.node,
            name,
        }))
    }

    fn av_insert(&self, names: &[EpName]) -> Result<Vec<FabricAddr>, FabricError> {
        let mut av = self.av.lock().unwrap();
        let mut out = Vec::with_capacity(names.len());
        for &name in names {
            self.fabric.lookup(name)?;
            out.push(av.len() as FabricAddr);
            av.push(name);
        }
        Ok(out)
    }

    fn create_wait_set(&self, handler_tx_token: usize) -> Option<Arc<dyn WaitSet>> {
        if !self.info.caps.contains(Caps::WAIT_SETS) {
            return None;
        }
        let handler_tx = self
            .txs
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.token == handler_tx_token)
            .cloned()?;
        Some(Arc::new(MemWaitSet {
            fabric: Arc::clone(&self.fabric),
            node: self.node,
            handler_tx,
        }))
    }
}

#[derive(Default)]
struct TxInner {
    /// Buffered writes per destination node, applied on ordered ops or on
    /// transmit progress.
    pending: HashMap<usize, VecDeque<PendingWrite>>,
    cq: VecDeque<TxCqEntry>,
}

struct PendingWrite {
    data: Vec<u8>,
    dst_addr: usize,
    dest_node: usize,
}

/// One transmit context of the in-process provider.
pub struct MemTx {
    fabric: Arc<MemFabric>,
    av: Arc<Mutex<Vec<EpName>>>,
    node: usize,
    token: usize,
    delivery_complete: bool,
    inject_size: usize,
    cq_capacity: usize,
    mr_virt_addr: bool,
    inner: Mutex<TxInner>,
}

impl MemTx {
    fn dest(&self, addr: FabricAddr) -> Result<(usize, EpKind), FabricError> {
        let av = self.av.lock().unwrap();
        let name = *av
            .get(addr as usize)
            .ok_or(FabricError::BadAddress(addr))?;
        drop(av);
        self.fabric.lookup(name)
    }

    fn apply(&self, w: PendingWrite) {
        // SAFETY: the destination range was validated against the target
        // node's registered regions at submission time.
        unsafe {
            std::ptr::copy(w.data.as_ptr(), w.dst_addr as *mut u8, w.data.len());
        }
        self.fabric.nodes[w.dest_node].bump_rma();
    }

    fn drain_pending_for(&self, inner: &mut TxInner, node: usize) {
        if let Some(mut queue) = inner.pending.remove(&node) {
            for w in queue.drain(..) {
                self.apply(w);
            }
        }
    }

    fn drain_all_pending(&self, inner: &mut TxInner) {
        let nodes: Vec<usize> = inner.pending.keys().copied().collect();
        for node in nodes {
            self.drain_pending_for(inner, node);
        }
    }

    fn push_cq(&self, inner: &mut TxInner, entry: TxCqEntry) -> Result<(), FabricError> {
        if inner.cq.len() >= self.cq_capacity {
            return Err(FabricError::Again);
        }
        inner.cq.push_back(entry);
        self.fabric.nodes[self.node].notify.notify_one();
        Ok(())
    }

    fn submit_write(
        &self,
        dest: FabricAddr,
        local: usize,
        len: usize,
        key: u64,
        offset: u64,
        ctx: Option<u64>,
        op: TraceOp,
    ) -> Result<(), FabricError> {
        let (dest_node, kind) = self.dest(dest)?;
        if kind != EpKind::Rma {
            return Err(FabricError::Unsupported("RMA to a message endpoint".into()));
        }
        let dst_addr = self
            .fabric
            .resolve(dest_node, key, offset, len, self.mr_virt_addr)?;
        let mut inner = self.inner.lock().unwrap();
        // Reserve CQ room before doing anything irrevocable.
        if ctx.is_some() && inner.cq.len() >= self.cq_capacity {
            return Err(FabricError::Again);
        }
        self.fabric.record(self.node, dest_node, op, len);
        let data = {
            // SAFETY: the local buffer is owned by the submitting caller
            // and valid for `len` bytes until this call returns; the bytes
            // are captured here so inject semantics hold.
            unsafe { std::slice::from_raw_parts(local as *const u8, len) }.to_vec()
        };
        let write = PendingWrite {
            data,
            dst_addr,
            dest_node,
        };
        if self.delivery_complete {
            self.apply(write);
        } else {
            inner.pending.entry(dest_node).or_default().push_back(write);
        }
        if let Some(ctx) = ctx {
            self.push_cq(&mut inner, TxCqEntry {
                ctx,
                flags: CqFlags::WRITE,
            })?;
        }
        Ok(())
    }
}

impl TxContext for MemTx {
    fn token(&self) -> usize {
        self.token
    }

    fn inject_send(&self, dest: FabricAddr, msg: &[u8]) -> Result<(), FabricError> {
        if msg.len() > self.inject_size {
            return Err(FabricError::Unsupported(format!(
                "inject of {} bytes exceeds inject size {}",
                msg.len(),
                self.inject_size
            )));
        }
        let (dest_node, kind) = self.dest(dest)?;
        if kind != EpKind::Msg {
            return Err(FabricError::Unsupported("send to an RMA endpoint".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        // Send-after-write: messages may not pass writes to the same node.
        self.drain_pending_for(&mut inner, dest_node);
        drop(inner);
        self.fabric
            .record(self.node, dest_node, TraceOp::InjectSend, msg.len());
        self.fabric.deliver_msg(dest_node, msg);
        Ok(())
    }

    fn send(&self, dest: FabricAddr, msg: &[u8], ctx: u64) -> Result<(), FabricError> {
        let (dest_node, kind) = self.dest(dest)?;
        if kind != EpKind::Msg {
            return Err(FabricError::Unsupported("send to an RMA endpoint".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.cq.len() >= self.cq_capacity {
            return Err(FabricError::Again);
        }
        self.drain_pending_for(&mut inner, dest_node);
        self.fabric
            .record(self.node, dest_node, TraceOp::Send, msg.len());
        self.fabric.deliver_msg(dest_node, msg);
        self.push_cq(&mut inner, TxCqEntry {
            ctx,
            flags: CqFlags::SEND,
        })?;
        Ok(())
    }

    fn inject_write(
        &self,
        dest: FabricAddr,
        local: usize,
        len: usize,
        key: u64,
        offset: u64,
    ) -> Result<(), FabricError> {
        if len > self.inject_size {
            return Err(FabricError::Unsupported(format!(
                "inject of {len} bytes exceeds inject size {}",
                self.inject_size
            )));
        }
        self.submit_write(dest, local, len, key, offset, None, TraceOp::InjectWrite)
    }

    fn write(
        &self,
        dest: FabricAddr,
        local: usize,
        len: usize,
        key: u64,
        offset: u64,
        ctx: u64,
        _more: bool,
    ) -> Result<(), FabricError> {
        self.submit_write(dest, local, len, key, offset, Some(ctx), TraceOp::Write)
    }

    fn read(
        &self,
        dest: FabricAddr,
        local: usize,
        len: usize,
        key: u64,
        offset: u64,
        ctx: u64,
        _more: bool,
    ) -> Result<(), FabricError> {
        let (dest_node, kind) = self.dest(dest)?;
        if kind != EpKind::Rma {
            return Err(FabricError::Unsupported("RMA to a message endpoint".into()));
        }
        let src_addr = self
            .fabric
            .resolve(dest_node, key, offset, len, self.mr_virt_addr)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.cq.len() >= self.cq_capacity {
            return Err(FabricError::Again);
        }
        // Read-after-write: the read observes every prior write on this pair.
        self.drain_pending_for(&mut inner, dest_node);
        self.fabric.record(self.node, dest_node, TraceOp::Read, len);
        // SAFETY: the source range was validated against the target node's
        // registered regions; the local destination is owned by the caller.
        unsafe {
            std::ptr::copy(src_addr as *const u8, local as *mut u8, len);
        }
        self.fabric.nodes[dest_node].bump_rma();
        self.push_cq(&mut inner, TxCqEntry {
            ctx,
            flags: CqFlags::READ,
        })?;
        Ok(())
    }

    fn atomic(
        &self,
        dest: FabricAddr,
        desc: &AtomicDesc,
        ctx: u64,
        _more: bool,
    ) -> Result<(), FabricError> {
        let (dest_node, kind) = self.dest(dest)?;
        if kind != EpKind::Rma {
            return Err(FabricError::Unsupported(
                "atomic to a message endpoint".into(),
            ));
        }
        if self.fabric.amo_deny.contains(&desc.ty) {
            return Err(FabricError::Unsupported(format!(
                "native atomic on {:?} disabled",
                desc.ty
            )));
        }
        let size = desc.ty.size();
        let obj_addr = self
            .fabric
            .resolve(dest_node, desc.key, desc.offset, size, self.mr_virt_addr)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.cq.len() >= self.cq_capacity {
            return Err(FabricError::Again);
        }
        self.drain_pending_for(&mut inner, dest_node);
        self.fabric
            .record(self.node, dest_node, TraceOp::Atomic, size);
        // SAFETY: object and fetch addresses were validated against
        // registered regions / are owned by the caller.
        let old = unsafe { cpu::cpu_amo_raw(obj_addr, desc.ty, desc.op, desc.opnd, desc.cmpr) };
        if let Some(fetch_addr) = desc.fetch_addr {
            unsafe {
                cpu::store_raw(fetch_addr, desc.ty, old);
            }
        }
        self.fabric.nodes[dest_node].bump_rma();
        self.push_cq(&mut inner, TxCqEntry {
            ctx,
            flags: CqFlags::ATOMIC,
        })?;
        Ok(())
    }

    fn poll_cq(&self, out: &mut Vec<TxCqEntry>, max: usize) -> Result<usize, FabricError> {
        let mut inner = self.inner.lock().unwrap();
        // Polling drives transmit progress: buffered writes land now.
        self.drain_all_pending(&mut inner);
        let n = max.min(inner.cq.len());
        out.extend(inner.cq.drain(..n));
        Ok(n)
    }
}

struct MemRxMsg {
    fabric: Arc<MemFabric>,
    node: usize,
    name: EpName,
}

impl RxMsgEndpoint for MemRxMsg {
    fn name(&self) -> EpName {
        self.name
    }

    fn post_multi_recv(&self, base: usize, len: usize) -> Result<(), FabricError> {
        let state = &self.fabric.nodes[self.node];
        let mut rx = state.am_rx.lock().unwrap();
        rx.posted.push_back(PostedBuf { base, len, used: 0 });
        // Backed-up messages land as soon as a zone is available again.
        while !rx.queued.is_empty() && !rx.posted.is_empty() && rx.error.is_none() {
            let msg = rx.queued.pop_front().expect("nonempty queue");
            MemFabric::deposit(&mut rx, &msg);
        }
        drop(rx);
        state.notify.notify_one();
        Ok(())
    }

    fn poll_cq(&self, out: &mut Vec<RxCqEntry>, max: usize) -> Result<usize, FabricError> {
        let mut rx = self.fabric.nodes[self.node].am_rx.lock().unwrap();
        if let Some(err) = rx.error.take() {
            return Err(err);
        }
        let n = max.min(rx.cq.len());
        out.extend(rx.cq.drain(..n));
        Ok(n)
    }
}

struct MemRxRma {
    fabric: Arc<MemFabric>,
    node: usize,
    name: EpName,
}

impl RxRmaEndpoint for MemRxRma {
    fn name(&self) -> EpName {
        self.name
    }

    fn poll_cq(&self) -> u64 {
        self.fabric.nodes[self.node]
            .rma_cq_events
            .swap(0, Ordering::AcqRel)
    }

    fn read_counter(&self) -> u64 {
        self.fabric.nodes[self.node].rma_counter.load(Ordering::Acquire)
    }
}

struct MemWaitSet {
    fabric: Arc<MemFabric>,
    node: usize,
    handler_tx: Arc<MemTx>,
}

#[async_trait]
impl WaitSet for MemWaitSet {
    fn poll(&self) -> Vec<PollEvent> {
        let mut events = Vec::new();
        let state = &self.fabric.nodes[self.node];
        {
            let rx = state.am_rx.lock().unwrap();
            if !rx.cq.is_empty() || rx.error.is_some() {
                events.push(PollEvent::AmRx);
            }
        }
        if state.rma_cq_events.load(Ordering::Acquire) > 0 {
            events.push(PollEvent::RmaRx);
        }
        {
            let mut inner = self.handler_tx.inner.lock().unwrap();
            // Poll-set polling is a progress point for the handler's
            // transmit context.
            self.handler_tx.drain_all_pending(&mut inner);
            if !inner.cq.is_empty() {
                events.push(PollEvent::HandlerTx);
            }
        }
        events
    }

    async fn wait(&self, timeout: Duration) {
        let notified = self.fabric.nodes[self.node].notify.notified();
        let _ = tokio::time::timeout(timeout, notified).await;
    }
}
