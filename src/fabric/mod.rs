//! Fabric transport abstraction
//!
//! The communication layer talks to the network through these traits. They
//! model the slice of a libfabric-style transport the layer actually uses:
//! provider discovery with capability hints, memory registration, transmit
//! contexts with RMA/atomic/message verbs, receive endpoints with
//! multi-receive buffers, completion queues and counters, and an optional
//! poll/wait set.
//!
//! Submission and polling are non-blocking calls; only [`WaitSet::wait`]
//! suspends. The in-process provider lives in [`mem`].

pub mod mem;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;

use crate::error::FabricError;
use crate::types::{AmoOp, AmoType, NodeId};

bitflags! {
    /// Capabilities requested from or granted by a provider.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        const MSG         = 1 << 0;
        const RMA         = 1 << 1;
        const ATOMIC      = 1 << 2;
        const MULTI_RECV  = 1 << 3;
        const LOCAL_COMM  = 1 << 4;
        const REMOTE_COMM = 1 << 5;
        const WAIT_SETS   = 1 << 6;
        const SCALABLE_MR = 1 << 7;
        const SCALABLE_EP = 1 << 8;
    }

    /// Transaction orderings a provider guarantees on a tx->rx endpoint pair.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgOrder: u32 {
        /// Read-after-write.
        const RAW = 1 << 0;
        /// Write-after-write.
        const WAW = 1 << 1;
        /// Send-after-write.
        const SAW = 1 << 2;
    }

    /// Per-operation flags granted by the provider.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u32 {
        const DELIVERY_COMPLETE = 1 << 0;
    }

    /// Flags on a completion-queue entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CqFlags: u32 {
        const RECV       = 1 << 0;
        /// The multi-receive buffer this entry landed in has been released.
        const MULTI_RECV = 1 << 1;
        const SEND       = 1 << 2;
        const WRITE      = 1 << 3;
        const READ       = 1 << 4;
        const ATOMIC     = 1 << 5;
    }
}

/// Endpoint types the layer can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpType {
    /// Reliable datagram.
    #[default]
    Rdm,
}

/// Address-vector types the layer can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AvType {
    #[default]
    Table,
}

/// Threading models the layer can request. The layer serializes access to
/// each context itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Threading {
    #[default]
    CallerSerialized,
}

/// Completion semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionLevel {
    /// Complete only once the target has visibly received the data.
    DeliveryComplete,
    /// Complete once locally submitted; ordering holds per endpoint pair.
    TransmitComplete,
}

/// Capability hints passed to [`Fabric::query`].
#[derive(Debug, Clone)]
pub struct ProviderHints {
    pub caps: Caps,
    pub ep_type: EpType,
    pub av_type: AvType,
    pub threading: Threading,
    pub resource_mgmt: bool,
    /// Requested completion semantics, if any.
    pub completion: Option<CompletionLevel>,
    /// Required transaction orderings.
    pub tx_order: MsgOrder,
    /// Restrict the query to a provider with this exact name.
    pub provider_name: Option<String>,
}

impl ProviderHints {
    /// The base hints every query round starts from.
    #[must_use]
    pub fn base() -> Self {
        Self {
            caps: Caps::MSG | Caps::MULTI_RECV | Caps::RMA | Caps::LOCAL_COMM | Caps::REMOTE_COMM,
            ep_type: EpType::Rdm,
            av_type: AvType::Table,
            threading: Threading::CallerSerialized,
            resource_mgmt: true,
            completion: None,
            tx_order: MsgOrder::empty(),
            provider_name: None,
        }
    }
}

/// One provider instance returned by discovery.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub name: String,
    pub caps: Caps,
    pub op_flags: OpFlags,
    pub tx_order: MsgOrder,
    pub max_msg_size: usize,
    pub inject_size: usize,
    pub max_tx_ctxs: usize,
    pub min_multi_recv: usize,
    /// Keys address remote regions by virtual address rather than offset.
    pub mr_virt_addr: bool,
    /// Stacked on a utility provider (name of the form `core;utility`).
    pub utility_stacked: bool,
}

impl ProviderInfo {
    /// Whether the provider reported delivery-complete support.
    #[must_use]
    pub fn have_delivery_complete(&self) -> bool {
        self.op_flags.contains(OpFlags::DELIVERY_COMPLETE)
    }

    /// Whether the provider guarantees every ordering in `required`.
    #[must_use]
    pub fn orders(&self, required: MsgOrder) -> bool {
        self.tx_order.contains(required)
    }
}

/// An index into the address vector.
pub type FabricAddr = u64;

/// An endpoint name, exchanged out of band and inserted into address
/// vectors. Opaque to everything but the fabric that minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpName(pub u64);

impl EpName {
    pub const WIRE_SIZE: usize = 8;

    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::WIRE_SIZE] {
        self.0.to_le_bytes()
    }

    #[must_use]
    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut b = [0u8; Self::WIRE_SIZE];
        b.copy_from_slice(&raw[..Self::WIRE_SIZE]);
        Self(u64::from_le_bytes(b))
    }
}

/// Descriptor for one remote atomic operation.
#[derive(Debug, Clone)]
pub struct AtomicDesc {
    /// Remote key covering the target object.
    pub key: u64,
    /// Offset of the object within the keyed region.
    pub offset: u64,
    pub ty: AmoType,
    pub op: AmoOp,
    /// Operand bit pattern, zero-extended to 64 bits.
    pub opnd: u64,
    /// Comparand bit pattern; only read for compare-and-swap.
    pub cmpr: u64,
    /// Local address the previous value is fetched into, if any.
    pub fetch_addr: Option<usize>,
}

/// A transmit-side completion.
#[derive(Debug, Clone, Copy)]
pub struct TxCqEntry {
    /// The context value supplied at submission.
    pub ctx: u64,
    pub flags: CqFlags,
}

/// A receive-side completion.
#[derive(Debug, Clone, Copy)]
pub struct RxCqEntry {
    pub flags: CqFlags,
    /// Address the message landed at.
    pub buf_addr: usize,
    pub len: usize,
}

/// Which completion object backs the RMA-target receive endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxCompletionKind {
    Queue,
    Counter,
}

/// Events a poll set reports ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// The AM request receive CQ has entries.
    AmRx,
    /// The RMA-target completion object advanced.
    RmaRx,
    /// The handler's transmit CQ has entries.
    HandlerTx,
}

/// Entry point: provider discovery and domain creation.
pub trait Fabric: Send + Sync {
    /// Returns every provider instance matching the hints, best first.
    fn query(&self, hints: &ProviderHints) -> Vec<ProviderInfo>;

    /// Opens a domain on the selected provider for `node`.
    fn open(&self, info: &ProviderInfo, node: NodeId) -> Result<Arc<dyn Domain>, FabricError>;
}

/// An open provider domain for one node.
pub trait Domain: Send + Sync {
    fn info(&self) -> &ProviderInfo;

    /// Registers `[base, base+len)` and returns the remote key peers use to
    /// address it.
    fn register(&self, base: usize, len: usize) -> Result<u64, FabricError>;

    /// True when the provider can execute `(ty, op)` natively.
    fn query_atomic(&self, ty: AmoType, op: AmoOp) -> bool;

    fn create_tx(&self) -> Result<Arc<dyn TxContext>, FabricError>;

    /// Creates the AM-request receive endpoint. Messages shorter than
    /// `min_multi_recv` remaining in a landing zone release the buffer.
    fn create_rx_msg(&self, min_multi_recv: usize) -> Result<Arc<dyn RxMsgEndpoint>, FabricError>;

    fn create_rx_rma(&self, kind: RxCompletionKind) -> Result<Arc<dyn RxRmaEndpoint>, FabricError>;

    /// Inserts endpoint names into the address vector, returning their
    /// fabric addresses in order.
    fn av_insert(&self, names: &[EpName]) -> Result<Vec<FabricAddr>, FabricError>;

    /// Builds a poll/wait set over the AM rx CQ, the RMA rx completion
    /// object, and the transmit CQ identified by `handler_tx_token`.
    /// `None` when the provider cannot support wait sets.
    fn create_wait_set(&self, handler_tx_token: usize) -> Option<Arc<dyn WaitSet>>;
}

impl std::fmt::Debug for dyn TxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxContext").field("token", &self.token()).finish()
    }
}

/// One transmit context. The caller serializes access.
pub trait TxContext: Send + Sync {
    /// Identifies this context's CQ for wait-set membership.
    fn token(&self) -> usize;

    /// Sends a message without generating a completion. The buffer is
    /// reusable on return. Fails on messages above the inject size.
    fn inject_send(&self, dest: FabricAddr, msg: &[u8]) -> Result<(), FabricError>;

    fn send(&self, dest: FabricAddr, msg: &[u8], ctx: u64) -> Result<(), FabricError>;

    /// RMA write without a completion; buffer reusable on return.
    fn inject_write(
        &self,
        dest: FabricAddr,
        local: usize,
        len: usize,
        key: u64,
        offset: u64,
    ) -> Result<(), FabricError>;

    /// RMA write with a completion. `more` hints that further operations
    /// for the same batch follow immediately.
    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        dest: FabricAddr,
        local: usize,
        len: usize,
        key: u64,
        offset: u64,
        ctx: u64,
        more: bool,
    ) -> Result<(), FabricError>;

    /// RMA read with a completion.
    #[allow(clippy::too_many_arguments)]
    fn read(
        &self,
        dest: FabricAddr,
        local: usize,
        len: usize,
        key: u64,
        offset: u64,
        ctx: u64,
        more: bool,
    ) -> Result<(), FabricError>;

    /// Remote atomic operation.
    fn atomic(
        &self,
        dest: FabricAddr,
        desc: &AtomicDesc,
        ctx: u64,
        more: bool,
    ) -> Result<(), FabricError>;

    /// Drains up to `max` completions into `out`, returning the count.
    /// Also drives transmit progress.
    fn poll_cq(&self, out: &mut Vec<TxCqEntry>, max: usize) -> Result<usize, FabricError>;
}

/// The AM-request receive endpoint.
pub trait RxMsgEndpoint: Send + Sync {
    fn name(&self) -> EpName;

    /// Posts `[base, base+len)` as a multi-receive landing zone.
    fn post_multi_recv(&self, base: usize, len: usize) -> Result<(), FabricError>;

    fn poll_cq(&self, out: &mut Vec<RxCqEntry>, max: usize) -> Result<usize, FabricError>;
}

/// The RMA-target receive endpoint. Completion state is drained either
/// through the CQ or through the counter, selected at init.
pub trait RxRmaEndpoint: Send + Sync {
    fn name(&self) -> EpName;

    /// Drains the completion queue, returning how many events it held.
    fn poll_cq(&self) -> u64;

    /// Reads the cumulative completion counter.
    fn read_counter(&self) -> u64;
}

/// A poll/wait set over the handler's completion objects.
#[async_trait]
pub trait WaitSet: Send + Sync {
    /// Reports which members have work, without blocking.
    fn poll(&self) -> Vec<PollEvent>;

    /// Suspends until a member may have work, or the timeout elapses.
    async fn wait(&self, timeout: Duration);
}
