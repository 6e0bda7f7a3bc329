//! Transmit-context scheduling
//!
//! The context table is partitioned: worker entries `[0, W)` float between
//! tasks, the final entry is reserved for the AM handler. Binding pins an
//! entry to one owner permanently, which is what lets the ordering layer
//! lean on the provider's per-endpoint-pair guarantees across calls.
//!
//! Completion contexts are an explicit sum type squeezed into the 64-bit
//! context word the fabric echoes back: one tag bit plus a 63-bit payload
//! that is either a fire-and-forget id or a waiter slot.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::task::yield_now;
use tracing::trace;

use crate::error::{CommError, CommResult, FabricError};
use crate::fabric::{TxContext, TxCqEntry};
use crate::tasking::{TaskKey, TaskRegistry};

/// How many completions one progress call reaps at most.
const CQ_BURST: usize = 32;

/// A decoded completion context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionCtx {
    /// Fire-and-forget; the completion is discarded.
    Id(u64),
    /// Identifies a blocking waiter's slot.
    Waiter(u64),
}

const CTX_TAG_BIT: u64 = 1 << 63;

impl CompletionCtx {
    pub(crate) fn encode(self) -> u64 {
        match self {
            CompletionCtx::Id(v) => v & !CTX_TAG_BIT,
            CompletionCtx::Waiter(v) => v | CTX_TAG_BIT,
        }
    }

    pub(crate) fn decode(raw: u64) -> Self {
        if raw & CTX_TAG_BIT != 0 {
            CompletionCtx::Waiter(raw & !CTX_TAG_BIT)
        } else {
            CompletionCtx::Id(raw)
        }
    }
}

/// Bookkeeping for one transmit context.
pub(crate) struct Tci {
    pub(crate) idx: usize,
    pub(crate) tx: Arc<dyn TxContext>,
    allocated: AtomicBool,
    bound: AtomicBool,
    owner: Mutex<Option<TaskKey>>,
    txns_out: AtomicU64,
    txns_sent: AtomicU64,
    waiters: DashMap<u64, Arc<AtomicBool>>,
    next_ctx: AtomicU64,
}

impl Tci {
    fn new(idx: usize, tx: Arc<dyn TxContext>) -> Self {
        Self {
            idx,
            tx,
            allocated: AtomicBool::new(false),
            bound: AtomicBool::new(false),
            owner: Mutex::new(None),
            txns_out: AtomicU64::new(0),
            txns_sent: AtomicU64::new(0),
            waiters: DashMap::new(),
            next_ctx: AtomicU64::new(1),
        }
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> bool {
        self.allocated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn bind(&self, key: TaskKey) {
        self.bound.store(true, Ordering::Release);
        *self.owner.lock().unwrap() = Some(key);
    }

    fn owned_by(&self, key: TaskKey) -> bool {
        *self.owner.lock().unwrap() == Some(key)
    }

    /// Registers a blocking waiter and returns its encoded context.
    pub(crate) fn post_waiter(&self) -> (u64, Arc<AtomicBool>) {
        let id = self.next_ctx.fetch_add(1, Ordering::AcqRel);
        let flag = Arc::new(AtomicBool::new(false));
        self.waiters.insert(id, Arc::clone(&flag));
        self.txns_out.fetch_add(1, Ordering::AcqRel);
        self.txns_sent.fetch_add(1, Ordering::AcqRel);
        (CompletionCtx::Waiter(id).encode(), flag)
    }

    /// An encoded context for a completion nobody waits on.
    pub(crate) fn fire_and_forget_ctx(&self) -> u64 {
        let id = self.next_ctx.fetch_add(1, Ordering::AcqRel);
        self.txns_out.fetch_add(1, Ordering::AcqRel);
        self.txns_sent.fetch_add(1, Ordering::AcqRel);
        CompletionCtx::Id(id).encode()
    }

    /// Reaps a burst of transmit completions, waking waiters.
    pub(crate) fn check_tx_completions(&self) -> CommResult<usize> {
        let mut entries: Vec<TxCqEntry> = Vec::with_capacity(CQ_BURST);
        let n = self.tx.poll_cq(&mut entries, CQ_BURST)?;
        for entry in &entries {
            match CompletionCtx::decode(entry.ctx) {
                CompletionCtx::Id(_) => {}
                CompletionCtx::Waiter(id) => {
                    let (_, flag) = self.waiters.remove(&id).ok_or_else(|| {
                        CommError::BadState(format!("completion for unknown waiter slot {id}"))
                    })?;
                    flag.store(true, Ordering::Release);
                }
            }
            let _ = self
                .txns_out
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_sub(1))
                });
        }
        Ok(n)
    }

    /// Drives transmit progress; used inside wait loops and retry loops.
    pub(crate) fn ensure_progress(&self) -> CommResult<()> {
        self.check_tx_completions().map(|_| ())
    }
}

/// Spins a submission past transient "again" returns, driving progress
/// between attempts.
pub(crate) async fn ride_out_eagain<T>(
    tci: &Tci,
    mut submit: impl FnMut() -> Result<T, FabricError>,
) -> CommResult<T> {
    loop {
        match submit() {
            Err(FabricError::Again) => {
                tci.ensure_progress()?;
                yield_now().await;
            }
            other => return other.map_err(CommError::from),
        }
    }
}

/// Spins until a waiter flag fires, reaping completions between polls.
pub(crate) async fn wait_tx_done(tci: &Tci, flag: &AtomicBool) -> CommResult<()> {
    while !flag.load(Ordering::Acquire) {
        tci.check_tx_completions()?;
        if flag.load(Ordering::Acquire) {
            break;
        }
        yield_now().await;
    }
    Ok(())
}

/// The transmit-context table.
pub(crate) struct TciTable {
    entries: Vec<Arc<Tci>>,
    num_workers: usize,
    fixed_binding: bool,
    rotor: AtomicUsize,
}

impl TciTable {
    pub(crate) fn new(
        txs: Vec<Arc<dyn TxContext>>,
        num_workers: usize,
        fixed_binding: bool,
    ) -> Self {
        assert!(num_workers < txs.len(), "handler entries follow the workers");
        Self {
            entries: txs
                .into_iter()
                .enumerate()
                .map(|(idx, tx)| Arc::new(Tci::new(idx, tx)))
                .collect(),
            num_workers,
            fixed_binding,
            rotor: AtomicUsize::new(0),
        }
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub(crate) fn entry(&self, idx: usize) -> &Arc<Tci> {
        &self.entries[idx]
    }

    /// Allocates a worker context to the calling task.
    pub(crate) async fn alloc(
        self: &Arc<Self>,
        tasks: &TaskRegistry,
    ) -> CommResult<TciGuard> {
        let key = TaskRegistry::current_key();
        let (cached, is_fixed) = tasks.with(|t| (t.last_tci, t.is_fixed));

        // Cached entry first: a bound entry is ours outright, an unbound
        // one we try to reacquire.
        if let Some(idx) = cached {
            let e = &self.entries[idx];
            if e.is_bound() {
                if e.owned_by(key) {
                    return Ok(TciGuard {
                        table: Arc::clone(self),
                        idx,
                    });
                }
            } else if e.try_acquire() {
                return Ok(TciGuard {
                    table: Arc::clone(self),
                    idx,
                });
            }
        }

        let start = cached
            .map(|i| i + 1)
            .unwrap_or_else(|| self.rotor.fetch_add(1, Ordering::AcqRel))
            % self.num_workers;

        loop {
            let mut all_bound = true;
            for k in 0..self.num_workers {
                let idx = (start + k) % self.num_workers;
                let e = &self.entries[idx];
                if e.is_bound() {
                    if e.owned_by(key) {
                        tasks.with(|t| t.last_tci = Some(idx));
                        return Ok(TciGuard {
                            table: Arc::clone(self),
                            idx,
                        });
                    }
                    continue;
                }
                all_bound = false;
                if e.try_acquire() {
                    if is_fixed && self.fixed_binding {
                        e.bind(key);
                        trace!(idx, "bound transmit context");
                    }
                    tasks.with(|t| t.last_tci = Some(idx));
                    return Ok(TciGuard {
                        table: Arc::clone(self),
                        idx,
                    });
                }
            }
            if all_bound {
                // Every worker entry is permanently owned by someone else;
                // no amount of waiting can satisfy this caller.
                return Err(CommError::BadState(
                    "all worker transmit contexts are bound to other tasks".into(),
                ));
            }
            yield_now().await;
        }
    }

    /// The handler's dedicated entry; always bound to its caller.
    pub(crate) fn alloc_for_handler(self: &Arc<Self>) -> TciGuard {
        let idx = self.num_workers;
        let e = &self.entries[idx];
        e.allocated.store(true, Ordering::Release);
        e.bind(TaskRegistry::current_key());
        TciGuard {
            table: Arc::clone(self),
            idx,
        }
    }
}

/// Exclusive hold on one context. Bound entries stay allocated on drop;
/// floating entries return to the pool.
///
/// The hold is owned by the task, so awaiting while holding it cannot
/// migrate the entry away from its completion state.
pub(crate) struct TciGuard {
    table: Arc<TciTable>,
    idx: usize,
}

impl std::ops::Deref for TciGuard {
    type Target = Tci;

    fn deref(&self) -> &Tci {
        self.table.entries[self.idx].as_ref()
    }
}

impl Drop for TciGuard {
    fn drop(&mut self) {
        let e = &self.table.entries[self.idx];
        if !e.is_bound() {
            e.allocated.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{CqFlags, FabricAddr};

    /// Transmit stub whose CQ the test scripts by hand.
    struct StubTx {
        cq: Mutex<Vec<TxCqEntry>>,
    }

    impl StubTx {
        fn shared() -> Arc<Self> {
            Arc::new(Self {
                cq: Mutex::new(Vec::new()),
            })
        }

        fn complete(&self, ctx: u64) {
            self.cq.lock().unwrap().push(TxCqEntry {
                ctx,
                flags: CqFlags::WRITE,
            });
        }
    }

    impl TxContext for StubTx {
        fn token(&self) -> usize {
            0
        }
        fn inject_send(&self, _: FabricAddr, _: &[u8]) -> Result<(), FabricError> {
            Ok(())
        }
        fn send(&self, _: FabricAddr, _: &[u8], _: u64) -> Result<(), FabricError> {
            Ok(())
        }
        fn inject_write(
            &self,
            _: FabricAddr,
            _: usize,
            _: usize,
            _: u64,
            _: u64,
        ) -> Result<(), FabricError> {
            Ok(())
        }
        fn write(
            &self,
            _: FabricAddr,
            _: usize,
            _: usize,
            _: u64,
            _: u64,
            _: u64,
            _: bool,
        ) -> Result<(), FabricError> {
            Ok(())
        }
        fn read(
            &self,
            _: FabricAddr,
            _: usize,
            _: usize,
            _: u64,
            _: u64,
            _: u64,
            _: bool,
        ) -> Result<(), FabricError> {
            Ok(())
        }
        fn atomic(
            &self,
            _: FabricAddr,
            _: &crate::fabric::AtomicDesc,
            _: u64,
            _: bool,
        ) -> Result<(), FabricError> {
            Ok(())
        }
        fn poll_cq(&self, out: &mut Vec<TxCqEntry>, max: usize) -> Result<usize, FabricError> {
            let mut cq = self.cq.lock().unwrap();
            let n = max.min(cq.len());
            out.extend(cq.drain(..n));
            Ok(n)
        }
    }

    fn table(workers: usize, fixed_binding: bool) -> Arc<TciTable> {
        let txs: Vec<Arc<dyn TxContext>> = (0..=workers)
            .map(|_| StubTx::shared() as Arc<dyn TxContext>)
            .collect();
        Arc::new(TciTable::new(txs, workers, fixed_binding))
    }

    #[test]
    fn completion_ctx_round_trips() {
        for ctx in [
            CompletionCtx::Id(0),
            CompletionCtx::Id(12345),
            CompletionCtx::Waiter(0),
            CompletionCtx::Waiter((1 << 63) - 1),
        ] {
            assert_eq!(CompletionCtx::decode(ctx.encode()), ctx);
        }
    }

    #[tokio::test]
    async fn concurrent_holds_get_distinct_entries() {
        let table = table(2, false);
        let tasks = TaskRegistry::new(1);
        let a = table.alloc(&tasks).await.unwrap();
        let b = table.alloc(&tasks).await.unwrap();
        assert_ne!(a.idx, b.idx);
        drop(a);
        drop(b);
        // Freed entries are reusable.
        let c = table.alloc(&tasks).await.unwrap();
        assert!(c.idx < 2);
        tasks.remove_current();
    }

    #[tokio::test]
    async fn bound_entry_is_reused_without_reacquisition() {
        let table = table(2, true);
        let tasks = TaskRegistry::new(1);
        tasks.with(|t| t.is_fixed = true);
        let a = table.alloc(&tasks).await.unwrap();
        let idx = a.idx;
        assert!(a.is_bound());
        drop(a);
        let b = table.alloc(&tasks).await.unwrap();
        assert_eq!(b.idx, idx);
        tasks.remove_current();
    }

    #[tokio::test]
    async fn handler_entry_is_the_reserved_slot() {
        let table = table(3, false);
        let guard = table.alloc_for_handler();
        assert_eq!(guard.idx, 3);
        assert!(guard.is_bound());
    }

    #[tokio::test]
    async fn waiter_completion_wakes_flag() {
        let stub = StubTx::shared();
        let tci = Tci::new(0, Arc::clone(&stub) as Arc<dyn TxContext>);
        let (ctx, flag) = tci.post_waiter();
        stub.complete(ctx);
        tci.check_tx_completions().unwrap();
        assert!(flag.load(Ordering::Acquire));
        wait_tx_done(&tci, &flag).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_waiter_slot_is_bad_state() {
        let stub = StubTx::shared();
        let tci = Tci::new(0, Arc::clone(&stub) as Arc<dyn TxContext>);
        stub.complete(CompletionCtx::Waiter(99).encode());
        match tci.check_tx_completions() {
            Err(CommError::BadState(msg)) => assert!(msg.contains("99")),
            other => panic!("expected BadState, got {other:?}"),
        }
    }
}
