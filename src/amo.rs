//! Remote atomic memory operations
//!
//! Three execution paths, picked in order: CPU when the job has one node or
//! the target is local and the fabric cannot help; native fabric atomics
//! when the provider validated the whole `(type, op)` matrix for the
//! datatype at init; an AM-mediated CPU atomic at the owner otherwise.
//!
//! Operand and result values travel as 64-bit patterns zero-extended from
//! the operand width, so one signature covers the whole datatype set.

use tracing::trace;

use crate::am::AmRequest;
use crate::error::{CommError, CommResult};
use crate::fabric::AtomicDesc;
use crate::runtime::Comm;
use crate::tci::{ride_out_eagain, wait_tx_done};
use crate::types::{AmoOp, AmoType, NodeId};

/// CPU-side atomic matrix on raw addresses.
///
/// Also used by the in-process fabric to execute "native" atomics at the
/// target, which keeps the two paths bit-for-bit identical.
pub(crate) mod cpu {
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    use crate::types::{AmoOp, AmoType};

    /// Executes `(op, ty)` on the naturally-aligned object at `addr`,
    /// returning the previous value's bit pattern.
    ///
    /// # Safety
    /// `addr` must point to a live, naturally-aligned object of the
    /// operand width that is only accessed atomically for the duration of
    /// the call.
    pub(crate) unsafe fn cpu_amo_raw(
        addr: usize,
        ty: AmoType,
        op: AmoOp,
        opnd: u64,
        cmpr: u64,
    ) -> u64 {
        match ty.size() {
            4 => unsafe {
                u64::from(amo32(
                    addr,
                    ty,
                    op,
                    opnd as u32,
                    cmpr as u32,
                ))
            },
            _ => unsafe { amo64(addr, ty, op, opnd, cmpr) },
        }
    }

    /// Stores a value pattern of `ty`'s width at `addr`.
    ///
    /// # Safety
    /// Same contract as [`cpu_amo_raw`].
    pub(crate) unsafe fn store_raw(addr: usize, ty: AmoType, val: u64) {
        if ty.size() == 4 {
            let a = unsafe { AtomicU32::from_ptr(addr as *mut u32) };
            a.store(val as u32, Ordering::Release);
        } else {
            let a = unsafe { AtomicU64::from_ptr(addr as *mut u64) };
            a.store(val, Ordering::Release);
        }
    }

    /// Loads a value pattern of `ty`'s width from `addr`.
    ///
    /// # Safety
    /// Same contract as [`cpu_amo_raw`].
    pub(crate) unsafe fn load_raw(addr: usize, ty: AmoType) -> u64 {
        if ty.size() == 4 {
            let a = unsafe { AtomicU32::from_ptr(addr as *mut u32) };
            u64::from(a.load(Ordering::Acquire))
        } else {
            let a = unsafe { AtomicU64::from_ptr(addr as *mut u64) };
            a.load(Ordering::Acquire)
        }
    }

    unsafe fn amo32(addr: usize, ty: AmoType, op: AmoOp, opnd: u32, cmpr: u32) -> u32 {
        let a = unsafe { AtomicU32::from_ptr(addr as *mut u32) };
        match op {
            AmoOp::Read => a.load(Ordering::Acquire),
            AmoOp::Write | AmoOp::Xchg => a.swap(opnd, Ordering::AcqRel),
            AmoOp::Or => a.fetch_or(opnd, Ordering::AcqRel),
            AmoOp::And => a.fetch_and(opnd, Ordering::AcqRel),
            AmoOp::Xor => a.fetch_xor(opnd, Ordering::AcqRel),
            AmoOp::Cswap => match a.compare_exchange(cmpr, opnd, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(old) | Err(old) => old,
            },
            AmoOp::Add | AmoOp::Sub => {
                if ty == AmoType::F32 {
                    // No hardware float fetch-add: a compare-exchange loop
                    // over the bit pattern.
                    let mut cur = a.load(Ordering::Acquire);
                    loop {
                        let rhs = if op == AmoOp::Sub {
                            -f32::from_bits(opnd)
                        } else {
                            f32::from_bits(opnd)
                        };
                        let new = (f32::from_bits(cur) + rhs).to_bits();
                        match a.compare_exchange_weak(
                            cur,
                            new,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(old) => return old,
                            Err(seen) => cur = seen,
                        }
                    }
                } else {
                    // Subtraction is addition of the two's-complement
                    // negation; negating i32::MIN leaves it unchanged.
                    let rhs = if op == AmoOp::Sub {
                        opnd.wrapping_neg()
                    } else {
                        opnd
                    };
                    a.fetch_add(rhs, Ordering::AcqRel)
                }
            }
        }
    }

    unsafe fn amo64(addr: usize, ty: AmoType, op: AmoOp, opnd: u64, cmpr: u64) -> u64 {
        let a = unsafe { AtomicU64::from_ptr(addr as *mut u64) };
        match op {
            AmoOp::Read => a.load(Ordering::Acquire),
            AmoOp::Write | AmoOp::Xchg => a.swap(opnd, Ordering::AcqRel),
            AmoOp::Or => a.fetch_or(opnd, Ordering::AcqRel),
            AmoOp::And => a.fetch_and(opnd, Ordering::AcqRel),
            AmoOp::Xor => a.fetch_xor(opnd, Ordering::AcqRel),
            AmoOp::Cswap => match a.compare_exchange(cmpr, opnd, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(old) | Err(old) => old,
            },
            AmoOp::Add | AmoOp::Sub => {
                if ty == AmoType::F64 {
                    let mut cur = a.load(Ordering::Acquire);
                    loop {
                        let rhs = if op == AmoOp::Sub {
                            -f64::from_bits(opnd)
                        } else {
                            f64::from_bits(opnd)
                        };
                        let new = (f64::from_bits(cur) + rhs).to_bits();
                        match a.compare_exchange_weak(
                            cur,
                            new,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(old) => return old,
                            Err(seen) => cur = seen,
                        }
                    }
                } else {
                    let rhs = if op == AmoOp::Sub {
                        opnd.wrapping_neg()
                    } else {
                        opnd
                    };
                    a.fetch_add(rhs, Ordering::AcqRel)
                }
            }
        }
    }
}

/// Probes the provider for every operation the runtime may request and
/// memoizes one verdict per datatype: a type is natively supported only if
/// the whole probe set passes.
pub(crate) fn probe_atomic_validity(domain: &dyn crate::fabric::Domain) -> [bool; 6] {
    let mut valid = [false; 6];
    for (i, ty) in AmoType::ALL.iter().enumerate() {
        let ops: &[AmoOp] = if ty.is_float() {
            &AmoOp::FLOAT_PROBE
        } else {
            &AmoOp::INT_PROBE
        };
        valid[i] = ops.iter().all(|&op| domain.query_atomic(*ty, op));
    }
    valid
}

/// Negates an operand pattern at the operand's width.
pub(crate) fn neg_pattern(ty: AmoType, v: u64) -> u64 {
    match ty {
        AmoType::I32 | AmoType::U32 => u64::from((v as u32).wrapping_neg()),
        AmoType::I64 | AmoType::U64 => v.wrapping_neg(),
        AmoType::F32 => u64::from((-f32::from_bits(v as u32)).to_bits()),
        AmoType::F64 => (-f64::from_bits(v)).to_bits(),
    }
}

impl Comm {
    /// Non-fetching atomic operation on `obj` at `node`.
    pub async fn amo(
        &self,
        node: NodeId,
        obj: usize,
        op: AmoOp,
        ty: AmoType,
        opnd: u64,
    ) -> CommResult<()> {
        self.do_amo(node, obj, op, ty, opnd, 0, None).await
    }

    /// Fetching atomic operation; the previous value lands at `result`.
    pub async fn amo_fetch(
        &self,
        node: NodeId,
        obj: usize,
        op: AmoOp,
        ty: AmoType,
        opnd: u64,
        result: usize,
    ) -> CommResult<()> {
        self.do_amo(node, obj, op, ty, opnd, 0, Some(result)).await
    }

    /// Atomic read of `obj` at `node` into `result`.
    pub async fn amo_read(
        &self,
        node: NodeId,
        obj: usize,
        ty: AmoType,
        result: usize,
    ) -> CommResult<()> {
        self.do_amo(node, obj, AmoOp::Read, ty, 0, 0, Some(result))
            .await
    }

    /// Compare-and-swap: installs `desired` if `obj` holds `cmpr`; the
    /// previous value lands at `result` either way.
    pub async fn amo_cswap(
        &self,
        node: NodeId,
        obj: usize,
        ty: AmoType,
        cmpr: u64,
        desired: u64,
        result: usize,
    ) -> CommResult<()> {
        self.do_amo(node, obj, AmoOp::Cswap, ty, desired, cmpr, Some(result))
            .await
    }

    pub(crate) async fn do_amo(
        &self,
        node: NodeId,
        obj: usize,
        mut op: AmoOp,
        ty: AmoType,
        mut opnd: u64,
        cmpr: u64,
        result: Option<usize>,
    ) -> CommResult<()> {
        if op == AmoOp::Sub {
            opnd = neg_pattern(ty, opnd);
            op = AmoOp::Add;
        }

        if self.num_nodes == 1 {
            return self.cpu_amo_local(obj, op, ty, opnd, cmpr, result);
        }

        // Atomics are MCM-significant: a parked delayed done from an
        // earlier nonblocking AMO must land before this one is issued.
        self.retire_delayed_done().await?;

        let native_ok =
            self.amo_valid[ty as usize] && self.resolve_remote(node, obj, ty.size()).is_some();
        if !native_ok {
            if node == self.node {
                return self.cpu_amo_local(obj, op, ty, opnd, cmpr, result);
            }
            return self.amo_via_am(node, obj, op, ty, opnd, cmpr, result).await;
        }

        self.amo_native(node, obj, op, ty, opnd, cmpr, result).await
    }

    fn cpu_amo_local(
        &self,
        obj: usize,
        op: AmoOp,
        ty: AmoType,
        opnd: u64,
        cmpr: u64,
        result: Option<usize>,
    ) -> CommResult<()> {
        // SAFETY: the object is local memory the caller owns; the fetch
        // destination likewise.
        let old = unsafe { cpu::cpu_amo_raw(obj, ty, op, opnd, cmpr) };
        if let Some(res) = result {
            unsafe {
                cpu::store_raw(res, ty, old);
            }
        }
        Ok(())
    }

    async fn amo_native(
        &self,
        node: NodeId,
        obj: usize,
        op: AmoOp,
        ty: AmoType,
        opnd: u64,
        cmpr: u64,
        result: Option<usize>,
    ) -> CommResult<()> {
        let (key, offset) = self
            .resolve_remote(node, obj, ty.size())
            .ok_or(CommError::BadState(
                "native AMO path reached without a remote key".into(),
            ))?;
        trace!(node = %node, ?op, ?ty, "native amo");

        // An unregistered fetch destination goes through a registered
        // bounce word.
        let mut bounce: Option<usize> = None;
        let fetch_addr = match result {
            None => None,
            Some(res) if self.local_desc(res, ty.size()) => Some(res),
            Some(_) => {
                let b = self.heap.alloc(8, 8)?;
                bounce = Some(b);
                Some(b)
            }
        };

        let tci = self.alloc_tci().await?;
        let desc = AtomicDesc {
            key,
            offset,
            ty,
            op,
            opnd,
            cmpr,
            fetch_addr,
        };
        let dest = self.eps.rx_rma_addr(node);
        if result.is_some() {
            let (ctx, flag) = tci.post_waiter();
            ride_out_eagain(&tci, || tci.tx.atomic(dest, &desc, ctx, false)).await?;
            wait_tx_done(&tci, &flag).await?;
        } else {
            let ctx = tci.fire_and_forget_ctx();
            ride_out_eagain(&tci, || tci.tx.atomic(dest, &desc, ctx, false)).await?;
            if op.is_write() && !self.have_dc {
                // Non-fetching write AMOs follow the PUT flushing rule.
                self.record_put(node);
            }
        }
        drop(tci);

        if let (Some(b), Some(res)) = (bounce, result) {
            // SAFETY: both words are live local memory of `ty`'s width.
            unsafe {
                let old = cpu::load_raw(b, ty);
                cpu::store_raw(res, ty, old);
            }
        }
        if let Some(b) = bounce {
            self.heap.free(b);
        }
        Ok(())
    }

    async fn amo_via_am(
        &self,
        node: NodeId,
        obj: usize,
        op: AmoOp,
        ty: AmoType,
        opnd: u64,
        cmpr: u64,
        result: Option<usize>,
    ) -> CommResult<()> {
        trace!(node = %node, ?op, ?ty, "amo via am");

        // A fetching AMO must deliver its result into registered memory on
        // this side; bounce if the caller's destination is not.
        let mut bounce: Option<usize> = None;
        let result_addr = match result {
            None => 0u64,
            Some(res) if self.local_desc(res, ty.size()) => res as u64,
            Some(_) => {
                let b = self.heap.alloc(8, 8)?;
                bounce = Some(b);
                b as u64
            }
        };

        let req = AmRequest::Amo {
            initiator: self.node,
            done: 0,
            obj: obj as u64,
            op,
            ty,
            opnd,
            cmpr,
            result_addr,
        };

        if result.is_some() {
            self.am_request(node, req, true).await?;
        } else {
            // Delayed blocking: the done byte is parked in task-private
            // state and retired at the next MCM-significant operation. A
            // task that is already ending issues strictly nonblocking.
            if self.tasks.with(|t| t.task_is_ending) {
                self.am_request(node, req, false).await?;
            } else {
                let done = self.am_request_delayed(node, req).await?;
                self.tasks.with(|t| t.am_done_pending = Some(done));
            }
        }

        if let (Some(b), Some(res)) = (bounce, result) {
            // SAFETY: both words are live local memory of `ty`'s width.
            unsafe {
                let old = cpu::load_raw(b, ty);
                cpu::store_raw(res, ty, old);
            }
        }
        if let Some(b) = bounce {
            self.heap.free(b);
        }
        Ok(())
    }

    /// Executes an AM-carried atomic at the owner; runs on the handler.
    pub(crate) fn cpu_amo_for_am(
        &self,
        obj: u64,
        op: AmoOp,
        ty: AmoType,
        opnd: u64,
        cmpr: u64,
    ) -> u64 {
        // SAFETY: the initiator resolved nothing, but the object is owned
        // by this node and the request came from inside the job.
        unsafe { cpu::cpu_amo_raw(obj as usize, ty, op, opnd, cmpr) }
    }
}

#[cfg(test)]
mod tests {
    use super::cpu::{cpu_amo_raw, load_raw};
    use super::*;
    use proptest::prelude::*;

    fn amo_on_u64(obj: &mut u64, op: AmoOp, opnd: u64, cmpr: u64) -> u64 {
        unsafe { cpu_amo_raw(obj as *mut u64 as usize, AmoType::U64, op, opnd, cmpr) }
    }

    fn amo_on_u32(obj: &mut u32, ty: AmoType, op: AmoOp, opnd: u32, cmpr: u32) -> u32 {
        unsafe { cpu_amo_raw(obj as *mut u32 as usize, ty, op, u64::from(opnd), u64::from(cmpr)) as u32 }
    }

    #[test]
    fn cswap_installs_and_returns_old() {
        let mut obj = 5u64;
        let old = amo_on_u64(&mut obj, AmoOp::Cswap, 9, 5);
        assert_eq!(old, 5);
        assert_eq!(obj, 9);

        // Mismatched comparand: no write, old value still returned.
        let old = amo_on_u64(&mut obj, AmoOp::Cswap, 42, 5);
        assert_eq!(old, 9);
        assert_eq!(obj, 9);
    }

    #[test]
    fn add_zero_is_a_no_op() {
        let mut obj = 0xDEAD_BEEFu64;
        let old = amo_on_u64(&mut obj, AmoOp::Add, 0, 0);
        assert_eq!(old, 0xDEAD_BEEF);
        assert_eq!(obj, 0xDEAD_BEEF);
    }

    #[test]
    fn sub_of_int_min_keeps_the_sign_bit_quiet() {
        // Negating i32::MIN is a two's-complement no-op, so subtracting it
        // adds it back.
        let mut obj = 7u32;
        amo_on_u32(&mut obj, AmoType::I32, AmoOp::Sub, i32::MIN as u32, 0);
        assert_eq!(obj as i32, 7i32.wrapping_add(i32::MIN));
    }

    #[test]
    fn float_add_runs_through_the_bit_pattern_loop() {
        let mut obj = 1.5f64.to_bits();
        let old = unsafe {
            cpu_amo_raw(
                &mut obj as *mut u64 as usize,
                AmoType::F64,
                AmoOp::Add,
                2.25f64.to_bits(),
                0,
            )
        };
        assert_eq!(f64::from_bits(old), 1.5);
        assert_eq!(f64::from_bits(obj), 3.75);

        let mut obj32 = 8.0f32.to_bits();
        unsafe {
            cpu_amo_raw(
                &mut obj32 as *mut u32 as usize,
                AmoType::F32,
                AmoOp::Sub,
                0.5f32.to_bits() as u64,
                0,
            );
        }
        assert_eq!(f32::from_bits(obj32), 7.5);
    }

    #[test]
    fn bitwise_matrix() {
        let mut obj = 0b1100u32;
        amo_on_u32(&mut obj, AmoType::U32, AmoOp::Or, 0b0011, 0);
        assert_eq!(obj, 0b1111);
        amo_on_u32(&mut obj, AmoType::U32, AmoOp::And, 0b1010, 0);
        assert_eq!(obj, 0b1010);
        amo_on_u32(&mut obj, AmoType::U32, AmoOp::Xor, 0b0110, 0);
        assert_eq!(obj, 0b1100);
        let old = amo_on_u32(&mut obj, AmoType::U32, AmoOp::Xchg, 77, 0);
        assert_eq!(old, 0b1100);
        assert_eq!(obj, 77);
    }

    #[test]
    fn load_raw_matches_width() {
        let word = 0x1122_3344_5566_7788u64;
        let got32 = unsafe { load_raw(&word as *const u64 as usize, AmoType::U32) };
        assert_eq!(got32, u64::from(0x5566_7788u32));
        let got64 = unsafe { load_raw(&word as *const u64 as usize, AmoType::U64) };
        assert_eq!(got64, word);
    }

    #[test]
    fn neg_pattern_widths() {
        assert_eq!(neg_pattern(AmoType::I32, 1), u64::from(u32::MAX));
        assert_eq!(neg_pattern(AmoType::I64, 1), u64::MAX);
        assert_eq!(
            neg_pattern(AmoType::F64, 2.0f64.to_bits()),
            (-2.0f64).to_bits()
        );
        // The extreme negative value negates to itself.
        assert_eq!(
            neg_pattern(AmoType::I32, i32::MIN as u32 as u64),
            i32::MIN as u32 as u64
        );
    }

    proptest! {
        #[test]
        fn add_matches_wrapping_semantics(start: u64, opnd: u64) {
            let mut obj = start;
            let old = amo_on_u64(&mut obj, AmoOp::Add, opnd, 0);
            prop_assert_eq!(old, start);
            prop_assert_eq!(obj, start.wrapping_add(opnd));
        }

        #[test]
        fn sub_is_add_of_negation(start: u32, opnd: u32) {
            let mut obj = start;
            amo_on_u32(&mut obj, AmoType::U32, AmoOp::Sub, opnd, 0);
            prop_assert_eq!(obj, start.wrapping_sub(opnd));
        }
    }
}
