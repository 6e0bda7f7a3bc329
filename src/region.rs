//! Memory registration
//!
//! Two modes. Scalable: one logical region covering the whole address
//! space, so remote references need no per-transfer lookup. Basic: an
//! explicit registered heap with a provider-issued key; anything outside
//! it goes through bounce buffers or AM-mediated transfer.
//!
//! After local registration every node all-gathers its table over the
//! out-of-band channel; the result is a per-node replica set, immutable
//! for the rest of the job.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use crate::error::{CommError, CommResult};
use crate::fabric::Domain;
use crate::oob::OobChannel;
use crate::types::NodeId;

/// Most regions one node may register.
pub const MAX_MR: usize = 10;

/// One registered region.
///
/// `start..start+len` is the coverage range; `base` is what remote offsets
/// are relative to (zero when the provider keys by virtual address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRegion {
    pub start: usize,
    pub len: usize,
    pub base: usize,
    pub key: u64,
}

impl MemRegion {
    /// Whether `[addr, addr+len)` lies inside this region. Addresses past
    /// the end (or wrapping the address space) must resolve to false, not
    /// underflow: lookups routinely probe arbitrary unregistered
    /// addresses to pick the fallback path.
    fn covers(&self, addr: usize, len: usize) -> bool {
        addr.checked_sub(self.start)
            .is_some_and(|off| off.checked_add(len).is_some_and(|end| end <= self.len))
    }

    const WIRE_SIZE: usize = 32;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.start as u64);
        buf.put_u64_le(self.len as u64);
        buf.put_u64_le(self.base as u64);
        buf.put_u64_le(self.key);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Self {
            start: buf.get_u64_le() as usize,
            len: buf.get_u64_le() as usize,
            base: buf.get_u64_le() as usize,
            key: buf.get_u64_le(),
        }
    }
}

/// The per-job registration table: this node's regions plus a replica of
/// every peer's.
#[derive(Debug)]
pub struct RegionTable {
    scalable: bool,
    mine: Vec<MemRegion>,
    all: Vec<Vec<MemRegion>>,
}

impl RegionTable {
    /// Registers this node's regions. In scalable mode that is the one
    /// universe region; otherwise the supplied heap.
    pub(crate) fn register(
        domain: &dyn Domain,
        scalable: bool,
        heap: Option<(usize, usize)>,
    ) -> CommResult<Self> {
        let mut mine = Vec::new();
        if scalable {
            let key = domain.register(0, usize::MAX)?;
            mine.push(MemRegion {
                start: 0,
                len: usize::MAX,
                base: 0,
                key,
            });
        } else {
            let (start, len) =
                heap.ok_or_else(|| CommError::BadState("basic mode requires a heap".into()))?;
            let key = domain.register(start, len)?;
            let base = if domain.info().mr_virt_addr { 0 } else { start };
            mine.push(MemRegion {
                start,
                len,
                base,
                key,
            });
        }
        if mine.len() > MAX_MR {
            return Err(CommError::BadState(format!(
                "{} regions exceeds the table limit {MAX_MR}",
                mine.len()
            )));
        }
        debug!(scalable, regions = mine.len(), "registered memory regions");
        Ok(Self {
            scalable,
            mine,
            all: Vec::new(),
        })
    }

    /// All-gathers every node's table.
    pub(crate) async fn exchange(&mut self, oob: &Arc<dyn OobChannel>) -> CommResult<()> {
        let mut wire = BytesMut::with_capacity(4 + self.mine.len() * MemRegion::WIRE_SIZE);
        wire.put_u32_le(self.mine.len() as u32);
        for r in &self.mine {
            r.encode(&mut wire);
        }
        let gathered = oob.all_gather(&wire).await?;
        self.all = gathered
            .into_iter()
            .map(|raw| {
                let mut buf = &raw[..];
                let n = buf.get_u32_le() as usize;
                (0..n).map(|_| MemRegion::decode(&mut buf)).collect()
            })
            .collect();
        Ok(())
    }

    /// True once peer replicas are installed.
    pub fn exchanged(&self) -> bool {
        !self.all.is_empty()
    }

    pub fn is_scalable(&self) -> bool {
        self.scalable
    }

    /// The registered descriptor covering `[addr, addr+len)`, if any.
    pub fn get_local_desc(&self, addr: usize, len: usize) -> Option<&MemRegion> {
        self.mine.iter().find(|r| r.covers(addr, len))
    }

    /// Resolves `[addr, addr+len)` against `node`'s replica, returning the
    /// remote key and the offset from its base.
    pub fn get_remote_key(&self, node: NodeId, addr: usize, len: usize) -> Option<(u64, u64)> {
        self.all
            .get(node.as_usize())?
            .iter()
            .find(|r| r.covers(addr, len))
            .map(|r| (r.key, (addr - r.base) as u64))
    }
}

/// A fixed arena inside registered memory. Landing zones, bounce buffers,
/// done bytes, the ordering ghost word, and barrier flags live here, so
/// they are remotely addressable in both registration modes.
pub(crate) struct RegisteredHeap {
    // Kept alive for the arena's lifetime; all access goes through raw
    // pointers handed out by `alloc`.
    _buf: Box<[u8]>,
    base: usize,
    len: usize,
    state: Mutex<HeapState>,
}

struct HeapState {
    /// Free extents as (offset, len), kept sorted by offset.
    holes: Vec<(usize, usize)>,
    allocated: HashMap<usize, usize>,
}

impl RegisteredHeap {
    pub(crate) fn new(len: usize) -> Self {
        let buf = vec![0u8; len].into_boxed_slice();
        let base = buf.as_ptr() as usize;
        Self {
            _buf: buf,
            base,
            len,
            state: Mutex::new(HeapState {
                holes: vec![(0, len)],
                allocated: HashMap::new(),
            }),
        }
    }

    pub(crate) fn base(&self) -> usize {
        self.base
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// First-fit allocation; the returned address is `align`-aligned.
    pub(crate) fn alloc(&self, len: usize, align: usize) -> CommResult<usize> {
        debug_assert!(align.is_power_of_two());
        let len = len.max(1);
        let mut state = self.state.lock().unwrap();
        for i in 0..state.holes.len() {
            let (off, hole_len) = state.holes[i];
            let addr = self.base + off;
            let pad = addr.wrapping_neg() & (align - 1);
            if pad + len > hole_len {
                continue;
            }
            let take_off = off + pad;
            // The alignment pad stays free.
            if pad > 0 {
                state.holes[i].1 = pad;
                state.holes.insert(i + 1, (take_off + len, hole_len - pad - len));
                if state.holes[i + 1].1 == 0 {
                    state.holes.remove(i + 1);
                }
            } else if hole_len == len {
                state.holes.remove(i);
            } else {
                state.holes[i] = (off + len, hole_len - len);
            }
            state.allocated.insert(take_off, len);
            return Ok(self.base + take_off);
        }
        Err(CommError::BadState(format!(
            "registered heap exhausted allocating {len} bytes"
        )))
    }

    pub(crate) fn free(&self, addr: usize) {
        let off = addr - self.base;
        let mut state = self.state.lock().unwrap();
        let len = state
            .allocated
            .remove(&off)
            .expect("free of an address the heap never produced");
        let pos = state.holes.partition_point(|&(o, _)| o < off);
        state.holes.insert(pos, (off, len));
        // Coalesce with neighbors.
        if pos + 1 < state.holes.len() {
            let (next_off, next_len) = state.holes[pos + 1];
            if off + len == next_off {
                state.holes[pos].1 += next_len;
                state.holes.remove(pos + 1);
            }
        }
        if pos > 0 {
            let (prev_off, prev_len) = state.holes[pos - 1];
            if prev_off + prev_len == off {
                state.holes[pos - 1].1 += state.holes[pos].1;
                state.holes.remove(pos);
            }
        }
    }

}
