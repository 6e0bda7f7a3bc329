//! Split-phase tree barrier
//!
//! Fan-out 64 over the node ids: node `n`'s parent is `(n-1)/64`, its
//! children are `64n+1 ..= 64n+64`. Each node owns a small block of
//! registered flag bytes (one notify slot per child plus one release
//! byte); the block addresses are all-gathered once at init. Arrival
//! propagates up with one-byte PUTs, release propagates back down.
//!
//! Before the AM handler is alive (or when the job has one node) the
//! out-of-band barrier is used instead.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::task::yield_now;
use tracing::trace;

use crate::error::CommResult;
use crate::runtime::Comm;
use crate::types::NodeId;

/// Tree fan-out.
pub(crate) const BARRIER_FANOUT: usize = 64;

/// Bytes in one node's flag block: child-notify slots plus the release
/// byte.
pub(crate) const BAR_INFO_SIZE: usize = BARRIER_FANOUT + 1;

fn parent_of(node: usize) -> usize {
    (node - 1) / BARRIER_FANOUT
}

/// Children of `node` in a job of `num_nodes`.
pub(crate) fn children_of(node: usize, num_nodes: usize) -> impl Iterator<Item = usize> {
    let first = BARRIER_FANOUT * node + 1;
    (first..first + BARRIER_FANOUT).filter(move |&c| c < num_nodes)
}

fn flag(addr: usize) -> &'static AtomicU8 {
    // SAFETY: barrier flag bytes live in the registered heap arena for
    // the lifetime of the job and are only accessed atomically.
    unsafe { AtomicU8::from_ptr(addr as *mut u8) }
}

impl Comm {
    /// Blocks until every node has arrived.
    pub async fn barrier(&self) -> CommResult<()> {
        if self.num_nodes == 1 {
            return Ok(());
        }
        if !self.am_alive() {
            // Initialization-time calls go out of band.
            return self.oob.barrier().await;
        }

        let me = self.node.as_usize();
        let my_info = self.bar_addrs[me];
        let children: Vec<usize> = children_of(me, self.num_nodes).collect();
        trace!(node = me, children = children.len(), "barrier enter");

        // Phase 1: wait for every live child's notify slot.
        for slot in 0..children.len() {
            let byte = flag(my_info + slot);
            while byte.load(Ordering::Acquire) == 0 {
                yield_now().await;
            }
        }

        if me != 0 {
            // Phase 2: notify the parent, then wait for release.
            let parent = parent_of(me);
            let slot = me - BARRIER_FANOUT * parent - 1;
            self.put_flag(NodeId::from_usize(parent), self.bar_addrs[parent] + slot)
                .await?;
            let release = flag(my_info + BARRIER_FANOUT);
            while release.load(Ordering::Acquire) == 0 {
                yield_now().await;
            }
        }

        // Phase 4: clear own flags before any peer can set them for the
        // next barrier, then release the children.
        for i in 0..BAR_INFO_SIZE {
            flag(my_info + i).store(0, Ordering::Release);
        }
        for &c in &children {
            self.put_flag(
                NodeId::from_usize(c),
                self.bar_addrs[c] + BARRIER_FANOUT,
            )
            .await?;
        }
        trace!(node = me, "barrier exit");
        Ok(())
    }

    /// One-byte PUT of 1 that is forced visible before returning.
    async fn put_flag(&self, node: NodeId, raddr: usize) -> CommResult<()> {
        let one: u8 = 1;
        self.put(&one as *const u8 as usize, node, raddr, 1).await?;
        self.flush_node(node).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_shape_for_a_64_node_job() {
        // The root of a 64-node job has exactly min(K, N-1) children.
        assert_eq!(children_of(0, 64).count(), 63);
        assert_eq!(children_of(0, 65).count(), 64);
        assert_eq!(children_of(0, 200).count(), 64);
        // Node 1's children start at 65.
        let kids: Vec<usize> = children_of(1, 200).collect();
        assert_eq!(kids.first(), Some(&65));
        assert_eq!(kids.last(), Some(&128));
        // Leaves have none.
        assert_eq!(children_of(100, 101).count(), 0);
    }

    #[test]
    fn parent_child_relations_are_mutual() {
        for n in 1..500 {
            let p = parent_of(n);
            assert!(children_of(p, 501).any(|c| c == n));
        }
    }
}
