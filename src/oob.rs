//! Out-of-band bootstrap channel
//!
//! The layer needs a tiny collective surface once at startup (address and
//! key exchange) and one barrier at shutdown. The real channel is an
//! external collaborator (PMI, slurm, ssh); [`LocalOob`] is the in-process
//! implementation used by tests and single-process jobs.
//!
//! All nodes must call the same collective operations in the same order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Barrier, Mutex};

use crate::error::{CommError, CommResult};
use crate::types::NodeId;

/// The bootstrap channel contract.
#[async_trait]
pub trait OobChannel: Send + Sync {
    /// This node's identity within the job.
    fn node(&self) -> NodeId;

    /// Job size.
    fn num_nodes(&self) -> usize;

    /// Contributes `mine` and returns every node's contribution, indexed by
    /// node id.
    async fn all_gather(&self, mine: &[u8]) -> CommResult<Vec<Vec<u8>>>;

    /// Returns `root`'s buffer on every node.
    async fn broadcast(&self, root: NodeId, buf: Vec<u8>) -> CommResult<Vec<u8>>;

    /// Blocks until every node has arrived.
    async fn barrier(&self) -> CommResult<()>;

    /// Releases the channel. Called once, after the final barrier.
    async fn fini(&self) -> CommResult<()>;
}

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Vec<u8>>>>,
}

/// In-process out-of-band channel connecting the nodes of one test job.
pub struct LocalOob {
    node: NodeId,
    num_nodes: usize,
    shared: Arc<Shared>,
}

impl LocalOob {
    /// Creates a connected group of `n` channels, one per node.
    #[must_use]
    pub fn group(n: usize) -> Vec<Arc<LocalOob>> {
        assert!(n > 0, "a job has at least one node");
        let shared = Arc::new(Shared {
            barrier: Barrier::new(n),
            slots: Mutex::new(vec![None; n]),
        });
        (0..n)
            .map(|i| {
                Arc::new(LocalOob {
                    node: NodeId::from_usize(i),
                    num_nodes: n,
                    shared: Arc::clone(&shared),
                })
            })
            .collect()
    }
}

#[async_trait]
impl OobChannel for LocalOob {
    fn node(&self) -> NodeId {
        self.node
    }

    fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    async fn all_gather(&self, mine: &[u8]) -> CommResult<Vec<Vec<u8>>> {
        {
            let mut slots = self.shared.slots.lock().await;
            slots[self.node.as_usize()] = Some(mine.to_vec());
        }
        self.shared.barrier.wait().await;
        let gathered = {
            let slots = self.shared.slots.lock().await;
            slots
                .iter()
                .map(|s| {
                    s.clone()
                        .ok_or_else(|| CommError::Oob("all_gather slot missing".into()))
                })
                .collect::<CommResult<Vec<Vec<u8>>>>()?
        };
        // Second rendezvous so the slots can be reused by the next collective.
        self.shared.barrier.wait().await;
        Ok(gathered)
    }

    async fn broadcast(&self, root: NodeId, buf: Vec<u8>) -> CommResult<Vec<u8>> {
        if self.node == root {
            let mut slots = self.shared.slots.lock().await;
            slots[0] = Some(buf.clone());
        }
        self.shared.barrier.wait().await;
        let out = {
            let slots = self.shared.slots.lock().await;
            slots[0]
                .clone()
                .ok_or_else(|| CommError::Oob("broadcast root never contributed".into()))?
        };
        self.shared.barrier.wait().await;
        Ok(out)
    }

    async fn barrier(&self) -> CommResult<()> {
        self.shared.barrier.wait().await;
        Ok(())
    }

    async fn fini(&self) -> CommResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_gather_orders_by_node() {
        let group = LocalOob::group(3);
        let handles: Vec<_> = group
            .into_iter()
            .map(|oob| {
                tokio::spawn(async move {
                    let mine = vec![oob.node().as_usize() as u8; 2];
                    oob.all_gather(&mine).await.unwrap()
                })
            })
            .collect();
        for h in handles {
            let gathered = h.await.unwrap();
            assert_eq!(gathered, vec![vec![0, 0], vec![1, 1], vec![2, 2]]);
        }
    }

    #[tokio::test]
    async fn broadcast_spreads_the_root_buffer() {
        let group = LocalOob::group(4);
        let handles: Vec<_> = group
            .into_iter()
            .map(|oob| {
                tokio::spawn(async move {
                    let buf = if oob.node().as_usize() == 2 {
                        b"root".to_vec()
                    } else {
                        Vec::new()
                    };
                    oob.broadcast(NodeId::from_usize(2), buf).await.unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap(), b"root".to_vec());
        }
    }

    #[tokio::test]
    async fn back_to_back_collectives_do_not_cross() {
        let group = LocalOob::group(2);
        let handles: Vec<_> = group
            .into_iter()
            .map(|oob| {
                tokio::spawn(async move {
                    let id = oob.node().as_usize() as u8;
                    let first = oob.all_gather(&[id]).await.unwrap();
                    let second = oob.all_gather(&[id + 10]).await.unwrap();
                    (first, second)
                })
            })
            .collect();
        for h in handles {
            let (first, second) = h.await.unwrap();
            assert_eq!(first, vec![vec![0], vec![1]]);
            assert_eq!(second, vec![vec![10], vec![11]]);
        }
    }
}
