//! Task-private communication state
//!
//! The tasking layer proper (task creation, scheduling, yielding) is the
//! runtime this crate runs under; what the communication layer needs from
//! it is a private block per task: the put bitmap, the parked delayed-done
//! byte, the unordered-operation buffers, and the context-scheduling
//! cache. State is keyed by the current task identity and created lazily
//! on first touch; `task_end` tears it down.

use dashmap::DashMap;

use crate::am::DoneByte;
use crate::batch::{AmoBatch, GetBatch, PutBatch};
use crate::bitmap::NodeBitmap;

/// Identity of the executing task, falling back to the thread for calls
/// made outside any task context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TaskKey {
    Task(tokio::task::Id),
    Thread(std::thread::ThreadId),
}

/// The per-task private block.
#[derive(Default)]
pub(crate) struct TaskPrivate {
    /// Declared stable for the life of the process; enables binding.
    pub is_fixed: bool,
    /// Last transmit-context index this task used.
    pub last_tci: Option<usize>,
    /// Nodes holding an injected PUT whose visibility has not been forced.
    pub put_bitmap: Option<NodeBitmap>,
    /// Done byte of a delayed nonblocking AMO, retired at the next
    /// MCM-significant operation.
    pub am_done_pending: Option<DoneByte>,
    pub task_is_ending: bool,
    pub amo_batch: Option<AmoBatch>,
    pub get_batch: Option<GetBatch>,
    pub put_batch: Option<PutBatch>,
}

/// Registry of private blocks for every live task.
pub(crate) struct TaskRegistry {
    map: DashMap<TaskKey, TaskPrivate>,
    num_nodes: usize,
}

impl TaskRegistry {
    pub(crate) fn new(num_nodes: usize) -> Self {
        Self {
            map: DashMap::new(),
            num_nodes,
        }
    }

    pub(crate) fn current_key() -> TaskKey {
        tokio::task::try_id()
            .map(TaskKey::Task)
            .unwrap_or_else(|| TaskKey::Thread(std::thread::current().id()))
    }

    /// Runs `f` on the current task's block, creating it on first touch.
    ///
    /// The closure runs under the registry shard lock: keep it small and
    /// never call back into the registry from inside it.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut TaskPrivate) -> R) -> R {
        let mut entry = self.map.entry(Self::current_key()).or_default();
        f(&mut entry)
    }

    /// Ensures the current task's put bitmap exists and runs `f` on it.
    pub(crate) fn with_put_bitmap<R>(&self, f: impl FnOnce(&mut NodeBitmap) -> R) -> R {
        let num_nodes = self.num_nodes;
        self.with(|t| {
            f(t.put_bitmap
                .get_or_insert_with(|| NodeBitmap::new(num_nodes)))
        })
    }

    /// Detaches and returns the current task's block, if any.
    pub(crate) fn remove_current(&self) -> Option<TaskPrivate> {
        self.map.remove(&Self::current_key()).map(|(_, v)| v)
    }

    /// Number of live private blocks; used by teardown sanity checks.
    pub(crate) fn live(&self) -> usize {
        self.map.len()
    }
}

/// The tasking layer's maximum useful parallelism.
pub(crate) fn max_parallelism(configured: Option<usize>) -> usize {
    configured.unwrap_or_else(num_cpus::get).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    #[tokio::test]
    async fn state_is_created_lazily_and_removed_explicitly() {
        let reg = TaskRegistry::new(4);
        assert_eq!(reg.live(), 0);
        reg.with(|t| t.last_tci = Some(3));
        assert_eq!(reg.live(), 1);
        assert_eq!(reg.with(|t| t.last_tci), Some(3));
        let private = reg.remove_current().unwrap();
        assert_eq!(private.last_tci, Some(3));
        assert_eq!(reg.live(), 0);
    }

    #[tokio::test]
    async fn put_bitmap_is_sized_to_the_job() {
        let reg = TaskRegistry::new(130);
        reg.with_put_bitmap(|bm| {
            assert_eq!(bm.len(), 130);
            bm.set(NodeId::from_usize(129));
        });
        assert!(reg.with(|t| t.put_bitmap.as_ref().unwrap().test(NodeId::from_usize(129))));
        reg.remove_current();
    }

    #[tokio::test]
    async fn tasks_see_distinct_state() {
        let reg = std::sync::Arc::new(TaskRegistry::new(2));
        reg.with(|t| t.last_tci = Some(7));
        let reg2 = std::sync::Arc::clone(&reg);
        let other = tokio::spawn(async move { reg2.with(|t| t.last_tci) })
            .await
            .unwrap();
        assert_eq!(other, None);
        assert_eq!(reg.with(|t| t.last_tci), Some(7));
    }

    #[test]
    fn max_parallelism_floor_is_one() {
        assert_eq!(max_parallelism(Some(6)), 6);
        assert!(max_parallelism(None) >= 1);
    }
}
