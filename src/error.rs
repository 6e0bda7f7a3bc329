//! Error types for the communication layer
//!
//! Every user-facing operation either succeeds or is fatal to the job; the
//! only error that is ever retried internally is the fabric's transient
//! "again" code. `CommError` is the layer-wide taxonomy, `FabricError` is
//! what the transport traits speak.

use thiserror::Error;

use crate::types::NodeId;

/// Result alias used throughout the crate.
pub type CommResult<T> = Result<T, CommError>;

/// Layer-wide error type.
///
/// With `abort_on_error` set in the configuration, public entry points turn
/// any of these into a process abort instead of propagating.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("no fabric provider satisfies the fundamental requirements")]
    NoProvider,

    #[error(
        "multi-receive buffer overflowed (cq flags {cq_flags:#x}, buffer offset {offset}, \
         message length {len}); min_multi_recv is misconfigured"
    )]
    Truncation {
        cq_flags: u32,
        offset: usize,
        len: usize,
    },

    #[error(
        "open-file limit exhausted while creating endpoints: {num_nodes} nodes x \
         {num_tx_ctxs} tx contexts needs more than the limit of {limit} open files; \
         lower COMM_CONCURRENCY or raise the open-file ulimit"
    )]
    OpenFileLimit {
        num_nodes: usize,
        num_tx_ctxs: usize,
        limit: usize,
    },

    #[error("invariant violated: {0}")]
    BadState(String),

    #[error("address {addr:#x}+{len} is not covered by any memory region on node {node}")]
    NoRemoteKey {
        node: NodeId,
        addr: usize,
        len: usize,
    },

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("fabric error: {0}")]
    Fabric(#[from] FabricError),

    #[error("out-of-band channel error: {0}")]
    Oob(String),
}

/// Errors surfaced by the fabric transport traits.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Transient back-pressure; the caller retries after driving progress.
    #[error("fabric busy, try again")]
    Again,

    #[error("message truncated at receive (cq flags {cq_flags:#x}, offset {offset}, len {len})")]
    Truncated {
        cq_flags: u32,
        offset: usize,
        len: usize,
    },

    #[error("no provider instance matches the hints")]
    NoMatch,

    #[error("endpoint creation exceeded the open-file budget (limit {limit})")]
    FileLimit { limit: usize },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid fabric address {0}")]
    BadAddress(u64),

    #[error("fabric internal error: {0}")]
    Internal(String),
}

impl CommError {
    /// True for errors the retry loop may ride out by driving progress.
    pub fn is_transient(&self) -> bool {
        matches!(self, CommError::Fabric(FabricError::Again))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_file_limit_diagnostic_names_the_knobs() {
        let err = CommError::OpenFileLimit {
            num_nodes: 512,
            num_tx_ctxs: 17,
            limit: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("512 nodes"));
        assert!(msg.contains("17 tx contexts"));
        assert!(msg.contains("limit of 1024"));
        assert!(msg.contains("COMM_CONCURRENCY"));
        assert!(msg.contains("ulimit"));
    }

    #[test]
    fn truncation_diagnostic_carries_cq_state() {
        let err = CommError::Truncation {
            cq_flags: 0x12,
            offset: 4096,
            len: 8192,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x12"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("min_multi_recv"));
    }

    #[test]
    fn only_again_is_transient() {
        assert!(CommError::Fabric(FabricError::Again).is_transient());
        assert!(!CommError::NoProvider.is_transient());
        assert!(!CommError::BadState("x".into()).is_transient());
    }
}
