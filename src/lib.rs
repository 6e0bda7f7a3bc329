//! # Weft - One-Sided Communication for Parallel Jobs
//!
//! Weft is the communication core of a distributed runtime: it gives every
//! node of a parallel job one-sided remote memory access (PUT/GET), remote
//! atomic memory operations, and active messages, layered over a low-level
//! fabric transport that provides reliable-datagram endpoints, RMA verbs,
//! remote atomics, memory registration, and completion queues.
//!
//! ## Core Components
//!
//! - **Provider selection**: negotiates delivery-complete or message-order
//!   semantics with the fabric and picks one provider for the job
//! - **Memory registration**: scalable (whole-address-space) or basic
//!   (explicit heap) region tables, replicated across all nodes
//! - **TX context scheduling**: transmit contexts handed to tasks, with
//!   permanent binding where the tasking layer has stable threads
//! - **Ordering layer**: per-task put bitmaps and one-byte "dummy GET"
//!   flushes that uphold the memory consistency model on providers that
//!   only guarantee message ordering
//! - **RMA / AMO engines**: chunking, bounce buffering, CPU and
//!   AM-mediated fallbacks when the fabric cannot do an operation natively
//! - **Active messages**: a compact wire protocol with a large-payload
//!   pull variant, a handler loop driven by a poll/wait set or explicit
//!   polling, and nonce-based liveness probes
//! - **Barrier and shutdown**: a fan-out-64 split-phase tree barrier and a
//!   dedicated shutdown opcode
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weft::{Comm, CommConfig, NopDispatch};
//! use weft::fabric::mem::MemFabric;
//! use weft::oob::LocalOob;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let fabric = MemFabric::builder().nodes(1).build();
//! let mut oob = LocalOob::group(1);
//! let comm = Comm::init(
//!     CommConfig::development(),
//!     fabric,
//!     oob.remove(0),
//!     Arc::new(NopDispatch),
//! )
//! .await?;
//!
//! comm.barrier().await?;
//! comm.shutdown().await?;
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod amo;
pub mod barrier;
pub mod batch;
pub mod bitmap;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fabric;
pub mod oob;
pub mod ordering;
pub mod provider;
pub mod region;
pub mod rma;
pub mod runtime;
pub mod tasking;
pub mod tci;
pub mod types;

// Active message protocol
pub mod am;

// Re-export the public surface
pub use crate::am::{AmDispatch, NopDispatch};
pub use crate::config::{CommConfig, CommConfigBuilder, ConfigError};
pub use crate::error::{CommError, CommResult};
pub use crate::runtime::Comm;
pub use crate::types::{AmoOp, AmoType, NodeId};

// Common imports
pub use ::tracing::{debug, error, info, trace, warn};
pub use thiserror::Error;
