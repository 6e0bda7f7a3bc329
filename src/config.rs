//! Communication-layer configuration
//!
//! Pre-configured settings for development, production, and test
//! deployments, a builder, and `from_env` which reads the `COMM_*`
//! environment variables the layer recognizes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ConcurrencyCap, LivenessIntervalSecs, MultiRecvBufSize, RegisteredHeapSize};

/// Environment variable forcing a provider by name.
pub const ENV_PROVIDER: &str = "COMM_OFI_PROVIDER";
/// Environment variable selecting abort-instead-of-propagate.
pub const ENV_ABORT_ON_ERROR: &str = "COMM_OFI_ABORT_ON_ERROR";
/// Environment variable ordering the delivery-complete query round first.
pub const ENV_DO_DELIVERY_COMPLETE: &str = "COMM_OFI_DO_DELIVERY_COMPLETE";
/// Environment variable permitting a scalable transmit endpoint.
pub const ENV_USE_SCALABLE_EP: &str = "COMM_OFI_USE_SCALABLE_EP";
/// Environment variable capping the number of transmit contexts.
pub const ENV_CONCURRENCY: &str = "COMM_CONCURRENCY";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("bad environment value for {var}: {reason}")]
    EnvError { var: String, reason: String },
}

/// Complete configuration for one node's communication layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommConfig {
    // Provider negotiation
    pub provider_name: Option<String>,
    pub prefer_delivery_complete: bool,
    /// True when the completion preference came from the environment and is
    /// therefore a hard constraint (provider-quality filtering disabled).
    pub completion_forced: bool,
    pub accelerator_fabric: bool,

    // Endpoints and contexts
    pub use_scalable_ep: bool,
    pub concurrency: ConcurrencyCap,
    /// Fixed worker-thread count declared by the tasking layer, if any.
    pub fixed_threads: Option<usize>,
    /// Override for the tasking layer's maximum parallelism.
    pub max_parallelism: Option<usize>,

    // Memory
    pub registered_heap_size: RegisteredHeapSize,
    pub multi_recv_buf_size: MultiRecvBufSize,

    // Active messages
    pub liveness_interval_secs: LivenessIntervalSecs,
    pub enable_liveness: bool,

    // Completion backends
    /// Opt-in counter-based RX-RMA completion checking (default is CQ).
    pub rx_rma_counter: bool,

    // Error policy and observability
    pub abort_on_error: bool,
    pub enable_detailed_logs: bool,
}

impl CommConfig {
    /// Development configuration: small buffers, verbose logs, no liveness
    /// probes getting in the way of debugging.
    #[must_use]
    pub fn development() -> Self {
        Self {
            provider_name: None,
            prefer_delivery_complete: true,
            completion_forced: false,
            accelerator_fabric: false,
            use_scalable_ep: true,
            concurrency: ConcurrencyCap::default(),
            fixed_threads: None,
            max_parallelism: None,
            registered_heap_size: RegisteredHeapSize::try_new(1 << 20).unwrap(),
            multi_recv_buf_size: MultiRecvBufSize::try_new(16 * 1024).unwrap(),
            liveness_interval_secs: LivenessIntervalSecs::default(),
            enable_liveness: false,
            rx_rma_counter: false,
            abort_on_error: false,
            enable_detailed_logs: true,
        }
    }

    /// Production configuration: full-size buffers, liveness probing on,
    /// abort on error the way a batch job wants.
    #[must_use]
    pub fn production() -> Self {
        Self {
            provider_name: None,
            prefer_delivery_complete: true,
            completion_forced: false,
            accelerator_fabric: false,
            use_scalable_ep: true,
            concurrency: ConcurrencyCap::default(),
            fixed_threads: None,
            max_parallelism: None,
            registered_heap_size: RegisteredHeapSize::default(),
            multi_recv_buf_size: MultiRecvBufSize::default(),
            liveness_interval_secs: LivenessIntervalSecs::default(),
            enable_liveness: true,
            rx_rma_counter: false,
            abort_on_error: true,
            enable_detailed_logs: false,
        }
    }

    /// Testing configuration: tiny buffers so landing-zone swaps and
    /// back-pressure paths actually run.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            multi_recv_buf_size: MultiRecvBufSize::try_new(4096).unwrap(),
            registered_heap_size: RegisteredHeapSize::try_new(1 << 20).unwrap(),
            ..Self::development()
        }
    }

    /// Builds a configuration from the environment, starting from the
    /// production preset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::production();

        if let Ok(name) = std::env::var(ENV_PROVIDER) {
            if !name.is_empty() {
                cfg.provider_name = Some(name);
            }
        }
        if let Some(v) = env_bool(ENV_ABORT_ON_ERROR)? {
            cfg.abort_on_error = v;
        }
        if let Some(v) = env_bool(ENV_DO_DELIVERY_COMPLETE)? {
            cfg.prefer_delivery_complete = v;
            cfg.completion_forced = true;
        }
        if let Some(v) = env_bool(ENV_USE_SCALABLE_EP)? {
            cfg.use_scalable_ep = v;
        }
        if let Ok(raw) = std::env::var(ENV_CONCURRENCY) {
            let n: usize = raw.parse().map_err(|_| ConfigError::EnvError {
                var: ENV_CONCURRENCY.into(),
                reason: format!("expected a non-negative integer, got {raw:?}"),
            })?;
            cfg.concurrency = ConcurrencyCap::try_new(n).map_err(|e| ConfigError::EnvError {
                var: ENV_CONCURRENCY.into(),
                reason: e.to_string(),
            })?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Creates a builder starting from the development preset.
    #[must_use]
    pub fn builder() -> CommConfigBuilder {
        CommConfigBuilder {
            config: Self::development(),
        }
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(f) = self.fixed_threads {
            if f == 0 {
                return Err(ConfigError::ValidationError {
                    field: "fixed_threads".into(),
                    reason: "a fixed-thread tasking layer has at least one thread".into(),
                });
            }
        }
        if let Some(p) = self.max_parallelism {
            if p == 0 {
                return Err(ConfigError::ValidationError {
                    field: "max_parallelism".into(),
                    reason: "must be at least 1".into(),
                });
            }
        }
        if self.multi_recv_buf_size.as_usize() > self.registered_heap_size.as_usize() / 4 {
            return Err(ConfigError::ValidationError {
                field: "multi_recv_buf_size".into(),
                reason: "two landing zones plus scratch must fit the registered heap".into(),
            });
        }
        Ok(())
    }
}

fn env_bool(var: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(var) {
        Err(_) => Ok(None),
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" => Ok(Some(true)),
            "0" | "false" | "no" | "n" => Ok(Some(false)),
            _ => Err(ConfigError::EnvError {
                var: var.into(),
                reason: format!("expected a boolean, got {raw:?}"),
            }),
        },
    }
}

/// Builder for [`CommConfig`].
#[derive(Debug, Clone)]
pub struct CommConfigBuilder {
    config: CommConfig,
}

impl CommConfigBuilder {
    #[must_use]
    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn prefer_delivery_complete(mut self, v: bool) -> Self {
        self.config.prefer_delivery_complete = v;
        self
    }

    #[must_use]
    pub fn completion_forced(mut self, v: bool) -> Self {
        self.config.completion_forced = v;
        self
    }

    #[must_use]
    pub fn use_scalable_ep(mut self, v: bool) -> Self {
        self.config.use_scalable_ep = v;
        self
    }

    #[must_use]
    pub fn concurrency(mut self, cap: ConcurrencyCap) -> Self {
        self.config.concurrency = cap;
        self
    }

    #[must_use]
    pub fn fixed_threads(mut self, threads: usize) -> Self {
        self.config.fixed_threads = Some(threads);
        self
    }

    #[must_use]
    pub fn max_parallelism(mut self, par: usize) -> Self {
        self.config.max_parallelism = Some(par);
        self
    }

    #[must_use]
    pub fn registered_heap_size(mut self, size: RegisteredHeapSize) -> Self {
        self.config.registered_heap_size = size;
        self
    }

    #[must_use]
    pub fn multi_recv_buf_size(mut self, size: MultiRecvBufSize) -> Self {
        self.config.multi_recv_buf_size = size;
        self
    }

    #[must_use]
    pub fn enable_liveness(mut self, v: bool) -> Self {
        self.config.enable_liveness = v;
        self
    }

    #[must_use]
    pub fn rx_rma_counter(mut self, v: bool) -> Self {
        self.config.rx_rma_counter = v;
        self
    }

    #[must_use]
    pub fn abort_on_error(mut self, v: bool) -> Self {
        self.config.abort_on_error = v;
        self
    }

    pub fn build(self) -> Result<CommConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
