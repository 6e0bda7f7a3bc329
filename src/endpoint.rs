//! Endpoint and context construction
//!
//! Builds, in order: the transmit-context set sized from provider limits
//! and configuration, the two receive endpoints (AM requests on a CQ, RMA
//! targets on a CQ or counter), the address vector holding two entries
//! per node, and the optional poll/wait set for the handler.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::CommConfig;
use crate::error::{CommError, CommResult, FabricError};
use crate::fabric::{
    Caps, Domain, EpName, FabricAddr, RxCompletionKind, RxMsgEndpoint, RxRmaEndpoint, TxContext,
    WaitSet,
};
use crate::oob::OobChannel;
use crate::tasking;
use crate::types::NodeId;

/// One AM handler in this version.
pub(crate) const NUM_AM_HANDLERS: usize = 1;

/// The constructed endpoint set for one node.
pub(crate) struct EndpointFabric {
    // (Debug is implemented manually below; trait-object fields don't derive it.)
    /// Fabric addresses, two per node: `[2n]` messages, `[2n+1]` RMA.
    addrs: Vec<FabricAddr>,
    pub rx_msg: Arc<dyn RxMsgEndpoint>,
    pub rx_rma: Arc<dyn RxRmaEndpoint>,
    pub wait_set: Option<Arc<dyn WaitSet>>,
    pub txs: Vec<Arc<dyn TxContext>>,
    pub num_tx_ctxs: usize,
    pub num_workers: usize,
    pub fixed_binding: bool,
    pub scalable_ep: bool,
}

impl std::fmt::Debug for EndpointFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointFabric").finish_non_exhaustive()
    }
}

impl EndpointFabric {
    pub(crate) fn rx_msg_addr(&self, node: NodeId) -> FabricAddr {
        self.addrs[2 * node.as_usize()]
    }

    pub(crate) fn rx_rma_addr(&self, node: NodeId) -> FabricAddr {
        self.addrs[2 * node.as_usize() + 1]
    }
}

/// Sizes the worker slice of the context table: provider maximum, capped
/// by configured concurrency, capped by maximum parallelism, and capped at
/// `F + 1` when the tasking layer declares `F` fixed worker threads, with
/// binding enabled on exact equality.
pub(crate) fn ep_num_ctxs(provider_max: usize, cfg: &CommConfig, max_par: usize) -> (usize, bool) {
    let mut n = provider_max.max(1);
    let user_cap = cfg.concurrency.as_usize();
    if user_cap > 0 {
        n = n.min(user_cap);
    }
    n = n.min(max_par);
    let mut bind = false;
    if let Some(fixed) = cfg.fixed_threads {
        n = n.min(fixed + 1);
        bind = n == fixed + 1;
    }
    (n, bind)
}

/// Providers whose wait-set support is known not to work cleanly; they
/// fall back to explicit polling.
fn explicit_polling_required(provider: &str) -> bool {
    provider.contains("ofi_rxm") || provider.starts_with("efa")
}

fn map_file_limit(err: FabricError, num_nodes: usize, num_tx_ctxs: usize) -> CommError {
    match err {
        FabricError::FileLimit { limit } => CommError::OpenFileLimit {
            num_nodes,
            num_tx_ctxs,
            limit,
        },
        other => other.into(),
    }
}

/// Builds the endpoint set and exchanges endpoint names with every peer.
pub(crate) async fn build(
    domain: &Arc<dyn Domain>,
    cfg: &CommConfig,
    oob: &Arc<dyn OobChannel>,
    min_multi_recv: usize,
) -> CommResult<EndpointFabric> {
    let info = domain.info().clone();
    let num_nodes = oob.num_nodes();
    let max_par = tasking::max_parallelism(cfg.max_parallelism);

    let (num_workers, fixed_binding) = ep_num_ctxs(info.max_tx_ctxs, cfg, max_par);
    let num_tx_ctxs = num_workers + NUM_AM_HANDLERS;
    let scalable_ep = cfg.use_scalable_ep && info.caps.contains(Caps::SCALABLE_EP);

    // Utility-stacked providers track address state per transmit endpoint,
    // which multiplies the vector.
    let av_size = 2 * num_nodes * if info.utility_stacked { num_tx_ctxs } else { 1 };
    debug!(
        num_tx_ctxs,
        num_workers, fixed_binding, scalable_ep, av_size, "sizing endpoint fabric"
    );

    let mut txs: Vec<Arc<dyn TxContext>> = Vec::with_capacity(num_tx_ctxs);
    for _ in 0..num_tx_ctxs {
        txs.push(
            domain
                .create_tx()
                .map_err(|e| map_file_limit(e, num_nodes, num_tx_ctxs))?,
        );
    }

    let rx_msg = domain
        .create_rx_msg(min_multi_recv)
        .map_err(|e| map_file_limit(e, num_nodes, num_tx_ctxs))?;
    let rx_kind = if cfg.rx_rma_counter {
        RxCompletionKind::Counter
    } else {
        RxCompletionKind::Queue
    };
    let rx_rma = domain
        .create_rx_rma(rx_kind)
        .map_err(|e| map_file_limit(e, num_nodes, num_tx_ctxs))?;

    // Exchange both rx names and insert every node's pair in node order.
    let mut wire = Vec::with_capacity(2 * EpName::WIRE_SIZE);
    wire.extend_from_slice(&rx_msg.name().to_bytes());
    wire.extend_from_slice(&rx_rma.name().to_bytes());
    let gathered = oob.all_gather(&wire).await?;
    let mut names = Vec::with_capacity(2 * num_nodes);
    for raw in &gathered {
        names.push(EpName::from_bytes(&raw[..EpName::WIRE_SIZE]));
        names.push(EpName::from_bytes(&raw[EpName::WIRE_SIZE..]));
    }
    let addrs = domain.av_insert(&names)?;

    let wait_set = if explicit_polling_required(&info.name) {
        None
    } else {
        domain.create_wait_set(txs[num_workers].token())
    };
    info!(
        provider = %info.name,
        num_tx_ctxs,
        wait_set = wait_set.is_some(),
        "endpoint fabric ready"
    );

    Ok(EndpointFabric {
        addrs,
        rx_msg,
        rx_rma,
        wait_set,
        txs,
        num_tx_ctxs,
        num_workers,
        fixed_binding,
        scalable_ep,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::Fabric;
    use crate::fabric::mem::MemFabric;
    use crate::oob::LocalOob;
    use crate::provider::select_provider;
    use crate::types::ConcurrencyCap;

    fn cfg_with(concurrency: usize, fixed: Option<usize>) -> CommConfig {
        let mut builder = CommConfig::builder()
            .concurrency(ConcurrencyCap::try_new(concurrency).unwrap())
            .max_parallelism(8);
        if let Some(f) = fixed {
            builder = builder.fixed_threads(f);
        }
        builder.build().unwrap()
    }

    #[test]
    fn sizing_applies_caps_in_order() {
        // Provider max dominates nothing else.
        assert_eq!(ep_num_ctxs(16, &cfg_with(0, None), 8), (8, false));
        // User concurrency caps below the provider.
        assert_eq!(ep_num_ctxs(16, &cfg_with(4, None), 8), (4, false));
        // Fixed threads cap at F+1 and bind on exact equality.
        assert_eq!(ep_num_ctxs(16, &cfg_with(0, Some(3)), 8), (4, true));
        // A tighter earlier cap disables binding.
        assert_eq!(ep_num_ctxs(16, &cfg_with(2, Some(3)), 8), (2, false));
        // Degenerate provider still yields one context.
        assert_eq!(ep_num_ctxs(0, &cfg_with(0, None), 8), (1, false));
    }

    #[test]
    fn polling_deny_list() {
        assert!(explicit_polling_required("verbs;ofi_rxm"));
        assert!(explicit_polling_required("efa"));
        assert!(!explicit_polling_required("mem-dc"));
    }

    #[tokio::test]
    async fn build_wires_two_addresses_per_node() {
        let fabric = MemFabric::builder().nodes(1).build();
        let cfg = CommConfig::testing();
        let sel = select_provider(fabric.as_ref(), &cfg).unwrap();
        let domain = fabric.open(&sel.info, NodeId::from_usize(0)).unwrap();
        let oob: Arc<dyn OobChannel> = LocalOob::group(1).remove(0);
        let eps = build(&domain, &cfg, &oob, 128).await.unwrap();
        assert_eq!(eps.num_tx_ctxs, eps.num_workers + 1);
        assert_eq!(eps.rx_msg_addr(NodeId::from_usize(0)), 0);
        assert_eq!(eps.rx_rma_addr(NodeId::from_usize(0)), 1);
        assert!(eps.wait_set.is_some());
    }

    #[tokio::test]
    async fn basic_provider_gets_no_wait_set() {
        let fabric = MemFabric::builder().nodes(1).build();
        let cfg = CommConfig::builder().provider_name("mem-basic").build().unwrap();
        let sel = select_provider(fabric.as_ref(), &cfg).unwrap();
        let domain = fabric.open(&sel.info, NodeId::from_usize(0)).unwrap();
        let oob: Arc<dyn OobChannel> = LocalOob::group(1).remove(0);
        let eps = build(&domain, &cfg, &oob, 128).await.unwrap();
        assert!(eps.wait_set.is_none());
    }

    #[tokio::test]
    async fn exhausted_file_budget_reports_the_knobs() {
        let fabric = MemFabric::builder().nodes(1).file_limit(2).build();
        let cfg = CommConfig::testing();
        let sel = select_provider(fabric.as_ref(), &cfg).unwrap();
        let domain = fabric.open(&sel.info, NodeId::from_usize(0)).unwrap();
        let oob: Arc<dyn OobChannel> = LocalOob::group(1).remove(0);
        match build(&domain, &cfg, &oob, 128).await {
            Err(CommError::OpenFileLimit {
                num_nodes,
                num_tx_ctxs,
                limit,
            }) => {
                assert_eq!(num_nodes, 1);
                assert!(num_tx_ctxs >= 2);
                assert_eq!(limit, 2);
            }
            other => panic!("expected OpenFileLimit, got {other:?}"),
        }
    }
}
