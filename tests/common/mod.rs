//! Shared harness: brings up an in-process multi-node job.
#![allow(dead_code)] // each test binary uses a subset of the harness

use std::sync::Arc;
use std::sync::Mutex;

use weft::fabric::Fabric;
use weft::fabric::mem::MemFabric;
use weft::oob::LocalOob;
use weft::{AmDispatch, Comm, CommConfig};

/// Starts one `Comm` per node over the shared fabric. Every node runs the
/// same init collectives, so they come up together.
pub async fn bring_up(
    fabric: &Arc<MemFabric>,
    cfgs: Vec<CommConfig>,
    dispatch: Arc<dyn AmDispatch>,
) -> Vec<Arc<Comm>> {
    let n = cfgs.len();
    let oobs = LocalOob::group(n);
    let mut handles = Vec::with_capacity(n);
    for (cfg, oob) in cfgs.into_iter().zip(oobs) {
        let fabric: Arc<dyn Fabric> = Arc::clone(fabric) as Arc<dyn Fabric>;
        let dispatch = Arc::clone(&dispatch);
        handles.push(tokio::spawn(Comm::init(cfg, fabric, oob, dispatch)));
    }
    let mut comms = Vec::with_capacity(n);
    for h in handles {
        comms.push(h.await.expect("init task").expect("comm init"));
    }
    comms
}

/// A config pinned to one mem-fabric personality.
pub fn cfg_for(provider: &str) -> CommConfig {
    CommConfig::builder()
        .provider_name(provider)
        .max_parallelism(4)
        .build()
        .expect("config")
}

pub fn cfgs_for(provider: &str, n: usize) -> Vec<CommConfig> {
    (0..n).map(|_| cfg_for(provider)).collect()
}

/// Dispatch that records every executed body.
#[derive(Default)]
pub struct Recorder {
    pub calls: Mutex<Vec<(u32, Vec<u8>)>>,
}

impl AmDispatch for Recorder {
    fn execute(&self, fid: u32, payload: &[u8]) {
        self.calls.lock().unwrap().push((fid, payload.to_vec()));
    }
}

impl Recorder {
    pub fn calls(&self) -> Vec<(u32, Vec<u8>)> {
        self.calls.lock().unwrap().clone()
    }
}
