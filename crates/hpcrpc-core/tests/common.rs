//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use hpcrpc_core::{
    Address, BreadcrumbType, InboundRequest, Instance, InstanceConfig, LoopbackFabric, Pool,
    Result, RpcError, RpcId, Snapshot,
};

pub const SERVER: &str = "loop://server";
pub const CLIENT: &str = "loop://client";

/// A listening server and a client instance on one fabric.
pub struct Pair {
    pub fabric: LoopbackFabric,
    pub server: Instance,
    pub client: Instance,
}

impl Pair {
    /// Both instances share the caller's runtime, with separate pools.
    pub fn new() -> Self {
        Self::with_pools(
            Pool::current("progress").unwrap(),
            Pool::current("handlers").unwrap(),
        )
    }

    pub fn with_pools(progress: Pool, handlers: Pool) -> Self {
        let fabric = LoopbackFabric::new();
        let config = InstanceConfig::default();
        let server = Instance::initialize(
            &fabric,
            true,
            SERVER,
            progress.clone(),
            handlers.clone(),
            config.clone(),
        )
        .unwrap();
        let client = Instance::initialize(&fabric, false, CLIENT, progress, handlers, config).unwrap();
        Self {
            fabric,
            server,
            client,
        }
    }

    pub fn server_addr(&self) -> Address {
        self.client.addr_lookup(SERVER).unwrap()
    }

    pub async fn finalize(self) {
        self.client.finalize().await;
        self.server.finalize().await;
    }
}

pub fn register_echo(instance: &Instance, name: &str) -> RpcId {
    instance.register(name, 0, |req: InboundRequest| async move { Ok::<_, RpcError>(req.input) })
}

/// Forwards `input` to `rpc_id` at `addr` from inside a handler.
pub async fn relay(instance: Instance, addr: Address, rpc_id: RpcId, input: Bytes) -> Result<Bytes> {
    let handle = instance.create_handle(&addr, rpc_id, 0)?;
    instance.forward(&handle, input).await
}

pub fn count(snapshot: &Snapshot, kind: BreadcrumbType) -> u64 {
    snapshot
        .iter()
        .filter(|b| b.kind == kind)
        .map(|b| b.stats.count)
        .sum()
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
