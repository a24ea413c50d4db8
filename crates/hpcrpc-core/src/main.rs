//! hpcrpc-diag: drives a pair of loopback instances and prints the
//! resulting breadcrumb snapshot as JSON.
//!
//! Usage: `hpcrpc-diag [CALLS] [CONFIG_JSON]`

use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use hpcrpc_core::{InboundRequest, Instance, InstanceConfig, LoopbackFabric, Pool, RpcError};
use tokio::runtime::Builder;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let calls: usize = match args.next() {
        Some(n) => n.parse().context("CALLS must be a number")?,
        None => 16,
    };
    let config = match args.next() {
        Some(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            InstanceConfig::from_json(&text)?
        }
        None => InstanceConfig::default(),
    };

    // completions and handlers on separate runtimes
    let progress_rt = Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("hpcrpc-progress")
        .enable_all()
        .build()?;
    let handler_rt = Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("hpcrpc-handler")
        .enable_all()
        .build()?;

    handler_rt.block_on(run(
        calls,
        config,
        Pool::new("progress", progress_rt.handle().clone()),
        Pool::new("handlers", handler_rt.handle().clone()),
    ))?;

    progress_rt.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}

async fn run(calls: usize, config: InstanceConfig, progress: Pool, handlers: Pool) -> anyhow::Result<()> {
    let fabric = LoopbackFabric::new();
    let server = Instance::initialize(
        &fabric,
        true,
        "loop://diag-server",
        progress.clone(),
        handlers.clone(),
        config.clone(),
    )?;
    let client = Instance::initialize(&fabric, false, "loop://diag-client", progress, handlers, config)?;

    let echo = server.register("diag_echo", 0, |req: InboundRequest| async move {
        Ok::<_, RpcError>(req.input)
    });
    let target = client.addr_lookup("loop://diag-server")?;

    for i in 0..calls {
        let handle = client.create_handle(&target, echo, 0)?;
        let payload = Bytes::from(format!("ping {i}"));
        let reply = client.forward(&handle, payload.clone()).await?;
        anyhow::ensure!(reply == payload, "echo mismatch on call {i}");
    }

    let report = serde_json::json!({
        "client": client.snapshot(),
        "server": server.snapshot(),
        "client_trace": client.trace_stats(),
        "server_trace": server.trace_stats(),
        "fabric": fabric.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    client.finalize().await;
    server.finalize().await;
    Ok(())
}
