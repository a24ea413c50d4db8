//! Instance lifecycle.
//!
//! An [`Instance`] ties one transport context to two execution pools. The
//! progress pool runs the progress loop, which fires every transport
//! callback and the inbound hook. The handler pool runs one unit per admitted
//! RPC and nothing else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::address::{Address, RpcId};
use crate::config::InstanceConfig;
use crate::error::{Result, RpcError};
use crate::handler::HandlerRegistry;
use crate::pool::Pool;
use crate::sysstat::{self, SystemSampler, SystemStat};
use crate::table::{BreadcrumbTable, Snapshot};
use crate::trace::{TraceRecord, TraceRecorder, TraceStats, TracingSink};
use crate::transport::{
    BulkAccess, BulkHandle, InboundHook, RpcHandle, Transport, TransportContextId, TransportFactory,
};

/// Maps transport contexts to the instance that owns them.
///
/// Entries are added by [`Instance::initialize`] and removed by
/// [`Instance::finalize`]. The registry holds weak references only.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: Mutex<HashMap<TransportContextId, Weak<InstanceInner>>>,
}

impl InstanceRegistry {
    /// Process-wide registry used by the inbound hook.
    pub fn global() -> &'static InstanceRegistry {
        static REGISTRY: OnceLock<InstanceRegistry> = OnceLock::new();
        REGISTRY.get_or_init(InstanceRegistry::default)
    }

    fn instances(&self) -> std::sync::MutexGuard<'_, HashMap<TransportContextId, Weak<InstanceInner>>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, ctx: TransportContextId, inner: &Arc<InstanceInner>) {
        self.instances().insert(ctx, Arc::downgrade(inner));
    }

    fn remove(&self, ctx: TransportContextId) {
        self.instances().remove(&ctx);
    }

    pub fn lookup(&self, ctx: TransportContextId) -> Option<Instance> {
        let inner = self.instances().get(&ctx)?.upgrade()?;
        if inner.finalized.load(Ordering::Acquire) {
            return None;
        }
        Some(Instance { inner })
    }

    pub fn len(&self) -> usize {
        self.instances().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) struct InstanceInner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) progress_pool: Pool,
    pub(crate) handler_pool: Pool,
    pub(crate) table: BreadcrumbTable,
    pub(crate) tracer: Arc<TraceRecorder>,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) config: InstanceConfig,
    finalized: AtomicBool,
    outstanding: AtomicUsize,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        if !self.finalized.load(Ordering::Acquire) {
            // dropping `shutdown` stops both loops
            InstanceRegistry::global().remove(self.transport.context_id());
            self.transport.finalize();
        }
    }
}

/// One RPC instance. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Instance {
    pub(crate) inner: Arc<InstanceInner>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("addr", &self.inner.transport.self_addr())
            .field("context", &self.inner.transport.context_id())
            .field("progress_pool", &self.inner.progress_pool)
            .field("handler_pool", &self.inner.handler_pool)
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

/// Decrements the outstanding-operation counter on drop.
pub(crate) struct OutstandingGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for OutstandingGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Instance {
    /// Creates the transport context and starts the progress loop.
    ///
    /// `progress_pool` and `handler_pool` may be the same pool. When they are
    /// not, a saturated handler pool does not delay completions.
    pub fn initialize(
        factory: &dyn TransportFactory,
        listen: bool,
        local_address: &str,
        progress_pool: Pool,
        handler_pool: Pool,
        config: InstanceConfig,
    ) -> Result<Instance> {
        for pool in [&progress_pool, &handler_pool] {
            if !pool.is_valid() {
                return Err(RpcError::InvalidPool {
                    name: pool.name().to_string(),
                });
            }
        }

        let transport = factory.create(listen, local_address)?;
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(InstanceInner {
            transport: Arc::clone(&transport),
            progress_pool,
            handler_pool,
            table: BreadcrumbTable::with_max_entries(config.breadcrumb_max_entries),
            tracer: Arc::new(TraceRecorder::new(
                config.trace_enabled,
                config.trace_capacity,
                Arc::new(TracingSink),
            )),
            handlers: HandlerRegistry::default(),
            config,
            finalized: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            shutdown,
            loops: Mutex::new(Vec::new()),
        });

        let ctx = transport.context_id();
        InstanceRegistry::global().insert(ctx, &inner);

        let hook: InboundHook = Arc::new(|ctx: TransportContextId, handle: RpcHandle| {
            match Instance::lookup_by_transport_context(ctx) {
                Some(instance) => instance.admit(handle),
                None => Err(RpcError::Transport {
                    reason: format!("no live instance for transport context {}", ctx.0),
                }),
            }
        });
        transport.set_inbound_hook(hook);

        let instance = Instance { inner };
        if let Err(e) = instance.start_loops() {
            instance.inner.finalized.store(true, Ordering::Release);
            InstanceRegistry::global().remove(ctx);
            transport.finalize();
            return Err(e);
        }

        info!(
            addr = %transport.self_addr(),
            context = ctx.0,
            listen,
            progress_pool = instance.inner.progress_pool.name(),
            handler_pool = instance.inner.handler_pool.name(),
            "instance initialized"
        );
        Ok(instance)
    }

    fn start_loops(&self) -> Result<()> {
        let inner = &self.inner;
        let mut loops = Vec::with_capacity(2);

        let transport = Arc::clone(&inner.transport);
        let timeout = inner.config.progress_timeout();
        let mut shutdown = inner.shutdown.subscribe();
        loops.push(inner.progress_pool.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    res = transport.progress(timeout) => {
                        if let Err(e) = res {
                            warn!(error = %e, "progress loop stopped");
                            break;
                        }
                    }
                }
            }
            debug!(context = transport.context_id().0, "progress loop exited");
        })?);

        if let Some(period) = inner.config.system_stat_interval() {
            let tracer = Arc::clone(&inner.tracer);
            let handler_pool = inner.handler_pool.clone();
            let mut shutdown = inner.shutdown.subscribe();
            loops.push(inner.progress_pool.spawn(async move {
                let mut sampler = SystemSampler::new();
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = ticker.tick() => {
                            let stat = sampler.sample(handler_pool.sample());
                            tracer.record_system_stat(stat, sysstat::resource_usage());
                        }
                    }
                }
            })?);
        }

        inner
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(loops);
        Ok(())
    }

    /// Tears the instance down.
    ///
    /// No forward or bulk transfer issued through this instance may still be
    /// in flight. Handler units that are still running lose their transport.
    pub async fn finalize(self) {
        let inner = &self.inner;
        debug_assert_eq!(
            inner.outstanding.load(Ordering::Acquire),
            0,
            "finalize with operations in flight"
        );
        if inner.finalized.swap(true, Ordering::AcqRel) {
            return;
        }

        let ctx = inner.transport.context_id();
        InstanceRegistry::global().remove(ctx);
        let _ = inner.shutdown.send(true);

        let loops: Vec<_> = inner
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in loops {
            if let Err(e) = task.await {
                warn!(context = ctx.0, error = %e, "instance loop did not exit cleanly");
            }
        }

        inner.transport.finalize();
        info!(
            addr = %inner.transport.self_addr(),
            context = ctx.0,
            breadcrumbs = inner.table.len(),
            "instance finalized"
        );
    }

    /// Instance owning transport context `ctx`, if it is still live.
    pub fn lookup_by_transport_context(ctx: TransportContextId) -> Option<Instance> {
        InstanceRegistry::global().lookup(ctx)
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::Acquire)
    }

    pub(crate) fn assert_live(&self) {
        debug_assert!(!self.is_finalized(), "instance used after finalize");
    }

    pub(crate) fn track_outstanding(&self) -> OutstandingGuard<'_> {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        OutstandingGuard {
            counter: &self.inner.outstanding,
        }
    }

    /// Forwards and bulk transfers currently in flight.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn context_id(&self) -> TransportContextId {
        self.inner.transport.context_id()
    }

    pub fn self_addr(&self) -> Address {
        self.assert_live();
        self.inner.transport.self_addr()
    }

    pub fn addr_lookup(&self, name: &str) -> Result<Address> {
        self.assert_live();
        self.inner.transport.addr_lookup(name)
    }

    pub fn create_handle(&self, addr: &Address, rpc_id: RpcId, provider_id: u16) -> Result<RpcHandle> {
        self.assert_live();
        self.inner.transport.create_handle(addr, rpc_id, provider_id)
    }

    pub fn bulk_create(&self, buffer: Vec<u8>, access: BulkAccess) -> Result<BulkHandle> {
        self.assert_live();
        self.inner.transport.bulk_create(buffer, access)
    }

    pub fn progress_pool(&self) -> &Pool {
        &self.inner.progress_pool
    }

    pub fn handler_pool(&self) -> &Pool {
        &self.inner.handler_pool
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.inner.config
    }

    /// Detached copy of every breadcrumb aggregate.
    pub fn snapshot(&self) -> Snapshot {
        self.assert_live();
        self.inner.table.snapshot()
    }

    /// Removes and returns buffered trace records, oldest first.
    pub fn traces(&self) -> Vec<TraceRecord> {
        self.inner.tracer.drain()
    }

    /// Removes and returns buffered system samples, oldest first.
    pub fn system_stats(&self) -> Vec<SystemStat> {
        self.inner.tracer.drain_system_stats()
    }

    pub fn trace_stats(&self) -> TraceStats {
        self.inner.tracer.stats()
    }

    /// Breadcrumb updates refused because the table was full.
    pub fn dropped_breadcrumbs(&self) -> u64 {
        self.inner.table.dropped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackFabric;
    use std::time::Duration;

    fn pools() -> (Pool, Pool) {
        (
            Pool::current("progress").unwrap(),
            Pool::current("handlers").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_initialize_registers_and_finalize_removes() {
        let fabric = LoopbackFabric::new();
        let (progress, handlers) = pools();
        let inst = Instance::initialize(
            &fabric,
            true,
            "loop://inst-registry",
            progress,
            handlers,
            InstanceConfig::default(),
        )
        .unwrap();

        let ctx = inst.context_id();
        let found = Instance::lookup_by_transport_context(ctx).unwrap();
        assert_eq!(found.self_addr().as_str(), "loop://inst-registry");
        drop(found);

        inst.finalize().await;
        assert!(Instance::lookup_by_transport_context(ctx).is_none());
    }

    #[tokio::test]
    async fn test_closed_pool_rejected() {
        let fabric = LoopbackFabric::new();
        let (progress, handlers) = pools();
        handlers.close();
        let err = Instance::initialize(
            &fabric,
            true,
            "loop://inst-closed-pool",
            progress,
            handlers,
            InstanceConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RpcError::InvalidPool { .. }));
    }

    #[tokio::test]
    async fn test_invalid_and_duplicate_address() {
        let fabric = LoopbackFabric::new();
        let (progress, handlers) = pools();
        let cfg = InstanceConfig::default();
        assert!(matches!(
            Instance::initialize(&fabric, true, "nonsense", progress.clone(), handlers.clone(), cfg.clone()),
            Err(RpcError::InvalidAddress { .. })
        ));

        let first = Instance::initialize(
            &fabric,
            true,
            "loop://inst-dup",
            progress.clone(),
            handlers.clone(),
            cfg.clone(),
        )
        .unwrap();
        assert!(matches!(
            Instance::initialize(&fabric, true, "loop://inst-dup", progress, handlers, cfg),
            Err(RpcError::AddressInUse { .. })
        ));
        first.finalize().await;
    }

    #[tokio::test]
    async fn test_system_stat_sampler_runs() {
        let fabric = LoopbackFabric::new();
        let (progress, handlers) = pools();
        let cfg = InstanceConfig {
            system_stat_interval_ms: Some(5),
            ..InstanceConfig::default()
        };
        let inst = Instance::initialize(&fabric, true, "loop://inst-sampler", progress, handlers, cfg).unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let stats = inst.system_stats();
        assert!(!stats.is_empty());
        assert!(inst.trace_stats().system_stats_recorded >= 1);
        inst.finalize().await;
    }

    #[cfg(debug_assertions)]
    #[tokio::test]
    #[should_panic(expected = "instance used after finalize")]
    async fn test_use_after_finalize_asserts() {
        let fabric = LoopbackFabric::new();
        let (progress, handlers) = pools();
        let inst = Instance::initialize(
            &fabric,
            true,
            "loop://inst-after-finalize",
            progress,
            handlers,
            InstanceConfig::default(),
        )
        .unwrap();
        let stale = inst.clone();
        inst.finalize().await;
        let _ = stale.snapshot();
    }

    #[tokio::test]
    async fn test_progress_loop_occupies_progress_pool() {
        let fabric = LoopbackFabric::new();
        let (progress, handlers) = pools();
        let inst = Instance::initialize(
            &fabric,
            true,
            "loop://inst-loop",
            progress.clone(),
            handlers.clone(),
            InstanceConfig::default(),
        )
        .unwrap();
        assert_eq!(progress.total_size(), 1);
        assert_eq!(handlers.total_size(), 0);

        inst.finalize().await;
        assert_eq!(progress.total_size(), 0);
    }
}
