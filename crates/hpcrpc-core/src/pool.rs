//! Execution pools: tokio runtime handles with occupancy accounting.
//!
//! An execution unit is a tokio task spawned through [`Pool::spawn`]. The pool
//! counts its live units and how many of them are currently suspended on a
//! transport operation, which is what breadcrumb and trace samples report as
//! pool size (runnable) and total pool size (runnable + blocked).

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, RpcError};

tokio::task_local! {
    static CURRENT_POOL: Pool;
}

struct PoolInner {
    name: String,
    handle: Handle,
    max_units: Option<usize>,
    live: AtomicUsize,
    blocked: AtomicUsize,
    spawned: AtomicU64,
    closed: AtomicBool,
}

/// Cloneable handle to an execution pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("max_units", &self.inner.max_units)
            .field("size", &self.size())
            .field("total_size", &self.total_size())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSample {
    /// Runnable units.
    pub size: u64,
    /// Runnable plus blocked units.
    pub total_size: u64,
}

impl Pool {
    /// Wraps a runtime handle as an unbounded pool.
    pub fn new(name: impl Into<String>, handle: Handle) -> Self {
        Self::build(name.into(), handle, None)
    }

    /// Wraps a runtime handle as a pool that refuses to hold more than
    /// `max_units` live units.
    pub fn bounded(name: impl Into<String>, handle: Handle, max_units: usize) -> Self {
        Self::build(name.into(), handle, Some(max_units))
    }

    /// Pool on the runtime the caller is running on.
    pub fn current(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        match Handle::try_current() {
            Ok(handle) => Ok(Self::new(name, handle)),
            Err(_) => Err(RpcError::InvalidPool { name }),
        }
    }

    fn build(name: String, handle: Handle, max_units: Option<usize>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                handle,
                max_units,
                live: AtomicUsize::new(0),
                blocked: AtomicUsize::new(0),
                spawned: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Pool of the execution unit currently running, if it was spawned
    /// through a [`Pool`].
    pub fn current_unit_pool() -> Option<Pool> {
        CURRENT_POOL.try_with(|pool| pool.clone()).ok()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// A closed pool accepts no new units and is rejected by `Instance::initialize`.
    pub fn is_valid(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Whether two handles refer to the same pool.
    pub fn same_pool(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runnable units.
    pub fn size(&self) -> usize {
        let live = self.inner.live.load(Ordering::Relaxed);
        live.saturating_sub(self.inner.blocked.load(Ordering::Relaxed))
    }

    /// Units suspended on a pending operation.
    pub fn blocked(&self) -> usize {
        self.inner.blocked.load(Ordering::Relaxed)
    }

    /// Runnable plus blocked units.
    pub fn total_size(&self) -> usize {
        self.inner.live.load(Ordering::Relaxed)
    }

    /// Units ever spawned on this pool.
    pub fn spawned(&self) -> u64 {
        self.inner.spawned.load(Ordering::Relaxed)
    }

    pub fn sample(&self) -> PoolSample {
        PoolSample {
            size: self.size() as u64,
            total_size: self.total_size() as u64,
        }
    }

    /// Creates a new execution unit on this pool running `fut`.
    ///
    /// Fails without spawning anything if the pool is closed or full.
    pub fn spawn<F>(&self, fut: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.is_valid() {
            return Err(RpcError::InvalidPool {
                name: self.inner.name.clone(),
            });
        }

        let max = self.inner.max_units;
        let reserved = self
            .inner
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| match max {
                Some(max) if live >= max => None,
                _ => Some(live + 1),
            });
        if reserved.is_err() {
            debug!(pool = %self.inner.name, "pool full, refusing new unit");
            return Err(RpcError::ResourceExhausted {
                reason: format!("pool {} is at its unit limit", self.inner.name),
            });
        }
        self.inner.spawned.fetch_add(1, Ordering::Relaxed);

        let guard = UnitGuard { pool: self.clone() };
        let unit = CURRENT_POOL.scope(self.clone(), async move {
            let _guard = guard;
            fut.await
        });
        Ok(self.inner.handle.spawn(unit))
    }

    /// Marks one unit of this pool as suspended until the guard is dropped.
    pub(crate) fn block_current(&self) -> BlockedGuard {
        self.inner.blocked.fetch_add(1, Ordering::Relaxed);
        BlockedGuard { pool: self.clone() }
    }
}

struct UnitGuard {
    pool: Pool,
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        self.pool.inner.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Keeps a unit counted as blocked while it waits on a completion.
pub(crate) struct BlockedGuard {
    pool: Pool,
}

impl Drop for BlockedGuard {
    fn drop(&mut self) {
        self.pool.inner.blocked.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_spawn_tracks_live_units() {
        let pool = Pool::current("handlers").unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = pool
            .spawn(async move {
                rx.await.ok();
            })
            .unwrap();
        assert_eq!(pool.total_size(), 1);
        assert_eq!(pool.spawned(), 1);

        tx.send(()).unwrap();
        task.await.unwrap();
        assert_eq!(pool.total_size(), 0);
    }

    #[tokio::test]
    async fn test_bounded_pool_refuses() {
        let pool = Pool::bounded("tiny", Handle::current(), 1);
        let (tx, rx) = oneshot::channel::<()>();
        let first = pool.spawn(async move { rx.await.ok(); }).unwrap();

        let err = pool.spawn(async {}).unwrap_err();
        assert!(err.is_resource_exhausted());

        tx.send(()).unwrap();
        first.await.unwrap();
        assert!(pool.spawn(async {}).is_ok());
    }

    #[tokio::test]
    async fn test_closed_pool_is_invalid() {
        let pool = Pool::current("progress").unwrap();
        assert!(pool.is_valid());
        pool.close();
        assert!(!pool.is_valid());
        assert!(matches!(pool.spawn(async {}), Err(RpcError::InvalidPool { .. })));
    }

    #[tokio::test]
    async fn test_current_unit_pool_inside_unit() {
        let pool = Pool::current("handlers").unwrap();
        assert!(Pool::current_unit_pool().is_none());

        let inner = pool.clone();
        let same = pool
            .spawn(async move {
                Pool::current_unit_pool()
                    .map(|p| p.same_pool(&inner))
                    .unwrap_or(false)
            })
            .unwrap()
            .await
            .unwrap();
        assert!(same);
    }

    #[tokio::test]
    async fn test_blocked_guard_moves_unit_out_of_runnable() {
        let pool = Pool::current("handlers").unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let (seen_tx, seen_rx) = oneshot::channel::<(usize, usize)>();
        let probe = pool.clone();
        let task = pool
            .spawn(async move {
                let current = Pool::current_unit_pool().unwrap();
                let _blocked = current.block_current();
                seen_tx.send((probe.size(), probe.total_size())).ok();
                rx.await.ok();
            })
            .unwrap();

        assert_eq!(seen_rx.await.unwrap(), (0, 1));
        assert_eq!(pool.blocked(), 1);
        tx.send(()).unwrap();
        task.await.unwrap();
        assert_eq!(pool.blocked(), 0);
    }

    #[test]
    fn test_current_outside_runtime_fails() {
        assert!(matches!(Pool::current("none"), Err(RpcError::InvalidPool { .. })));
    }
}
