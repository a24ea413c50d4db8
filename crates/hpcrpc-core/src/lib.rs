//! hpcrpc core: pool-decoupled RPC dispatch over a pluggable transport.
//!
//! An [`Instance`] binds one transport context to a progress pool, which
//! delivers completions, and a handler pool, which runs RPC handlers.
//! Outbound calls suspend only the issuing unit until their completion fires.
//! Every completed call is folded into a per-call-path [`BreadcrumbTable`]
//! and traced by a [`TraceRecorder`].

pub mod address;
pub mod breadcrumb;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod instance;
pub mod loopback;
pub mod metadata;
pub mod pool;
pub mod sysstat;
pub mod table;
pub mod trace;
pub mod transport;

pub use address::{Address, RpcId};
pub use breadcrumb::{chain_call_path, BreadcrumbType, CallPathKey, Observation, StatsAggregate};
pub use config::InstanceConfig;
pub use error::{Result, RpcError};
pub use handler::{InboundRequest, RpcHandler};
pub use instance::{Instance, InstanceRegistry};
pub use loopback::{Fault, LoopbackFabric};
pub use metadata::RequestMetadata;
pub use pool::{Pool, PoolSample};
pub use sysstat::SystemStat;
pub use table::{Breadcrumb, BreadcrumbTable, Snapshot};
pub use trace::{EventType, TraceRecord, TraceRecorder};
pub use transport::{BulkAccess, BulkHandle, BulkOp, RpcHandle, Transport, TransportFactory};
