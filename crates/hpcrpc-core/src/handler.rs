//! Inbound dispatch: handler registration and admission.
//!
//! The transport hands every inbound RPC to [`Instance::admit`] from the
//! progress pool. Admission looks up the handler and spawns one unit for the
//! request on the handler pool. That unit owns the request metadata, runs
//! the handler, sends the response and records the `Target` breadcrumb.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::address::{Address, RpcId};
use crate::breadcrumb::{BreadcrumbType, CallPathKey, Observation};
use crate::error::{Result, RpcError};
use crate::instance::Instance;
use crate::metadata::{self, RequestMetadata};
use crate::pool::{Pool, PoolSample};
use crate::trace::{wall_clock_secs, EventType, TraceEvent, Window};
use crate::transport::RpcHandle;

/// One inbound request as seen by a handler.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub rpc_id: RpcId,
    pub provider_id: u16,
    /// Address of the instance that sent the request.
    pub origin: Address,
    pub input: Bytes,
    pub metadata: RequestMetadata,
}

/// Serves one registered RPC.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(&self, request: InboundRequest) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>>;
}

impl<F, Fut> RpcHandler for F
where
    F: Fn(InboundRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    fn handle(&self, request: InboundRequest) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>> {
        Box::pin((self)(request))
    }
}

/// Registration table keyed by RPC id and provider.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<(RpcId, u16), Arc<dyn RpcHandler>>>,
}

impl HandlerRegistry {
    fn insert(&self, rpc_id: RpcId, provider_id: u16, handler: Arc<dyn RpcHandler>) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((rpc_id, provider_id), handler)
            .is_some()
    }

    fn remove(&self, rpc_id: RpcId, provider_id: u16) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(rpc_id, provider_id))
            .is_some()
    }

    fn get(&self, rpc_id: RpcId, provider_id: u16) -> Option<Arc<dyn RpcHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(rpc_id, provider_id))
            .cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Instance {
    /// Registers `handler` for `name` on `provider_id` and returns the RPC id
    /// origins must use. Replaces any previous registration.
    pub fn register(&self, name: &str, provider_id: u16, handler: impl RpcHandler) -> RpcId {
        self.assert_live();
        let rpc_id = RpcId::from_name(name);
        if self.inner.handlers.insert(rpc_id, provider_id, Arc::new(handler)) {
            warn!(rpc = name, %rpc_id, provider_id, "handler replaced");
        } else {
            debug!(rpc = name, %rpc_id, provider_id, "handler registered");
        }
        rpc_id
    }

    /// Registers a handler taking and returning bincode-encoded values.
    /// Decode and encode times are charged to the served RPC.
    pub fn register_typed<I, O, F, Fut>(&self, name: &str, provider_id: u16, handler: F) -> RpcId
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(InboundRequest, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(name, provider_id, move |request: InboundRequest| {
            let handler = Arc::clone(&handler);
            async move {
                let t = Instant::now();
                let input: I = bincode::deserialize(&request.input)?;
                let decoded = t.elapsed().as_secs_f64();
                metadata::with_timings(|timings| timings.input_deserial_time += decoded);

                let output = (*handler)(request, input).await?;

                let t = Instant::now();
                let encoded = bincode::serialize(&output)?;
                let elapsed = t.elapsed().as_secs_f64();
                metadata::with_timings(|timings| timings.output_serial_time += elapsed);
                Ok::<_, RpcError>(Bytes::from(encoded))
            }
        })
    }

    /// Removes the handler for `rpc_id` on `provider_id`. Returns whether one
    /// was registered.
    pub fn deregister(&self, rpc_id: RpcId, provider_id: u16) -> bool {
        self.assert_live();
        self.inner.handlers.remove(rpc_id, provider_id)
    }

    pub fn registered_handlers(&self) -> usize {
        self.inner.handlers.len()
    }

    /// Spawns a handler unit for `handle` on the handler pool.
    ///
    /// Called from the progress pool. An error tells the transport to fail
    /// the RPC on the origin side.
    pub(crate) fn admit(&self, handle: RpcHandle) -> Result<()> {
        let handler = self
            .inner
            .handlers
            .get(handle.rpc_id, handle.provider_id)
            .ok_or(RpcError::UnknownRpc {
                rpc_id: handle.rpc_id.as_u64(),
                provider_id: handle.provider_id,
            })?;

        let admitted = Instant::now();
        let pool = self.inner.handler_pool.sample();
        let instance = self.clone();
        self.inner
            .handler_pool
            .spawn(instance.serve(handler, handle, admitted, pool))?;
        Ok(())
    }

    async fn serve(self, handler: Arc<dyn RpcHandler>, handle: RpcHandle, admitted: Instant, pool: PoolSample) {
        let header = handle.header;
        let md = RequestMetadata {
            rpc_breadcrumb: header.rpc_breadcrumb,
            trace_id: header.trace_id,
            ordering_sequence: header.ordering_sequence,
            current_rpc_id: handle.rpc_id.as_u64(),
        };
        metadata::scope(md, self.run_handler(handler, handle, md, admitted, pool)).await
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn RpcHandler>,
        handle: RpcHandle,
        md: RequestMetadata,
        admitted: Instant,
        pool: PoolSample,
    ) {
        let inner = &self.inner;
        let name = handle.rpc_id.to_string();
        inner.tracer.record(
            TraceEvent::new(EventType::ServerReceive, md.trace_id, md.rpc_breadcrumb, name.as_str())
                .pool(pool)
                .observed(md.ordering_sequence)
                .size(handle.input.len() as u64),
        );

        let request = InboundRequest {
            rpc_id: handle.rpc_id,
            provider_id: handle.provider_id,
            origin: handle.peer.clone(),
            input: handle.input.clone(),
            metadata: md,
        };
        let start_wall = wall_clock_secs();
        let handler_start = Instant::now();
        let response = handler.handle(request).await;
        let handler_time = handler_start.elapsed().as_secs_f64();

        let succeeded = response.is_ok();
        let output_len = response.as_ref().map_or(0, |b| b.len() as u64);
        if let Err(e) = &response {
            debug!(rpc = %name, origin = %handle.peer, error = %e, "handler failed");
        }

        let send_start = Instant::now();
        let (tx, rx) = oneshot::channel();
        let issued = inner.transport.respond(
            &handle,
            response,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let sent = match issued {
            Ok(()) => {
                let _blocked = Pool::current_unit_pool().map(|p| p.block_current());
                rx.await.unwrap_or(Err(RpcError::CompletionDropped))
            }
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(rpc = %name, origin = %handle.peer, error = %e, "response not delivered");
            return;
        }
        if !succeeded {
            return;
        }

        let timings = metadata::take_timings();
        let at_update = inner.handler_pool.sample();
        let obs = Observation {
            elapsed: admitted.elapsed().as_secs_f64(),
            handler_time,
            operation_time: send_start.elapsed().as_secs_f64(),
            input_deserial_time: timings.input_deserial_time,
            output_serial_time: timings.output_serial_time,
            bulk_transfer_time: timings.bulk_transfer_time,
            rdma_transfer_size: timings.rdma_transfer_size,
            ..Observation::default()
        }
        .with_pool_sample(at_update.size, at_update.total_size);
        // hashes the serving address, the same key the origin folds under
        let self_hash = inner.transport.self_addr().hash64();
        let key = CallPathKey::new(md.rpc_breadcrumb, self_hash, handle.provider_id);
        inner.table.update(key, BreadcrumbType::Target, &obs);

        let event = TraceEvent::new(EventType::ServerSend, md.trace_id, md.rpc_breadcrumb, name)
            .pool(at_update)
            .operation(Window::new(start_wall, wall_clock_secs()));
        let event = match timings.bulk_window {
            Some(window) => event.bulk(window, timings.rdma_transfer_size),
            None => event.size(output_len),
        };
        inner.tracer.record(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Arc<dyn RpcHandler> {
        Arc::new(|req: InboundRequest| async move { Ok::<_, RpcError>(req.input) })
    }

    #[test]
    fn test_registry_keys_on_provider() {
        let registry = HandlerRegistry::default();
        let id = RpcId::from_name("echo");
        assert!(!registry.insert(id, 0, echo()));
        assert!(!registry.insert(id, 1, echo()));
        assert!(registry.insert(id, 0, echo()));
        assert_eq!(registry.len(), 2);

        assert!(registry.get(id, 1).is_some());
        assert!(registry.get(id, 2).is_none());
        assert!(registry.remove(id, 1));
        assert!(!registry.remove(id, 1));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_closure_handler_runs() {
        let handler = echo();
        let request = InboundRequest {
            rpc_id: RpcId::from_name("echo"),
            provider_id: 0,
            origin: Address::new("loop://peer"),
            input: Bytes::from_static(b"abc"),
            metadata: RequestMetadata::default(),
        };
        let out = handler.handle(request).await.unwrap();
        assert_eq!(out, Bytes::from_static(b"abc"));
    }
}
