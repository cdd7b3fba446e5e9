//! Sub-resources created at runtime and addressed by generated ids.
//!
//! A service that hands out sub-resources (e.g. `NewContractReader`) builds
//! the implementation, registers it here together with the adapter service
//! that speaks for it, and returns the id to the client. The client tags its
//! later calls with that id; this registry routes them. A `/Close` call
//! unregisters the id before it is forwarded, so anything after it is
//! `NotFound` even when the close itself fails or is cut short.

use std::sync::Arc;

use looprpc::Context;
use looprpc::Request;
use looprpc::Service;
use looprpc::Status;
use looprpc::StreamSink;
use tracing::debug;

use super::ResourceId;
use super::ResourceKind;
use super::Tag;
use super::TargetRegistry;
use crate::client_conn::is_close_method;

/// An adapter service and the implementation it fronts.
pub struct SubResource<I: ?Sized> {
    pub service: Arc<dyn Service>,
    pub inner: Arc<I>,
}

impl<I: ?Sized> Clone for SubResource<I> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            inner: self.inner.clone(),
        }
    }
}

pub struct SubResources<K: ResourceKind, I: ?Sized + Send + Sync + 'static> {
    registry: TargetRegistry<ResourceId<K>, SubResource<I>>,
}

impl<K: ResourceKind, I: ?Sized + Send + Sync + 'static> SubResources<K, I> {
    pub fn new() -> Self {
        Self {
            registry: TargetRegistry::new(K::NAME),
        }
    }

    /// Registers a new sub-resource under a fresh id.
    pub fn register(&self, service: Arc<dyn Service>, inner: Arc<I>) -> ResourceId<K> {
        let mut entry = SubResource { service, inner };
        loop {
            let id = ResourceId::generate();
            match self.registry.try_insert(id.clone(), entry) {
                Ok(()) => {
                    debug!(%id, "registered sub-resource");
                    return id;
                }
                Err(taken) => entry = taken,
            }
        }
    }

    pub fn get(&self, id: &ResourceId<K>) -> Result<SubResource<I>, Status> {
        self.registry.get(id)
    }

    /// The implementation behind `id`.
    pub fn inner(&self, id: &ResourceId<K>) -> Result<Arc<I>, Status> {
        self.get(id).map(|entry| entry.inner)
    }

    pub fn remove(&self, id: &ResourceId<K>) -> Option<SubResource<I>> {
        self.registry.remove(id)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

impl<K: ResourceKind, I: ?Sized + Send + Sync + 'static> Default for SubResources<K, I> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl<K: ResourceKind, I: ?Sized + Send + Sync + 'static> Service for SubResources<K, I> {
    async fn call(&self, ctx: Context, request: Request) -> Result<Vec<u8>, Status> {
        let id = ResourceId::<K>::extract(&request.metadata)?;
        if !is_close_method(&request.method) {
            let entry = self.get(&id)?;
            return entry.service.call(ctx, request).await;
        }
        let entry = self
            .remove(&id)
            .ok_or_else(|| Status::not_found(format!("{} {id} not found", K::NAME)))?;
        debug!(%id, "closing sub-resource");
        entry.service.call(ctx, request).await
    }

    async fn stream(&self, ctx: Context, request: Request, sink: StreamSink) -> Result<(), Status> {
        let id = ResourceId::<K>::extract(&request.metadata)?;
        let entry = self.get(&id)?;
        entry.service.stream(ctx, request, sink).await
    }
}
