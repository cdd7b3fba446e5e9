//! Server side of multiplexing: targets by tag, and the service that routes
//! each call to the target its tag names.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use looprpc::Context;
use looprpc::Request;
use looprpc::Service;
use looprpc::Status;
use looprpc::StreamSink;
use tracing::trace;

use super::Tag;

/// Concurrent map from tag to target.
pub struct TargetRegistry<T: Tag, V> {
    kind: &'static str,
    targets: DashMap<T, V>,
}

impl<T: Tag, V: Clone> TargetRegistry<T, V> {
    /// `kind` names the targets in errors, e.g. `"relayer"`.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            targets: DashMap::new(),
        }
    }

    /// Registers `target`, returning the one it replaced.
    pub fn insert(&self, tag: T, target: V) -> Option<V> {
        self.targets.insert(tag, target)
    }

    /// Registers `target` unless the tag is taken; hands it back if it is.
    pub fn try_insert(&self, tag: T, target: V) -> Result<(), V> {
        match self.targets.entry(tag) {
            Entry::Occupied(_) => Err(target),
            Entry::Vacant(slot) => {
                slot.insert(target);
                Ok(())
            }
        }
    }

    /// The target for `tag`, or `NotFound` naming the tag.
    pub fn get(&self, tag: &T) -> Result<V, Status> {
        self.targets
            .get(tag)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Status::not_found(format!("{} {} not found", self.kind, tag)))
    }

    pub fn remove(&self, tag: &T) -> Option<V> {
        self.targets.remove(tag).map(|(_, target)| target)
    }

    pub fn contains(&self, tag: &T) -> bool {
        self.targets.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn tags(&self) -> Vec<T> {
        self.targets.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Routes each call to the service registered under the call's tag.
pub struct Dispatcher<T: Tag> {
    registry: Arc<TargetRegistry<T, Arc<dyn Service>>>,
}

impl<T: Tag> Dispatcher<T> {
    pub fn new(registry: Arc<TargetRegistry<T, Arc<dyn Service>>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TargetRegistry<T, Arc<dyn Service>>> {
        &self.registry
    }

    fn route(&self, request: &Request) -> Result<Arc<dyn Service>, Status> {
        let tag = T::extract(&request.metadata)?;
        trace!(%tag, method = %request.method, "dispatching call");
        self.registry.get(&tag)
    }
}

#[async_trait::async_trait]
impl<T: Tag> Service for Dispatcher<T> {
    async fn call(&self, ctx: Context, request: Request) -> Result<Vec<u8>, Status> {
        let target = self.route(&request)?;
        target.call(ctx, request).await
    }

    async fn stream(&self, ctx: Context, request: Request, sink: StreamSink) -> Result<(), Status> {
        let target = self.route(&request)?;
        target.stream(ctx, request, sink).await
    }
}
