//! # Server-Side Services
//!
//! A `Service` answers calls for one service name. Full method names follow the
//! gRPC convention `/package.Service/Method`; the `Router` picks the service
//! by everything before the last `/` and leaves the method to the service.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::context::Context;
use crate::metadata::Metadata;
use crate::status::Status;

/// An inbound call as seen by a service.
#[derive(Clone, Debug, Default)]
pub struct Request {
    pub method: String,
    pub metadata: Metadata,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(method: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            method: method.into(),
            metadata: Metadata::new(),
            payload,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// `package.Service` part of the full method name.
    pub fn service_name(&self) -> &str {
        split_method(&self.method).map(|(s, _)| s).unwrap_or("")
    }

    /// `Method` part of the full method name.
    pub fn method_name(&self) -> &str {
        split_method(&self.method)
            .map(|(_, m)| m)
            .unwrap_or(&self.method)
    }
}

/// Splits `/package.Service/Method` into its two halves.
pub fn split_method(method: &str) -> Option<(&str, &str)> {
    method.strip_prefix('/')?.rsplit_once('/')
}

/// Where a streaming handler writes its messages.
#[derive(Clone)]
pub struct StreamSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl StreamSink {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx }
    }

    pub fn send(&self, message: Vec<u8>) -> Result<(), Status> {
        self.tx
            .send(message)
            .map_err(|_| Status::cancelled("stream receiver is gone"))
    }
}

/// Handler for the calls of one service.
#[async_trait::async_trait]
pub trait Service: Send + Sync + 'static {
    /// Unary call.
    async fn call(&self, ctx: Context, request: Request) -> Result<Vec<u8>, Status>;

    /// Server-streaming call. Messages go to `sink`; the return value is the final status.
    async fn stream(&self, ctx: Context, request: Request, sink: StreamSink) -> Result<(), Status> {
        let _ = (ctx, sink);
        Err(Status::unimplemented(format!(
            "streaming method {} not implemented",
            request.method
        )))
    }
}

#[async_trait::async_trait]
impl<S: Service + ?Sized> Service for Arc<S> {
    async fn call(&self, ctx: Context, request: Request) -> Result<Vec<u8>, Status> {
        (**self).call(ctx, request).await
    }

    async fn stream(&self, ctx: Context, request: Request, sink: StreamSink) -> Result<(), Status> {
        (**self).stream(ctx, request, sink).await
    }
}

/// Maps service names to services.
#[derive(Clone, Default)]
pub struct Router {
    services: HashMap<String, Arc<dyn Service>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` under `name` (e.g. `loop.Relayer`), replacing any previous one.
    pub fn add_service(&mut self, name: impl Into<String>, service: impl Service) -> &mut Self {
        self.services.insert(name.into(), Arc::new(service));
        self
    }

    pub fn add_shared(&mut self, name: impl Into<String>, service: Arc<dyn Service>) -> &mut Self {
        self.services.insert(name.into(), service);
        self
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    fn route(&self, method: &str) -> Result<&Arc<dyn Service>, Status> {
        let (service, _) = split_method(method)
            .ok_or_else(|| Status::unimplemented(format!("malformed method name {method:?}")))?;
        self.services
            .get(service)
            .ok_or_else(|| Status::unimplemented(format!("unknown service {service}")))
    }
}

#[async_trait::async_trait]
impl Service for Router {
    async fn call(&self, ctx: Context, request: Request) -> Result<Vec<u8>, Status> {
        self.route(&request.method)?.call(ctx, request).await
    }

    async fn stream(&self, ctx: Context, request: Request, sink: StreamSink) -> Result<(), Status> {
        self.route(&request.method)?.stream(ctx, request, sink).await
    }
}
