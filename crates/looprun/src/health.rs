//! Standard health service every served plugin exposes as `loop.Health`.

use std::collections::HashMap;
use std::sync::Arc;

use looprpc::Code;
use looprpc::Context;
use looprpc::Invoker;
use looprpc::Metadata;
use looprpc::Request;
use looprpc::Service;
use looprpc::Status;
use prost::Message;

pub const SERVICE_NAME: &str = "loop.Health";

const NAME: &str = "/loop.Health/Name";
const READY: &str = "/loop.Health/Ready";
const HEALTH_REPORT: &str = "/loop.Health/HealthReport";
const CLOSE: &str = "/loop.Health/Close";

#[derive(Clone, PartialEq, prost::Message)]
pub struct NameReply {
    #[prost(string, tag = "1")]
    pub name: String,
}

/// Empty value means healthy, anything else is the error message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthReportReply {
    #[prost(map = "string, string", tag = "1")]
    pub report: HashMap<String, String>,
}

/// Something that can report on its own health.
#[async_trait::async_trait]
pub trait Checkable: Send + Sync + 'static {
    fn name(&self) -> String;

    async fn ready(&self) -> anyhow::Result<()>;

    /// Health of this component and its children, keyed by name. `None` is healthy.
    async fn health_report(&self) -> HashMap<String, Option<String>>;

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct HealthService<C: ?Sized> {
    inner: Arc<C>,
}

impl<C: Checkable + ?Sized> HealthService<C> {
    pub fn new(inner: Arc<C>) -> Self {
        Self { inner }
    }
}

fn failed(e: anyhow::Error) -> Status {
    Status::new(Code::FailedPrecondition, format!("{e:#}"))
}

#[async_trait::async_trait]
impl<C: Checkable + ?Sized> Service for HealthService<C> {
    async fn call(&self, _ctx: Context, request: Request) -> Result<Vec<u8>, Status> {
        match request.method_name() {
            "Name" => Ok(NameReply { name: self.inner.name() }.encode_to_vec()),
            "Ready" => self.inner.ready().await.map(|()| Vec::new()).map_err(failed),
            "HealthReport" => {
                let report = self
                    .inner
                    .health_report()
                    .await
                    .into_iter()
                    .map(|(name, err)| (name, err.unwrap_or_default()))
                    .collect();
                Ok(HealthReportReply { report }.encode_to_vec())
            }
            "Close" => self.inner.close().await.map(|()| Vec::new()).map_err(failed),
            other => Err(Status::unimplemented(format!("{SERVICE_NAME} has no method {other}"))),
        }
    }
}

/// Client for a remote `loop.Health`.
pub struct HealthClient<I: ?Sized> {
    inner: Arc<I>,
}

impl<I: Invoker + ?Sized> HealthClient<I> {
    pub fn new(inner: Arc<I>) -> Self {
        Self { inner }
    }

    pub async fn name(&self, ctx: &Context) -> Result<String, Status> {
        let reply = self.inner.invoke(ctx, NAME, Metadata::new(), Vec::new()).await?;
        let reply = NameReply::decode(reply.as_slice())
            .map_err(|e| Status::internal(format!("malformed Name reply: {e}")))?;
        Ok(reply.name)
    }

    pub async fn ready(&self, ctx: &Context) -> Result<(), Status> {
        self.inner.invoke(ctx, READY, Metadata::new(), Vec::new()).await?;
        Ok(())
    }

    pub async fn health_report(&self, ctx: &Context) -> Result<HashMap<String, Option<String>>, Status> {
        let reply = self
            .inner
            .invoke(ctx, HEALTH_REPORT, Metadata::new(), Vec::new())
            .await?;
        let reply = HealthReportReply::decode(reply.as_slice())
            .map_err(|e| Status::internal(format!("malformed HealthReport reply: {e}")))?;
        Ok(reply
            .report
            .into_iter()
            .map(|(name, err)| (name, (!err.is_empty()).then_some(err)))
            .collect())
    }

    pub async fn close(&self, ctx: &Context) -> Result<(), Status> {
        self.inner.invoke(ctx, CLOSE, Metadata::new(), Vec::new()).await?;
        Ok(())
    }
}
