//! # Broker Extension
//!
//! `BrokerExt` pairs a broker with the session config and a logger name, and
//! builds everything else on top: served endpoints, dialed peers and
//! self-healing client connections.
//!
//! ## Invariants
//!
//! - A served endpoint runs exactly two tasks: the server and a watcher that
//!   stops it on release or on the session shutdown signal.
//! - Releasing a served endpoint waits for both tasks to finish.
//! - If an endpoint cannot be served, the dependencies handed to `serve` are
//!   released before the error is returned.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use looprpc::Peer;
use looprpc::Router;
use looprpc::Server;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::warn;

use crate::broker::Broker;
use crate::client_conn::ClientConn;
use crate::config::BrokerConfig;
use crate::error::Error;
use crate::resource::Resource;
use crate::resource::Resources;

const ROOT_NAME: &str = "loop";

#[derive(Clone)]
pub struct BrokerExt {
    broker: Arc<dyn Broker>,
    config: BrokerConfig,
    name: String,
}

impl BrokerExt {
    pub fn new(broker: Arc<dyn Broker>, config: BrokerConfig) -> Self {
        Self {
            broker,
            config,
            name: ROOT_NAME.into(),
        }
    }

    /// Logger name, dotted from the root (`loop.Relayer.ContractReader`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Copy of this extension logging under `self.name + "." + name`.
    pub fn with_name(&self, name: &str) -> Self {
        let mut named = self.clone();
        named.name = format!("{}.{}", self.name, name);
        named
    }

    /// Serves a new endpoint whose services are added by `register`.
    ///
    /// Returns the endpoint id for the other side to dial and the resource
    /// that stops it. `deps` are only consumed on failure.
    pub async fn serve<F>(&self, name: &str, register: F, deps: Resources) -> Result<(u32, Resource), Error>
    where
        F: FnOnce(&mut Router),
    {
        let id = self.broker.next_id();
        let listener = match self.broker.accept(id).await {
            Ok(listener) => listener,
            Err(source) => {
                self.close_all(deps).await;
                return Err(Error::Accept {
                    name: name.into(),
                    id,
                    source,
                });
            }
        };

        let mut router = self.config.new_router();
        register(&mut router);

        let label = format!("{}.{}", self.name, name);
        let span = tracing::debug_span!("serve", logger = %self.name, endpoint = name, id);
        let stop = CancellationToken::new();

        let server_task = {
            let stop = stop.clone();
            let server = Server::new(label.clone(), router);
            tokio::spawn(async move { server.serve(listener, stop).await }.instrument(span.clone()))
        };

        let watcher_task = {
            let stop = stop.clone();
            let shutdown = self.config.shutdown.clone();
            tokio::spawn(
                async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => debug!("session shutting down"),
                        _ = stop.cancelled() => {}
                    }
                    stop.cancel();
                }
                .instrument(span),
            )
        };

        debug!(logger = %self.name, endpoint = name, id, "serving endpoint");

        let resource = Resource::from_fn(label.clone(), move || async move {
            stop.cancel();
            let (server, watcher) = tokio::join!(server_task, watcher_task);
            server.with_context(|| format!("{label} server task"))?;
            watcher.with_context(|| format!("{label} watcher task"))?;
            Ok(())
        });
        Ok((id, resource))
    }

    /// Dials endpoint `id` with the session's dial options.
    pub async fn dial(&self, id: u32) -> Result<Peer, Error> {
        let transport = self
            .broker
            .dial(id, &self.config.dial_options)
            .await
            .map_err(|source| Error::Dial {
                name: self.name.clone(),
                id,
                source,
            })?;
        Ok(Peer::new(format!("{}#{}", self.name, id), transport))
    }

    /// Releases every resource, logging failures instead of returning them.
    pub async fn close_all(&self, resources: impl IntoIterator<Item = Resource>) {
        for resource in resources {
            if let Err(e) = resource.release().await {
                warn!(logger = %self.name, resource = resource.name(), error = %format!("{e:#}"), "error closing resource");
            }
        }
    }

    /// A self-healing connection named `self.name + "." + name`.
    ///
    /// `rebuild` serves whatever the connection needs and returns the id to
    /// dial plus the resources that must live exactly as long as that dial.
    pub fn new_client_conn<F, Fut>(&self, name: &str, rebuild: F) -> ClientConn
    where
        F: Fn(looprpc::Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<(u32, Resources)>> + Send + 'static,
    {
        ClientConn::new(self.with_name(name), rebuild)
    }
}
