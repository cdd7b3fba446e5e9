//! End-to-end sessions between a host and an in-process plugin.
//!
//! The plugin keeps its relayers and contract readers across restarts of its
//! endpoint, the way a plugin process outlives a single connection; the host
//! reaches all of them through one self-healing connection.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use looprpc::Code;
use looprpc::Context;
use looprpc::Invoker;
use looprpc::Metadata;
use looprpc::Request;
use looprpc::Service;
use looprpc::Status;
use looprun::BrokerConfig;
use looprun::BrokerExt;
use looprun::ClientConn;
use looprun::DialOptions;
use looprun::MemBroker;
use looprun::RelayTag;
use looprun::Resource;
use looprun::ResourceId;
use looprun::Resources;
use looprun::SwapBroker;
use looprun::TaggedClient;
use looprun::multiplex::ContractReader;
use looprun::multiplex::Dispatcher;
use looprun::multiplex::SubResources;
use looprun::multiplex::TargetRegistry;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

type Readers = SubResources<ContractReader, Reader>;

struct Reader {
    chain: String,
}

struct ReaderService(Arc<Reader>);

#[async_trait::async_trait]
impl Service for ReaderService {
    async fn call(&self, _ctx: Context, request: Request) -> Result<Vec<u8>, Status> {
        match request.method_name() {
            "GetLatestValue" => Ok(format!("value from {}", self.0.chain).into_bytes()),
            "Close" => Ok(Vec::new()),
            other => Err(Status::unimplemented(format!("contract reader has no {other}"))),
        }
    }
}

/// Makes the next `Name` call hang until its context ends.
#[derive(Default)]
struct Stall {
    armed: AtomicBool,
    reached: Notify,
}

struct Relayer {
    chain: String,
    readers: Arc<Readers>,
    stall: Arc<Stall>,
}

#[async_trait::async_trait]
impl Service for Relayer {
    async fn call(&self, ctx: Context, request: Request) -> Result<Vec<u8>, Status> {
        match request.method_name() {
            "Name" if self.stall.armed.swap(false, Ordering::SeqCst) => {
                self.stall.reached.notify_one();
                Err(ctx.done().await.into())
            }
            "Name" => Ok(format!("relayer {}", self.chain).into_bytes()),
            "NewContractReader" => {
                let reader = Arc::new(Reader {
                    chain: self.chain.clone(),
                });
                let id = self
                    .readers
                    .register(Arc::new(ReaderService(reader.clone())), reader);
                Ok(id.as_str().as_bytes().to_vec())
            }
            other => Err(Status::unimplemented(format!("relayer has no {other}"))),
        }
    }
}

/// Plugin side: relayers by chain, contract readers by id, and the endpoints
/// it has served so far.
struct Plugin {
    ext: BrokerExt,
    relayers: Arc<TargetRegistry<RelayTag, Arc<dyn Service>>>,
    readers: Arc<Readers>,
    stall: Arc<Stall>,
    endpoints: Mutex<Vec<Resource>>,
}

impl Plugin {
    fn new(ext: BrokerExt) -> Arc<Self> {
        Arc::new(Self {
            ext,
            relayers: Arc::new(TargetRegistry::new("relayer")),
            readers: Arc::new(SubResources::new()),
            stall: Arc::new(Stall::default()),
            endpoints: Mutex::new(Vec::new()),
        })
    }

    fn add_relayer(&self, tag: &RelayTag) {
        let relayer = Relayer {
            chain: tag.chain_id.clone(),
            readers: self.readers.clone(),
            stall: self.stall.clone(),
        };
        self.relayers.insert(tag.clone(), Arc::new(relayer));
    }

    async fn start(&self) -> anyhow::Result<(u32, Resources)> {
        let dispatcher = Dispatcher::new(self.relayers.clone());
        let readers = self.readers.clone();
        let (id, endpoint) = self
            .ext
            .serve(
                "Relayer",
                |router| {
                    router.add_service("loop.Relayer", dispatcher);
                    router.add_service("loop.ContractReader", readers);
                },
                Resources::new(),
            )
            .await?;
        self.endpoints.lock().expect("endpoints lock").push(endpoint.clone());
        Ok((id, vec![endpoint].into()))
    }

    async fn kill(&self) {
        let latest = self
            .endpoints
            .lock()
            .expect("endpoints lock")
            .last()
            .cloned()
            .expect("plugin was started");
        latest.release().await.expect("stop endpoint");
    }
}

fn config() -> BrokerConfig {
    BrokerConfig::new(CancellationToken::new()).with_dial_options(DialOptions {
        timeout: Duration::from_millis(200),
    })
}

/// A host connected to a fresh plugin through a linked broker pair.
fn session() -> (Arc<ClientConn>, Arc<Plugin>) {
    let (host_broker, plugin_broker) = MemBroker::pair();
    let plugin = Plugin::new(BrokerExt::new(Arc::new(plugin_broker), config()));
    let host = BrokerExt::new(Arc::new(host_broker), config());

    let conn = {
        let plugin = plugin.clone();
        host.new_client_conn("Relayer", move |_ctx| {
            let plugin = plugin.clone();
            async move { plugin.start().await }
        })
    };
    (Arc::new(conn), plugin)
}

async fn text(client: &impl Invoker, ctx: &Context, method: &str) -> Result<String, Status> {
    let reply = client.invoke(ctx, method, Metadata::new(), Vec::new()).await?;
    Ok(String::from_utf8(reply).expect("utf-8 reply"))
}

// --- Scenarios A, B, C ---

#[tokio::test]
async fn test_unimplemented_then_done_contexts() {
    let (conn, plugin) = session();
    let tag = RelayTag::new("N1", "C1");
    plugin.add_relayer(&tag);
    let relayer = TaggedClient::new(tag, conn.clone());

    let err = text(&relayer, &Context::background(), "/loop.Relayer/Transmit")
        .await
        .expect_err("not implemented");
    assert_eq!(err.code(), Code::Unimplemented);
    assert_eq!(conn.rebuild_count(), 1);

    let (cancelled, cancel) = Context::background().with_cancel();
    cancel.cancel();
    let err = text(&relayer, &cancelled, "/loop.Relayer/Name")
        .await
        .expect_err("cancelled");
    assert_eq!(err.code(), Code::Cancelled);
    assert_eq!(conn.rebuild_count(), 1);

    let expired = Context::background().with_deadline(tokio::time::Instant::now() - Duration::from_millis(1));
    let err = text(&relayer, &expired, "/loop.Relayer/Name")
        .await
        .expect_err("expired");
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert_eq!(conn.rebuild_count(), 1);
}

// --- Scenario D and dispatch ---

#[tokio::test]
async fn test_targets_share_one_connection() {
    let (conn, plugin) = session();
    let first = RelayTag::new("N1", "C1");
    let second = RelayTag::new("N2", "C2");
    plugin.add_relayer(&first);
    plugin.add_relayer(&second);

    let ctx = Context::background();
    let one = TaggedClient::new(first, conn.clone());
    let two = TaggedClient::new(second, conn.clone());
    assert_eq!(text(&one, &ctx, "/loop.Relayer/Name").await.expect("C1"), "relayer C1");
    assert_eq!(text(&two, &ctx, "/loop.Relayer/Name").await.expect("C2"), "relayer C2");

    let stranger = TaggedClient::new(RelayTag::new("N3", "C3"), conn.clone());
    let err = text(&stranger, &ctx, "/loop.Relayer/Name")
        .await
        .expect_err("unregistered tag");
    assert_eq!(err.code(), Code::NotFound);

    let err = text(conn.as_ref(), &ctx, "/loop.Relayer/Name")
        .await
        .expect_err("untagged call");
    assert_eq!(err.code(), Code::NotFound);

    // one connection, never rebuilt
    assert_eq!(conn.rebuild_count(), 1);
}

#[tokio::test]
async fn test_closed_sub_resource_is_not_found() {
    let (conn, plugin) = session();
    let tag = RelayTag::new("N1", "C1");
    plugin.add_relayer(&tag);
    let relayer = TaggedClient::new(tag, conn.clone());
    let ctx = Context::background();

    let id = text(&relayer, &ctx, "/loop.Relayer/NewContractReader")
        .await
        .expect("new reader");
    let reader = TaggedClient::new(ResourceId::<ContractReader>::new(id), conn.clone());

    assert_eq!(
        text(&reader, &ctx, "/loop.ContractReader/GetLatestValue").await.expect("read"),
        "value from C1"
    );
    text(&reader, &ctx, "/loop.ContractReader/Close").await.expect("close");
    assert!(plugin.readers.is_empty());

    let err = text(&reader, &ctx, "/loop.ContractReader/GetLatestValue")
        .await
        .expect_err("closed reader");
    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(conn.rebuild_count(), 1);
}

// --- Scenario E ---

#[tokio::test]
async fn test_killed_transport_heals_under_tagged_calls() {
    let (conn, plugin) = session();
    let tag = RelayTag::new("N1", "C1");
    plugin.add_relayer(&tag);
    let relayer = TaggedClient::new(tag, conn.clone());
    let ctx = Context::background();

    assert_eq!(text(&relayer, &ctx, "/loop.Relayer/Name").await.expect("before"), "relayer C1");

    plugin.kill().await;
    assert_eq!(text(&relayer, &ctx, "/loop.Relayer/Name").await.expect("after"), "relayer C1");
    assert_eq!(conn.rebuild_count(), 2);
    assert_eq!(plugin.endpoints.lock().expect("endpoints lock").len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_endpoint_killed_mid_call_heals() {
    let (conn, plugin) = session();
    let tag = RelayTag::new("N1", "C1");
    plugin.add_relayer(&tag);
    let relayer = Arc::new(TaggedClient::new(tag, conn.clone()));
    text(relayer.as_ref(), &Context::background(), "/loop.Relayer/Name")
        .await
        .expect("connect");

    for round in 0..20 {
        plugin.stall.armed.store(true, Ordering::SeqCst);
        let call = {
            let relayer = relayer.clone();
            tokio::spawn(async move {
                text(relayer.as_ref(), &Context::background(), "/loop.Relayer/Name").await
            })
        };
        plugin.stall.reached.notified().await;
        plugin.kill().await;

        let reply = call.await.expect("task").expect("healed call");
        assert_eq!(reply, "relayer C1");
        assert_eq!(conn.rebuild_count(), 2 + round);
    }
}

#[tokio::test]
async fn test_rebuild_follows_swapped_broker() {
    let (host_a, plugin_a) = MemBroker::pair();
    let host_broker = Arc::new(SwapBroker::new(Arc::new(host_a)));
    let plugin_broker = Arc::new(SwapBroker::new(Arc::new(plugin_a)));

    let plugin = Plugin::new(BrokerExt::new(plugin_broker.clone(), config()));
    let tag = RelayTag::new("N1", "C1");
    plugin.add_relayer(&tag);
    let host = BrokerExt::new(host_broker.clone(), config());
    let conn = {
        let plugin = plugin.clone();
        Arc::new(host.new_client_conn("Relayer", move |_ctx| {
            let plugin = plugin.clone();
            async move { plugin.start().await }
        }))
    };
    let relayer = TaggedClient::new(tag, conn.clone());
    let ctx = Context::background();

    text(&relayer, &ctx, "/loop.Relayer/Name").await.expect("first broker");
    text(&relayer, &ctx, "/loop.Relayer/Name").await.expect("still first broker");
    assert_eq!(conn.active_id(), Some(1));

    // a restarted plugin comes back on a new broker pair
    let (host_b, plugin_b) = MemBroker::pair();
    host_broker.store(Arc::new(host_b));
    plugin_broker.store(Arc::new(plugin_b));
    plugin.kill().await;

    text(&relayer, &ctx, "/loop.Relayer/Name").await.expect("second broker");
    // ids restart on the new pair; the old pair would have handed out 2
    assert_eq!(conn.active_id(), Some(1));
    assert_eq!(conn.rebuild_count(), 2);
}
