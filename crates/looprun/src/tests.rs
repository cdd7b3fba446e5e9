//! Tests for the self-healing client connection against a loopback broker.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use looprpc::Code;
use looprpc::Context;
use looprpc::Invoker;
use looprpc::Metadata;
use looprpc::Request;
use looprpc::Service;
use looprpc::Status;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use crate::broker::DialOptions;
use crate::broker::MemBroker;
use crate::client_conn::ClientConn;
use crate::config::BrokerConfig;
use crate::ext::BrokerExt;
use crate::resource::Resource;
use crate::resource::Resources;

struct EchoService {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Service for EchoService {
    async fn call(&self, _ctx: Context, request: Request) -> Result<Vec<u8>, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match request.method_name() {
            "Echo" => Ok(request.payload),
            "Fail" => Err(Status::internal("handler failed")),
            "Close" => Err(Status::unavailable("already closing")),
            other => Err(Status::unimplemented(format!("method {other} not implemented"))),
        }
    }
}

/// The plugin side of a connection: every rebuild serves a fresh endpoint.
#[derive(Default)]
struct Plugin {
    served: Mutex<Vec<Resource>>,
    calls: Arc<AtomicUsize>,
    deps_released: Arc<AtomicUsize>,
    down: AtomicBool,
    bogus_once: AtomicBool,
}

impl Plugin {
    fn latest(&self) -> Resource {
        self.served
            .lock()
            .expect("served lock")
            .last()
            .cloned()
            .expect("nothing served yet")
    }

    /// Stops the currently served endpoint, killing its connection.
    async fn kill(&self) {
        self.latest().release().await.expect("kill endpoint");
    }

    fn dependency(&self) -> Resource {
        let released = self.deps_released.clone();
        Resource::from_fn("dep", move || async move {
            released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    async fn start(&self, ext: &BrokerExt) -> anyhow::Result<(u32, Resources)> {
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("plugin is down");
        }
        if self.bogus_once.swap(false, Ordering::SeqCst) {
            return Ok((9999, vec![self.dependency()].into()));
        }
        let service = EchoService {
            calls: self.calls.clone(),
        };
        let (id, resource) = ext
            .serve("Echo", |router| { router.add_service("test.Echo", service); }, Resources::new())
            .await?;
        self.served.lock().expect("served lock").push(resource.clone());
        Ok((id, vec![resource, self.dependency()].into()))
    }
}

fn loopback() -> BrokerExt {
    let config = BrokerConfig::new(CancellationToken::new()).with_dial_options(DialOptions {
        timeout: Duration::from_millis(50),
    });
    BrokerExt::new(Arc::new(MemBroker::new()), config)
}

fn connect(ext: &BrokerExt) -> (Arc<ClientConn>, Arc<Plugin>) {
    let plugin = Arc::new(Plugin::default());
    let conn = {
        let ext = ext.clone();
        let plugin = plugin.clone();
        ext.clone().new_client_conn("Echo", move |_ctx| {
            let ext = ext.clone();
            let plugin = plugin.clone();
            async move { plugin.start(&ext).await }
        })
    };
    (Arc::new(conn), plugin)
}

async fn echo(conn: &ClientConn, ctx: &Context, payload: &[u8]) -> Result<Vec<u8>, Status> {
    conn.invoke(ctx, "/test.Echo/Echo", Metadata::new(), payload.to_vec())
        .await
}

// --- Classification ---

#[tokio::test]
async fn test_unimplemented_is_returned_without_rebuild() {
    let (conn, _plugin) = connect(&loopback());
    let err = conn
        .invoke(&Context::background(), "/test.Echo/Nope", Metadata::new(), Vec::new())
        .await
        .expect_err("unimplemented");
    assert_eq!(err.code(), Code::Unimplemented);
    assert_eq!(conn.rebuild_count(), 1);
}

#[tokio::test]
async fn test_done_context_is_never_charged_a_rebuild() {
    let (conn, plugin) = connect(&loopback());

    // before any connection exists
    let (cancelled, cancel) = Context::background().with_cancel();
    cancel.cancel();
    let err = echo(&conn, &cancelled, b"x").await.expect_err("cancelled");
    assert_eq!(err.code(), Code::Cancelled);
    assert_eq!(conn.rebuild_count(), 0);

    echo(&conn, &Context::background(), b"x").await.expect("connect");
    assert_eq!(conn.rebuild_count(), 1);

    let err = echo(&conn, &cancelled, b"x").await.expect_err("cancelled");
    assert_eq!(err.code(), Code::Cancelled);

    let expired = Context::background().with_deadline(tokio::time::Instant::now() - Duration::from_millis(1));
    let err = echo(&conn, &expired, b"x").await.expect_err("expired");
    assert_eq!(err.code(), Code::DeadlineExceeded);

    // also when the connection underneath is dead
    plugin.kill().await;
    let err = echo(&conn, &cancelled, b"x").await.expect_err("cancelled");
    assert_eq!(err.code(), Code::Cancelled);

    assert_eq!(conn.rebuild_count(), 1);
    assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_application_errors_do_not_rebuild() {
    let (conn, _plugin) = connect(&loopback());
    let err = conn
        .invoke(&Context::background(), "/test.Echo/Fail", Metadata::new(), Vec::new())
        .await
        .expect_err("handler error");
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(conn.rebuild_count(), 1);
}

#[tokio::test]
async fn test_close_method_failure_is_returned_as_is() {
    let (conn, plugin) = connect(&loopback());
    let ctx = Context::background();

    let err = conn
        .invoke(&ctx, "/test.Echo/Close", Metadata::new(), Vec::new())
        .await
        .expect_err("close fails");
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(conn.rebuild_count(), 1);

    // closing a dead connection does not bring it back
    plugin.kill().await;
    let err = conn
        .invoke(&ctx, "/test.Echo/Close", Metadata::new(), Vec::new())
        .await
        .expect_err("dead connection");
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(conn.rebuild_count(), 1);
}

// --- Healing ---

#[tokio::test]
async fn test_dead_connection_is_rebuilt_transparently() {
    let (conn, plugin) = connect(&loopback());
    let ctx = Context::background();

    assert_eq!(echo(&conn, &ctx, b"one").await.expect("first"), b"one");
    let first_id = conn.active_id().expect("connected");

    plugin.kill().await;
    assert_eq!(echo(&conn, &ctx, b"two").await.expect("healed"), b"two");

    assert_eq!(conn.rebuild_count(), 2);
    assert_ne!(conn.active_id(), Some(first_id));
    // the dead generation's dependencies went with it
    assert_eq!(plugin.deps_released.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_share_one_rebuild() {
    let (conn, plugin) = connect(&loopback());
    echo(&conn, &Context::background(), b"warm").await.expect("connect");
    plugin.kill().await;

    let mut handles = Vec::new();
    for i in 0..8u8 {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move {
            echo(&conn, &Context::background(), &[i]).await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let reply = handle.await.expect("task").expect("healed call");
        assert_eq!(reply, vec![i as u8]);
    }

    assert_eq!(conn.rebuild_count(), 2);
    assert_eq!(plugin.served.lock().expect("served lock").len(), 2);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_rebuild_backs_off_until_plugin_returns() {
    let (conn, plugin) = connect(&loopback());
    let ctx = Context::background();
    echo(&conn, &ctx, b"warm").await.expect("connect");

    plugin.down.store(true, Ordering::SeqCst);
    plugin.kill().await;
    let restore = {
        let plugin = plugin.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            plugin.down.store(false, Ordering::SeqCst);
        })
    };

    let start = tokio::time::Instant::now();
    assert_eq!(echo(&conn, &ctx, b"late").await.expect("healed"), b"late");
    restore.await.expect("restore");

    // failed at 0ms, 100ms and 300ms; succeeded at 700ms
    assert_eq!(conn.rebuild_count(), 1 + 4);
    assert!(start.elapsed() >= Duration::from_millis(700));
    assert!(logs_contain("failed to rebuild client connection"));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_ends_backoff() {
    let (conn, plugin) = connect(&loopback());
    plugin.down.store(true, Ordering::SeqCst);

    let ctx = Context::background().with_timeout(Duration::from_millis(250));
    let err = echo(&conn, &ctx, b"x").await.expect_err("deadline");
    assert_eq!(err.code(), Code::DeadlineExceeded);
    // attempts at 0ms and 100ms; the next one would be at 300ms
    assert_eq!(conn.rebuild_count(), 2);

    plugin.down.store(false, Ordering::SeqCst);
    echo(&conn, &Context::background(), b"x").await.expect("recovered");
    assert_eq!(conn.rebuild_count(), 3);
}

#[tokio::test]
async fn test_failed_dial_releases_rebuild_dependencies() {
    let (conn, plugin) = connect(&loopback());
    plugin.bogus_once.store(true, Ordering::SeqCst);

    assert_eq!(echo(&conn, &Context::background(), b"x").await.expect("second try"), b"x");
    assert_eq!(conn.rebuild_count(), 2);
    assert_eq!(plugin.deps_released.load(Ordering::SeqCst), 1);
}

// --- Close ---

#[tokio::test]
async fn test_close_is_terminal() {
    let (conn, plugin) = connect(&loopback());
    echo(&conn, &Context::background(), b"x").await.expect("connect");
    let served = plugin.latest();

    conn.close().await;
    assert!(conn.is_closed());
    assert!(served.is_released());
    assert_eq!(plugin.deps_released.load(Ordering::SeqCst), 1);

    let err = echo(&conn, &Context::background(), b"x").await.expect_err("closed");
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(conn.rebuild_count(), 1);
}
