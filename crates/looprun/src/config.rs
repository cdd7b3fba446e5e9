//! Session configuration shared by everything a `BrokerExt` builds.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use looprpc::Router;
use tokio_util::sync::CancellationToken;

use crate::broker::DialOptions;

/// Builds the router every served endpoint starts from, e.g. to pre-register
/// a health service.
pub type ServerFactory = Arc<dyn Fn() -> Router + Send + Sync>;

/// Exponential backoff between rebuild attempts. Attempts are unlimited;
/// only the caller's context ends a rebuild loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    pub max_backoff: Duration,

    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.initial_backoff.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        if !nanos.is_finite() || nanos >= self.max_backoff.as_nanos() as f64 {
            return self.max_backoff;
        }
        Duration::from_nanos(nanos.round().max(0.0) as u64)
    }
}

/// Read-only settings of one broker session.
#[derive(Clone, Default)]
pub struct BrokerConfig {
    /// Fires when the whole session is going away; served endpoints stop on it.
    pub shutdown: CancellationToken,
    pub dial_options: DialOptions,
    pub server_factory: Option<ServerFactory>,
    pub retry: RetryPolicy,
}

impl BrokerConfig {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            ..Self::default()
        }
    }

    pub fn with_dial_options(mut self, dial_options: DialOptions) -> Self {
        self.dial_options = dial_options;
        self
    }

    pub fn with_server_factory(mut self, factory: impl Fn() -> Router + Send + Sync + 'static) -> Self {
        self.server_factory = Some(Arc::new(factory));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// A router from the server factory, or an empty one.
    pub fn new_router(&self) -> Router {
        self.server_factory
            .as_ref()
            .map(|factory| factory())
            .unwrap_or_default()
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("shutdown", &self.shutdown.is_cancelled())
            .field("dial_options", &self.dial_options)
            .field("server_factory", &self.server_factory.is_some())
            .field("retry", &self.retry)
            .finish()
    }
}
