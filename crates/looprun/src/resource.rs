//! # Resources
//!
//! A `Resource` is a named handle for something that must be torn down: a
//! served endpoint, a dialed connection, a sub-service. Handles are cheap to
//! clone and every clone refers to the same teardown.
//!
//! ## Invariants
//!
//! - Teardown runs at most once. Concurrent and repeated `release` calls wait
//!   for that single run and then succeed; only the first caller sees its error.
//! - `Resources::release_all` attempts every member in order and never stops
//!   at the first failure.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context as _;
use tokio::sync::OnceCell;

use crate::error::Error;

/// Teardown action behind a `Resource`.
#[async_trait::async_trait]
pub trait Closer: Send + Sync + 'static {
    async fn close(&self) -> anyhow::Result<()>;
}

/// Adapts a one-shot async closure into a `Closer`.
struct FnCloser<F> {
    f: Mutex<Option<F>>,
}

#[async_trait::async_trait]
impl<F, Fut> Closer for FnCloser<F>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn close(&self) -> anyhow::Result<()> {
        let f = {
            let mut slot = self.f.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.take()
        };
        match f {
            Some(f) => f().await,
            None => Ok(()),
        }
    }
}

struct Inner {
    name: String,
    closer: Box<dyn Closer>,
    released: OnceCell<()>,
}

#[derive(Clone)]
pub struct Resource {
    inner: Arc<Inner>,
}

impl Resource {
    pub fn new(name: impl Into<String>, closer: impl Closer) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                closer: Box::new(closer),
                released: OnceCell::new(),
            }),
        }
    }

    /// A resource whose teardown is the given async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(name, FnCloser { f: Mutex::new(Some(f)) })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.initialized()
    }

    /// Runs the teardown once. Later calls return `Ok(())` without running it again.
    pub async fn release(&self) -> anyhow::Result<()> {
        let mut outcome = Ok(());
        let slot = &mut outcome;
        let closer = &self.inner.closer;
        self.inner
            .released
            .get_or_init(|| async move {
                *slot = closer.close().await;
            })
            .await;
        outcome.with_context(|| format!("release {}", self.inner.name))
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.inner.name)
            .field("released", &self.is_released())
            .finish()
    }
}

/// An ordered set of resources released together.
#[derive(Clone, Debug, Default)]
pub struct Resources(Vec<Resource>);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: Resource) {
        self.0.push(resource);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.0.iter()
    }

    /// Releases every member in order, collecting all failures.
    pub async fn release_all(&self) -> Result<(), Error> {
        let mut errors = Vec::new();
        for resource in &self.0 {
            if let Err(e) = resource.release().await {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Release(errors))
        }
    }
}

impl From<Vec<Resource>> for Resources {
    fn from(resources: Vec<Resource>) -> Self {
        Self(resources)
    }
}

impl FromIterator<Resource> for Resources {
    fn from_iter<I: IntoIterator<Item = Resource>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Resource> for Resources {
    fn extend<I: IntoIterator<Item = Resource>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for Resources {
    type Item = Resource;
    type IntoIter = std::vec::IntoIter<Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Resources {
    type Item = &'a Resource;
    type IntoIter = std::slice::Iter<'a, Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
