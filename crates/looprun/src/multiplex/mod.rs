//! # Target Multiplexing
//!
//! Many logical targets share one connection. The client side attaches a tag
//! naming the target to every call's metadata; the server side reads it back
//! and hands the call to whatever is registered under that tag.
//!
//! Two kinds of tags exist:
//!
//! - `RelayTag`: a chain, named by `network` and `chain_id`.
//! - `ResourceId<K>`: a sub-resource created at runtime (a contract reader, a
//!   codec...), named by a random id under a key chosen by its kind.

use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::marker::PhantomData;
use std::sync::Arc;

use looprpc::Context;
use looprpc::Invoker;
use looprpc::Metadata;
use looprpc::Status;
use looprpc::Streaming;

pub mod registry;
pub mod sub_resource;

pub use registry::Dispatcher;
pub use registry::TargetRegistry;
pub use sub_resource::SubResource;
pub use sub_resource::SubResources;

pub const NETWORK_KEY: &str = "network";
pub const CHAIN_ID_KEY: &str = "chain_id";

/// A routing key carried in call metadata.
pub trait Tag: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {
    fn attach(&self, metadata: &mut Metadata);

    /// Reads the tag back. A missing key is `NotFound` naming that key.
    fn extract(metadata: &Metadata) -> Result<Self, Status>;
}

fn required<'a>(metadata: &'a Metadata, key: &str) -> Result<&'a str, Status> {
    metadata
        .get(key)
        .ok_or_else(|| Status::not_found(format!("missing {key} in call metadata")))
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RelayTag {
    pub network: String,
    pub chain_id: String,
}

impl RelayTag {
    pub fn new(network: impl Into<String>, chain_id: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            chain_id: chain_id.into(),
        }
    }
}

impl fmt::Display for RelayTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.chain_id)
    }
}

impl Tag for RelayTag {
    fn attach(&self, metadata: &mut Metadata) {
        metadata.insert(NETWORK_KEY, self.network.as_str());
        metadata.insert(CHAIN_ID_KEY, self.chain_id.as_str());
    }

    fn extract(metadata: &Metadata) -> Result<Self, Status> {
        Ok(Self::new(
            required(metadata, NETWORK_KEY)?,
            required(metadata, CHAIN_ID_KEY)?,
        ))
    }
}

/// A family of sub-resources sharing one metadata key.
pub trait ResourceKind: Send + Sync + 'static {
    /// Metadata key the id travels under.
    const KEY: &'static str;
    /// Human-readable name for errors and logs.
    const NAME: &'static str;
}

pub struct ContractReader;

impl ResourceKind for ContractReader {
    const KEY: &'static str = "contractReaderID";
    const NAME: &'static str = "contract reader";
}

pub struct Codec;

impl ResourceKind for Codec {
    const KEY: &'static str = "codecID";
    const NAME: &'static str = "codec";
}

/// Random id of a sub-resource of kind `K`.
pub struct ResourceId<K> {
    id: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ResourceKind> ResourceId<K> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            _kind: PhantomData,
        }
    }

    /// A fresh random id.
    pub fn generate() -> Self {
        Self::new(format!("{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl<K> Clone for ResourceId<K> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> PartialEq for ResourceId<K> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<K> Eq for ResourceId<K> {}

impl<K> Hash for ResourceId<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<K: ResourceKind> fmt::Debug for ResourceId<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", K::KEY, self.id)
    }
}

impl<K: ResourceKind> fmt::Display for ResourceId<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl<K: ResourceKind> Tag for ResourceId<K> {
    fn attach(&self, metadata: &mut Metadata) {
        metadata.insert(K::KEY, self.id.as_str());
    }

    fn extract(metadata: &Metadata) -> Result<Self, Status> {
        required(metadata, K::KEY).map(Self::new)
    }
}

/// Client for one target behind a shared connection.
pub struct TaggedClient<T, I: ?Sized> {
    tag: T,
    inner: Arc<I>,
}

impl<T: Tag, I: Invoker + ?Sized> TaggedClient<T, I> {
    pub fn new(tag: T, inner: Arc<I>) -> Self {
        Self { tag, inner }
    }

    pub fn tag(&self) -> &T {
        &self.tag
    }

    pub fn inner(&self) -> &Arc<I> {
        &self.inner
    }
}

impl<T: Clone, I: ?Sized> Clone for TaggedClient<T, I> {
    fn clone(&self) -> Self {
        Self {
            tag: self.tag.clone(),
            inner: self.inner.clone(),
        }
    }
}

#[async_trait::async_trait]
impl<T: Tag, I: Invoker + ?Sized> Invoker for TaggedClient<T, I> {
    async fn invoke(
        &self,
        ctx: &Context,
        method: &str,
        mut metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Status> {
        self.tag.attach(&mut metadata);
        self.inner.invoke(ctx, method, metadata, payload).await
    }

    async fn open_stream(
        &self,
        ctx: &Context,
        method: &str,
        mut metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Streaming, Status> {
        self.tag.attach(&mut metadata);
        self.inner.open_stream(ctx, method, metadata, payload).await
    }
}

#[cfg(test)]
mod tests {
    use looprpc::Code;

    use super::*;

    #[test]
    fn test_relay_tag_travels_in_metadata() {
        let tag = RelayTag::new("evm", "1");
        let mut metadata = Metadata::new();
        tag.attach(&mut metadata);
        assert_eq!(metadata.get("network"), Some("evm"));
        assert_eq!(metadata.get("chain_id"), Some("1"));
        assert_eq!(RelayTag::extract(&metadata).expect("extract"), tag);
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let mut metadata = Metadata::new();
        metadata.insert(NETWORK_KEY, "evm");
        let err = RelayTag::extract(&metadata).expect_err("no chain id");
        assert_eq!(err.code(), Code::NotFound);
        assert!(err.message().contains("chain_id"));
    }

    #[test]
    fn test_resource_id_uses_kind_key() {
        let id = ResourceId::<ContractReader>::generate();
        let mut metadata = Metadata::new();
        id.attach(&mut metadata);
        assert_eq!(metadata.get("contractReaderID"), Some(id.as_str()));
        assert_eq!(ResourceId::<ContractReader>::extract(&metadata).expect("extract"), id);

        let err = ResourceId::<Codec>::extract(&metadata).expect_err("other kind");
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn test_generated_ids_differ() {
        let a = ResourceId::<ContractReader>::generate();
        let b = ResourceId::<ContractReader>::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }
}
