//! # looprun
//!
//! Session layer for out-of-process plugins. A host and its plugins share a
//! broker that turns endpoint ids into connections; on top of it this crate
//! serves endpoints, keeps client connections alive across plugin restarts,
//! tracks what has to be torn down with them, and routes calls for many
//! logical targets through one connection.
//!
//! ## Layers
//!
//! - `resource`: idempotent teardown handles.
//! - `broker`: id allocation plus accept/dial (in-memory, TCP side-channel,
//!   swappable).
//! - `ext`: `BrokerExt`, serving and dialing with session config.
//! - `client_conn`: the self-healing `ClientConn`.
//! - `multiplex`: tags, tagged clients, target registries and dispatchers.
//! - `health`: the `loop.Health` service.

pub mod broker;
pub mod client_conn;
pub mod config;
pub mod error;
pub mod ext;
pub mod health;
pub mod logging;
pub mod multiplex;
pub mod resource;

pub use broker::Broker;
pub use broker::DialOptions;
pub use broker::MemBroker;
pub use broker::NetBroker;
pub use broker::SwapBroker;
pub use client_conn::ClientConn;
pub use config::BrokerConfig;
pub use config::RetryPolicy;
pub use error::Error;
pub use ext::BrokerExt;
pub use multiplex::RelayTag;
pub use multiplex::ResourceId;
pub use multiplex::TaggedClient;
pub use resource::Resource;
pub use resource::Resources;

#[cfg(test)]
mod tests;
