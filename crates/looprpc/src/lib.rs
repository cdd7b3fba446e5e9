//! # looprpc
//!
//! The RPC substrate of the plugin session layer: protobuf frames, byte
//! transports, the client `Peer`, and the server-side `Service` / `Server`
//! pair. Everything here is about one logical connection at a time; the
//! session layer on top decides which connections exist and when they are
//! replaced.

pub mod client;
pub mod context;
pub mod frame;
pub mod mem_transport;
pub mod metadata;
pub mod peer;
pub mod server;
pub mod service;
pub mod status;
pub mod stream_transport;
pub mod transport;

pub use client::Invoker;
pub use client::Streaming;
pub use context::Context;
pub use context::ContextError;
pub use mem_transport::MemTransport;
pub use metadata::Metadata;
pub use peer::Peer;
pub use server::Listener;
pub use server::Server;
pub use service::Request;
pub use service::Router;
pub use service::Service;
pub use service::StreamSink;
pub use status::Code;
pub use status::Status;
pub use stream_transport::StreamTransport;
pub use transport::Transport;
