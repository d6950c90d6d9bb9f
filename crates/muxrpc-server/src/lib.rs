//! muxrpc Server
//!
//! This crate provides the server half of muxrpc: a typed service registry
//! and a dispatch engine that serves many interleaved calls per connection.
//!
//! # Overview
//!
//! A service is an exported name plus a table of methods built from plain
//! closures over a receiver object. The server accepts connections,
//! performs the codec handshake, then pumps requests: every request is
//! handled on its own worker while the pump keeps reading, and responses
//! are serialized one at a time so frames never interleave on the wire.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use muxrpc_server::{Server, Service};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = Service::build("Arith", ())
//!         .method("Add", |_state: &(), args: (i64, i64), reply: &mut i64| {
//!             *reply = args.0 + args.1;
//!             Ok(())
//!         })
//!         .finish();
//!
//!     let server = Arc::new(Server::new());
//!     server.register(service)?;
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:9999").await?;
//!     server.accept(listener).await;
//!     Ok(())
//! }
//! ```

pub mod server;
pub mod service;

pub use server::Server;
pub use service::{MethodType, Service, ServiceBuilder};
