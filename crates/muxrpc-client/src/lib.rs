//! muxrpc Client
//!
//! This crate provides the client half of muxrpc:
//!
//! - **[`client`]** - a multiplexing connection client: many outstanding
//!   calls share one connection, completions are routed back by sequence
//!   number, and calls can be issued asynchronously ([`Client::go`]) or
//!   synchronously ([`Client::call`])
//! - **[`discovery`]** - endpoint discovery: a static multi-server list
//!   and a registry-backed variant that refreshes itself on a TTL
//! - **[`xclient`]** - the cluster client: cached connections per
//!   endpoint, load-balanced unicast calls and fail-fast broadcast
//!
//! # Example
//!
//! ```no_run
//! use muxrpc_client::Client;
//! use muxrpc_common::Options;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::dial("127.0.0.1:9999", Options::default()).await?;
//!     let reply: i64 = client.call("Arith.Add", &(1i64, 2i64)).await?;
//!     assert_eq!(reply, 3);
//!     Ok(())
//! }
//! ```
//!
//! Calls are cancellation-safe: dropping an in-flight call (for example
//! through `tokio::time::timeout`) deregisters it, and a late response is
//! discarded by the receive loop. Cancellation is a local affordance only;
//! the server-side invocation is not interrupted.

pub mod client;
pub mod discovery;
pub mod xclient;

pub use client::{Call, CallHandle, Client};
pub use discovery::{Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode};
pub use xclient::XClient;
