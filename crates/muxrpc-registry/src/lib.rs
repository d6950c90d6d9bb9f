//! muxrpc Registry
//!
//! An in-memory endpoint registry with heartbeat-driven liveness. Servers
//! `POST` their address periodically; clients `GET` the list of endpoints
//! whose heartbeat is still within the TTL. Addresses travel in the
//! `X-Gorpc-Servers` header in both directions.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use muxrpc_registry::{heartbeat, Registry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(Registry::default());
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:9091").await?;
//!     tokio::spawn(Arc::clone(&registry).serve(listener));
//!
//!     // a server keeps itself alive from its own process
//!     let _beat = heartbeat(
//!         "http://127.0.0.1:9091/_gorpc_/registry",
//!         "tcp@127.0.0.1:9999",
//!         Duration::ZERO,
//!     );
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use muxrpc_common::addr::SERVERS_HEADER;
use muxrpc_common::error::{Result, RpcError};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Path the registry surface is mounted on by [`Registry::serve`].
pub const DEFAULT_REGISTRY_PATH: &str = "/_gorpc_/registry";
/// How long an endpoint stays alive without a heartbeat.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
/// Heartbeat period applied when none is configured; safely below the
/// default TTL so one missed beat does not evict the endpoint.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// The endpoint table: address to last-heartbeat time.
pub struct Registry {
    ttl: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl Registry {
    /// A TTL of zero means endpoints never expire.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Adds an endpoint or refreshes its heartbeat time. Idempotent on the
    /// address.
    pub fn put_server(&self, addr: &str) {
        self.servers.lock().insert(addr.to_string(), Instant::now());
    }

    /// Returns the alive endpoints in sorted order, evicting any whose
    /// heartbeat has aged out.
    pub fn alive_servers(&self) -> Vec<String> {
        let ttl = self.ttl;
        let mut servers = self.servers.lock();
        servers.retain(|_, heartbeat| ttl.is_zero() || heartbeat.elapsed() <= ttl);
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// The HTTP surface as an axum router mounted at `path`. `GET` lists
    /// alive endpoints in the response header, `POST` registers the one in
    /// the request header, anything else is 405.
    pub fn router(self: &Arc<Self>, path: &str) -> Router {
        Router::new()
            .route(path, get(list_servers).post(register_server))
            .with_state(Arc::clone(self))
    }

    /// Serves the registry at [`DEFAULT_REGISTRY_PATH`] until the listener
    /// fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, path = DEFAULT_REGISTRY_PATH, "rpc registry: serving");
        }
        let app = self.router(DEFAULT_REGISTRY_PATH);
        axum::serve(listener, app)
            .await
            .map_err(|e| RpcError::Registry(e.to_string()))
    }
}

async fn list_servers(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let servers = registry.alive_servers().join(",");
    (StatusCode::OK, [(SERVERS_HEADER, servers)])
}

async fn register_server(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
) -> StatusCode {
    let addr = headers
        .get(SERVERS_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|addr| !addr.is_empty());
    match addr {
        Some(addr) => {
            registry.put_server(addr);
            StatusCode::OK
        }
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Keeps an endpoint alive in a registry: posts one heartbeat immediately,
/// then on every tick. A zero period selects the default. Send failures
/// are logged and never stop the ticker.
pub fn heartbeat(
    registry: impl Into<String>,
    addr: impl Into<String>,
    period: Duration,
) -> JoinHandle<()> {
    let registry = registry.into();
    let addr = addr.into();
    let period = if period.is_zero() {
        DEFAULT_HEARTBEAT_PERIOD
    } else {
        period
    };
    tokio::spawn(async move {
        let http = reqwest::Client::new();
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            send_heartbeat(&http, &registry, &addr).await;
        }
    })
}

async fn send_heartbeat(http: &reqwest::Client, registry: &str, addr: &str) {
    debug!(%addr, %registry, "rpc registry: sending heartbeat");
    if let Err(e) = http
        .post(registry)
        .header(SERVERS_HEADER, addr)
        .send()
        .await
    {
        warn!("rpc registry: heartbeat to {registry} failed: {e}");
    }
}
