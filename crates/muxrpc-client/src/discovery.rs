//! Endpoint discovery: a static multi-server list with pluggable
//! selection, and a registry-backed variant that refreshes itself on a
//! TTL.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use muxrpc_common::addr::SERVERS_HEADER;
use muxrpc_common::error::{Result, RpcError};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::debug;

/// How an endpoint is picked out of the discovered list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniformly at random.
    Random,
    /// `servers[i % n]`, advancing a cursor seeded randomly so replicas
    /// starting together do not pile onto the same endpoint.
    RoundRobin,
}

/// Source of candidate server endpoints.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Pulls a fresh list from upstream, when there is one.
    async fn refresh(&self) -> Result<()>;
    /// Replaces the list locally.
    async fn update(&self, servers: Vec<String>) -> Result<()>;
    /// Picks one endpoint according to the selection mode.
    async fn get(&self, mode: SelectMode) -> Result<String>;
    /// Returns a snapshot of all endpoints, independent of later updates.
    async fn get_all(&self) -> Result<Vec<String>>;
}

struct ListState {
    servers: Vec<String>,
    index: usize,
}

/// Discovery over a fixed, manually updated server list.
pub struct MultiServersDiscovery {
    state: RwLock<ListState>,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        // decorrelate the round-robin start across replicas
        let index = rand::thread_rng().gen_range(0..i32::MAX as usize);
        Self {
            state: RwLock::new(ListState { servers, index }),
        }
    }
}

#[async_trait]
impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.state.write().servers = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        let mut state = self.state.write();
        let n = state.servers.len();
        if n == 0 {
            return Err(RpcError::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => Ok(state.servers[rand::thread_rng().gen_range(0..n)].clone()),
            SelectMode::RoundRobin => {
                let server = state.servers[state.index % n].clone();
                state.index = (state.index + 1) % n;
                Ok(server)
            }
        }
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.state.read().servers.clone())
    }
}

/// Refresh interval applied when none is configured.
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(1);

/// Discovery backed by a registry: the server list is pulled from the
/// registry's HTTP surface and cached for a TTL. Every `get`/`get_all`
/// refreshes first, which is a no-op while the cache is fresh.
pub struct RegistryDiscovery {
    inner: MultiServersDiscovery,
    registry: String,
    ttl: Duration,
    last_update: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// `ttl` is how long a pulled list stays valid; zero selects the
    /// default.
    pub fn new(registry: impl Into<String>, ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_REFRESH_TTL } else { ttl };
        Self {
            inner: MultiServersDiscovery::new(Vec::new()),
            registry: registry.into(),
            ttl,
            last_update: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        {
            let last_update = self.last_update.lock();
            if let Some(at) = *last_update {
                if at.elapsed() < self.ttl {
                    return Ok(());
                }
            }
        }
        debug!(registry = %self.registry, "rpc discovery: refreshing server list");
        let response = self
            .http
            .get(&self.registry)
            .send()
            .await
            .map_err(|e| RpcError::Registry(e.to_string()))?;
        let servers = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(String::from)
            .collect();
        self.inner.update(servers).await?;
        *self.last_update.lock() = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.inner.update(servers).await?;
        *self.last_update.lock() = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.inner.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        self.inner.get_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers() -> Vec<String> {
        vec!["x:1".to_string(), "y:2".to_string(), "z:3".to_string()]
    }

    #[tokio::test]
    async fn test_empty_list_errors() {
        let discovery = MultiServersDiscovery::new(Vec::new());
        for mode in [SelectMode::Random, SelectMode::RoundRobin] {
            assert!(matches!(
                discovery.get(mode).await,
                Err(RpcError::NoAvailableServers)
            ));
        }
    }

    #[tokio::test]
    async fn test_round_robin_cycles_from_random_start() {
        let discovery = MultiServersDiscovery::new(servers());
        let all = servers();
        let first = discovery.get(SelectMode::RoundRobin).await.unwrap();
        let start = all.iter().position(|s| *s == first).unwrap();
        for i in 1..=6 {
            let picked = discovery.get(SelectMode::RoundRobin).await.unwrap();
            assert_eq!(picked, all[(start + i) % all.len()]);
        }
    }

    #[tokio::test]
    async fn test_random_select_stays_in_list() {
        let discovery = MultiServersDiscovery::new(servers());
        for _ in 0..50 {
            let picked = discovery.get(SelectMode::Random).await.unwrap();
            assert!(servers().contains(&picked));
        }
    }

    #[tokio::test]
    async fn test_get_all_returns_snapshot() {
        let discovery = MultiServersDiscovery::new(servers());
        let snapshot = discovery.get_all().await.unwrap();
        discovery
            .update(vec!["replaced:1".to_string()])
            .await
            .unwrap();
        assert_eq!(snapshot, servers());
        assert_eq!(
            discovery.get_all().await.unwrap(),
            vec!["replaced:1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_update_replaces_list() {
        let discovery = MultiServersDiscovery::new(Vec::new());
        discovery.update(servers()).await.unwrap();
        assert_eq!(discovery.get_all().await.unwrap(), servers());
    }

    #[tokio::test]
    async fn test_registry_discovery_unreachable_registry_errors() {
        // nothing listens on this port; refresh must surface the failure
        // and leave the (empty) list untouched
        let discovery = RegistryDiscovery::new("http://127.0.0.1:1/registry", Duration::ZERO);
        assert_eq!(discovery.ttl, DEFAULT_REFRESH_TTL);
        assert!(matches!(
            discovery.get_all().await,
            Err(RpcError::Registry(_))
        ));
        assert!(discovery.inner.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registry_discovery_manual_update_stamps_cache() {
        let discovery = RegistryDiscovery::new("http://127.0.0.1:1/registry", Duration::from_secs(60));
        discovery.update(servers()).await.unwrap();
        // fresh cache: get_all must not hit the unreachable registry
        assert_eq!(discovery.get_all().await.unwrap(), servers());
    }
}
