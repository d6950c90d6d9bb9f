//! Tests driving the registry's HTTP surface with a real listener, plus
//! the heartbeat helper and registry-backed discovery on top of it.

use std::sync::Arc;
use std::time::Duration;

use muxrpc_client::{Discovery, RegistryDiscovery, SelectMode};
use muxrpc_common::addr::SERVERS_HEADER;
use muxrpc_registry::{heartbeat, Registry, DEFAULT_REGISTRY_PATH};

async fn start_registry(ttl: Duration) -> (Arc<Registry>, String) {
    let registry = Arc::new(Registry::new(ttl));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&registry).serve(listener));
    (registry, format!("http://{addr}{DEFAULT_REGISTRY_PATH}"))
}

async fn fetch_servers(url: &str) -> Vec<String> {
    let response = reqwest::get(url).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    response
        .headers()
        .get(SERVERS_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .split(',')
        .filter(|server| !server.is_empty())
        .map(String::from)
        .collect()
}

async fn post_server(http: &reqwest::Client, url: &str, addr: &str) -> reqwest::StatusCode {
    http.post(url)
        .header(SERVERS_HEADER, addr)
        .send()
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn test_register_and_query() {
    let (_, url) = start_registry(Duration::from_secs(60)).await;
    let http = reqwest::Client::new();

    assert!(fetch_servers(&url).await.is_empty());
    assert_eq!(
        post_server(&http, &url, "tcp@b:2").await,
        reqwest::StatusCode::OK
    );
    assert_eq!(
        post_server(&http, &url, "tcp@a:1").await,
        reqwest::StatusCode::OK
    );
    assert_eq!(
        fetch_servers(&url).await,
        vec!["tcp@a:1".to_string(), "tcp@b:2".to_string()]
    );
}

#[tokio::test]
async fn test_post_without_address_header_is_rejected() {
    let (_, url) = start_registry(Duration::from_secs(60)).await;
    let status = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_other_methods_are_not_allowed() {
    let (_, url) = start_registry(Duration::from_secs(60)).await;
    let status = reqwest::Client::new()
        .delete(&url)
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_entry_expires_without_heartbeats() {
    let (_, url) = start_registry(Duration::from_millis(200)).await;
    let http = reqwest::Client::new();

    post_server(&http, &url, "tcp@a:1").await;
    assert_eq!(fetch_servers(&url).await, vec!["tcp@a:1".to_string()]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fetch_servers(&url).await.is_empty());

    // a fresh heartbeat re-adds the endpoint
    post_server(&http, &url, "tcp@a:1").await;
    assert_eq!(fetch_servers(&url).await, vec!["tcp@a:1".to_string()]);
}

#[tokio::test]
async fn test_heartbeat_task_keeps_entry_alive() {
    let (_, url) = start_registry(Duration::from_millis(500)).await;

    let beat = heartbeat(url.clone(), "tcp@a:1", Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(fetch_servers(&url).await, vec!["tcp@a:1".to_string()]);

    // once the heartbeat stops, the entry ages out
    beat.abort();
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(fetch_servers(&url).await.is_empty());
}

#[tokio::test]
async fn test_registry_backed_discovery_refreshes_on_ttl() {
    let (registry, url) = start_registry(Duration::from_secs(60)).await;
    registry.put_server("tcp@b:2");
    registry.put_server("tcp@a:1");

    let discovery = RegistryDiscovery::new(url, Duration::from_millis(150));
    assert_eq!(
        discovery.get_all().await.unwrap(),
        vec!["tcp@a:1".to_string(), "tcp@b:2".to_string()]
    );

    // inside the TTL window the cached list is served
    registry.put_server("tcp@c:3");
    assert_eq!(discovery.get_all().await.unwrap().len(), 2);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        discovery.get_all().await.unwrap(),
        vec![
            "tcp@a:1".to_string(),
            "tcp@b:2".to_string(),
            "tcp@c:3".to_string()
        ]
    );

    let picked = discovery.get(SelectMode::RoundRobin).await.unwrap();
    assert!(discovery.get_all().await.unwrap().contains(&picked));
}
