//! The cluster client: cached connections per endpoint, load-balanced
//! unicast calls and fail-fast broadcast over a [`Discovery`].

use std::collections::HashMap;

use muxrpc_common::codec::CodecKind;
use muxrpc_common::error::{Result, RpcError};
use muxrpc_common::options::Options;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::client::Client;
use crate::discovery::{Discovery, SelectMode};

/// A client over many servers. Connections are cached per endpoint address
/// and re-dialed when a cached one is no longer available; a failed call
/// is never retried on another endpoint.
pub struct XClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    opt: Options,
    kind: CodecKind,
    clients: AsyncMutex<HashMap<String, Client>>,
}

struct BroadcastState<R> {
    first_error: Option<RpcError>,
    winner: Option<R>,
    reply_done: bool,
}

impl<D: Discovery> XClient<D> {
    pub fn new(discovery: D, mode: SelectMode, opt: Options) -> Result<Self> {
        let opt = opt.normalized();
        let kind = opt.codec_kind()?;
        Ok(Self {
            discovery,
            mode,
            opt,
            kind,
            clients: AsyncMutex::new(HashMap::new()),
        })
    }

    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    /// Closes and evicts every cached connection.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
    }

    /// Returns the cached client for an endpoint if it is still available;
    /// otherwise evicts the stale one and dials anew.
    async fn dial(&self, rpc_addr: &str) -> Result<Client> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            if let Some(stale) = clients.remove(rpc_addr) {
                let _ = stale.close().await;
            }
        }
        let client = Client::xdial(rpc_addr, self.opt.clone()).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_raw_on<A: Serialize>(
        &self,
        rpc_addr: &str,
        service_method: &str,
        args: &A,
    ) -> Result<Vec<u8>> {
        let client = self.dial(rpc_addr).await?;
        client.call_raw(service_method, args).await
    }

    /// Calls one endpoint picked by the discovery's selection mode.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        let reply = self.call_raw_on(&rpc_addr, service_method, args).await?;
        self.kind.decode_value(&reply)
    }

    /// Calls every discovered endpoint concurrently.
    ///
    /// The first failure is remembered and cancels the peers still in
    /// flight; each peer decodes into its own fresh reply, the first
    /// success fills `reply` and later ones are dropped. With no reply
    /// slot the responses are discarded undecoded. Returns the remembered
    /// error, if any.
    pub async fn broadcast<A, R>(
        &self,
        service_method: &str,
        args: &A,
        reply: Option<&mut R>,
    ) -> Result<()>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let servers = self.discovery.get_all().await?;
        let want_reply = reply.is_some();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = Mutex::new(BroadcastState::<R> {
            first_error: None,
            winner: None,
            reply_done: !want_reply,
        });

        let state_ref = &state;
        let cancel_tx_ref = &cancel_tx;
        let calls = servers.iter().map(|rpc_addr| {
            let mut cancel = cancel_rx.clone();
            async move {
                let result = tokio::select! {
                    result = self.call_raw_on(rpc_addr, service_method, args) => result,
                    _ = cancel.changed() => Err(RpcError::Canceled),
                };
                // decode into this peer's own fresh reply before racing
                // for the slot; a body that fails to decode counts as
                // this peer failing
                let result: Result<Option<R>> = result.and_then(|bytes| {
                    if want_reply {
                        self.kind.decode_value(&bytes).map(Some)
                    } else {
                        Ok(None)
                    }
                });
                let mut state = state_ref.lock();
                match result {
                    Err(e) => {
                        if state.first_error.is_none() {
                            state.first_error = Some(e);
                            let _ = cancel_tx_ref.send(true);
                        }
                    }
                    Ok(value) => {
                        if !state.reply_done {
                            state.winner = value;
                            state.reply_done = true;
                        }
                    }
                }
            }
        });
        futures::future::join_all(calls).await;

        let state = state.into_inner();
        if let (Some(slot), Some(value)) = (reply, state.winner) {
            *slot = value;
        }
        match state.first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
