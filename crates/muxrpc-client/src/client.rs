//! The multiplexing connection client.
//!
//! One connection carries many outstanding calls. A single send lock
//! serializes `(header, args)` pairs on the wire, a background receive
//! loop routes responses back to their calls by sequence number, and two
//! flags (`closing`, set by [`Client::close`]; `shutdown`, set on any
//! terminal read error) gate new registrations.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use muxrpc_common::addr::{Addr, CONNECTED, DEFAULT_RPC_PATH};
use muxrpc_common::codec::{BoxedReader, BoxedWriter, CodecKind, FrameReader, FrameWriter, Header};
use muxrpc_common::error::{Result, RpcError};
use muxrpc_common::options::Options;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// One completed invocation, delivered through a [`CallHandle`].
#[derive(Debug)]
pub struct Call {
    /// Sequence number the call was registered under (0 when registration
    /// itself failed).
    pub seq: u64,
    pub service_method: String,
    /// Encoded reply body, present iff the call succeeded.
    pub reply: Option<Vec<u8>>,
    /// Failure, if any. At most one of `reply`/`error` is set.
    pub error: Option<RpcError>,
}

struct PendingCall {
    service_method: String,
    tx: oneshot::Sender<Call>,
}

struct ClientState {
    /// Next sequence number; starts at 1, 0 is reserved for "no call".
    seq: u64,
    pending: HashMap<u64, PendingCall>,
    /// Set by `close()`.
    closing: bool,
    /// Set when the receive loop hits a terminal error.
    shutdown: bool,
}

struct ClientCore {
    kind: CodecKind,
    /// The send lock: held across exactly one header+body write pair.
    writer: AsyncMutex<FrameWriter>,
    state: Mutex<ClientState>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl ClientCore {
    fn register_call(&self, service_method: &str) -> Result<(u64, oneshot::Receiver<Call>)> {
        let mut state = self.state.lock();
        if state.closing || state.shutdown {
            return Err(RpcError::Shutdown);
        }
        let seq = state.seq;
        state.seq += 1;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            seq,
            PendingCall {
                service_method: service_method.to_string(),
                tx,
            },
        );
        Ok((seq, rx))
    }

    fn remove_call(&self, seq: u64) -> Option<PendingCall> {
        self.state.lock().pending.remove(&seq)
    }

    /// Marks the client shut down and completes every pending call with
    /// the terminal error. Each call is signaled exactly once.
    fn terminate_calls(&self, err: &RpcError) {
        let drained: Vec<(u64, PendingCall)> = {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.pending.drain().collect()
        };
        for (seq, pending) in drained {
            let error = match err {
                RpcError::Shutdown => RpcError::Shutdown,
                other => RpcError::Connection(other.to_string()),
            };
            let _ = pending.tx.send(Call {
                seq,
                service_method: pending.service_method,
                reply: None,
                error: Some(error),
            });
        }
    }
}

/// Future resolving to the completed [`Call`].
///
/// Dropping an unresolved handle cancels the call locally: the pending
/// entry is removed and a late response is discarded by the receive loop.
/// The remote invocation is not interrupted.
pub struct CallHandle {
    seq: u64,
    service_method: String,
    rx: oneshot::Receiver<Call>,
    core: Arc<ClientCore>,
    completed: bool,
}

impl CallHandle {
    fn completed_with(core: Arc<ClientCore>, service_method: &str, err: RpcError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Call {
            seq: 0,
            service_method: service_method.to_string(),
            reply: None,
            error: Some(err),
        });
        Self {
            seq: 0,
            service_method: service_method.to_string(),
            rx,
            core,
            completed: false,
        }
    }
}

impl Future for CallHandle {
    type Output = Call;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Call> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(call)) => {
                this.completed = true;
                Poll::Ready(call)
            }
            Poll::Ready(Err(_)) => {
                this.completed = true;
                Poll::Ready(Call {
                    seq: this.seq,
                    service_method: std::mem::take(&mut this.service_method),
                    reply: None,
                    error: Some(RpcError::Shutdown),
                })
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if !self.completed {
            self.core.remove_call(self.seq);
        }
    }
}

/// A connection to one RPC server, shared freely via `Clone`.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Dials a TCP endpoint and performs the handshake, bounded by
    /// `Options::connect_timeout` (zero disables the bound).
    pub async fn dial(addr: &str, opt: Options) -> Result<Self> {
        let opt = opt.normalized();
        dial_with_setup(TcpStream::connect(addr.to_string()), Self::with_stream, opt).await
    }

    /// Dials a unix socket endpoint.
    #[cfg(unix)]
    pub async fn dial_unix(path: &str, opt: Options) -> Result<Self> {
        let opt = opt.normalized();
        dial_with_setup(
            tokio::net::UnixStream::connect(path.to_string()),
            Self::with_stream,
            opt,
        )
        .await
    }

    /// Dials an HTTP endpoint: tunnels the session through an HTTP CONNECT
    /// exchange on the server's shared port before the usual handshake.
    pub async fn dial_http(addr: &str, opt: Options) -> Result<Self> {
        let opt = opt.normalized();
        dial_with_setup(
            TcpStream::connect(addr.to_string()),
            Self::with_http_stream,
            opt,
        )
        .await
    }

    /// Dials a `scheme@target` endpoint address.
    pub async fn xdial(rpc_addr: &str, opt: Options) -> Result<Self> {
        match rpc_addr.parse::<Addr>()? {
            Addr::Tcp(target) => Self::dial(&target, opt).await,
            #[cfg(unix)]
            Addr::Unix(path) => Self::dial_unix(&path, opt).await,
            #[cfg(not(unix))]
            Addr::Unix(_) => Err(RpcError::InvalidAddress(rpc_addr.to_string())),
            Addr::Http(target) => Self::dial_http(&target, opt).await,
        }
    }

    async fn with_stream<S>(stream: S, opt: Options) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = BufReader::new(Box::new(read_half) as BoxedReader);
        let writer = Box::new(write_half) as BoxedWriter;
        Self::handshake(reader, writer, opt).await
    }

    async fn with_http_stream<S>(stream: S, opt: Options) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(Box::new(read_half) as BoxedReader);
        let mut writer = Box::new(write_half) as BoxedWriter;

        use tokio::io::AsyncWriteExt;
        writer
            .write_all(format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\n\n").as_bytes())
            .await?;

        let mut status = String::new();
        reader.read_line(&mut status).await?;
        let status = status.trim();
        if !status.ends_with(CONNECTED) {
            return Err(RpcError::Handshake(format!(
                "unexpected HTTP response: {status}"
            )));
        }
        // drain the rest of the response head up to the blank line
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line.trim().is_empty() {
                break;
            }
        }

        Self::handshake(reader, writer, opt).await
    }

    /// Writes the handshake document and starts the receive loop over an
    /// established byte stream.
    pub async fn handshake(
        reader: BufReader<BoxedReader>,
        writer: BoxedWriter,
        opt: Options,
    ) -> Result<Self> {
        let opt = opt.normalized();
        let kind = opt.codec_kind()?;
        let mut frame_writer = FrameWriter::new(kind, writer);
        frame_writer.write_raw(&opt.to_line()?).await?;

        let core = Arc::new(ClientCore {
            kind,
            writer: AsyncMutex::new(frame_writer),
            state: Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            receiver: Mutex::new(None),
        });
        let task = tokio::spawn(receive_loop(
            Arc::clone(&core),
            FrameReader::new(kind, reader),
        ));
        *core.receiver.lock() = Some(task);
        Ok(Self { core })
    }

    /// True until the client is closed or hits a terminal error; once
    /// false, it stays false and every new call fails with the shutdown
    /// error without touching the wire.
    pub fn is_available(&self) -> bool {
        let state = self.core.state.lock();
        !state.closing && !state.shutdown
    }

    /// Closes the connection. Pending calls complete with the shutdown
    /// error; further calls fail immediately.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.core.state.lock();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        if let Some(task) = self.core.receiver.lock().take() {
            task.abort();
        }
        self.core.terminate_calls(&RpcError::Shutdown);
        let _ = self.core.writer.lock().await.shutdown().await;
        Ok(())
    }

    /// Issues a call asynchronously. The returned handle resolves to the
    /// completed [`Call`]; registration or send failures are delivered
    /// through it as well.
    pub async fn go<A: Serialize>(&self, service_method: &str, args: &A) -> CallHandle {
        let core = Arc::clone(&self.core);
        let body = match core.kind.encode_value(args) {
            Ok(body) => body,
            Err(e) => return CallHandle::completed_with(core, service_method, e),
        };

        // registration happens under the send lock so wire order matches
        // registration order
        let mut writer = self.core.writer.lock().await;
        let (seq, rx) = match core.register_call(service_method) {
            Ok(registered) => registered,
            Err(e) => {
                drop(writer);
                return CallHandle::completed_with(core, service_method, e);
            }
        };
        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        };
        if let Err(e) = writer.write(&header, &body).await {
            // the entry may already be gone if the receive loop tore the
            // connection down first
            if let Some(pending) = core.remove_call(seq) {
                let _ = pending.tx.send(Call {
                    seq,
                    service_method: pending.service_method,
                    reply: None,
                    error: Some(e),
                });
            }
        }
        drop(writer);

        CallHandle {
            seq,
            service_method: service_method.to_string(),
            rx,
            core,
            completed: false,
        }
    }

    /// Calls a remote method and returns the raw encoded reply.
    pub async fn call_raw<A: Serialize>(&self, service_method: &str, args: &A) -> Result<Vec<u8>> {
        let handle = self.go(service_method, args).await;
        let call = handle.await;
        match call.error {
            Some(e) => Err(e),
            None => Ok(call.reply.unwrap_or_default()),
        }
    }

    /// Calls a remote method and decodes the reply.
    ///
    /// Bound the wait with `tokio::time::timeout` (or any select) to get
    /// cancellation: dropping the future deregisters the call.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let reply = self.call_raw(service_method, args).await?;
        self.core.kind.decode_value(&reply)
    }
}

/// Routes responses to their pending calls until the connection dies, then
/// fails everything still outstanding.
async fn receive_loop(core: Arc<ClientCore>, mut reader: FrameReader) {
    let err = loop {
        let header = match reader.read_header().await {
            Ok(header) => header,
            Err(e) => break e,
        };
        match core.remove_call(header.seq) {
            None => {
                // canceled locally or never fully sent; keep the stream
                // framed by consuming the body
                debug!(seq = header.seq, "rpc client: discarding response for unknown call");
                if let Err(e) = reader.read_body().await {
                    break e;
                }
            }
            Some(pending) => {
                let body = reader.read_body().await;
                let mut call = Call {
                    seq: header.seq,
                    service_method: pending.service_method,
                    reply: None,
                    error: None,
                };
                let frame_error = match body {
                    Ok(bytes) => {
                        if header.error.is_empty() {
                            call.reply = Some(bytes);
                        } else {
                            call.error = Some(RpcError::Application(header.error));
                        }
                        None
                    }
                    Err(e) => {
                        call.error = Some(RpcError::Connection(e.to_string()));
                        Some(e)
                    }
                };
                let _ = pending.tx.send(call);
                if let Some(e) = frame_error {
                    break e;
                }
            }
        }
    };
    core.terminate_calls(&err);
}

/// Shared dial plumbing: open the transport and run the client setup, each
/// bounded by the connect timeout. A zero timeout disables the bound.
async fn dial_with_setup<S, C, N, NF>(connect: C, setup: N, opt: Options) -> Result<Client>
where
    C: Future<Output = std::io::Result<S>>,
    S: AsyncRead + AsyncWrite + Send + 'static,
    N: FnOnce(S, Options) -> NF,
    NF: Future<Output = Result<Client>>,
{
    let timeout = opt.connect_timeout;
    let stream = if timeout.is_zero() {
        connect.await?
    } else {
        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| RpcError::ConnectTimeout(timeout))??
    };

    let setup = setup(stream, opt);
    if timeout.is_zero() {
        setup.await
    } else {
        match tokio::time::timeout(timeout, setup).await {
            Ok(result) => result,
            // dropping the setup future closes the opened socket
            Err(_) => Err(RpcError::ConnectTimeout(timeout)),
        }
    }
}
