//! The dispatch engine: accept loop, codec handshake, per-connection
//! request pump, concurrent workers and the HTTP CONNECT tunnel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use muxrpc_common::addr::{CONNECTED, DEFAULT_RPC_PATH};
use muxrpc_common::codec::{
    BoxedReader, BoxedWriter, CodecKind, FrameReader, FrameWriter, Header,
};
use muxrpc_common::error::{Result, RpcError};
use muxrpc_common::options::{self, MAGIC_NUMBER};
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::service::{is_exported, MethodType, Service};

/// An RPC server: a concurrency-safe service map plus the machinery to
/// serve connections against it.
///
/// Connections may carry many interleaved requests. Each request runs on
/// its own worker while the pump keeps reading; responses are serialized
/// through a per-connection send lock so frames never interleave, and the
/// echoed sequence number tells the client which call each response
/// belongs to.
#[derive(Default)]
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service. Fails on an unexported service name or a
    /// duplicate registration; safe to call while serving.
    pub fn register(&self, service: Service) -> Result<()> {
        let name = service.name().to_string();
        if !is_exported(&name) {
            return Err(RpcError::UnexportedService(name));
        }
        let mut services = self.services.write();
        if services.contains_key(&name) {
            return Err(RpcError::DuplicateService(name));
        }
        info!(service = %name, methods = ?service.method_names(), "rpc server: registered");
        services.insert(name, Arc::new(service));
        Ok(())
    }

    /// Looks a registered service up by name, for introspection.
    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.read().get(name).cloned()
    }

    /// Resolves `"Service.Method"` to the service and method descriptor,
    /// splitting on the last dot.
    fn find_service(&self, service_method: &str) -> Result<(Arc<Service>, Arc<MethodType>)> {
        let (service_name, method_name) = service_method
            .rsplit_once('.')
            .ok_or_else(|| RpcError::BadServiceMethod(service_method.to_string()))?;
        let service = self
            .services
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| RpcError::ServiceNotFound(service_name.to_string()))?;
        let method = service
            .method(method_name)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound(service_method.to_string()))?;
        Ok((service, method))
    }

    /// Accepts connections until the listener fails, serving each one on
    /// its own task.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "rpc server: listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(server.serve_conn(stream));
                }
                Err(e) => {
                    error!("rpc server: accept failed: {e}");
                    return;
                }
            }
        }
    }

    /// Accepts connections on a unix socket listener.
    #[cfg(unix)]
    pub async fn accept_unix(self: Arc<Self>, listener: tokio::net::UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(server.serve_conn(stream));
                }
                Err(e) => {
                    error!("rpc server: accept failed: {e}");
                    return;
                }
            }
        }
    }

    /// Serves a single connection: handshake, then the request pump.
    pub async fn serve_conn<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = BufReader::new(Box::new(read_half) as BoxedReader);
        let writer = Box::new(write_half) as BoxedWriter;
        self.serve_split(reader, writer).await;
    }

    async fn serve_split(self: Arc<Self>, mut reader: BufReader<BoxedReader>, writer: BoxedWriter) {
        let opt = match options::read_options(&mut reader).await {
            Ok(opt) => opt,
            Err(e) => {
                error!("rpc server: invalid handshake options: {e}");
                return;
            }
        };
        if opt.magic_number != MAGIC_NUMBER {
            error!("rpc server: invalid magic number {:#x}", opt.magic_number);
            return;
        }
        let kind = match CodecKind::from_tag(&opt.codec_type) {
            Some(kind) => kind,
            None => {
                error!(codec = %opt.codec_type, "rpc server: unknown codec type");
                return;
            }
        };
        self.serve_codec(
            FrameReader::new(kind, reader),
            FrameWriter::new(kind, writer),
            opt.handle_timeout,
        )
        .await;
    }

    /// The per-connection pump. Requests are handled concurrently but
    /// responses go out one at a time under the send lock. Only a failed
    /// header or body read ends the loop; dispatch errors are answered on
    /// the wire and the pump moves on.
    async fn serve_codec(
        self: Arc<Self>,
        mut reader: FrameReader,
        writer: FrameWriter,
        handle_timeout: Duration,
    ) {
        let kind = reader.kind();
        let sending = Arc::new(Mutex::new(writer));
        let mut workers = JoinSet::new();

        loop {
            let header = match reader.read_header().await {
                Ok(header) => header,
                Err(e) => {
                    log_read_error(&e);
                    break;
                }
            };
            let body = match reader.read_body().await {
                Ok(body) => body,
                Err(e) => {
                    log_read_error(&e);
                    break;
                }
            };

            let (_, method) = match self.find_service(&header.service_method) {
                Ok(found) => found,
                Err(e) => {
                    let mut header = header;
                    header.error = e.to_string();
                    send_response(&sending, &header, kind.invalid_body()).await;
                    continue;
                }
            };

            workers.spawn(handle_request(
                method,
                header,
                body,
                Arc::clone(&sending),
                kind,
                handle_timeout,
            ));
        }

        // drain in-flight workers before closing the codec
        while workers.join_next().await.is_some() {}
        let _ = sending.lock().await.shutdown().await;
    }

    /// Serves the HTTP CONNECT tunnel on a listener: RPC sessions arrive
    /// as `CONNECT /_gorpc_` requests and take over the raw socket after
    /// the acknowledgement, so RPC can share a port with HTTP traffic.
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, path = DEFAULT_RPC_PATH, "rpc server: http tunnel listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_http_conn(stream).await {
                            warn!("rpc server: http tunnel connection failed: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("rpc server: accept failed: {e}");
                    return;
                }
            }
        }
    }

    async fn serve_http_conn(self: Arc<Self>, stream: tokio::net::TcpStream) -> Result<()> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(Box::new(read_half) as BoxedReader);
        let mut writer = Box::new(write_half) as BoxedWriter;

        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;
        // drain the remaining request head up to the blank line
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line.trim().is_empty() {
                break;
            }
        }

        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or_default();
        if method != "CONNECT" {
            writer
                .write_all(
                    b"HTTP/1.1 405 Method Not Allowed\r\n\
                      Content-Type: text/plain; charset=utf-8\r\n\r\n\
                      405 must CONNECT\n",
                )
                .await?;
            return Ok(());
        }
        if path != DEFAULT_RPC_PATH {
            writer.write_all(b"HTTP/1.1 404 Not Found\r\n\r\n").await?;
            return Ok(());
        }

        writer
            .write_all(format!("HTTP/1.0 {CONNECTED}\n\n").as_bytes())
            .await?;
        self.serve_split(reader, writer).await;
        Ok(())
    }
}

fn log_read_error(e: &RpcError) {
    // a peer hanging up mid-frame is ordinary connection teardown
    if let RpcError::Io(io_err) = e {
        if matches!(
            io_err.kind(),
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
        ) {
            return;
        }
    }
    error!("rpc server: failed to read request: {e}");
}

/// Runs one request on the blocking pool, racing it against the handle
/// timeout when one is configured. On timeout the response goes out
/// immediately; the orphaned invocation keeps running and its result is
/// dropped.
async fn handle_request(
    method: Arc<MethodType>,
    mut header: Header,
    body: Vec<u8>,
    sending: Arc<Mutex<FrameWriter>>,
    kind: CodecKind,
    handle_timeout: Duration,
) {
    let invoke = tokio::task::spawn_blocking(move || method.call(kind, &body));
    let result = if handle_timeout.is_zero() {
        flatten_join(invoke.await)
    } else {
        match tokio::time::timeout(handle_timeout, invoke).await {
            Ok(joined) => flatten_join(joined),
            Err(_) => Err(RpcError::HandleTimeout(handle_timeout)),
        }
    };

    match result {
        Ok(reply) => {
            header.error.clear();
            send_response(&sending, &header, reply).await;
        }
        Err(e) => {
            header.error = e.to_string();
            send_response(&sending, &header, kind.invalid_body()).await;
        }
    }
}

fn flatten_join(joined: std::result::Result<Result<Vec<u8>>, JoinError>) -> Result<Vec<u8>> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(RpcError::Application(format!("handler panicked: {e}"))),
    }
}

async fn send_response(sending: &Mutex<FrameWriter>, header: &Header, body: Vec<u8>) {
    let mut writer = sending.lock().await;
    if let Err(e) = writer.write(header, &body).await {
        error!("rpc server: failed to write response: {e}");
    }
}
