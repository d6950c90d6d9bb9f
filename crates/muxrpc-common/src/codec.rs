//! Body codecs and frame-level reading/writing.
//!
//! After the handshake every exchange on a connection is exactly one
//! [`Header`] chunk followed by one body chunk. A chunk is self-delimiting:
//! a 4-byte big-endian length prefix followed by the codec's encoding of
//! the value. The framework adds no outer framing beyond that.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::error::{Result, RpcError};

/// Upper bound on a single header or body chunk, guarding against
/// allocation of absurdly large buffers on a corrupt stream.
const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Request/response header, transmitted before each body.
///
/// `seq` is assigned by the originating client and echoed unchanged by the
/// server; `error` is empty iff the call succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    /// Qualified method name in the form `"<Service>.<Method>"`.
    pub service_method: String,
    /// Per-client monotonic sequence number; 0 is reserved.
    pub seq: u64,
    /// Error text, empty on success.
    pub error: String,
}

/// Wire tag of the default binary body codec.
pub const BINARY_TYPE: &str = "application/gob";
/// Wire tag of the JSON body codec.
pub const JSON_TYPE: &str = "application/json";

/// Body codec negotiated during the handshake.
///
/// The enum allows for future extensibility: adding a codec means adding a
/// variant and its tag here, after which both ends can negotiate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// Compact self-describing binary encoding (postcard), the default.
    Binary,
    /// JSON encoding, mainly useful for debugging against other tooling.
    Json,
}

impl CodecKind {
    /// Looks up a codec by its wire tag. Returns `None` for unknown tags,
    /// which aborts the session during the handshake.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            BINARY_TYPE => Some(CodecKind::Binary),
            JSON_TYPE => Some(CodecKind::Json),
            _ => None,
        }
    }

    /// The wire tag carried in the handshake `Options`.
    pub fn tag(&self) -> &'static str {
        match self {
            CodecKind::Binary => BINARY_TYPE,
            CodecKind::Json => JSON_TYPE,
        }
    }

    /// Encodes one value with this codec.
    pub fn encode_value<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecKind::Binary => Ok(postcard::to_allocvec(value)?),
            CodecKind::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Decodes one value with this codec.
    pub fn decode_value<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            CodecKind::Binary => Ok(postcard::from_bytes(data)?),
            CodecKind::Json => Ok(serde_json::from_slice(data)?),
        }
    }

    /// Body placeholder sent with error responses, where no meaningful
    /// reply value exists.
    pub fn invalid_body(&self) -> Vec<u8> {
        self.encode_value(&()).unwrap_or_default()
    }
}

/// Byte source half of a connection, type-erased over the transport.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Byte sink half of a connection, type-erased over the transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reads header/body chunks from the connection.
///
/// The buffered reader is handed over from the handshake so no bytes read
/// ahead of the first frame are lost.
pub struct FrameReader {
    kind: CodecKind,
    reader: BufReader<BoxedReader>,
}

impl FrameReader {
    pub fn new(kind: CodecKind, reader: BufReader<BoxedReader>) -> Self {
        Self { kind, reader }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Reads and decodes the next header.
    pub async fn read_header(&mut self) -> Result<Header> {
        let chunk = self.read_chunk().await?;
        self.kind.decode_value(&chunk)
    }

    /// Reads the next body chunk as raw bytes. Decoding into a typed value
    /// (or discarding) is up to the caller; either way the stream stays
    /// framed.
    pub async fn read_body(&mut self) -> Result<Vec<u8>> {
        self.read_chunk().await
    }

    async fn read_chunk(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(RpcError::FrameTooLarge(len));
        }
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// Writes header/body pairs to the connection.
///
/// Writes are buffered and flushed once per pair, so a response is either
/// absent or byte-contiguous on the wire.
pub struct FrameWriter {
    kind: CodecKind,
    writer: BufWriter<BoxedWriter>,
}

impl FrameWriter {
    pub fn new(kind: CodecKind, writer: BoxedWriter) -> Self {
        Self {
            kind,
            writer: BufWriter::new(writer),
        }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Writes one header+body pair and flushes. On failure the caller is
    /// expected to tear the connection down.
    pub async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header_bytes = self.kind.encode_value(header)?;
        self.write_chunk(&header_bytes).await?;
        self.write_chunk(body).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Writes raw bytes ahead of the framed protocol (the handshake line).
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Flushes buffered data and shuts the underlying stream down.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(&(data.len() as u32).to_be_bytes())
            .await?;
        self.writer.write_all(data).await?;
        Ok(())
    }
}
