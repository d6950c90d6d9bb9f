//! Handshake options, exchanged exactly once per connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufReadExt;

use crate::codec::{CodecKind, BINARY_TYPE};
use crate::error::{Result, RpcError};

/// Fixed constant identifying a muxrpc handshake. A mismatch rejects the
/// session before any call executes.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Connect timeout applied when none is configured.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection parameters, sent by the client as a single JSON document on
/// its own line immediately after connecting. Every following frame uses
/// the codec named by `codec_type`.
///
/// Durations ride on the wire as integer nanoseconds; a zero timeout means
/// "no limit".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Options {
    pub magic_number: u32,
    /// Wire tag of the body codec, e.g. `"application/gob"`.
    pub codec_type: String,
    /// Client-side bound on dialing plus handshake.
    #[serde(with = "duration_ns")]
    pub connect_timeout: Duration,
    /// Server-side bound on a single method invocation.
    #[serde(with = "duration_ns")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: BINARY_TYPE.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(mut self, kind: CodecKind) -> Self {
        self.codec_type = kind.tag().to_string();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    /// Fills defaults into partially specified options. The magic number is
    /// always overwritten with the correct constant.
    pub fn normalized(mut self) -> Self {
        self.magic_number = MAGIC_NUMBER;
        if self.codec_type.is_empty() {
            self.codec_type = BINARY_TYPE.to_string();
        }
        self
    }

    /// Resolves the configured codec tag, failing on unknown tags.
    pub fn codec_kind(&self) -> Result<CodecKind> {
        CodecKind::from_tag(&self.codec_type)
            .ok_or_else(|| RpcError::UnknownCodec(self.codec_type.clone()))
    }

    /// Encodes the handshake document: one JSON object terminated by a
    /// newline, self-delimited so the frames that follow are untouched.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Reads and decodes the handshake document from the connection's buffered
/// reader.
pub async fn read_options<R>(reader: &mut R) -> Result<Options>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(RpcError::Handshake(
            "connection closed before handshake".to_string(),
        ));
    }
    Ok(serde_json::from_str(line.trim())?)
}

mod duration_ns {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JSON_TYPE;

    #[test]
    fn test_defaults() {
        let opt = Options::default();
        assert_eq!(opt.magic_number, MAGIC_NUMBER);
        assert_eq!(opt.codec_type, BINARY_TYPE);
        assert_eq!(opt.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(opt.handle_timeout, Duration::ZERO);
    }

    #[test]
    fn test_normalized_overwrites_magic() {
        let mut opt = Options::default();
        opt.magic_number = 0xdead;
        opt.codec_type = String::new();
        let opt = opt.normalized();
        assert_eq!(opt.magic_number, MAGIC_NUMBER);
        assert_eq!(opt.codec_type, BINARY_TYPE);
    }

    #[test]
    fn test_missing_fields_fill_defaults() {
        let opt: Options = serde_json::from_str("{}").unwrap();
        assert_eq!(opt.magic_number, MAGIC_NUMBER);
        assert_eq!(opt.codec_type, BINARY_TYPE);
    }

    #[test]
    fn test_wire_field_names_and_nanoseconds() {
        let opt = Options::default()
            .with_codec(CodecKind::Json)
            .with_connect_timeout(Duration::from_secs(1));
        let text = String::from_utf8(opt.to_line().unwrap()).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains("\"MagicNumber\""));
        assert!(text.contains("\"CodecType\":\"application/json\""));
        assert!(text.contains("\"ConnectTimeout\":1000000000"));
        assert!(text.contains("\"HandleTimeout\":0"));
    }

    #[test]
    fn test_codec_kind_lookup() {
        assert_eq!(Options::default().codec_kind().unwrap(), CodecKind::Binary);
        let opt = Options {
            codec_type: JSON_TYPE.to_string(),
            ..Options::default()
        };
        assert_eq!(opt.codec_kind().unwrap(), CodecKind::Json);
        let opt = Options {
            codec_type: "application/x-unknown".to_string(),
            ..Options::default()
        };
        assert!(matches!(opt.codec_kind(), Err(RpcError::UnknownCodec(_))));
    }

    #[tokio::test]
    async fn test_handshake_line_round_trip() {
        let opt = Options::default().with_handle_timeout(Duration::from_secs(2));
        let mut line = opt.to_line().unwrap();
        // trailing bytes after the newline belong to the framed protocol
        line.extend_from_slice(&[0xff, 0xee]);
        let mut reader = tokio::io::BufReader::new(line.as_slice());
        let decoded = read_options(&mut reader).await.unwrap();
        assert_eq!(decoded.magic_number, opt.magic_number);
        assert_eq!(decoded.codec_type, opt.codec_type);
        assert_eq!(decoded.handle_timeout, opt.handle_timeout);
    }

    #[tokio::test]
    async fn test_handshake_on_closed_connection() {
        let mut reader = tokio::io::BufReader::new(&[][..]);
        assert!(matches!(
            read_options(&mut reader).await,
            Err(RpcError::Handshake(_))
        ));
    }
}
