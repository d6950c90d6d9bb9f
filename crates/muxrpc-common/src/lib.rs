//! muxrpc Common Types and Wire Framing
//!
//! This crate provides the pieces shared by every muxrpc component:
//!
//! - **[`codec`]** - the request/response [`Header`](codec::Header), the
//!   negotiable body codecs and the length-delimited frame reader/writer
//! - **[`options`]** - the [`Options`](options::Options) record exchanged
//!   once per connection during the handshake
//! - **[`addr`]** - the `scheme@target` endpoint address grammar and the
//!   HTTP tunnel constants
//! - **[`error`]** - the [`RpcError`](error::RpcError) type used across the
//!   workspace
//!
//! # Wire format
//!
//! A connection opens with a single JSON-encoded `Options` document on its
//! own line, after which both sides speak the negotiated body codec:
//!
//! ```text
//! | Options (JSON line) | Header1 | Body1 | Header2 | Body2 | ...
//! ```
//!
//! Each header and body is one self-delimiting chunk: a 4-byte big-endian
//! length prefix followed by the codec's encoding of the value.

pub mod addr;
pub mod codec;
pub mod error;
pub mod options;

pub use addr::Addr;
pub use codec::{CodecKind, FrameReader, FrameWriter, Header};
pub use error::{Result, RpcError};
pub use options::{Options, MAGIC_NUMBER};
