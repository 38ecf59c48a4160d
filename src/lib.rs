//! Asynchronous HTTP/1.x engine.
//!
//! `httpwire` parses and emits HTTP/1.x messages incrementally over any byte stream and
//! builds client and server transports on top:
//!
//! - [`codec`]: the [`MessageCodec`] decoder/encoder state machine.
//! - [`client`]: [`HttpClient`], with connection pooling, redirects, authentication
//!   retry and per-request timeouts.
//! - [`server`]: [`HttpServer`] and the [`RequestPipeline`] that keeps pipelined
//!   responses in request order.
//! - [`session`]: [`SessionStore`] backed by the renewable [`TimedPermitIssuer`].

use thiserror::Error;

/// Error types for the httpwire library
#[derive(Error, Debug)]
pub enum WireError {
    /// Transport errors (connect, read, write)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed HTTP input
    #[error("Codec error: {0}")]
    Codec(codec::CodecError),

    /// Timeout errors
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// The peer closed the connection before a response arrived
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Request targets that cannot be parsed or resolved
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Header names or values that are not valid HTTP
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The request was dropped before it completed
    #[error("Request cancelled")]
    Cancelled,

    /// Unsupported operation errors
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl From<codec::CodecError> for WireError {
    fn from(err: codec::CodecError) -> Self {
        match err {
            codec::CodecError::Io(e) => WireError::Io(e),
            other => WireError::Codec(other),
        }
    }
}

/// Result type for the httpwire library
pub type Result<T> = std::result::Result<T, WireError>;

pub mod client;
pub mod codec;
pub mod message;
pub mod server;
pub mod session;

// Re-export main types for convenience
pub use client::{ClientConfig, ClientConfigBuilder, ConnectionPool, HttpClient, ResponseFuture};
pub use codec::{CodecError, DecoderLimits, MessageCodec, Role};
pub use message::{Body, Cookie, Message, Parameters, Request, Response, StatusCategory};
pub use server::{HttpServer, HttpService, RequestPipeline, ServerConfig, ServiceContext};
pub use session::{Session, SessionConfig, SessionListener, SessionStore, TimedPermit, TimedPermitIssuer};
