//! HTTP client: request lifecycle, connection reuse and the caller-facing future.
//!
//! [`HttpClient::send`] drives a request to its final response. Along the way it
//! follows `301`/`302`/`307` redirects, answers authentication challenges with the
//! registered [`AuthScheme`]s, and returns every connection that can carry another
//! exchange to the [`ConnectionPool`] before issuing the next request.

pub mod auth;
pub mod config;
pub mod connection;
pub mod engine;
pub mod future;
pub mod pool;

#[cfg(test)]
mod tests;

pub use auth::{AuthScheme, AuthSchemes, AuthState, BasicScheme, Challenge, Credentials};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use connection::{BoxedTransport, ClientConnection, ConnectionId, Connector, Destination, TcpConnector, Transport};
pub use engine::{Disposition, HttpClient};
pub use future::{Completion, ResponseFuture};
pub use pool::{ConnectionPool, PoolConfig, Pooled};
