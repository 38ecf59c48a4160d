use crate::codec::DecoderLimits;
use crate::session::SessionConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for [`HttpServer`](super::HttpServer)
///
/// # Examples
///
/// ```rust
/// use httpwire::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig {
///     bind_addr: "127.0.0.1:8080".parse().unwrap(),
///     max_connections: 100,
///     read_timeout: Duration::from_secs(15),
///     max_pipeline_depth: 8,
///     ..Default::default()
/// };
/// assert_eq!(config.write_timeout, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Network address to bind to
    pub bind_addr: SocketAddr,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Idle time tolerated while waiting for the next request
    pub read_timeout: Duration,
    /// Write timeout for each response
    pub write_timeout: Duration,
    /// Requests admitted on one connection before reading pauses
    pub max_pipeline_depth: usize,
    /// `Server` header added to responses that do not set one
    pub server_name: Option<String>,
    /// Bounds applied to decoded requests
    pub limits: DecoderLimits,
    /// Session expiry
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_connections: 100,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            max_pipeline_depth: 16,
            server_name: Some(concat!("httpwire/", env!("CARGO_PKG_VERSION")).to_string()),
            limits: DecoderLimits::default(),
            session: SessionConfig::default(),
        }
    }
}
