use super::auth::{AuthScheme, AuthSchemes, Credentials};
use super::pool::PoolConfig;
use crate::codec::DecoderLimits;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for [`HttpClient`](super::HttpClient)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Longest silence tolerated while a response is outstanding
    pub read_timeout: Duration,
    /// Write timeout for sending a request
    pub write_timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Deadline for the whole exchange, redirects and retries included
    pub request_timeout: Option<Duration>,
    /// Redirect hop limit. `None` follows redirects without bound.
    pub max_redirects: Option<usize>,
    /// How many times one request is reissued to answer authentication challenges
    pub max_auth_attempts: u32,
    /// Credentials used when a request carries none of its own
    pub credentials: Option<Credentials>,
    /// Handlers for authentication challenges
    pub auth_schemes: AuthSchemes,
    /// `User-Agent` added to requests that do not set one
    pub user_agent: Option<String>,
    /// Idle connection pooling
    pub pool: PoolConfig,
    /// Bounds applied to decoded responses
    pub limits: DecoderLimits,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            max_redirects: None,
            max_auth_attempts: 3,
            credentials: None,
            auth_schemes: AuthSchemes::default(),
            user_agent: Some(concat!("httpwire/", env!("CARGO_PKG_VERSION")).to_string()),
            pool: PoolConfig::default(),
            limits: DecoderLimits::default(),
        }
    }
}

/// Builder for client configuration
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    pub fn max_redirects(mut self, hops: usize) -> Self {
        self.config.max_redirects = Some(hops);
        self
    }

    pub fn max_auth_attempts(mut self, attempts: u32) -> Self {
        self.config.max_auth_attempts = attempts;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some(Credentials::new(username, password));
        self
    }

    /// Registers an extra challenge handler. Handlers registered later take precedence.
    pub fn auth_scheme(mut self, scheme: Arc<dyn AuthScheme>) -> Self {
        self.config.auth_schemes.register(scheme);
        self
    }

    pub fn user_agent(mut self, agent: Option<String>) -> Self {
        self.config.user_agent = agent;
        self
    }

    pub fn max_idle_per_destination(mut self, max: usize) -> Self {
        self.config.pool.max_idle_per_destination = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.pool.idle_timeout = timeout;
        self
    }

    pub fn max_response_size(mut self, size: usize) -> Self {
        self.config.limits.max_body_size = size;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
