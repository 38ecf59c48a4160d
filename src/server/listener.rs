use super::config::ServerConfig;
use super::connection::{ServerShared, serve_connection};
use super::limits::{ConnectionTracker, ServerMetrics};
use super::service::{
    CookieSessionIdentifier, ErrorResponseFormatter, HttpService, PlainTextErrorFormatter, SessionIdentifier,
};
use crate::session::SessionStore;
use crate::{Result, WireError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{Instrument, error, info, warn};

/// HTTP/1.x server that hands each request to an [`HttpService`]
///
/// Responses on a connection are written in request order, even when the service
/// finishes pipelined requests out of order.
///
/// # Examples
///
/// ```no_run
/// use async_trait::async_trait;
/// use httpwire::{HttpServer, HttpService, Response, ServerConfig, ServiceContext};
///
/// struct Hello;
///
/// #[async_trait]
/// impl HttpService for Hello {
///     async fn handle(&self, _ctx: &ServiceContext) -> Response {
///         Response::ok("hello")
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ServerConfig {
///         bind_addr: "127.0.0.1:8080".parse()?,
///         ..Default::default()
///     };
///     let server = HttpServer::new(config, Hello);
///     server.run().await?;
///     Ok(())
/// }
/// ```
pub struct HttpServer<S: HttpService> {
    shared: Arc<ServerShared<S>>,
    tracker: Arc<ConnectionTracker>,
    shutdown_signal: Arc<broadcast::Sender<()>>,
}

impl<S: HttpService> HttpServer<S> {
    /// Creates a server. Must be called inside a Tokio runtime, which runs session
    /// expiry.
    pub fn new(config: ServerConfig, service: S) -> Self {
        let (shutdown_signal, _) = broadcast::channel(1);
        let sessions = SessionStore::new(config.session.clone());
        let tracker = Arc::new(ConnectionTracker::new(config.max_connections));
        Self {
            shared: Arc::new(ServerShared {
                config,
                service,
                sessions,
                identifier: Arc::new(CookieSessionIdentifier::default()),
                formatter: Arc::new(PlainTextErrorFormatter),
                metrics: Arc::new(ServerMetrics::new()),
            }),
            tracker,
            shutdown_signal: Arc::new(shutdown_signal),
        }
    }

    /// Replaces the cookie-based session identifier.
    pub fn with_session_identifier(mut self, identifier: Arc<dyn SessionIdentifier>) -> Result<Self> {
        self.shared_mut()?.identifier = identifier;
        Ok(self)
    }

    /// Replaces the plain-text error page formatter.
    pub fn with_error_formatter(mut self, formatter: Arc<dyn ErrorResponseFormatter>) -> Result<Self> {
        self.shared_mut()?.formatter = formatter;
        Ok(self)
    }

    fn shared_mut(&mut self) -> Result<&mut ServerShared<S>> {
        Arc::get_mut(&mut self.shared)
            .ok_or_else(|| WireError::Config("server is already running".to_string()))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.shared.sessions
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.shared.metrics.clone()
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Returns a shutdown signal sender that can be used to gracefully shutdown the server
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_signal.as_ref().clone()
    }

    /// Binds `bind_addr` and serves until shut down.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections accepted from `listener` until shut down.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "HTTP server listening");

        let mut shutdown_rx = self.shutdown_signal.subscribe();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server");
                    break;
                }
                _ = shutdown_rx.recv() => {
                    info!("Received internal shutdown signal, stopping server");
                    break;
                }
            }
        }

        info!("HTTP server stopped");
        Ok(())
    }

    fn accept(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let Some(guard) = self.tracker.try_acquire() else {
            self.shared.metrics.connection_rejected();
            warn!(%addr, limit = self.tracker.max_connections(), "Connection rejected: limit reached");
            return;
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%addr, error = %e, "Failed to set TCP_NODELAY");
        }

        self.shared.metrics.connection_accepted();
        let current = self.tracker.active();
        info!(%addr, current, "Accepted connection");

        let shared = self.shared.clone();
        let span = tracing::info_span!("connection", %addr);
        tokio::spawn(
            async move {
                if let Err(e) = serve_connection(stream, addr, shared).await {
                    error!(%addr, error = %e, "Error handling connection");
                }
                drop(guard);
                info!(%addr, "Connection closed");
            }
            .instrument(span),
        );
    }
}

impl<S: HttpService> std::fmt::Debug for HttpServer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("bind_addr", &self.shared.config.bind_addr)
            .field("active_connections", &self.tracker.active())
            .finish()
    }
}
