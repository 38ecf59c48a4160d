use super::auth::{AuthState, Challenge};
use super::config::ClientConfig;
use super::connection::{ClientConnection, ConnectionId, Connector, Destination, TcpConnector};
use super::future::{Completion, ResponseFuture};
use super::pool::{ConnectionPool, Pooled};
use crate::message::{Body, Request, Response};
use crate::{Result, WireError};
use http::header::{AUTHORIZATION, CONTENT_LENGTH, HeaderValue, TRANSFER_ENCODING, USER_AGENT};
use http::uri::{PathAndQuery, Uri};
use http::{Method, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{sleep, timeout};
use tracing::{Instrument, debug, debug_span, warn};

/// What to do with a decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The request was retargeted; send it again.
    Redirect,
    /// The request now carries authentication; send it again.
    AuthRetry { attempt: u32 },
    /// Deliver the response to the caller.
    Complete,
}

/// Asynchronous HTTP/1.x client.
///
/// Cloning is cheap; clones share the configuration and the connection pool.
///
/// # Example
///
/// ```no_run
/// use httpwire::{HttpClient, Request};
///
/// # async fn run() -> httpwire::Result<()> {
/// let client = HttpClient::default();
/// let response = client.send(Request::get("http://localhost:8080/")?).await?;
/// println!("{} {}", response.status(), response.body().len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    pool: ConnectionPool<ClientConnection>,
    connector: Arc<dyn Connector>,
    next_id: AtomicU64,
}

impl HttpClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    /// Creates a client that opens its transports through `connector`.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let pool = ConnectionPool::new(config.pool.clone());
        Self {
            inner: Arc::new(ClientInner {
                config,
                pool,
                connector,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &ConnectionPool<ClientConnection> {
        &self.inner.pool
    }

    /// Starts the exchange on a background task and returns its future.
    ///
    /// The future resolves once: with the final response after any redirects and
    /// authentication retries, or with the first failure. Requests need an absolute
    /// URI.
    pub fn send(&self, request: Request) -> ResponseFuture {
        let (completion, future) = Completion::new();
        let inner = self.inner.clone();
        let span = debug_span!("request", method = %request.method(), uri = %request.uri());

        tokio::spawn(
            async move {
                let outcome = match inner.config.request_timeout {
                    Some(limit) => {
                        tokio::select! {
                            result = inner.execute(request, &completion) => result,
                            _ = sleep(limit) => {
                                warn!(timeout_ms = limit.as_millis() as u64, "request timed out");
                                Err(WireError::Timeout(format!("request exceeded {}ms", limit.as_millis())))
                            }
                        }
                    }
                    None => inner.execute(request, &completion).await,
                };
                if let Err(e) = &outcome {
                    debug!(error = %e, "request failed");
                }
                completion.complete(outcome);
            }
            .instrument(span),
        );
        future
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl ClientInner {
    async fn execute(&self, mut request: Request, completion: &Completion) -> Result<Response> {
        let mut redirects = 0;
        loop {
            if completion.is_abandoned() {
                return Err(WireError::Cancelled);
            }
            let destination = Destination::from_uri(request.uri())?;
            self.prepare(&mut request);

            let (connection, response) = self.exchange(&destination, &request).await?;
            match decide(&mut request, &response, &self.config, redirects)? {
                Disposition::Redirect => {
                    redirects += 1;
                    debug!(status = response.status().as_u16(), to = %request.uri(), hops = redirects, "following redirect");
                    self.pool.release(connection);
                }
                Disposition::AuthRetry { attempt } => {
                    debug!(attempt, scheme = request.auth_state().map(AuthState::scheme), "answering challenge");
                    self.pool.release(connection);
                }
                Disposition::Complete => {
                    self.pool.release(connection);
                    return Ok(response);
                }
            }
        }
    }

    /// Sets the per-dispatch headers.
    fn prepare(&self, request: &mut Request) {
        request.apply_host_header();
        if let Some(state) = request.auth_state() {
            let value = state.authorization().clone();
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        if let Some(agent) = &self.config.user_agent {
            if !request.headers().contains_key(USER_AGENT) {
                if let Ok(value) = HeaderValue::from_str(agent) {
                    request.headers_mut().insert(USER_AGENT, value);
                }
            }
        }
    }

    /// Sends `request` and reads its response. A pooled connection that turns out to
    /// have been closed by the peer is replaced by a fresh one once, unless the request
    /// was already written and is not idempotent.
    async fn exchange(&self, destination: &Destination, request: &Request) -> Result<(ClientConnection, Response)> {
        if let Some(mut connection) = self.pool.acquire(destination) {
            debug!(id = %connection.id(), idle_ms = connection.idle_for().as_millis() as u64, "reusing pooled connection");
            match connection.send(request.clone(), self.config.write_timeout).await {
                Ok(()) => match self.receive(&mut connection).await {
                    Ok(response) => return Ok((connection, response)),
                    Err(WireError::ConnectionClosed) if request.method().is_idempotent() => {
                        debug!(id = %connection.id(), "pooled connection closed before responding");
                    }
                    Err(e) => return Err(e),
                },
                Err(WireError::ConnectionClosed | WireError::Io(_)) => {
                    debug!(id = %connection.id(), "pooled connection was stale");
                }
                Err(e) => return Err(e),
            }
        }

        let mut connection = self.connect(destination).await?;
        connection.send(request.clone(), self.config.write_timeout).await?;
        let response = self.receive(&mut connection).await?;
        Ok((connection, response))
    }

    async fn receive(&self, connection: &mut ClientConnection) -> Result<Response> {
        let response = connection.receive(self.config.read_timeout).await;
        if let Err(WireError::Timeout(_)) = &response {
            warn!(id = %connection.id(), "timed out waiting for response");
        }
        response
    }

    async fn connect(&self, destination: &Destination) -> Result<ClientConnection> {
        let transport = timeout(self.config.connect_timeout, self.connector.connect(destination))
            .await
            .map_err(|_| WireError::Timeout("Connection timeout".to_string()))??;
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(%id, %destination, "connected");
        Ok(ClientConnection::new(id, destination.clone(), transport, self.config.limits.clone()))
    }
}

/// Decides how to continue after `response`, rewriting `request` for a follow-up
/// when one is needed.
pub fn decide(request: &mut Request, response: &Response, config: &ClientConfig, redirects: usize) -> Result<Disposition> {
    if is_redirect(response.status()) && request.follow_redirects() {
        if let Some(location) = response.location() {
            if config.max_redirects.is_some_and(|max| redirects >= max) {
                debug!(hops = redirects, "redirect limit reached");
                return Ok(Disposition::Complete);
            }
            let target = resolve_location(request.uri(), location)?;
            apply_redirect(request, target)?;
            return Ok(Disposition::Redirect);
        }
    }

    let challenges = response.challenges();
    if !challenges.is_empty() {
        let credentials = request.credentials().or(config.credentials.as_ref()).cloned();
        if let Some(credentials) = credentials {
            for value in challenges {
                let Some(challenge) = Challenge::parse(value) else { continue };
                let established = request
                    .auth_state()
                    .is_some_and(|state| state.scheme().eq_ignore_ascii_case(challenge.scheme()));
                if established {
                    continue;
                }
                let Some(handler) = config.auth_schemes.find(challenge.scheme()) else { continue };
                let authorization = handler.respond(&challenge, request, &credentials)?;
                *request.auth_state_mut() = Some(AuthState::new(handler.name(), authorization));
                break;
            }
        }

        if request.auth_state().is_some() {
            let attempt = request.increment_auth_attempts();
            if attempt <= config.max_auth_attempts {
                return Ok(Disposition::AuthRetry { attempt });
            }
            debug!(attempt, "authentication attempts exhausted");
        }
    }

    Ok(Disposition::Complete)
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::TEMPORARY_REDIRECT
    )
}

fn apply_redirect(request: &mut Request, target: Uri) -> Result<()> {
    let same_origin = request.uri().scheme() == target.scheme() && request.uri().authority() == target.authority();
    request.set_uri(target)?;
    if request.method() != Method::GET {
        request.set_method(Method::GET);
        request.set_body(Body::Empty);
        request.headers_mut().remove(CONTENT_LENGTH);
        request.headers_mut().remove(TRANSFER_ENCODING);
    }
    if !same_origin {
        *request.auth_state_mut() = None;
        request.headers_mut().remove(AUTHORIZATION);
    }
    Ok(())
}

/// `scheme ":"` prefix per RFC 3986: a letter, then letters, digits, `+`, `-` or `.`.
fn has_scheme(location: &str) -> bool {
    let Some((scheme, _)) = location.split_once(':') else { return false };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Resolves a `Location` value against the URI of the request that received it.
pub fn resolve_location(base: &Uri, location: &str) -> Result<Uri> {
    let location = location.trim();
    let invalid = |e: &dyn std::fmt::Display| WireError::InvalidUri(format!("Location {location}: {e}"));

    if has_scheme(location) {
        return location.parse().map_err(|e| invalid(&e));
    }
    if location.starts_with("//") {
        return format!("{}:{location}", base.scheme_str().unwrap_or("http"))
            .parse()
            .map_err(|e| invalid(&e));
    }

    let path_and_query = if location.starts_with('/') {
        location.to_string()
    } else {
        let base_path = base.path();
        let directory = &base_path[..base_path.rfind('/').map_or(0, |i| i + 1)];
        let directory = if directory.is_empty() { "/" } else { directory };
        format!("{directory}{location}")
    };
    let mut parts = base.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query.as_str()).map_err(|e| invalid(&e))?);
    Uri::from_parts(parts).map_err(|e| invalid(&e))
}
