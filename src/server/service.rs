//! Collaborators the server calls out to: the request handler, the session
//! identifier and the error page formatter.

use crate::message::{Cookie, Request, Response, StatusCategory};
use crate::session::{Session, SessionStore};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;

/// Produces the response for one request.
#[async_trait]
pub trait HttpService: Send + Sync + 'static {
    async fn handle(&self, ctx: &ServiceContext) -> Response;
}

#[async_trait]
impl<S: HttpService> HttpService for Arc<S> {
    async fn handle(&self, ctx: &ServiceContext) -> Response {
        (**self).handle(ctx).await
    }
}

/// Carries session keys between requests and responses.
pub trait SessionIdentifier: Send + Sync {
    /// The session key the request refers to, if any.
    fn identify(&self, request: &Request) -> Option<String>;
    /// Makes the client present `key` on later requests.
    fn attach(&self, key: &str, response: &mut Response);
    /// Makes the client forget its session key.
    fn detach(&self, response: &mut Response);
}

/// Keeps the session key in a cookie.
#[derive(Debug, Clone)]
pub struct CookieSessionIdentifier {
    name: String,
    path: String,
}

impl CookieSessionIdentifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: "/".to_string(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Default for CookieSessionIdentifier {
    fn default() -> Self {
        Self::new("SESSIONID")
    }
}

impl SessionIdentifier for CookieSessionIdentifier {
    fn identify(&self, request: &Request) -> Option<String> {
        request
            .cookie(&self.name)
            .map(|cookie| cookie.value().to_string())
            .filter(|key| !key.is_empty())
    }

    fn attach(&self, key: &str, response: &mut Response) {
        let cookie = Cookie::new(self.name.as_str(), key)
            .with_path(self.path.as_str())
            .with_http_only(true);
        set_cookie(response, cookie);
    }

    fn detach(&self, response: &mut Response) {
        let cookie = Cookie::new(self.name.as_str(), "")
            .with_path(self.path.as_str())
            .with_max_age(0);
        set_cookie(response, cookie);
    }
}

fn set_cookie(response: &mut Response, cookie: Cookie) {
    let cookies = response.cookies_mut();
    cookies.retain(|c| c.name() != cookie.name());
    cookies.insert(cookie);
}

/// Fills in the body of error responses the service left empty.
pub trait ErrorResponseFormatter: Send + Sync {
    fn format(&self, response: &mut Response);
}

/// Writes `"<code> <reason>"` as `text/plain`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextErrorFormatter;

impl ErrorResponseFormatter for PlainTextErrorFormatter {
    fn format(&self, response: &mut Response) {
        let text = format!("{} {}\n", response.status().as_u16(), response.reason());
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response.set_body(Bytes::from(text));
    }
}

/// Whether `response` is an error page the formatter should fill in.
pub(crate) fn needs_error_body(response: &Response) -> bool {
    matches!(
        response.category(),
        StatusCategory::ClientError | StatusCategory::ServerError
    ) && response.body().is_empty()
}

/// Everything a service sees about one request.
pub struct ServiceContext {
    request: Request,
    peer_addr: SocketAddr,
    sessions: Option<SessionStore>,
    requested_key: Option<String>,
    session: Mutex<Option<Arc<Session>>>,
}

impl ServiceContext {
    /// A context without session support.
    pub fn new(request: Request, peer_addr: SocketAddr) -> Self {
        Self {
            request,
            peer_addr,
            sessions: None,
            requested_key: None,
            session: Mutex::new(None),
        }
    }

    pub(crate) fn with_sessions(
        request: Request,
        peer_addr: SocketAddr,
        sessions: SessionStore,
        identifier: &dyn SessionIdentifier,
    ) -> Self {
        let requested_key = identifier.identify(&request);
        Self {
            request,
            peer_addr,
            sessions: Some(sessions),
            requested_key,
            session: Mutex::new(None),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Session key presented by the client, live or not.
    pub fn requested_session_key(&self) -> Option<&str> {
        self.requested_key.as_deref()
    }

    /// The live session the request refers to. Locating it renews its expiry.
    pub fn session(&self) -> Option<Arc<Session>> {
        let mut current = self.session.lock();
        if let Some(session) = current.as_ref().filter(|s| s.is_valid()) {
            return Some(session.clone());
        }
        let key = self.requested_key.as_deref()?;
        let session = self.sessions.as_ref()?.locate_session(key)?;
        *current = Some(session.clone());
        Some(session)
    }

    /// The request's live session, or a new one under a generated key.
    pub fn create_session(&self) -> Option<Arc<Session>> {
        if let Some(session) = self.session() {
            return Some(session);
        }
        let session = self.sessions.as_ref()?.create_session_with_generated_key()?;
        *self.session.lock() = Some(session.clone());
        Some(session)
    }

    /// The session touched while handling, without looking anything up.
    pub(crate) fn touched_session(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}
