use super::{Body, Cookie, header_str, negotiate_keep_alive};
use crate::{Result, WireError};
use http::header::{CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue, LOCATION, WWW_AUTHENTICATE};
use http::{StatusCode, Version};
use std::collections::BTreeSet;

/// Status code classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    /// 1xx
    Informational,
    /// 2xx
    Success,
    /// 3xx
    Redirection,
    /// 4xx
    ClientError,
    /// 5xx
    ServerError,
}

impl StatusCategory {
    pub fn of(status: StatusCode) -> Self {
        match status.as_u16() {
            100..=199 => StatusCategory::Informational,
            200..=299 => StatusCategory::Success,
            300..=399 => StatusCategory::Redirection,
            400..=499 => StatusCategory::ClientError,
            _ => StatusCategory::ServerError,
        }
    }
}

/// An HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: StatusCode,
    reason: String,
    version: Version,
    headers: HeaderMap,
    cookies: BTreeSet<Cookie>,
    body: Body,
}

impl Response {
    /// Creates an empty response with the canonical reason phrase.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: canonical_reason(status),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            cookies: BTreeSet::new(),
            body: Body::Empty,
        }
    }

    pub fn builder(status: StatusCode) -> ResponseBuilder {
        ResponseBuilder::new(status)
    }

    /// A 200 response carrying `body`.
    pub fn ok(body: impl Into<Body>) -> Self {
        ResponseBuilder::new(StatusCode::OK).body(body).build()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Changes the status and resets the reason phrase to the canonical one.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
        self.reason = canonical_reason(status);
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = reason.into();
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn cookies(&self) -> &BTreeSet<Cookie> {
        &self.cookies
    }

    pub fn cookies_mut(&mut self) -> &mut BTreeSet<Cookie> {
        &mut self.cookies
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Replaces the body and keeps `Content-Length` in step with it.
    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
        match &self.body {
            Body::Full(bytes) => {
                self.headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            }
            Body::Empty => {
                self.headers.insert(CONTENT_LENGTH, HeaderValue::from(0usize));
            }
            Body::Streamed(_) => {}
        }
    }

    pub fn category(&self) -> StatusCategory {
        StatusCategory::of(self.status)
    }

    /// Statuses after which the connection cannot be trusted to stay in sync.
    pub fn forces_connection_closure(&self) -> bool {
        matches!(
            self.status.as_u16(),
            400 | 408 | 411 | 413 | 414 | 500 | 501 | 503 | 505
        )
    }

    /// False for 1xx, 204 and 304, which never carry a body.
    pub fn allows_message_body(&self) -> bool {
        allows_body(self.status)
    }

    /// `WWW-Authenticate` challenge values in arrival order.
    pub fn challenges(&self) -> Vec<&str> {
        self.headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn location(&self) -> Option<&str> {
        header_str(&self.headers, LOCATION)
    }

    /// Whether the connection may carry another exchange after this response.
    pub fn keep_alive(&self) -> bool {
        !self.forces_connection_closure() && negotiate_keep_alive(self.version, &self.headers)
    }
}

/// Builder for [`Response`].
///
/// # Example
///
/// ```
/// use httpwire::message::Response;
/// use http::StatusCode;
///
/// let response = Response::builder(StatusCode::OK)
///     .header("content-type", "text/plain")
///     .body("hello")
///     .build();
/// assert_eq!(response.header("content-length"), Some("5"));
/// ```
pub struct ResponseBuilder {
    response: Response,
    invalid: Option<String>,
}

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        Self {
            response: Response::new(status),
            invalid: None,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.response.reason = reason.into();
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.response.version = version;
        self
    }

    /// Appends a header value. Invalid names or values are reported by `try_build`.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.response.headers.append(name, value);
            }
            _ => {
                self.invalid.get_or_insert_with(|| format!("{name}: {value}"));
            }
        }
        self
    }

    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.response.cookies.insert(cookie);
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.response.set_body(body);
        self
    }

    /// Builds the response, dropping any header that failed validation.
    pub fn build(self) -> Response {
        self.response
    }

    pub fn try_build(self) -> Result<Response> {
        match self.invalid {
            Some(header) => Err(WireError::InvalidHeader(header)),
            None => Ok(self.response),
        }
    }
}

pub(crate) fn allows_body(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
}

fn canonical_reason(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or("Unknown").to_string()
}
