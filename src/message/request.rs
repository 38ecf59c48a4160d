use super::{Body, Cookie, header_str, negotiate_keep_alive};
use crate::client::auth::{AuthState, Credentials};
use crate::{Result, WireError};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, HeaderMap, HeaderName, HeaderValue};
use http::uri::{PathAndQuery, Uri};
use http::{Method, Version};
use std::collections::BTreeSet;

/// Query parameters, multi-valued and kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters(Vec<(String, String)>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an `application/x-www-form-urlencoded` query string.
    pub fn from_query(query: &str) -> Result<Self> {
        serde_urlencoded::from_str::<Vec<(String, String)>>(query)
            .map(Parameters)
            .map_err(|e| WireError::InvalidUri(format!("bad query string: {e}")))
    }

    /// Renders the parameters as a query string (without the leading `?`).
    pub fn to_query(&self) -> String {
        // Serializing string pairs cannot fail.
        serde_urlencoded::to_string(&self.0).unwrap_or_default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value bound to `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Every value bound to `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An HTTP request.
///
/// The target URI never carries a query: query parameters live in [`Parameters`] and are
/// rendered back into the request line by the encoder. Client-side requests use an
/// absolute URI so the engine knows where to connect; decoded server-side requests
/// carry the origin-form target.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    cookies: BTreeSet<Cookie>,
    params: Parameters,
    body: Body,
    follow_redirects: bool,
    auth_attempts: u32,
    auth: Option<AuthState>,
    credentials: Option<Credentials>,
}

impl Request {
    /// Creates a request, moving any query in `uri` into the parameters.
    pub fn new(method: Method, uri: Uri) -> Result<Self> {
        let (uri, params) = split_query(uri)?;
        Ok(Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            cookies: BTreeSet::new(),
            params,
            body: Body::Empty,
            follow_redirects: true,
            auth_attempts: 0,
            auth: None,
            credentials: None,
        })
    }

    /// Shorthand for a GET request to an absolute URI.
    pub fn get(uri: &str) -> Result<Self> {
        Request::builder().method(Method::GET).uri(uri).build()
    }

    pub fn builder() -> RequestBuilder {
        RequestBuilder::new()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Replaces the target, taking any query it carries as the new parameters.
    pub fn set_uri(&mut self, uri: Uri) -> Result<()> {
        let (uri, params) = split_query(uri)?;
        self.uri = uri;
        self.params = params;
        Ok(())
    }

    /// The request-target written on the request line: path plus query.
    pub fn target(&self) -> String {
        let path = match self.uri.path() {
            "" => "/",
            path => path,
        };
        if self.params.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{}", self.params.to_query())
        }
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

    /// First value of a header, if present and valid ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn cookies(&self) -> &BTreeSet<Cookie> {
        &self.cookies
    }

    pub fn cookies_mut(&mut self) -> &mut BTreeSet<Cookie> {
        &mut self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name() == name)
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    pub fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    pub fn set_follow_redirects(&mut self, follow: bool) {
        self.follow_redirects = follow;
    }

    /// Number of times this request has been reissued to answer a challenge.
    pub fn auth_attempts(&self) -> u32 {
        self.auth_attempts
    }

    pub(crate) fn increment_auth_attempts(&mut self) -> u32 {
        self.auth_attempts += 1;
        self.auth_attempts
    }

    pub fn auth_state(&self) -> Option<&AuthState> {
        self.auth.as_ref()
    }

    pub(crate) fn auth_state_mut(&mut self) -> &mut Option<AuthState> {
        &mut self.auth
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
    }

    /// Whether the client asked for a persistent connection.
    pub fn keep_alive(&self) -> bool {
        negotiate_keep_alive(self.version, &self.headers)
    }

    /// Declared `Content-Length`, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.header(CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Sets `Host` from the target authority, replacing any previous value.
    pub(crate) fn apply_host_header(&mut self) {
        if let Some(authority) = self.uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                self.headers.insert(HOST, value);
            }
        }
    }
}

/// Builder for [`Request`].
pub struct RequestBuilder {
    method: Method,
    uri: Option<String>,
    version: Version,
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
    params: Vec<(String, String)>,
    body: Body,
    follow_redirects: bool,
    credentials: Option<Credentials>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: Method::GET,
            uri: None,
            version: Version::HTTP_11,
            headers: Vec::new(),
            cookies: Vec::new(),
            params: Vec::new(),
            body: Body::Empty,
            follow_redirects: true,
            credentials: None,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Appends a header value; repeated names keep every value in order.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Sets the body; a non-empty full body also sets `Content-Length`.
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn build(self) -> Result<Request> {
        let uri_text = self
            .uri
            .ok_or_else(|| WireError::InvalidUri("uri missing".to_string()))?;
        let uri: Uri = uri_text
            .parse()
            .map_err(|e| WireError::InvalidUri(format!("{uri_text}: {e}")))?;

        let mut request = Request::new(self.method, uri)?;
        request.version = self.version;
        for (name, value) in self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| WireError::InvalidHeader(format!("{name}: {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| WireError::InvalidHeader(format!("{name}: {e}")))?;
            request.headers.append(name, value);
        }
        request.cookies.extend(self.cookies);
        for (name, value) in self.params {
            request.params.add(name, value);
        }
        if let Body::Full(bytes) = &self.body {
            if !request.headers.contains_key(CONTENT_LENGTH) {
                request.headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            }
        }
        request.body = self.body;
        request.follow_redirects = self.follow_redirects;
        request.credentials = self.credentials;
        Ok(request)
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn split_query(uri: Uri) -> Result<(Uri, Parameters)> {
    let Some(query) = uri.query() else {
        return Ok((uri, Parameters::new()));
    };
    let params = Parameters::from_query(query)?;

    let mut parts = uri.into_parts();
    if let Some(pq) = parts.path_and_query.take() {
        let path = PathAndQuery::from_maybe_shared(Bytes::copy_from_slice(pq.path().as_bytes()))
            .map_err(|e| WireError::InvalidUri(e.to_string()))?;
        parts.path_and_query = Some(path);
    }
    let uri = Uri::from_parts(parts).map_err(|e| WireError::InvalidUri(e.to_string()))?;
    Ok((uri, params))
}
