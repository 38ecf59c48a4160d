//! Authentication challenge handling.
//!
//! A `401` response names one or more schemes in `WWW-Authenticate`. The engine picks
//! the first registered [`AuthScheme`] matching a challenge, stores its answer on the
//! request as an [`AuthState`], and reissues the request with an `Authorization`
//! header.

use crate::message::Request;
use crate::{Result, WireError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::HeaderValue;
use std::fmt;
use std::sync::Arc;

/// Username and password used to answer challenges.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authentication established on a request: the scheme that answered and the
/// `Authorization` value it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthState {
    scheme: String,
    authorization: HeaderValue,
}

impl AuthState {
    pub fn new(scheme: impl Into<String>, authorization: HeaderValue) -> Self {
        Self {
            scheme: scheme.into(),
            authorization,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authorization(&self) -> &HeaderValue {
        &self.authorization
    }
}

/// One parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Challenge<'a> {
    scheme: &'a str,
    params: &'a str,
}

impl<'a> Challenge<'a> {
    /// Splits `Scheme param=value, ...` into its scheme token and parameter text.
    pub fn parse(value: &'a str) -> Option<Self> {
        let value = value.trim();
        let (scheme, params) = value.split_once([' ', '\t']).unwrap_or((value, ""));
        if scheme.is_empty() {
            return None;
        }
        Some(Self {
            scheme,
            params: params.trim(),
        })
    }

    pub fn scheme(&self) -> &'a str {
        self.scheme
    }

    pub fn params(&self) -> &'a str {
        self.params
    }

    /// Value of an `auth-param`, unquoted.
    pub fn param(&self, name: &str) -> Option<&'a str> {
        self.params.split(',').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            key.trim().eq_ignore_ascii_case(name).then(|| {
                let value = value.trim();
                value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value)
            })
        })
    }
}

/// A handler for one authentication scheme.
pub trait AuthScheme: Send + Sync {
    /// Scheme token, compared case-insensitively with challenges.
    fn name(&self) -> &str;

    /// Produces the `Authorization` value answering `challenge`.
    fn respond(&self, challenge: &Challenge<'_>, request: &Request, credentials: &Credentials) -> Result<HeaderValue>;
}

/// RFC 7617 Basic authentication.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicScheme;

impl AuthScheme for BasicScheme {
    fn name(&self) -> &str {
        "Basic"
    }

    fn respond(&self, _challenge: &Challenge<'_>, _request: &Request, credentials: &Credentials) -> Result<HeaderValue> {
        let token = STANDARD.encode(format!("{}:{}", credentials.username, credentials.password));
        HeaderValue::from_str(&format!("Basic {token}"))
            .map_err(|e| WireError::InvalidHeader(format!("authorization: {e}")))
    }
}

/// Registered scheme handlers, searched most recently registered first.
#[derive(Clone)]
pub struct AuthSchemes {
    schemes: Vec<Arc<dyn AuthScheme>>,
}

impl AuthSchemes {
    /// A registry without any handler.
    pub fn empty() -> Self {
        Self { schemes: Vec::new() }
    }

    pub fn register(&mut self, scheme: Arc<dyn AuthScheme>) {
        self.schemes.push(scheme);
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn AuthScheme>> {
        self.schemes
            .iter()
            .rev()
            .find(|scheme| scheme.name().eq_ignore_ascii_case(name))
    }
}

impl Default for AuthSchemes {
    fn default() -> Self {
        let mut schemes = Self::empty();
        schemes.register(Arc::new(BasicScheme));
        schemes
    }
}

impl fmt::Debug for AuthSchemes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.schemes.iter().map(|s| s.name()))
            .finish()
    }
}
