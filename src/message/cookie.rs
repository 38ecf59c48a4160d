use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Errors raised while reading `Cookie` and `Set-Cookie` header values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CookieError {
    #[error("invalid cookie version: {0}")]
    InvalidVersion(String),
    #[error("malformed cookie: {0}")]
    Malformed(String),
}

/// An HTTP state-management cookie.
///
/// Version 0 cookies follow the Netscape draft and are emitted with an absolute
/// `Expires` date; version 1 cookies follow RFC 2109 and use a relative `Max-Age`.
/// Two cookies are equal when their name and value are equal, and cookie sets are
/// ordered by (name, value) so header emission is deterministic.
#[derive(Debug, Clone)]
pub struct Cookie {
    name: String,
    value: String,
    version: u8,
    path: Option<String>,
    domain: Option<String>,
    comment: Option<String>,
    /// Lifetime in seconds. `None` makes this a session cookie.
    max_age: Option<u64>,
    secure: bool,
    http_only: bool,
    created: SystemTime,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            version: 0,
            path: None,
            domain: None,
            comment: None,
            max_age: None,
            secure: false,
            http_only: false,
            created: SystemTime::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn max_age(&self) -> Option<u64> {
        self.max_age
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_http_only(&self) -> bool {
        self.http_only
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// Creation time plus max-age, or `None` for session cookies.
    pub fn expiration(&self) -> Option<SystemTime> {
        self.max_age.map(|secs| expires_after(self.created, secs))
    }

    /// Sets the cookie version. Only 0 and 1 are defined.
    pub fn with_version(mut self, version: u8) -> Result<Self, CookieError> {
        if version > 1 {
            return Err(CookieError::InvalidVersion(version.to_string()));
        }
        self.version = version;
        Ok(self)
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn with_created(mut self, created: SystemTime) -> Self {
        self.created = created;
        self
    }

    /// Renders this cookie as a `Set-Cookie` header value.
    pub fn to_set_cookie(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if self.version > 0 {
            out.push_str(&format!("; Version={}", self.version));
        }
        if let Some(comment) = &self.comment {
            out.push_str(&format!("; Comment={comment}"));
        }
        if let Some(domain) = &self.domain {
            out.push_str(&format!("; Domain={domain}"));
        }
        if let Some(path) = &self.path {
            out.push_str(&format!("; Path={path}"));
        }
        if let Some(max_age) = self.max_age {
            if self.version == 0 {
                // A zero max-age deletes the cookie, so it gets a date in the past.
                let expires = if max_age == 0 { UNIX_EPOCH } else { expires_after(self.created, max_age) };
                out.push_str(&format!("; Expires={}", httpdate::fmt_http_date(expires)));
            } else {
                out.push_str(&format!("; Max-Age={max_age}"));
            }
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }

    /// Parses one `Set-Cookie` header value.
    pub fn parse_set_cookie(header: &str) -> Result<Cookie, CookieError> {
        let mut parts = header.split(';');
        let first = parts.next().unwrap_or_default();
        let (name, value) = split_pair(first).ok_or_else(|| CookieError::Malformed(header.to_string()))?;
        if name.is_empty() {
            return Err(CookieError::Malformed(header.to_string()));
        }

        let mut cookie = Cookie::new(name, unquote(value));
        let mut expires = None;
        for attr in parts {
            let attr = attr.trim();
            if attr.is_empty() {
                continue;
            }
            let (key, val) = split_pair(attr).unwrap_or((attr, ""));
            let val = unquote(val);
            match key.to_ascii_lowercase().as_str() {
                "version" => cookie.version = parse_version(val)?,
                "path" => cookie.path = Some(val.to_string()),
                "domain" => cookie.domain = Some(val.to_string()),
                "comment" => cookie.comment = Some(val.to_string()),
                "max-age" => {
                    let secs = val
                        .parse::<i64>()
                        .map_err(|_| CookieError::Malformed(attr.to_string()))?;
                    cookie.max_age = Some(secs.max(0) as u64);
                }
                "expires" => expires = httpdate::parse_http_date(val).ok(),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }

        // Max-Age wins over Expires when both are present.
        if cookie.max_age.is_none() {
            if let Some(at) = expires {
                let remaining = at.duration_since(cookie.created).unwrap_or_default();
                cookie.max_age = Some(remaining.as_secs());
            }
        }
        Ok(cookie)
    }

    /// Parses a request `Cookie` header value.
    ///
    /// Understands both the plain `a=1; b=2` form and the RFC 2109 form where a
    /// `$Version` attribute applies to every following cookie and `$Path`/`$Domain`
    /// attach to the cookie right before them.
    pub fn parse_cookie_header(header: &str) -> Result<Vec<Cookie>, CookieError> {
        let mut cookies: Vec<Cookie> = Vec::new();
        let mut version = 0;

        for pair in header.split([';', ',']) {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, value) = split_pair(pair).ok_or_else(|| CookieError::Malformed(pair.to_string()))?;
            let value = unquote(value);
            if let Some(attr) = name.strip_prefix('$') {
                match attr.to_ascii_lowercase().as_str() {
                    "version" => version = parse_version(value)?,
                    "path" => {
                        if let Some(last) = cookies.last_mut() {
                            last.path = Some(value.to_string());
                        }
                    }
                    "domain" => {
                        if let Some(last) = cookies.last_mut() {
                            last.domain = Some(value.to_string());
                        }
                    }
                    _ => {}
                }
                continue;
            }
            if name.is_empty() {
                return Err(CookieError::Malformed(pair.to_string()));
            }
            let mut cookie = Cookie::new(name, value);
            cookie.version = version;
            cookies.push(cookie);
        }
        Ok(cookies)
    }

    /// Renders cookies as a single request `Cookie` header value.
    pub fn to_cookie_header<'a>(cookies: impl IntoIterator<Item = &'a Cookie>) -> String {
        let cookies: Vec<&Cookie> = cookies.into_iter().collect();
        let version = cookies.iter().map(|c| c.version).max().unwrap_or(0);

        let mut parts = Vec::with_capacity(cookies.len() + 1);
        if version > 0 {
            parts.push(format!("$Version={version}"));
        }
        for cookie in cookies {
            parts.push(format!("{}={}", cookie.name, cookie.value));
            if version > 0 {
                if let Some(path) = &cookie.path {
                    parts.push(format!("$Path={path}"));
                }
                if let Some(domain) = &cookie.domain {
                    parts.push(format!("$Domain={domain}"));
                }
            }
        }
        parts.join("; ")
    }
}

impl PartialEq for Cookie {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value
    }
}

impl Eq for Cookie {}

impl PartialOrd for Cookie {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cookie {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.value.cmp(&other.value))
    }
}

fn split_pair(pair: &str) -> Option<(&str, &str)> {
    pair.split_once('=').map(|(k, v)| (k.trim(), v.trim()))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn parse_version(value: &str) -> Result<u8, CookieError> {
    match value {
        "0" => Ok(0),
        "1" => Ok(1),
        other => Err(CookieError::InvalidVersion(other.to_string())),
    }
}

/// Last instant an HTTP date can express (9999-12-31T23:59:59Z).
const LATEST_EXPIRY_SECS: u64 = 253_402_300_799;

fn expires_after(created: SystemTime, max_age: u64) -> SystemTime {
    let latest = UNIX_EPOCH + Duration::from_secs(LATEST_EXPIRY_SECS);
    created
        .checked_add(Duration::from_secs(max_age))
        .map_or(latest, |at| at.min(latest))
}
