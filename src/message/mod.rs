//! HTTP message model.
//!
//! Requests and responses share a version, an ordered multi-valued header map, a set of
//! cookies and a body. The codec produces and consumes [`Message`] values; the client
//! engine and the server work with [`Request`] and [`Response`] directly.

pub mod cookie;
pub mod request;
pub mod response;


use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, HeaderMap};
use http::Version;
use std::collections::BTreeSet;

pub use cookie::{Cookie, CookieError};
pub use request::{Parameters, Request, RequestBuilder};
pub use response::{Response, ResponseBuilder, StatusCategory};

/// A decoded or to-be-encoded HTTP message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn version(&self) -> Version {
        match self {
            Message::Request(r) => r.version(),
            Message::Response(r) => r.version(),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        match self {
            Message::Request(r) => r.headers(),
            Message::Response(r) => r.headers(),
        }
    }

    pub fn cookies(&self) -> &BTreeSet<Cookie> {
        match self {
            Message::Request(r) => r.cookies(),
            Message::Response(r) => r.cookies(),
        }
    }

    pub fn body(&self) -> &Body {
        match self {
            Message::Request(r) => r.body(),
            Message::Response(r) => r.body(),
        }
    }

    /// Whether the peer negotiated a persistent connection for this message.
    pub fn keep_alive(&self) -> bool {
        match self {
            Message::Request(r) => r.keep_alive(),
            Message::Response(r) => r.keep_alive(),
        }
    }

    pub fn into_request(self) -> Option<Request> {
        match self {
            Message::Request(r) => Some(r),
            Message::Response(_) => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            Message::Response(r) => Some(r),
            Message::Request(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

/// Message body.
///
/// `Full` carries a body whose length was known up front (`Content-Length`);
/// `Streamed` carries the pieces of a body delimited by chunked transfer-coding or by
/// connection closure, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Body {
    #[default]
    Empty,
    Full(Bytes),
    Streamed(Vec<Bytes>),
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Body::Empty => 0,
            Body::Full(bytes) => bytes.len(),
            Body::Streamed(chunks) => chunks.iter().map(Bytes::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the body as one contiguous buffer, copying only for streamed bodies
    /// made of more than one piece.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Body::Empty => Bytes::new(),
            Body::Full(bytes) => bytes.clone(),
            Body::Streamed(chunks) if chunks.len() == 1 => chunks[0].clone(),
            Body::Streamed(chunks) => {
                let mut buf = BytesMut::with_capacity(self.len());
                for chunk in chunks {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() { Body::Empty } else { Body::Full(bytes) }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Bytes::from_static(bytes).into()
    }
}

/// Returns the first value of `name` when it is valid visible ASCII.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: impl http::header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Persistent-connection negotiation: explicit `Connection` tokens win, otherwise
/// HTTP/1.1 defaults to keep-alive and HTTP/1.0 to close.
pub(crate) fn negotiate_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let mut keep_alive = None;
    for value in headers.get_all(CONNECTION) {
        let Ok(value) = value.to_str() else { continue };
        for token in value.split(',').map(str::trim) {
            if token.eq_ignore_ascii_case("close") {
                return false;
            }
            if token.eq_ignore_ascii_case("keep-alive") {
                keep_alive = Some(true);
            }
        }
    }
    keep_alive.unwrap_or(version == Version::HTTP_11)
}
