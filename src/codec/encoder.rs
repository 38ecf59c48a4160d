//! One-shot message encoding.
//!
//! Encoding assumes the whole body is already materialized and writes it verbatim;
//! framing headers (`Content-Length`, `Transfer-Encoding`) are whatever the message
//! carries.

use super::CodecError;
use crate::message::{Body, Cookie, Request, Response};
use bytes::{BufMut, BytesMut};
use http::header::{COOKIE, HeaderMap, SET_COOKIE};
use http::Version;

pub fn encode_request(request: &Request, dst: &mut BytesMut) -> Result<(), CodecError> {
    let version = version_str(request.version())?;
    let target = request.target();
    dst.reserve(head_size(request.headers()) + target.len() + request.body().len() + 32);

    dst.put_slice(request.method().as_str().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(target.as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(version.as_bytes());
    dst.put_slice(b"\r\n");

    put_headers(request.headers(), dst);
    if !request.cookies().is_empty() {
        put_header(COOKIE.as_str(), Cookie::to_cookie_header(request.cookies()).as_bytes(), dst);
    }
    dst.put_slice(b"\r\n");
    put_body(request.body(), dst);
    Ok(())
}

pub fn encode_response(response: &Response, dst: &mut BytesMut) -> Result<(), CodecError> {
    let version = version_str(response.version())?;
    dst.reserve(head_size(response.headers()) + response.body().len() + 32);

    dst.put_slice(version.as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(response.status().as_str().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(response.reason().as_bytes());
    dst.put_slice(b"\r\n");

    put_headers(response.headers(), dst);
    for cookie in response.cookies() {
        put_header(SET_COOKIE.as_str(), cookie.to_set_cookie().as_bytes(), dst);
    }
    dst.put_slice(b"\r\n");
    put_body(response.body(), dst);
    Ok(())
}

fn version_str(version: Version) -> Result<&'static str, CodecError> {
    match version {
        Version::HTTP_11 => Ok("HTTP/1.1"),
        Version::HTTP_10 => Ok("HTTP/1.0"),
        other => Err(CodecError::UnsupportedVersion(format!("{other:?}"))),
    }
}

fn head_size(headers: &HeaderMap) -> usize {
    headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len() + 4)
        .sum()
}

/// Multi-valued headers become one line per value.
fn put_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        put_header(name.as_str(), value.as_bytes(), dst);
    }
}

fn put_header(name: &str, value: &[u8], dst: &mut BytesMut) {
    dst.put_slice(name.as_bytes());
    dst.put_slice(b": ");
    dst.put_slice(value);
    dst.put_slice(b"\r\n");
}

fn put_body(body: &Body, dst: &mut BytesMut) {
    match body {
        Body::Empty => {}
        Body::Full(bytes) => dst.put_slice(bytes),
        Body::Streamed(pieces) => {
            for piece in pieces {
                dst.put_slice(piece);
            }
        }
    }
}
