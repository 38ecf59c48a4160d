//! Decoding states and their transition function.
//!
//! Every state consumes one grammar unit from the front of the input buffer and
//! either moves on ([`Step::Next`]) or asks for more bytes ([`Step::NeedMore`]).
//! Partially received units stay in the input buffer, so a state never needs to
//! carry its own copy of them between calls.

use super::{CodecError, DecoderLimits, Role};
use crate::message::response::allows_body;
use crate::message::{Cookie, CookieError, Message, Request, Response};
use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, COOKIE, HeaderMap, HeaderName, HeaderValue, SET_COOKIE, TRANSFER_ENCODING};
use http::{Method, StatusCode, Uri, Version};

/// A piece of a message produced by a state transition.
#[derive(Debug)]
pub enum Fragment {
    /// Start line and headers, with an empty body.
    Head(Message, Framing),
    /// A run of body bytes.
    Content(Bytes),
    /// The message is complete.
    End,
}

/// How the body of the message in flight is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Facts a transition needs that live outside the state itself.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub role: Role,
    pub limits: &'a DecoderLimits,
    /// The response being decoded answers a HEAD request.
    pub head_response: bool,
}

/// Outcome of one transition.
#[derive(Debug)]
pub enum Step {
    Next(DecodingState),
    NeedMore(DecodingState),
}

/// Start line fields gathered before the header block is complete.
#[derive(Debug, Clone)]
pub enum StartLine {
    Request {
        method: Method,
        uri: Uri,
        version: Version,
    },
    Response {
        version: Version,
        status: StatusCode,
        reason: String,
    },
}

/// A header block under construction.
#[derive(Debug, Clone)]
pub struct PartialHead {
    start: StartLine,
    lines: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub enum DecodingState {
    #[default]
    StartLine,
    Headers(PartialHead),
    FixedBody { length: usize },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    ChunkTrailer { lines: usize },
    UntilClose,
    Failed,
}

impl DecodingState {
    /// Runs one transition, appending any produced fragments to `out`.
    pub fn step(
        self,
        ctx: &StepContext<'_>,
        src: &mut BytesMut,
        out: &mut Vec<Fragment>,
    ) -> Result<Step, CodecError> {
        match self {
            DecodingState::StartLine => start_line(ctx, src),
            DecodingState::Headers(head) => header_line(ctx, head, src, out),
            DecodingState::FixedBody { length } => fixed_body(length, src, out),
            DecodingState::ChunkSize => chunk_size(ctx, src),
            DecodingState::ChunkData { remaining } => chunk_data(remaining, src, out),
            DecodingState::ChunkDataEnd => chunk_data_end(src),
            DecodingState::ChunkTrailer { lines } => chunk_trailer(ctx, lines, src, out),
            DecodingState::UntilClose => {
                if !src.is_empty() {
                    out.push(Fragment::Content(src.split().freeze()));
                }
                Ok(Step::NeedMore(DecodingState::UntilClose))
            }
            DecodingState::Failed => Err(CodecError::Poisoned),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, DecodingState::StartLine)
    }
}

/// Splits one LF-terminated line off `src`, without its CRLF/LF terminator.
fn take_line(src: &mut BytesMut, max: usize) -> Result<Option<BytesMut>, usize> {
    match src.iter().position(|&b| b == b'\n') {
        Some(pos) if pos > max => Err(max),
        Some(pos) => {
            let mut line = src.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            Ok(Some(line))
        }
        None if src.len() > max => Err(max),
        None => Ok(None),
    }
}

fn start_line(ctx: &StepContext<'_>, src: &mut BytesMut) -> Result<Step, CodecError> {
    loop {
        let line = match take_line(src, ctx.limits.max_line_length) {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(Step::NeedMore(DecodingState::StartLine)),
            Err(max) => return Err(CodecError::StartLineTooLong(max)),
        };
        // Robust servers ignore empty lines before a request line.
        if line.is_empty() {
            continue;
        }
        let text = std::str::from_utf8(&line)
            .map_err(|_| CodecError::InvalidStartLine(String::from_utf8_lossy(&line).into_owned()))?;
        let start = match ctx.role {
            Role::Server => parse_request_line(text)?,
            Role::Client => parse_status_line(text)?,
        };
        return Ok(Step::Next(DecodingState::Headers(PartialHead {
            start,
            lines: Vec::new(),
        })));
    }
}

fn parse_request_line(line: &str) -> Result<StartLine, CodecError> {
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CodecError::InvalidStartLine(line.to_string()));
    };

    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| CodecError::InvalidMethod(method.to_string()))?;
    if target.is_empty() {
        return Err(CodecError::InvalidTarget(target.to_string()));
    }
    let uri = Uri::try_from(target).map_err(|_| CodecError::InvalidTarget(target.to_string()))?;
    let version = parse_version(version)?;
    Ok(StartLine::Request { method, uri, version })
}

fn parse_status_line(line: &str) -> Result<StartLine, CodecError> {
    let mut parts = line.splitn(3, ' ');
    let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
        return Err(CodecError::InvalidStartLine(line.to_string()));
    };
    let reason = parts.next().unwrap_or_default().trim().to_string();

    let version = parse_version(version)?;
    if status.len() != 3 {
        return Err(CodecError::InvalidStatus(status.to_string()));
    }
    let status = StatusCode::from_bytes(status.as_bytes())
        .map_err(|_| CodecError::InvalidStatus(status.to_string()))?;
    Ok(StartLine::Response { version, status, reason })
}

fn parse_version(version: &str) -> Result<Version, CodecError> {
    match version {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        other => Err(CodecError::UnsupportedVersion(other.to_string())),
    }
}

fn header_line(
    ctx: &StepContext<'_>,
    mut head: PartialHead,
    src: &mut BytesMut,
    out: &mut Vec<Fragment>,
) -> Result<Step, CodecError> {
    loop {
        let line = match take_line(src, ctx.limits.max_line_length) {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(Step::NeedMore(DecodingState::Headers(head))),
            Err(max) => return Err(CodecError::LineTooLong(max)),
        };
        if line.is_empty() {
            return finish_head(ctx, head, out);
        }

        let text = std::str::from_utf8(&line)
            .map_err(|_| CodecError::InvalidHeader(String::from_utf8_lossy(&line).into_owned()))?;

        // obs-fold: a continuation line extends the previous value.
        if text.starts_with([' ', '\t']) {
            let Some((_, value)) = head.lines.last_mut() else {
                return Err(CodecError::InvalidHeader(text.to_string()));
            };
            let extra = text.trim();
            if !extra.is_empty() {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(extra);
            }
            continue;
        }

        let Some((name, value)) = text.split_once(':') else {
            return Err(CodecError::InvalidHeader(text.to_string()));
        };
        if name.is_empty() || name.ends_with([' ', '\t']) {
            return Err(CodecError::InvalidHeader(text.to_string()));
        }
        if head.lines.len() >= ctx.limits.max_headers {
            return Err(CodecError::TooManyHeaders(ctx.limits.max_headers));
        }
        head.lines.push((name.to_string(), value.trim().to_string()));
    }
}

/// Builds the message head and picks the body state.
fn finish_head(ctx: &StepContext<'_>, head: PartialHead, out: &mut Vec<Fragment>) -> Result<Step, CodecError> {
    let mut headers = HeaderMap::with_capacity(head.lines.len());
    for (name, value) in head.lines {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| CodecError::InvalidHeader(name.clone()))?;
        let header_value = HeaderValue::from_bytes(value.as_bytes())
            .map_err(|_| CodecError::InvalidHeader(format!("{name}: {value}")))?;
        headers.append(header_name, header_value);
    }

    let chunked = is_chunked(&headers);
    let length = content_length(&headers)?;

    let (message, framing) = match head.start {
        StartLine::Request { method, uri, version } => {
            if !chunked && headers.contains_key(TRANSFER_ENCODING) {
                return Err(CodecError::UnsupportedTransferCoding(transfer_codings(&headers)));
            }
            let mut request =
                Request::new(method, uri).map_err(|e| CodecError::InvalidTarget(e.to_string()))?;
            request.set_version(version);
            for cookie in take_cookies(&mut headers, COOKIE, Cookie::parse_cookie_header)? {
                request.cookies_mut().insert(cookie);
            }
            *request.headers_mut() = headers;

            let framing = match (chunked, length) {
                (true, _) => Framing::Chunked,
                (false, Some(0)) | (false, None) => Framing::Empty,
                (false, Some(n)) => Framing::Length(n),
            };
            (Message::Request(request), framing)
        }
        StartLine::Response { version, status, reason } => {
            let mut response = Response::new(status);
            response.set_version(version);
            response.set_reason(reason);
            let set_cookies = take_cookies(&mut headers, SET_COOKIE, |v| Cookie::parse_set_cookie(v).map(|c| vec![c]))?;
            for cookie in set_cookies {
                response.cookies_mut().insert(cookie);
            }
            *response.headers_mut() = headers;

            let framing = if !allows_body(status) || ctx.head_response {
                Framing::Empty
            } else {
                match (chunked, length) {
                    (true, _) => Framing::Chunked,
                    (false, Some(0)) => Framing::Empty,
                    (false, Some(n)) => Framing::Length(n),
                    (false, None) => Framing::UntilClose,
                }
            };
            (Message::Response(response), framing)
        }
    };

    if let Framing::Length(n) = framing {
        if n > ctx.limits.max_body_size as u64 {
            return Err(CodecError::BodyTooLarge(ctx.limits.max_body_size));
        }
    }

    out.push(Fragment::Head(message, framing));
    let next = match framing {
        Framing::Empty => {
            out.push(Fragment::End);
            DecodingState::StartLine
        }
        // Bounded by max_body_size above, which is a usize.
        Framing::Length(n) => DecodingState::FixedBody { length: n as usize },
        Framing::Chunked => DecodingState::ChunkSize,
        Framing::UntilClose => DecodingState::UntilClose,
    };
    Ok(Step::Next(next))
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|coding| !coding.is_empty())
        .last()
        .is_some_and(|coding| coding.eq_ignore_ascii_case("chunked"))
}

fn transfer_codings(headers: &HeaderMap) -> String {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Declared body length; repeated headers must agree.
fn content_length(headers: &HeaderMap) -> Result<Option<u64>, CodecError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let text = value
            .to_str()
            .map_err(|_| CodecError::InvalidContentLength(format!("{value:?}")))?;
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(CodecError::InvalidContentLength(text.to_string()));
            }
            let n: u64 = part
                .parse()
                .map_err(|_| CodecError::InvalidContentLength(text.to_string()))?;
            match length {
                Some(previous) if previous != n => {
                    return Err(CodecError::InvalidContentLength(text.to_string()));
                }
                _ => length = Some(n),
            }
        }
    }
    Ok(length)
}

fn take_cookies(
    headers: &mut HeaderMap,
    name: HeaderName,
    parse: impl Fn(&str) -> Result<Vec<Cookie>, CookieError>,
) -> Result<Vec<Cookie>, CodecError> {
    let values: Vec<HeaderValue> = headers.get_all(&name).iter().cloned().collect();
    headers.remove(&name);

    let mut cookies = Vec::new();
    for value in values {
        let text = value
            .to_str()
            .map_err(|_| CodecError::InvalidCookie(format!("{value:?}")))?;
        cookies.extend(parse(text)?);
    }
    Ok(cookies)
}

fn fixed_body(length: usize, src: &mut BytesMut, out: &mut Vec<Fragment>) -> Result<Step, CodecError> {
    if src.len() < length {
        src.reserve(length - src.len());
        return Ok(Step::NeedMore(DecodingState::FixedBody { length }));
    }
    out.push(Fragment::Content(src.split_to(length).freeze()));
    out.push(Fragment::End);
    Ok(Step::Next(DecodingState::StartLine))
}

fn chunk_size(ctx: &StepContext<'_>, src: &mut BytesMut) -> Result<Step, CodecError> {
    if let Some(&first) = src.first() {
        if !first.is_ascii_hexdigit() {
            return Err(CodecError::InvalidChunkSize);
        }
    }
    // Only hex digits, spaces and the CR may precede an extension or the line end.
    let mut size_field = src.iter().take_while(|&&b| b != b';' && b != b'\n');
    if size_field.any(|&b| !(b.is_ascii_hexdigit() || b == b' ' || b == b'\r')) {
        return Err(CodecError::InvalidChunkSize);
    }
    match httparse::parse_chunk_size(&src[..]) {
        Ok(httparse::Status::Complete((consumed, size))) => {
            src.advance(consumed);
            if size == 0 {
                Ok(Step::Next(DecodingState::ChunkTrailer { lines: 0 }))
            } else {
                Ok(Step::Next(DecodingState::ChunkData { remaining: size }))
            }
        }
        Ok(httparse::Status::Partial) if src.len() > ctx.limits.max_line_length => {
            Err(CodecError::LineTooLong(ctx.limits.max_line_length))
        }
        Ok(httparse::Status::Partial) => Ok(Step::NeedMore(DecodingState::ChunkSize)),
        Err(httparse::InvalidChunkSize) => Err(CodecError::InvalidChunkSize),
    }
}

fn chunk_data(remaining: u64, src: &mut BytesMut, out: &mut Vec<Fragment>) -> Result<Step, CodecError> {
    if src.is_empty() {
        return Ok(Step::NeedMore(DecodingState::ChunkData { remaining }));
    }
    let take = remaining.min(src.len() as u64) as usize;
    out.push(Fragment::Content(src.split_to(take).freeze()));
    let remaining = remaining - take as u64;
    if remaining == 0 {
        Ok(Step::Next(DecodingState::ChunkDataEnd))
    } else {
        Ok(Step::NeedMore(DecodingState::ChunkData { remaining }))
    }
}

fn chunk_data_end(src: &mut BytesMut) -> Result<Step, CodecError> {
    match src.len() {
        0 => Ok(Step::NeedMore(DecodingState::ChunkDataEnd)),
        1 if src[0] == b'\r' => Ok(Step::NeedMore(DecodingState::ChunkDataEnd)),
        _ if src.starts_with(b"\r\n") => {
            src.advance(2);
            Ok(Step::Next(DecodingState::ChunkSize))
        }
        _ => Err(CodecError::MissingCrlf),
    }
}

/// Skips trailer headers after the last chunk. Trailers are dropped on purpose: the
/// head has already been handed out, so they could not be merged into it.
fn chunk_trailer(
    ctx: &StepContext<'_>,
    mut lines: usize,
    src: &mut BytesMut,
    out: &mut Vec<Fragment>,
) -> Result<Step, CodecError> {
    loop {
        let line = match take_line(src, ctx.limits.max_line_length) {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(Step::NeedMore(DecodingState::ChunkTrailer { lines })),
            Err(max) => return Err(CodecError::LineTooLong(max)),
        };
        if line.is_empty() {
            out.push(Fragment::End);
            return Ok(Step::Next(DecodingState::StartLine));
        }
        lines += 1;
        if lines > ctx.limits.max_headers {
            return Err(CodecError::TooManyHeaders(ctx.limits.max_headers));
        }
    }
}
