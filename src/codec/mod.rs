//! Incremental HTTP/1.x codec.
//!
//! [`MessageCodec`] implements `tokio_util`'s [`Decoder`] and [`Encoder`], so a
//! connection is simply `Framed<Transport, MessageCodec>`. Decoding is driven by the
//! explicit [`DecodingState`] machine in [`state`]; bytes may arrive in any
//! fragmentation and a state that lacks input leaves it in the read buffer until the
//! next call.
//!
//! ```text
//!  StartLine ──► Headers ──┬──► FixedBody ───────────────────────────┐
//!                          ├──► ChunkSize ◄──► ChunkData ► DataEnd    │
//!                          │        └──(size 0)──► ChunkTrailer ──────┤
//!                          ├──► UntilClose ──(eof)────────────────────┤
//!                          └──(no body)───────────────────────────────┴──► StartLine
//! ```

pub mod encoder;
pub mod state;


use crate::message::{Body, CookieError, Message, Request, Response};
use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};
use std::collections::VecDeque;
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

pub use state::{DecodingState, Fragment, Framing, Step, StepContext};

/// Which side of the exchange a codec serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Decodes requests, encodes responses.
    Server,
    /// Decodes responses, encodes requests.
    Client,
}

/// Bounds applied while decoding.
#[derive(Debug, Clone)]
pub struct DecoderLimits {
    /// Longest start line, header line or chunk-size line accepted
    pub max_line_length: usize,
    /// Maximum number of header (and trailer) lines per message
    pub max_headers: usize,
    /// Maximum body size, whatever the framing
    pub max_body_size: usize,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self {
            max_line_length: 8 * 1024,
            max_headers: 100,
            max_body_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

/// Classified codec failures.
///
/// Anything but [`CodecError::Io`] means the peer sent something this codec cannot
/// make sense of; the connection must not be reused afterwards.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid start line: {0}")]
    InvalidStartLine(String),
    #[error("start line exceeds {0} bytes")]
    StartLineTooLong(usize),
    #[error("invalid method: {0}")]
    InvalidMethod(String),
    #[error("invalid request target: {0}")]
    InvalidTarget(String),
    #[error("unsupported HTTP version: {0}")]
    UnsupportedVersion(String),
    #[error("invalid status code: {0}")]
    InvalidStatus(String),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("header line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("more than {0} header lines")]
    TooManyHeaders(usize),
    #[error("invalid content length: {0}")]
    InvalidContentLength(String),
    #[error("unsupported transfer coding: {0}")]
    UnsupportedTransferCoding(String),
    #[error("body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("invalid chunk size line")]
    InvalidChunkSize,
    #[error("missing CRLF after chunk data")]
    MissingCrlf,
    #[error("invalid cookie version: {0}")]
    InvalidCookieVersion(String),
    #[error("invalid cookie: {0}")]
    InvalidCookie(String),
    #[error("connection closed in the middle of a message")]
    UnexpectedEof,
    #[error("decoder is unusable after an earlier failure")]
    Poisoned,
}

impl CodecError {
    /// Status a server answers with when a request fails to decode.
    pub fn status_code(&self) -> StatusCode {
        match self {
            CodecError::StartLineTooLong(_) => StatusCode::URI_TOO_LONG,
            CodecError::UnsupportedVersion(_) => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            CodecError::UnsupportedTransferCoding(_) => StatusCode::NOT_IMPLEMENTED,
            CodecError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// True for transport failures as opposed to malformed input.
    pub fn is_io(&self) -> bool {
        matches!(self, CodecError::Io(_))
    }
}

impl From<CookieError> for CodecError {
    fn from(err: CookieError) -> Self {
        match err {
            CookieError::InvalidVersion(v) => CodecError::InvalidCookieVersion(v),
            CookieError::Malformed(v) => CodecError::InvalidCookie(v),
        }
    }
}

/// Body assembly for the message currently being decoded.
#[derive(Debug)]
struct Assembly {
    message: Message,
    framing: Framing,
    pieces: Vec<Bytes>,
    received: usize,
}

/// Per-connection HTTP/1.x codec.
#[derive(Debug)]
pub struct MessageCodec {
    role: Role,
    limits: DecoderLimits,
    state: DecodingState,
    assembly: Option<Assembly>,
    fragments: Vec<Fragment>,
    /// Methods of requests sent but not yet answered, oldest first (client role).
    outstanding: VecDeque<Method>,
    /// Set once a close-delimited body or a decode failure makes the stream unusable.
    exhausted: bool,
}

impl MessageCodec {
    pub fn new(role: Role) -> Self {
        Self::with_limits(role, DecoderLimits::default())
    }

    pub fn with_limits(role: Role, limits: DecoderLimits) -> Self {
        Self {
            role,
            limits,
            state: DecodingState::StartLine,
            assembly: None,
            fragments: Vec::new(),
            outstanding: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &DecodingState {
        &self.state
    }

    /// Whether the byte stream can carry another message: no decode failure, no
    /// close-delimited body, and no partially decoded message.
    pub fn is_reusable(&self) -> bool {
        !self.exhausted && self.state.is_idle() && self.assembly.is_none()
    }

    fn fail(&mut self, err: CodecError) -> CodecError {
        self.state = DecodingState::Failed;
        self.assembly = None;
        self.fragments.clear();
        self.exhausted = true;
        err
    }

    /// Folds produced fragments into the current assembly, returning a message once
    /// its end fragment has been seen.
    fn absorb(&mut self) -> Result<Option<Message>, CodecError> {
        let mut done = None;
        for fragment in self.fragments.drain(..) {
            match fragment {
                Fragment::Head(message, framing) => {
                    trace!(?framing, "decoded message head");
                    self.assembly = Some(Assembly {
                        message,
                        framing,
                        pieces: Vec::new(),
                        received: 0,
                    });
                }
                Fragment::Content(bytes) => {
                    let Some(assembly) = self.assembly.as_mut() else { continue };
                    assembly.received += bytes.len();
                    if assembly.received > self.limits.max_body_size {
                        return Err(CodecError::BodyTooLarge(self.limits.max_body_size));
                    }
                    assembly.pieces.push(bytes);
                }
                Fragment::End => {
                    if let Some(assembly) = self.assembly.take() {
                        done = Some(assembly);
                    }
                }
            }
        }

        let Some(assembly) = done else { return Ok(None) };
        if assembly.framing == Framing::UntilClose {
            self.exhausted = true;
        }
        let body = match assembly.framing {
            _ if assembly.received == 0 => Body::Empty,
            Framing::Length(_) if assembly.pieces.len() == 1 => {
                Body::Full(assembly.pieces.into_iter().next().unwrap_or_default())
            }
            Framing::Length(_) => Body::Full(Body::Streamed(assembly.pieces).to_bytes()),
            _ => Body::Streamed(assembly.pieces),
        };

        let message = match assembly.message {
            Message::Request(mut request) => {
                request.set_body(body);
                Message::Request(request)
            }
            Message::Response(mut response) => {
                if !response.status().is_informational() {
                    self.outstanding.pop_front();
                }
                replace_response_body(&mut response, body);
                Message::Response(response)
            }
        };
        Ok(Some(message))
    }
}

/// Sets a decoded body without touching the headers as received.
fn replace_response_body(response: &mut Response, body: Body) {
    let headers = std::mem::take(response.headers_mut());
    response.set_body(body);
    *response.headers_mut() = headers;
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        loop {
            let state = std::mem::take(&mut self.state);
            let ctx = StepContext {
                role: self.role,
                limits: &self.limits,
                head_response: self.outstanding.front() == Some(&Method::HEAD),
            };
            let step = match state.step(&ctx, src, &mut self.fragments) {
                Ok(step) => step,
                Err(err) => return Err(self.fail(err)),
            };
            let (next, need_more) = match step {
                Step::Next(next) => (next, false),
                Step::NeedMore(next) => (next, true),
            };
            self.state = next;

            match self.absorb() {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) if need_more => return Ok(None),
                Ok(None) => {}
                Err(err) => return Err(self.fail(err)),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        match self.state {
            DecodingState::UntilClose => {
                self.fragments.push(Fragment::End);
                self.state = DecodingState::StartLine;
                match self.absorb() {
                    Ok(message) => Ok(message),
                    Err(err) => Err(self.fail(err)),
                }
            }
            DecodingState::StartLine if src.iter().all(|b| b.is_ascii_whitespace()) => {
                src.clear();
                Ok(None)
            }
            _ => Err(self.fail(CodecError::UnexpectedEof)),
        }
    }
}

impl Encoder<Request> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), CodecError> {
        encoder::encode_request(&request, dst)?;
        if self.role == Role::Client {
            self.outstanding.push_back(request.method().clone());
        }
        Ok(())
    }
}

impl Encoder<Response> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, response: Response, dst: &mut BytesMut) -> Result<(), CodecError> {
        encoder::encode_response(&response, dst)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        match message {
            Message::Request(request) => self.encode(request, dst),
            Message::Response(response) => self.encode(response, dst),
        }
    }
}
