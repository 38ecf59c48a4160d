use super::pool::Pooled;
use crate::codec::{DecoderLimits, MessageCodec, Role};
use crate::message::{Request, Response};
use crate::{Result, WireError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use http::{StatusCode, Uri};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

/// Byte stream a connection runs over. TLS or any other wrapper fits here.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Connection reuse key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    scheme: String,
    host: String,
    port: u16,
}

impl Destination {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into().to_ascii_lowercase(),
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Derives the destination of an absolute URI, filling in the scheme's default port.
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| WireError::InvalidUri(format!("{uri}: not an absolute URI")))?;
        let host = uri
            .host()
            .ok_or_else(|| WireError::InvalidUri(format!("{uri}: missing host")))?;
        let port = match (uri.port_u16(), scheme) {
            (Some(port), _) => port,
            (None, s) if s.eq_ignore_ascii_case("http") => 80,
            (None, s) if s.eq_ignore_ascii_case("https") => 443,
            (None, s) => return Err(WireError::Unsupported(format!("scheme {s}"))),
        };
        Ok(Self::new(scheme, host, port))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host as written in the URI; IPv6 literals keep their brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Opens transports to destinations.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, destination: &Destination) -> Result<BoxedTransport>;
}

/// Plain TCP connector for `http` destinations.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, destination: &Destination) -> Result<BoxedTransport> {
        if destination.scheme() != "http" {
            return Err(WireError::Unsupported(format!(
                "{} needs a connector that provides the transport",
                destination.scheme()
            )));
        }
        let host = destination.host().trim_start_matches('[').trim_end_matches(']');
        let stream = TcpStream::connect((host, destination.port())).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One client transport with its codec.
///
/// At most one request is in flight at a time. The connection marks itself closed
/// when a response or an error means the byte stream cannot carry another exchange.
pub struct ClientConnection {
    id: ConnectionId,
    destination: Destination,
    framed: Framed<BoxedTransport, MessageCodec>,
    in_flight: bool,
    closed: bool,
    last_used: Instant,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, destination: Destination, transport: BoxedTransport, limits: DecoderLimits) -> Self {
        Self {
            id,
            destination,
            framed: Framed::new(transport, MessageCodec::with_limits(Role::Client, limits)),
            in_flight: false,
            closed: false,
            last_used: Instant::now(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Writes one request.
    pub async fn send(&mut self, request: Request, write_timeout: Duration) -> Result<()> {
        if self.closed {
            return Err(WireError::ConnectionClosed);
        }
        self.in_flight = true;
        self.last_used = Instant::now();
        match timeout(write_timeout, self.framed.send(request)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.closed = true;
                Err(e.into())
            }
            Err(_) => {
                self.closed = true;
                Err(WireError::Timeout("Write timeout".to_string()))
            }
        }
    }

    /// Reads the final response to the request in flight, skipping interim 1xx
    /// responses. `read_timeout` bounds each wait for more bytes.
    pub async fn receive(&mut self, read_timeout: Duration) -> Result<Response> {
        loop {
            let next = match timeout(read_timeout, self.framed.next()).await {
                Ok(next) => next,
                Err(_) => {
                    self.closed = true;
                    return Err(WireError::Timeout(format!(
                        "no response within {}ms",
                        read_timeout.as_millis()
                    )));
                }
            };
            let response = match next {
                Some(Ok(message)) => match message.into_response() {
                    Some(response) => response,
                    None => {
                        self.closed = true;
                        return Err(WireError::Unsupported("request received on a client connection".to_string()));
                    }
                },
                Some(Err(e)) => {
                    self.closed = true;
                    return Err(e.into());
                }
                None => {
                    self.closed = true;
                    return Err(WireError::ConnectionClosed);
                }
            };

            self.last_used = Instant::now();
            if response.status().is_informational() && response.status() != StatusCode::SWITCHING_PROTOCOLS {
                trace!(id = %self.id, status = response.status().as_u16(), "skipping interim response");
                continue;
            }

            self.in_flight = false;
            if !response.keep_alive()
                || !self.framed.codec().is_reusable()
                || response.status() == StatusCode::SWITCHING_PROTOCOLS
            {
                debug!(id = %self.id, "connection cannot be reused");
                self.closed = true;
            }
            return Ok(response);
        }
    }
}

impl Pooled for ClientConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn destination(&self) -> &Destination {
        &self.destination
    }

    fn is_reusable(&self) -> bool {
        !self.closed && !self.in_flight && self.framed.codec().is_reusable()
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("in_flight", &self.in_flight)
            .field("closed", &self.closed)
            .finish()
    }
}
