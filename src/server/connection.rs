//! Per-connection driver.
//!
//! One task owns the framed transport. It reads requests while the pipeline has room,
//! hands each to the service on its own task, and writes responses as the pipeline
//! releases them, so responses leave in request order even when handlers finish out of
//! order.

use super::config::ServerConfig;
use super::limits::ServerMetrics;
use super::pipeline::{RequestId, RequestPipeline};
use super::service::{ErrorResponseFormatter, HttpService, ServiceContext, SessionIdentifier, needs_error_body};
use crate::codec::{CodecError, MessageCodec, Role};
use crate::message::{Body, Message, Request, Response, negotiate_keep_alive};
use crate::session::SessionStore;
use futures::{FutureExt, SinkExt, Stream, StreamExt};
use http::header::{CONNECTION, CONTENT_LENGTH, DATE, HeaderValue, SERVER, TRANSFER_ENCODING};
use http::{Method, StatusCode, Version};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::codec::Framed;
use tracing::{Instrument, Span, debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Write timeout")]
    WriteTimeout,
    #[error("Response could not be encoded: {0}")]
    Encode(CodecError),
}

impl From<CodecError> for ConnectionError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => ConnectionError::Io(e),
            other => ConnectionError::Encode(other),
        }
    }
}

/// State shared by every connection of one server.
pub(crate) struct ServerShared<S> {
    pub(crate) config: ServerConfig,
    pub(crate) service: S,
    pub(crate) sessions: SessionStore,
    pub(crate) identifier: Arc<dyn SessionIdentifier>,
    pub(crate) formatter: Arc<dyn ErrorResponseFormatter>,
    pub(crate) metrics: Arc<ServerMetrics>,
}

/// A finished response and whether the connection ends after it.
#[derive(Debug)]
pub(crate) struct Reply {
    pub(crate) response: Response,
    pub(crate) close: bool,
}

/// What the response framing depends on from the request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Exchange {
    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
    pub(crate) head: bool,
}

impl Exchange {
    pub(crate) fn of(request: &Request) -> Self {
        Self {
            version: request.version(),
            keep_alive: request.keep_alive(),
            head: request.method() == Method::HEAD,
        }
    }

    /// For responses to input that never became a request.
    fn failed() -> Self {
        Self {
            version: Version::HTTP_11,
            keep_alive: false,
            head: false,
        }
    }
}

/// Serves requests on `io` until the peer leaves, a response closes the connection,
/// or the connection sits idle for `read_timeout`.
pub(crate) async fn serve_connection<T, S>(
    io: T,
    peer_addr: SocketAddr,
    shared: Arc<ServerShared<S>>,
) -> Result<(), ConnectionError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
    S: HttpService,
{
    let config = &shared.config;
    let codec = MessageCodec::with_limits(Role::Server, config.limits.clone());
    let (mut sink, mut stream) = Framed::new(io, codec).split::<Response>();

    let (released_tx, mut released_rx) = mpsc::unbounded_channel::<(RequestId, Reply)>();
    let pipeline = Arc::new(RequestPipeline::new(config.max_pipeline_depth.max(1), released_tx));
    let mut handlers = JoinSet::new();
    let (drained_tx, mut drained_rx) = oneshot::channel::<()>();
    let mut drained_tx = Some(drained_tx);
    let mut reading = true;
    let mut next_id: RequestId = 0;

    let idle = sleep(config.read_timeout);
    tokio::pin!(idle);

    let result = loop {
        tokio::select! {
            biased;

            Some((id, reply)) = released_rx.recv() => {
                let status = reply.response.status();
                match timeout(config.write_timeout, sink.send(reply.response)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e.into()),
                    Err(_) => {
                        warn!(%peer_addr, "Write timeout");
                        break Err(ConnectionError::WriteTimeout);
                    }
                }
                shared.metrics.response_sent();
                debug!(id, status = status.as_u16(), close = reply.close, "Response sent");
                if reply.close {
                    break Ok(());
                }
                if pipeline.depth() == 0 {
                    idle.as_mut().reset(Instant::now() + config.read_timeout);
                }
            }
            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = joined {
                    debug!(error = %e, "Handler task ended abnormally");
                }
            }
            _ = &mut drained_rx, if !reading => break Ok(()),
            () = &mut idle, if reading && pipeline.depth() == 0 => {
                warn!(%peer_addr, "Read timeout");
                break Ok(());
            }
            next = next_request(&mut stream, &pipeline), if reading => {
                let id = next_id;
                next_id += 1;
                match next {
                    Some(Ok(Message::Request(request))) => {
                        shared.metrics.request_received();
                        debug!(id, method = %request.method(), uri = %request.uri(), "Request received");
                        if !request.keep_alive() {
                            reading = false;
                        }
                        if !pipeline.admit(id) {
                            shared.metrics.pipeline_rejected();
                            let response = Response::new(StatusCode::SERVICE_UNAVAILABLE);
                            pipeline.complete(id, finish_response(&shared, response, Exchange::failed()));
                            reading = false;
                        } else {
                            let shared = shared.clone();
                            let pipeline = pipeline.clone();
                            handlers.spawn(
                                handle_request(request, id, peer_addr, shared, pipeline).instrument(Span::current()),
                            );
                        }
                        idle.as_mut().reset(Instant::now() + config.read_timeout);
                    }
                    Some(Ok(Message::Response(_))) => {
                        reading = false;
                    }
                    Some(Err(e)) if e.is_io() => break Err(e.into()),
                    Some(Err(e)) => {
                        shared.metrics.decode_failed();
                        warn!(%peer_addr, error = %e, "Malformed request");
                        let response = Response::new(e.status_code());
                        pipeline.complete(id, finish_response(&shared, response, Exchange::failed()));
                        reading = false;
                    }
                    None => {
                        info!(%peer_addr, "Client closed connection");
                        reading = false;
                    }
                }
                if !reading {
                    if let Some(tx) = drained_tx.take() {
                        pipeline.run_when_empty(move || {
                            let _ = tx.send(());
                        });
                    }
                }
            }
        }
    };

    pipeline.dispose_all();
    handlers.abort_all();
    let _ = timeout(config.write_timeout, sink.close()).await;
    result
}

async fn next_request<S>(stream: &mut S, pipeline: &RequestPipeline<Reply>) -> Option<Result<Message, CodecError>>
where
    S: Stream<Item = Result<Message, CodecError>> + Unpin,
{
    pipeline.wait_for_capacity().await;
    stream.next().await
}

async fn handle_request<S: HttpService>(
    request: Request,
    id: RequestId,
    peer_addr: SocketAddr,
    shared: Arc<ServerShared<S>>,
    pipeline: Arc<RequestPipeline<Reply>>,
) {
    let exchange = Exchange::of(&request);
    let ctx = ServiceContext::with_sessions(request, peer_addr, shared.sessions.clone(), shared.identifier.as_ref());

    let mut response = match AssertUnwindSafe(shared.service.handle(&ctx)).catch_unwind().await {
        Ok(response) => response,
        Err(_) => {
            error!(id, "Service panicked");
            Response::new(StatusCode::INTERNAL_SERVER_ERROR)
        }
    };
    apply_session(shared.identifier.as_ref(), &ctx, &mut response);
    pipeline.complete(id, finish_response(&shared, response, exchange));
}

/// Sends the key of a newly bound session, or withdraws the key of one the handler
/// destroyed.
pub(crate) fn apply_session(identifier: &dyn SessionIdentifier, ctx: &ServiceContext, response: &mut Response) {
    let Some(session) = ctx.touched_session() else {
        return;
    };
    let presented = ctx.requested_session_key() == Some(session.key());
    if session.is_valid() {
        if !presented {
            identifier.attach(session.key(), response);
        }
        session.set_attached(true);
    } else if presented {
        identifier.detach(response);
    }
}

/// Puts the framing headers in order and decides whether the connection survives.
pub(crate) fn finish_response<S>(shared: &ServerShared<S>, mut response: Response, exchange: Exchange) -> Reply {
    if needs_error_body(&response) {
        shared.formatter.format(&mut response);
    }

    let headers = response.headers_mut();
    if let Some(name) = &shared.config.server_name {
        if !headers.contains_key(SERVER) {
            if let Ok(value) = HeaderValue::from_str(name) {
                headers.insert(SERVER, value);
            }
        }
    }
    if !headers.contains_key(DATE) {
        if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
            headers.insert(DATE, value);
        }
    }
    headers.remove(TRANSFER_ENCODING);
    response.set_version(exchange.version);

    if response.allows_message_body() {
        let body = match response.body() {
            Body::Streamed(_) => Body::from(response.body().to_bytes()),
            other => other.clone(),
        };
        response.set_body(body);
    } else {
        response.set_body(Body::Empty);
        response.headers_mut().remove(CONTENT_LENGTH);
    }

    // The service can only force closure with an explicit `close` token.
    let close = !exchange.keep_alive
        || response.forces_connection_closure()
        || !negotiate_keep_alive(Version::HTTP_11, response.headers());
    if close {
        response.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
    } else if exchange.version == Version::HTTP_10 {
        response.headers_mut().insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    }

    if exchange.head {
        let headers = std::mem::take(response.headers_mut());
        response.set_body(Body::Empty);
        *response.headers_mut() = headers;
    }
    Reply { response, close }
}
