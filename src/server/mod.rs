//! HTTP server: accept loop, per-connection driver and the collaborators it calls.
//!
//! Each accepted connection decodes requests with [`MessageCodec`](crate::MessageCodec),
//! admits them to a [`RequestPipeline`], runs the [`HttpService`] for each on its own
//! task, and writes responses back in request order. Sessions referenced by requests
//! are tracked in the server's [`SessionStore`](crate::SessionStore).

pub mod config;
pub mod connection;
pub mod limits;
pub mod listener;
pub mod pipeline;
pub mod service;


pub use config::ServerConfig;
pub use connection::ConnectionError;
pub use limits::{ConnectionGuard, ConnectionTracker, MetricsSnapshot, ServerMetrics};
pub use listener::HttpServer;
pub use pipeline::{PipelineListener, RequestId, RequestPipeline};
pub use service::{
    CookieSessionIdentifier, ErrorResponseFormatter, HttpService, PlainTextErrorFormatter, ServiceContext,
    SessionIdentifier,
};
