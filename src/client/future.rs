use crate::message::Response;
use crate::{Result, WireError};
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Caller-side handle for a request sent with [`HttpClient::send`](super::HttpClient::send).
///
/// Resolves exactly once, with the final response or the failure that ended the
/// exchange. Dropping it abandons the request.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Response>>,
}

impl Future for ResponseFuture {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx
            .poll_unpin(cx)
            .map(|result| result.unwrap_or(Err(WireError::Cancelled)))
    }
}

/// Engine-side, single-assignment resolver of a [`ResponseFuture`].
#[derive(Debug)]
pub struct Completion {
    tx: Mutex<Option<oneshot::Sender<Result<Response>>>>,
}

impl Completion {
    pub fn new() -> (Self, ResponseFuture) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Mutex::new(Some(tx)) }, ResponseFuture { rx })
    }

    /// Resolves the future. Only the first call has any effect and returns `true`.
    pub fn complete(&self, result: Result<Response>) -> bool {
        let Some(tx) = self.tx.lock().take() else {
            return false;
        };
        // The caller may have dropped the future already; the outcome is settled either way.
        let _ = tx.send(result);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// True once the caller dropped its [`ResponseFuture`].
    pub fn is_abandoned(&self) -> bool {
        self.tx.lock().as_ref().is_some_and(|tx| tx.is_closed())
    }
}
