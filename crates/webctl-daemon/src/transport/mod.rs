//! Request sources for the run loop.

mod ndjson;

use std::future::Future;

use tokio::sync::mpsc;
use tracing::debug;

use crate::app::Application;
use crate::controller::Controller;
use crate::request::Request;

pub use ndjson::{NdjsonStream, WireRequest, WireResponse};

/// A source of inbound requests.
///
/// `next_request` must be cancel safe: the run loop drops the future when
/// another event wins, and no request may be lost when that happens.
pub trait RequestStream: Send {
    /// The next request, or `None` once the source is exhausted.
    fn next_request(&mut self) -> impl Future<Output = Option<Request>> + Send;
}

/// Requests fed through an in-process channel.
#[derive(Debug)]
pub struct ChannelStream {
    rx: mpsc::Receiver<Request>,
}

impl RequestStream for ChannelStream {
    async fn next_request(&mut self) -> Option<Request> {
        self.rx.recv().await
    }
}

/// Create an in-process request channel holding up to `capacity` requests.
pub fn channel(capacity: usize) -> (mpsc::Sender<Request>, ChannelStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, ChannelStream { rx })
}

/// Receive a streamed body, reporting progress after every chunk.
///
/// Returns the request with its body once `chunks` closes, or `None` if the
/// controller refused further data. A refused chunk is not buffered.
/// Refusing drops `chunks`, so the sender observes the abort on its next send.
pub async fn receive_body<A: Application>(
    controller: &Controller<A>,
    mut request: Request,
    total: u64,
    mut chunks: mpsc::Receiver<Vec<u8>>,
) -> Option<Request> {
    let mut received: u64 = 0;
    while let Some(chunk) = chunks.recv().await {
        received = received.saturating_add(chunk.len() as u64);
        if !controller.request_data_received(&request, received, total).await {
            debug!(path = request.path(), received, total, "Upload aborted");
            return None;
        }
        request.extend_body(&chunk);
    }
    Some(request)
}
