//! Newline-delimited JSON request stream.
//!
//! Each input line is one [`WireRequest`]; each response is written as one
//! [`WireResponse`] line, tagged with the request's id. Responses may be
//! written out of order.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::RequestStream;
use crate::request::{Request, Response};

/// One request line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: u64,
    /// `path[?query]`
    pub target: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: u64,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
}

impl WireResponse {
    fn new(id: u64, response: &Response) -> Self {
        Self {
            id,
            status: response.status,
            headers: response.headers.clone(),
            body: String::from_utf8_lossy(&response.body).into_owned(),
        }
    }
}

/// Requests read as JSON lines from `R`, responses written to a writer task.
pub struct NdjsonStream<R> {
    lines: Lines<BufReader<R>>,
    out: mpsc::UnboundedSender<WireResponse>,
}

impl<R> NdjsonStream<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Read requests from `reader` and write responses to `writer`.
    ///
    /// Must be called within a tokio runtime; spawns the writer task.
    pub fn new<W>(reader: R, writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_responses(writer, rx));
        Self {
            lines: BufReader::new(reader).lines(),
            out,
        }
    }

    fn admit(&self, wire: WireRequest) -> Request {
        let (request, rx) = Request::new(&wire.target);
        let request = wire
            .headers
            .into_iter()
            .fold(request, |req, (name, value)| req.with_header(name, value))
            .with_body(wire.body);

        let id = wire.id;
        let out = self.out.clone();
        tokio::spawn(async move {
            let response = rx.await.unwrap_or_else(|_| Response::unavailable());
            if out.send(WireResponse::new(id, &response)).is_err() {
                debug!(id, "Response writer closed");
            }
        });
        request
    }
}

impl<R> RequestStream for NdjsonStream<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_request(&mut self) -> Option<Request> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<WireRequest>(&line) {
                        Ok(wire) => return Some(self.admit(wire)),
                        Err(e) => warn!(error = %e, "Skipping malformed request line"),
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "Failed to read request stream");
                    return None;
                }
            }
        }
    }
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<WireResponse>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = match serde_json::to_string(&response) {
            Ok(line) => line,
            Err(e) => {
                warn!(id = response.id, error = %e, "Failed to encode response");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(error = %e, "Failed to write response");
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!(error = %e, "Failed to flush response");
            return;
        }
    }
}
