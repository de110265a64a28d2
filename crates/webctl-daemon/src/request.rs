//! Inbound requests and their responses.

use tokio::sync::oneshot;
use tracing::debug;

/// Receiver for the response to one request.
pub type ResponseReceiver = oneshot::Receiver<Response>;

/// A request delivered by the transport.
#[derive(Debug)]
pub struct Request {
    path: String,
    query: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    reply: Option<oneshot::Sender<Response>>,
}

impl Request {
    /// Create a request for `target` (`path[?query]`) and the receiver its
    /// response will be delivered on.
    pub fn new(target: &str) -> (Self, ResponseReceiver) {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let (tx, rx) = oneshot::channel();
        let request = Self {
            path: if path.is_empty() { "/".into() } else { path.into() },
            query: query.into(),
            headers: Vec::new(),
            body: Vec::new(),
            reply: Some(tx),
        };
        (request, rx)
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Path plus query string, as registered for upload progress.
    pub fn url(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// First header with this name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First query parameter with this name. Values are not percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .split('&')
            .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Append a streamed body chunk.
    pub fn extend_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    pub(crate) fn take_reply(&mut self) -> Reply {
        Reply(self.reply.take())
    }

    /// Answer the request directly, bypassing dispatch.
    pub(crate) fn respond(&mut self, response: Response) {
        self.take_reply().send(response);
    }
}

/// One-shot handle for answering a request.
pub(crate) struct Reply(Option<oneshot::Sender<Response>>);

impl Reply {
    pub(crate) fn send(self, response: Response) {
        if let Some(tx) = self.0
            && tx.send(response).is_err()
        {
            debug!("Response receiver dropped before reply");
        }
    }
}

/// Response produced by an application or by the controller itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    ends_session: bool,
}

impl Response {
    pub const fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            ends_session: false,
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200).with_body(body)
    }

    pub fn not_found() -> Self {
        Self::new(404).with_body("Not Found")
    }

    pub fn internal_error() -> Self {
        Self::new(500).with_body("Internal Server Error")
    }

    pub fn unavailable() -> Self {
        Self::new(503).with_body("Service Unavailable")
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Ask the controller to terminate the session after this response.
    #[must_use]
    pub const fn ending_session(mut self) -> Self {
        self.ends_session = true;
        self
    }

    pub const fn ends_session(&self) -> bool {
        self.ends_session
    }

    /// First header with this name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn target_splits_path_and_query() {
        let (req, _rx) = Request::new("/app/page?wtd=abc&x=1");
        assert_eq!(req.path(), "/app/page");
        assert_eq!(req.query(), "wtd=abc&x=1");
        assert_eq!(req.query_param("wtd"), Some("abc"));
        assert_eq!(req.query_param("x"), Some("1"));
        assert_eq!(req.query_param("missing"), None);
        assert_eq!(req.url(), "/app/page?wtd=abc&x=1");
    }

    #[test]
    fn empty_target_is_root() {
        let (req, _rx) = Request::new("");
        assert_eq!(req.path(), "/");
        assert_eq!(req.url(), "/");
    }

    #[test]
    fn headers_are_case_insensitive() {
        let (req, _rx) = Request::new("/");
        let req = req.with_header("Cookie", "a=b");
        assert_eq!(req.header("cookie"), Some("a=b"));
        assert_eq!(req.header("COOKIE"), Some("a=b"));
    }

    #[tokio::test]
    async fn respond_delivers_once() {
        let (mut req, rx) = Request::new("/");
        req.respond(Response::not_found());
        // A second reply is silently dropped.
        req.respond(Response::internal_error());
        assert_eq!(rx.await.unwrap().status, 404);
    }

    #[test]
    fn ending_session_flag() {
        let resp = Response::ok("bye").ending_session();
        assert!(resp.ends_session());
        assert!(!Response::ok("hi").ends_session());
    }
}
