//! Shared probe application for controller integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use webctl_daemon::{
    AppError, Application, Controller, ControllerConfig, EntryPoints, Request, Response,
    SessionInfo,
};

/// Counters shared by every probe instance.
#[derive(Default)]
pub struct Probes {
    pub created: AtomicUsize,
    pub teardowns: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl Probes {
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

/// Test application whose behavior is chosen by the request path.
pub struct Probe {
    pub session_id: String,
    pub hits: u64,
    probes: Arc<Probes>,
}

impl Probe {
    /// Record a stretch of exclusive work, noting any overlap.
    pub fn exclusive_work(&self, duration: Duration) {
        let now = self.probes.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probes.max_active.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(duration);
        self.probes.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Application for Probe {
    fn process(&mut self, request: &Request) -> Result<Response, AppError> {
        self.hits += 1;
        match request.path() {
            "/fail" => Err(AppError::Failed("requested failure".into())),
            "/corrupt" => Err(AppError::Corrupted("requested corruption".into())),
            "/panic" => panic!("requested panic"),
            "/quit" => Ok(Response::ok("bye").ending_session()),
            "/slow" => {
                self.exclusive_work(Duration::from_millis(5));
                Ok(Response::ok(self.hits.to_string()))
            }
            _ => Ok(Response::ok(self.hits.to_string())),
        }
    }

    fn teardown(&mut self) {
        self.probes.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn entry_points(path: &str, probes: &Arc<Probes>) -> EntryPoints<Probe> {
    let probes = Arc::clone(probes);
    EntryPoints::new().with(path, move |info: &SessionInfo| {
        probes.created.fetch_add(1, Ordering::SeqCst);
        Ok(Probe {
            session_id: info.session_id.clone(),
            hits: 0,
            probes: Arc::clone(&probes),
        })
    })
}

pub fn controller(config: ControllerConfig) -> (Arc<Controller<Probe>>, Arc<Probes>) {
    let probes = Arc::new(Probes::default());
    let controller = Controller::new(config, entry_points("/", &probes)).unwrap();
    (controller, probes)
}

/// Make a request and wait for its response.
pub async fn send(
    controller: &Arc<Controller<Probe>>,
    target: &str,
    cookie: Option<&str>,
) -> Response {
    let (mut request, rx) = Request::new(target);
    if let Some(cookie) = cookie {
        request = request.with_header("Cookie", cookie);
    }
    controller.handle_request(request).await;
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("response timed out")
        .expect("response dropped")
}

/// `name=value` from a `Set-Cookie` header, usable as a `Cookie` header.
pub fn cookie(response: &Response) -> Option<String> {
    response
        .header("Set-Cookie")
        .and_then(|value| value.split(';').next())
        .map(String::from)
}

/// Session id carried in a `Set-Cookie` header.
pub fn session_id(response: &Response) -> Option<String> {
    cookie(response).and_then(|c| c.split_once('=').map(|(_, id)| id.to_string()))
}

pub fn body(response: &Response) -> String {
    String::from_utf8_lossy(&response.body).into_owned()
}
