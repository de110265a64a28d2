//! webctl Daemon
//!
//! Serves a demo counter application through the session-multiplexing
//! controller, reading NDJSON requests on stdin and writing responses to
//! stdout.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use webctl_core::config::load_config;
use webctl_daemon::transport::NdjsonStream;
use webctl_daemon::{
    AppError, Application, Controller, ControllerConfig, EntryPoints, Request, Response,
    SessionInfo,
};

#[derive(Parser, Debug)]
#[command(name = "webctl-daemon")]
#[command(version, about = "webctl daemon - session-multiplexing request controller")]
struct Args {
    /// Project directory holding `.webctl/settings.json`
    #[arg(long, env = "WEBCTL_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn"); overrides settings
    #[arg(long, env = "WEBCTL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "WEBCTL_LOG_JSON")]
    log_json: bool,

    /// Dispatch requests on the worker pool (`false` handles them inline)
    #[arg(long, env = "WEBCTL_THREADED")]
    threaded: Option<bool>,

    /// Worker pool size; overrides settings
    #[arg(long, env = "WEBCTL_WORKER_THREADS")]
    workers: Option<usize>,
}

/// Per-session hit counter. `/quit` ends the session.
struct CounterApp {
    session_id: String,
    hits: u64,
}

impl Application for CounterApp {
    fn process(&mut self, request: &Request) -> Result<Response, AppError> {
        self.hits += 1;
        let body = format!("session {} hits {}\n", self.session_id, self.hits);
        if request.path().ends_with("/quit") {
            return Ok(Response::ok(body).ending_session());
        }
        Ok(Response::ok(body).with_header("Content-Type", "text/plain"))
    }

    fn teardown(&mut self) {
        info!(session_id = %self.session_id, hits = self.hits, "Counter session closed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = load_config(args.project_dir.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&settings.controller.log_level);
    let log_filter = format!("webctl_daemon={log_level}");
    webctl_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let mut config = ControllerConfig::from(&settings);
    if let Some(threaded) = args.threaded {
        config.threaded = threaded;
    }
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        threaded = config.threaded,
        workers = config.worker_threads,
        "Starting webctl-daemon"
    );

    let entry_points = EntryPoints::new().with("/", |info: &SessionInfo| {
        Ok(CounterApp {
            session_id: info.session_id.clone(),
            hits: 0,
        })
    });
    let controller = Controller::new(config, entry_points)?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let signals = {
        let controller = std::sync::Arc::clone(&controller);
        tokio::spawn(async move {
            #[cfg(unix)]
            let sigterm_future = sigterm.recv();
            #[cfg(not(unix))]
            let sigterm_future = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                _ = sigterm_future => info!("Received SIGTERM, shutting down"),
            }
            controller.force_shutdown();
        })
    };

    let stream = NdjsonStream::new(tokio::io::stdin(), tokio::io::stdout());
    controller.run(stream).await?;
    signals.abort();

    info!("webctl-daemon stopped");
    Ok(())
}
