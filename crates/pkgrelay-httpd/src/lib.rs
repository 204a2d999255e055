//! HTTP serving layer for the pkgrelay mirrors.
//!
//! The engine itself only exposes typed read/write operations; this crate
//! binds them to the wire. A small fixed pool of worker threads accepts
//! requests, matches them against the route patterns in [`routes`] and
//! streams mirror payloads back. Server-sent events and git smart-http get
//! dedicated handling.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use pkgrelay::bower::BowerService;
use pkgrelay::composer::ComposerService;
use pkgrelay::git::GitService;
use pkgrelay::npm::NpmService;
use pkgrelay::statics::StaticService;
use pkgrelay_config::Config;
use pkgrelay_state::SseBroker;

pub mod routes;
pub mod smart;

mod stream;

pub(crate) use stream::pipe;

/// Request worker threads. SSE connections move off onto their own thread,
/// so this bounds concurrent non-streaming requests only.
const HTTP_WORKERS: usize = 8;

/// Every service the router can dispatch to.
#[derive(Default)]
pub struct Mirrors {
    pub composer: BTreeMap<String, Arc<ComposerService>>,
    pub npm: BTreeMap<String, Arc<NpmService>>,
    pub git: Vec<Arc<GitService>>,
    pub bower: BTreeMap<String, Arc<BowerService>>,
    pub statics: BTreeMap<String, Arc<StaticService>>,
}

impl Mirrors {
    /// Git mirror responsible for a repository path (`<host>/...`).
    pub fn git_for_path(&self, path: &str) -> Option<&Arc<GitService>> {
        let host = path.split('/').next().unwrap_or(path);
        self.git.iter().find(|svc| svc.server() == host)
    }
}

/// The internal HTTP endpoint.
pub struct HttpServer {
    config: Config,
    mirrors: Arc<Mirrors>,
    broker: Arc<SseBroker>,
}

impl HttpServer {
    pub fn new(config: Config, mirrors: Arc<Mirrors>, broker: Arc<SseBroker>) -> Self {
        Self {
            config,
            mirrors,
            broker,
        }
    }

    /// Accept requests until the shutdown channel fires.
    pub fn run(&self, addr: &str, shutdown: Receiver<()>) -> Result<()> {
        let server = tiny_http::Server::http(addr)
            .map_err(|err| anyhow::anyhow!("unable to bind {addr}: {err}"))?;
        let server = Arc::new(server);
        tracing::info!(addr, "http server listening");

        let mut workers = Vec::new();
        for _ in 0..HTTP_WORKERS {
            let server = Arc::clone(&server);
            let mirrors = Arc::clone(&self.mirrors);
            let broker = Arc::clone(&self.broker);
            let config = self.config.clone();
            let shutdown = shutdown.clone();

            workers.push(std::thread::spawn(move || {
                loop {
                    match shutdown.try_recv() {
                        Err(crossbeam::channel::TryRecvError::Empty) => {}
                        _ => return,
                    }
                    match server.recv_timeout(Duration::from_millis(250)) {
                        Ok(Some(request)) => {
                            routes::handle(&config, &mirrors, &broker, request);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::error!(error = %err, "http accept failed");
                            return;
                        }
                    }
                }
            }));
        }

        for worker in workers {
            let _ = worker.join();
        }
        Ok(())
    }
}

pub(crate) fn header(name: &str, value: &str) -> tiny_http::Header {
    tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("valid header")
}

/// The `{status, message}` envelope used by mutation and error responses.
pub(crate) fn send_with_http_code(request: tiny_http::Request, code: u16, message: &str) {
    let status = if code == 200 { "OK" } else { "KO" };
    let body = serde_json::json!({ "status": status, "message": message }).to_string();
    let response = tiny_http::Response::from_string(body)
        .with_status_code(tiny_http::StatusCode(code))
        .with_header(header("Content-Type", "application/json"));
    if let Err(err) = request.respond(response) {
        tracing::debug!(error = %err, "client went away during error response");
    }
}

/// Stream a producer's output as the response body without buffering it
/// whole. The first chunk (or the producer's completion) decides the
/// status: a producer that fails before writing anything gets an error
/// envelope instead of a truncated 200.
pub(crate) fn stream_response(
    request: tiny_http::Request,
    content_type: &str,
    producer: impl FnOnce(&mut dyn Write) -> Result<()> + Send + 'static,
) {
    let (writer, mut reader) = pipe();
    let (done_tx, done_rx): (
        Sender<Option<anyhow::Error>>,
        Receiver<Option<anyhow::Error>>,
    ) = bounded(1);

    std::thread::spawn(move || {
        let mut writer = writer;
        let result = producer(&mut writer);
        drop(writer);
        let _ = done_tx.send(result.err());
    });

    if reader.wait_first() {
        let response = tiny_http::Response::new(
            tiny_http::StatusCode(200),
            vec![header("Content-Type", content_type)],
            reader,
            None,
            None,
        );
        if let Err(err) = request.respond(response) {
            tracing::debug!(error = %err, "client went away mid-stream");
        }
        if let Ok(Some(err)) = done_rx.recv_timeout(Duration::from_secs(600)) {
            tracing::error!(error = %format!("{err:#}"), "stream producer failed mid-body");
        }
    } else {
        // no bytes were produced; report the outcome precisely
        match done_rx.recv_timeout(Duration::from_secs(600)) {
            Ok(Some(err)) => {
                let code = match err.downcast_ref::<pkgrelay_types::MirrorError>() {
                    Some(pkgrelay_types::MirrorError::ResourceNotFound)
                    | Some(pkgrelay_types::MirrorError::EmptyKey) => 404,
                    _ => 500,
                };
                send_with_http_code(request, code, &format!("{err:#}"));
            }
            Ok(None) => {
                let response = tiny_http::Response::empty(200)
                    .with_header(header("Content-Type", content_type));
                let _ = request.respond(response);
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                send_with_http_code(request, 500, "stream producer vanished");
            }
        }
    }
}

