//! Route patterns and request dispatch.
//!
//! Paths are percent-decoded before matching, so scoped npm names arrive
//! as `@scope/name` and are re-encoded for lookup. Routes are matched
//! most-specific first; anything unmatched gets a 404 envelope.

use std::io::{self, Read};
use std::sync::{Arc, LazyLock};

use percent_encoding::percent_decode_str;
use pkgrelay::api;
use pkgrelay::git::GitService;
use pkgrelay_config::Config;
use pkgrelay_state::{SseBroker, Subscriber, sse_frame};
use pkgrelay_types::MirrorError;
use regex::Regex;

use crate::{Mirrors, header, send_with_http_code, smart, stream_response};

static COMPOSER_ROOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/composer/([\w.-]+)$").expect("valid pattern"));
static COMPOSER_MANIFEST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/composer/([\w.-]+)/packages\.json$").expect("valid pattern"));
static COMPOSER_SHARD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/composer/([\w.-]+)/p/([^/]+)/([^/$]+)\$([^/.]+)\.json$").expect("valid pattern")
});
static COMPOSER_PROVIDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/composer/([\w.-]+)/p/([^/]+\$[^/]+\.json)$").expect("valid pattern")
});
static COMPOSER_INFO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/composer/([\w.-]+)/p/([^/$]+)/([^/$]+)$").expect("valid pattern")
});
static NPM_TARBALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/npm/([\w.-]+)/((@([\w\d.-]+)/|)([@\w\d.-]+))/-/(.*)\.tgz$")
        .expect("valid pattern")
});
static NPM_DOC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/npm/([\w.-]+)/(.+)$").expect("valid pattern"));
static GIT_ARCHIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/git/(.+)/([0-9a-fA-F]{40}|[^/]+)\.zip$").expect("valid pattern")
});
static BOWER_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/bower/([\w.-]+)/packages$").expect("valid pattern"));
static BOWER_PACKAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/bower/([\w.-]+)/packages/(.+)$").expect("valid pattern"));
static STATIC_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/static/([\w.-]+)/(.+)$").expect("valid pattern"));

/// Extract `(code, encoded package, version)` from a tarball path.
pub fn parse_npm_archive(path: &str) -> Option<(String, String, String)> {
    let caps = NPM_TARBALL.captures(path)?;
    let base = caps.get(5).map(|m| m.as_str()).unwrap_or("");
    let file = caps.get(6).map(|m| m.as_str()).unwrap_or("");
    if file.len() <= base.len() + 1 {
        return None;
    }
    let version = file[base.len() + 1..].to_string();
    let package = caps[2].replace('/', "%2f");
    Some((caps[1].to_string(), package, version))
}

/// Extract `(repository path, ref)` from an archive path; the repository
/// path gets its `.git` suffix appended.
pub fn parse_git_archive(path: &str) -> Option<(String, String)> {
    let caps = GIT_ARCHIVE.captures(path)?;
    Some((format!("{}.git", &caps[1]), caps[2].to_string()))
}

/// What a smart-http (or dumb-protocol) git path asks for.
#[derive(Debug, PartialEq, Eq)]
pub enum GitOp {
    InfoRefs,
    UploadPack,
    ReceivePack,
    File(String),
}

/// Split `/git/<repo>.git/<suffix>` into the repository path and operation.
pub fn parse_git_service(path: &str) -> Option<(String, GitOp)> {
    let rest = path.strip_prefix("/git/")?;
    let idx = rest.find(".git/")?;
    let repo = rest[..idx + 4].to_string();
    let suffix = &rest[idx + 5..];
    let op = match suffix {
        "" => return None,
        "info/refs" => GitOp::InfoRefs,
        "git-upload-pack" => GitOp::UploadPack,
        "git-receive-pack" => GitOp::ReceivePack,
        other => GitOp::File(other.to_string()),
    };
    Some((repo, op))
}

fn query_param<'q>(query: Option<&'q str>, name: &str) -> Option<&'q str> {
    for pair in query?.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == name && !value.is_empty() {
            return Some(value);
        }
    }
    None
}

fn respond_data(request: tiny_http::Request, data: Vec<u8>, headers: Vec<tiny_http::Header>) {
    let mut response = tiny_http::Response::from_data(data);
    for h in headers {
        response = response.with_header(h);
    }
    if let Err(err) = request.respond(response) {
        tracing::debug!(error = %err, "client went away");
    }
}

fn respond_json(request: tiny_http::Request, data: Vec<u8>) {
    respond_data(request, data, vec![header("Content-Type", "application/json")]);
}

fn respond_gzip_json(request: tiny_http::Request, data: Vec<u8>) {
    respond_data(
        request,
        data,
        vec![
            header("Content-Type", "application/json"),
            header("Content-Encoding", "gzip"),
        ],
    );
}

fn redirect(request: tiny_http::Request, code: u16, location: &str) {
    let response = tiny_http::Response::empty(tiny_http::StatusCode(code))
        .with_header(header("Location", location));
    let _ = request.respond(response);
}

fn error_code(err: &anyhow::Error, fallback: u16) -> u16 {
    match err.downcast_ref::<MirrorError>() {
        Some(MirrorError::EmptyKey) | Some(MirrorError::ResourceNotFound) => 404,
        Some(_) => 500,
        None => fallback,
    }
}

/// Dispatch one request.
pub fn handle(
    config: &Config,
    mirrors: &Arc<Mirrors>,
    broker: &Arc<SseBroker>,
    request: tiny_http::Request,
) {
    let url = request.url().to_string();
    let (raw_path, query) = match url.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (url.as_str(), None),
    };
    let path = percent_decode_str(raw_path).decode_utf8_lossy().into_owned();
    let query = query.as_deref();

    let method = request.method().clone();
    tracing::info!(method = %method, path = %path, "receive http request");

    match method {
        tiny_http::Method::Get => handle_get(config, mirrors, broker, request, &path, query),
        tiny_http::Method::Post => handle_post(mirrors, request, &path),
        _ => send_with_http_code(request, 405, "method not allowed"),
    }
}

fn handle_get(
    config: &Config,
    mirrors: &Arc<Mirrors>,
    broker: &Arc<SseBroker>,
    request: tiny_http::Request,
    path: &str,
    query: Option<&str>,
) {
    if path == "/api/ping" {
        let _ = request.respond(tiny_http::Response::from_string("pong"));
        return;
    }

    if path == "/api/mirrors" {
        match serde_json::to_vec(&api::mirror_catalog(config)) {
            Ok(body) => respond_json(request, body),
            Err(err) => send_with_http_code(request, 500, &err.to_string()),
        }
        return;
    }

    if path == "/api/sse" {
        handle_sse(broker, request);
        return;
    }

    // legacy entry point: /packagist/... moved under /composer/packagist/...
    if path == "/packagist" || path.starts_with("/packagist/") {
        redirect(request, 301, &format!("/composer{path}"));
        return;
    }

    if let Some(caps) = COMPOSER_ROOT.captures(path) {
        redirect(request, 301, &format!("/composer/{}/packages.json", &caps[1]));
        return;
    }

    if let Some(caps) = COMPOSER_MANIFEST.captures(path) {
        let Some(svc) = mirrors.composer.get(&caps[1]) else {
            send_with_http_code(request, 404, "unknown composer mirror");
            return;
        };
        match svc.get("packages.json") {
            Ok(data) => respond_json(request, data),
            Err(err) => send_with_http_code(request, 500, &format!("{err:#}")),
        }
        return;
    }

    if let Some(caps) = COMPOSER_SHARD.captures(path) {
        let Some(svc) = mirrors.composer.get(&caps[1]) else {
            send_with_http_code(request, 404, "unknown composer mirror");
            return;
        };
        let key = format!("{}/{}${}", &caps[2], &caps[3], &caps[4]);

        if query_param(query, "refresh").is_some() {
            match svc.update_package(&key) {
                Ok(()) => send_with_http_code(request, 200, "Package updated"),
                Err(err) => send_with_http_code(request, 500, &format!("{err:#}")),
            }
            return;
        }

        match svc.get(&key) {
            Ok(data) => respond_gzip_json(request, data),
            Err(err) => send_with_http_code(request, 404, &format!("{err:#}")),
        }
        return;
    }

    if let Some(caps) = COMPOSER_PROVIDER.captures(path) {
        let Some(svc) = mirrors.composer.get(&caps[1]) else {
            send_with_http_code(request, 404, "unknown composer mirror");
            return;
        };
        match svc.get(&format!("p/{}", &caps[2])) {
            Ok(data) => respond_json(request, data),
            Err(err) => send_with_http_code(request, 404, &format!("{err:#}")),
        }
        return;
    }

    if let Some(caps) = COMPOSER_INFO.captures(path) {
        let code = caps[1].to_string();
        let Some(svc) = mirrors.composer.get(&code) else {
            send_with_http_code(request, 404, "unknown composer mirror");
            return;
        };
        match svc.get_package(&format!("{}/{}", &caps[2], &caps[3])) {
            Ok(info) => redirect(
                request,
                302,
                &format!("/composer/{}/p/{}.json", code, info.target_key()),
            ),
            Err(err) => send_with_http_code(request, 404, &format!("{err:#}")),
        }
        return;
    }

    if let Some((code, package, version)) = parse_npm_archive(path) {
        let Some(svc) = mirrors.npm.get(&code) else {
            send_with_http_code(request, 404, "unknown npm mirror");
            return;
        };
        let svc = Arc::clone(svc);
        stream_response(request, "application/octet-stream", move |w| {
            svc.write_archive(w, &package, &version)
        });
        return;
    }

    if let Some((repo, op)) = parse_git_service(path) {
        handle_git_get(mirrors, request, &repo, op, query);
        return;
    }

    if let Some((repo, reference)) = parse_git_archive(path) {
        let Some(svc) = mirrors.git_for_path(&repo) else {
            send_with_http_code(request, 404, "unknown git mirror");
            return;
        };
        let svc = Arc::clone(svc);
        stream_response(request, "application/zip", move |w| {
            svc.write_archive(w, &repo, &reference)
        });
        return;
    }

    if let Some(caps) = NPM_DOC.captures(path) {
        let Some(svc) = mirrors.npm.get(&caps[1]) else {
            send_with_http_code(request, 404, "unknown npm mirror");
            return;
        };
        let key = caps[2].replace('/', "%2f");
        match svc.get(&key) {
            Ok(data) => respond_gzip_json(request, data),
            Err(err) => send_with_http_code(request, error_code(&err, 404), &format!("{err:#}")),
        }
        return;
    }

    if let Some(caps) = BOWER_PACKAGE.captures(path) {
        let Some(svc) = mirrors.bower.get(&caps[1]) else {
            send_with_http_code(request, 404, "unknown bower mirror");
            return;
        };
        match svc.get(&caps[2]) {
            Ok(data) => respond_json(request, data),
            Err(err) => send_with_http_code(request, 404, &format!("{err:#}")),
        }
        return;
    }

    if let Some(caps) = BOWER_LIST.captures(path) {
        let Some(svc) = mirrors.bower.get(&caps[1]) else {
            send_with_http_code(request, 404, "unknown bower mirror");
            return;
        };
        let svc = Arc::clone(svc);
        stream_response(request, "application/json", move |w| svc.write_list(w));
        return;
    }

    if let Some(caps) = STATIC_FILE.captures(path) {
        let Some(svc) = mirrors.statics.get(&caps[1]) else {
            send_with_http_code(request, 404, "unknown static mirror");
            return;
        };

        // buffers the whole file before replying; headers come from the
        // stored record and cannot be sent until the download finished
        let mut body = Vec::new();
        match svc.write_archive(&mut body, &caps[2]) {
            Ok(record) => {
                let mut headers = Vec::new();
                for (name, value) in &record.header {
                    if name == "Content-Length" {
                        continue;
                    }
                    headers.push(header(name, value));
                }
                respond_data(request, body, headers);
            }
            Err(err) => {
                send_with_http_code(request, error_code(&err, 500), &format!("{err:#}"));
            }
        }
        return;
    }

    send_with_http_code(request, 404, "no route");
}

fn handle_post(mirrors: &Arc<Mirrors>, mut request: tiny_http::Request, path: &str) {
    let Some((repo, op)) = parse_git_service(path) else {
        send_with_http_code(request, 404, "no route");
        return;
    };

    match op {
        GitOp::UploadPack => {
            let Some(svc) = mirrors.git_for_path(&repo) else {
                send_with_http_code(request, 404, "unknown git mirror");
                return;
            };
            let svc = Arc::clone(svc);
            clone_on_demand(&svc, &repo);
            if !svc.has(&repo) {
                send_with_http_code(request, 404, "repository not found");
                return;
            }

            let mut body = Vec::new();
            if let Err(err) = request.as_reader().read_to_end(&mut body) {
                send_with_http_code(request, 400, &err.to_string());
                return;
            }

            let repo_dir = svc.repository_path(&repo);
            stream_response(request, smart::RESULT_TYPE, move |w| {
                smart::upload_pack(svc.binary(), &repo_dir, &mut body.as_slice(), w)
            });
        }
        GitOp::ReceivePack => {
            // push is disabled, the mirror is read-only
            send_with_http_code(request, 403, "receive-pack is disabled");
        }
        _ => send_with_http_code(request, 404, "no route"),
    }
}

fn handle_git_get(
    mirrors: &Arc<Mirrors>,
    request: tiny_http::Request,
    repo: &str,
    op: GitOp,
    query: Option<&str>,
) {
    let Some(svc) = mirrors.git_for_path(repo) else {
        send_with_http_code(request, 404, "unknown git mirror");
        return;
    };
    let svc = Arc::clone(svc);

    clone_on_demand(&svc, repo);
    if !svc.has(repo) {
        send_with_http_code(request, 404, "repository not found");
        return;
    }
    let repo_dir = svc.repository_path(repo);

    match op {
        GitOp::InfoRefs => match query_param(query, "service") {
            Some(smart::UPLOAD_PACK) => {
                let mut out = Vec::new();
                match smart::advertise_refs(svc.binary(), &repo_dir, &mut out) {
                    Ok(()) => respond_data(
                        request,
                        out,
                        vec![header("Content-Type", smart::ADVERTISEMENT_TYPE)],
                    ),
                    Err(err) => send_with_http_code(request, 500, &format!("{err:#}")),
                }
            }
            Some(smart::RECEIVE_PACK) => {
                send_with_http_code(request, 403, "receive-pack is disabled");
            }
            Some(other) => {
                send_with_http_code(request, 400, &format!("unknown service {other}"));
            }
            // dumb protocol fallback
            None => serve_repo_file(request, &repo_dir, "info/refs"),
        },
        GitOp::File(file) => serve_repo_file(request, &repo_dir, &file),
        GitOp::UploadPack | GitOp::ReceivePack => {
            send_with_http_code(request, 405, "method not allowed");
        }
    }
}

/// The smart-http pre-action: clone a missing repository when a template
/// is configured, so the request that follows can succeed.
fn clone_on_demand(svc: &Arc<GitService>, repo: &str) {
    if svc.has(repo) {
        tracing::debug!(repo, "skipping cloning, repository exists");
        return;
    }
    if !svc.clone_configured() {
        return;
    }
    if let Err(err) = svc.clone_repository(repo) {
        tracing::error!(repo, error = %err, "unable to clone the repository");
    }
}

fn serve_repo_file(request: tiny_http::Request, repo_dir: &std::path::Path, file: &str) {
    let clean = std::path::Path::new(file);
    let traversal = clean.components().any(|c| {
        !matches!(c, std::path::Component::Normal(_))
    });
    if traversal {
        send_with_http_code(request, 400, "invalid path");
        return;
    }

    let full = repo_dir.join(clean);
    if !full.is_file() {
        send_with_http_code(request, 404, "no such file");
        return;
    }

    let full_for_stream = full.clone();
    stream_response(request, "application/octet-stream", move |w| {
        let mut f = std::fs::File::open(&full_for_stream)?;
        std::io::copy(&mut f, w)?;
        Ok(())
    });
}

fn handle_sse(broker: &Arc<SseBroker>, request: tiny_http::Request) {
    let subscriber = broker.subscribe();
    let reader = SseReader {
        subscriber,
        buf: Vec::new(),
        pos: 0,
    };
    let response = tiny_http::Response::new(
        tiny_http::StatusCode(200),
        vec![
            header("Content-Type", "text/event-stream"),
            header("Cache-Control", "no-cache"),
            header("Access-Control-Allow-Origin", "*"),
        ],
        reader,
        None,
        None,
    );
    // a subscriber can stay connected for hours; it gets its own thread
    std::thread::spawn(move || {
        let _ = request.respond(response);
    });
}

struct SseReader {
    subscriber: Subscriber,
    buf: Vec<u8>,
    pos: usize,
}

impl Read for SseReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buf.len() {
            match self.subscriber.recv() {
                Some(payload) => {
                    self.buf = sse_frame(&payload);
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = (self.buf.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
