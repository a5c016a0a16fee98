use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use http::header::CONTENT_LENGTH;
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::access_log::{format_access_time, AccessLogger};
use crate::config::Bootstrap;
use crate::content::{self, Body};
use crate::dispatch::{repo_key, Mirror};

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let listener = bind(&cfg.server.addr)?;
    log::info!("listening on {}", listener.local_addr().context("local addr")?);
    serve(listener, cfg).await
}

/// Binds separately from serving so callers can hand out port 0 and read the
/// assigned address back. Addresses of the form `:9000` bind every interface.
pub fn bind(addr: &str) -> Result<TcpListener> {
    let bind_addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    let socket_addr: SocketAddr = bind_addr.parse().context("parse server.addr")?;
    let listener = std::net::TcpListener::bind(socket_addr).context("bind tcp")?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener).context("register listener")
}

pub async fn serve(listener: TcpListener, cfg: Arc<Bootstrap>) -> Result<()> {
    let state = Arc::new(AppState {
        mirror: Mirror::new(Arc::clone(&cfg)),
        access_logger: build_access_logger(&cfg),
    });

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            res = listener.accept() => {
                let (stream, _) = res.context("accept tcp")?;
                let peer = stream.peer_addr().ok().map(|addr| addr.to_string());
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        handle(req, Arc::clone(&state), peer.clone())
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("http connection ended: {err}");
                    }
                });
            }
        }
    }

    let grace = cfg.server.shutdown_grace;
    if !grace.is_zero() {
        log::info!("shutting down, draining for {grace:?}");
        tokio::time::sleep(grace).await;
    }
    Ok(())
}

struct AppState {
    mirror: Mirror,
    access_logger: Option<Arc<AccessLogger>>,
}

fn spawn_signal_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
        tokio::select! {
            _ = async {
                if let Some(sig) = sigterm.as_mut() {
                    let _ = sig.recv().await;
                } else {
                    std::future::pending::<()>().await;
                }
            } => {}
            _ = async {
                if let Some(sig) = sigint.as_mut() {
                    let _ = sig.recv().await;
                } else {
                    std::future::pending::<()>().await;
                }
            } => {}
        }
        let _ = shutdown.send(true);
    });
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
    peer: Option<String>,
) -> Result<Response<Body>, Infallible> {
    let info = RequestInfo::from_request(&req, peer);
    let resp = route(req, &state).await;
    log_access(&state, &info, &resp);
    Ok(resp)
}

async fn route(req: Request<Incoming>, state: &AppState) -> Response<Body> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return content::text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    let Some(key) = repo_key(req.uri().path()).map(|key| key.to_string()) else {
        return content::text_response(StatusCode::NOT_FOUND, "not found");
    };
    match state.mirror.dispatch(&req, &key).await {
        Ok(resp) => resp,
        Err(err) => {
            log::warn!("dispatch for {key} failed: {err:#}");
            content::text_response(StatusCode::NOT_FOUND, "not found")
        }
    }
}

fn build_access_logger(cfg: &Bootstrap) -> Option<Arc<AccessLogger>> {
    let access = cfg.server.access_log.as_ref()?;
    if !access.enabled {
        return None;
    }
    match AccessLogger::new(Some(&access.path)) {
        Ok(logger) => Some(Arc::new(logger)),
        Err(err) => {
            log::warn!("failed to init access log: {err}");
            None
        }
    }
}

struct RequestInfo {
    method: Method,
    uri: String,
    protocol: String,
    remote_addr: String,
    range: String,
    user_agent: String,
    start_at: std::time::Instant,
}

impl RequestInfo {
    fn from_request(req: &Request<Incoming>, peer: Option<String>) -> Self {
        let range = req
            .headers()
            .get("Range")
            .and_then(|val| val.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let user_agent = req
            .headers()
            .get("User-Agent")
            .and_then(|val| val.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let protocol = match req.version() {
            http::Version::HTTP_10 => "HTTP/1.0".to_string(),
            http::Version::HTTP_2 => "HTTP/2.0".to_string(),
            _ => "HTTP/1.1".to_string(),
        };
        Self {
            method: req.method().clone(),
            uri: req.uri().to_string(),
            protocol,
            remote_addr: peer.unwrap_or_else(|| "-".to_string()),
            range,
            user_agent,
            start_at: std::time::Instant::now(),
        }
    }
}

fn log_access(state: &AppState, req: &RequestInfo, resp: &Response<Body>) {
    let logger = match &state.access_logger {
        Some(logger) => logger,
        None => return,
    };
    let status = resp.status().as_u16();
    let body_len = resp
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("0");
    let cache_status = resp
        .headers()
        .get(crate::constants::CACHE_STATUS_KEY)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("-");
    let duration_ms = req.start_at.elapsed().as_millis().to_string();
    let request_line = format!("{} {} {}", req.method, req.uri, req.protocol);
    let fields = [
        normalize_field(&req.remote_addr),
        normalize_field(&format_access_time()),
        normalize_field_replace(&request_line),
        normalize_field(&status.to_string()),
        normalize_field(body_len),
        normalize_field(&duration_ms),
        normalize_field_replace(&req.range),
        normalize_field_replace(&req.user_agent),
        normalize_field(cache_status),
    ];
    let line = format!("{}\n", fields.join(" "));
    logger.log_line(&line);
}

fn normalize_field(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.to_string()
    }
}

fn normalize_field_replace(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.replace(' ', "+")
    }
}
