#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use rand::RngCore;
use tokio::net::TcpListener;

use pacmirror::config::{Bootstrap, Cache, Server, Upstream};
use pacmirror::content;
use pacmirror::server;

pub type MockBody = content::Body;

/// One proxy instance on an ephemeral port with its own scratch cache dir.
pub struct TestMirror {
    pub addr: SocketAddr,
    pub cache_dir: PathBuf,
    _tmp: tempfile::TempDir,
}

pub async fn start_mirror(upstream_url: &str) -> TestMirror {
    let tmp = tempfile::tempdir().expect("tempdir");
    let cache_dir = tmp.path().join("cache");
    let cfg = Bootstrap {
        server: Server {
            addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        },
        upstream: Upstream {
            url: upstream_url.to_string(),
        },
        cache: Cache {
            dir: cache_dir.display().to_string(),
        },
        ..Default::default()
    };
    cfg.validate().expect("config");
    let listener = server::bind(&cfg.server.addr).expect("bind proxy");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server::serve(listener, Arc::new(cfg)).await;
    });
    TestMirror {
        addr,
        cache_dir,
        _tmp: tmp,
    }
}

impl TestMirror {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn repo_url(&self, key: &str) -> String {
        format!("http://{}/repo/{}", self.addr, key)
    }

    pub fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(key)
    }
}

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn cache_status(&self) -> &str {
        self.headers
            .get("X-Cache")
            .and_then(|val| val.to_str().ok())
            .unwrap_or("-")
    }
}

#[derive(Clone, Default)]
pub struct TestClient;

impl TestClient {
    pub fn new() -> Self {
        Self
    }

    pub async fn send(&self, method: Method, url: &str, headers: HeaderMap) -> TestResponse {
        self.try_send(method, url, headers)
            .await
            .expect("request failed")
    }

    pub async fn get(&self, url: &str) -> TestResponse {
        self.send(Method::GET, url, HeaderMap::new()).await
    }

    /// Like `send` but surfaces mid-body failures, for responses that are
    /// expected to be torn down before Content-Length is satisfied.
    pub async fn try_send(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
    ) -> Result<TestResponse, hyper::Error> {
        let uri: http::Uri = url.parse().expect("uri");
        let authority = uri.authority().expect("authority").as_str().to_string();
        let stream = tokio::net::TcpStream::connect(&authority)
            .await
            .expect("connect proxy");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder().method(method).uri(uri.clone());
        builder = builder.header(http::header::HOST, authority);
        for (key, val) in headers.iter() {
            builder = builder.header(key, val);
        }
        let req = builder.body(Full::new(Bytes::new())).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await?.to_bytes();

        Ok(TestResponse {
            status,
            headers,
            body,
        })
    }
}

/// Mock origin: counts requests and hands each to the supplied handler.
pub struct MockServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<MockBody> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_accept = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(val) => val, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        let hits = Arc::clone(&hits_accept);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                hits.fetch_add(1, Ordering::SeqCst);
                                let resp = handler(req);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            hits,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}/repo", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub fn gen_bytes(size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// 200 response with the whole payload buffered, Content-Length and
/// Last-Modified set.
pub fn resp_file(payload: &[u8], modified: SystemTime) -> Response<MockBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Length", payload.len().to_string())
        .header("Last-Modified", httpdate::fmt_http_date(modified))
        .body(content::full(payload.to_vec()))
        .unwrap()
}

pub fn resp_status(status: StatusCode) -> Response<MockBody> {
    Response::builder()
        .status(status)
        .body(content::empty())
        .unwrap()
}

/// 200 response whose body trickles out chunk by chunk. `declared_len` is
/// what Content-Length claims; with `abort` the body errors out after the
/// chunks instead of finishing.
pub fn resp_stream(
    declared_len: u64,
    chunks: Vec<Bytes>,
    gap: Duration,
    abort: bool,
) -> Response<MockBody> {
    let (tx, body) = content::channel(4);
    tokio::spawn(async move {
        for chunk in chunks {
            tokio::time::sleep(gap).await;
            if tx.send(Ok(chunk)).await.is_err() {
                return;
            }
        }
        if abort {
            let _ = tx
                .send(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "origin gave up",
                )))
                .await;
        }
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Length", declared_len.to_string())
        .header("Last-Modified", httpdate::fmt_http_date(SystemTime::now()))
        .body(body)
        .unwrap()
}

pub fn chunked(payload: &[u8], chunk_size: usize) -> Vec<Bytes> {
    payload
        .chunks(chunk_size)
        .map(|chunk| Bytes::copy_from_slice(chunk))
        .collect()
}

pub fn range_header(start: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("bytes={}-{}", start, end),
        None => format!("bytes={}-", start),
    }
}

pub async fn wait_for<F>(mut cond: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
