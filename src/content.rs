use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED,
    RANGE,
};
use http::{HeaderMap, Method, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Frame;
use tokio::sync::mpsc;

use crate::constants::{CACHE_STATUS_KEY, OCTET_STREAM, READ_CHUNK_SIZE};
use crate::http_range::{build_content_range, build_unsatisfied_range, parse_range, RangeError};
use crate::reader::{FileReader, ReadError};

pub type Body = BoxBody<Bytes, io::Error>;

pub fn full(body: impl Into<Bytes>) -> Body {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> Body {
    full(Bytes::new())
}

/// Bounded producer/consumer pair backing a streamed response body. The body
/// ends at channel close; an `Err` item aborts it, terminating the connection.
pub fn channel(capacity: usize) -> (mpsc::Sender<io::Result<Bytes>>, Body) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, BoxBody::new(ChannelBody { rx }))
}

struct ChannelBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl hyper::body::Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Serves one GET/HEAD request from a positioned reader: discovers the total
/// length from the reader, honors If-Modified-Since and single byte ranges,
/// and streams the selected span. The reader access pattern is seek-end to
/// size the content, then seek-start plus sequential reads for the body.
pub fn serve(
    method: &Method,
    req_headers: &HeaderMap,
    mut reader: FileReader,
    modified: Option<SystemTime>,
    cache_status: &'static str,
) -> Response<Body> {
    let total = match reader.seek(SeekFrom::End(0)) {
        Ok(size) => size,
        Err(_) => return status_response(StatusCode::NOT_FOUND),
    };

    let mut headers = HeaderMap::new();
    headers.insert(CACHE_STATUS_KEY, cache_status.parse().unwrap());
    if let Some(modified) = modified {
        headers.insert(
            LAST_MODIFIED,
            httpdate::fmt_http_date(modified).parse().unwrap(),
        );
        if unchanged_since(modified, req_headers) {
            return with_headers(StatusCode::NOT_MODIFIED, headers, empty());
        }
    }
    headers.insert(CONTENT_TYPE, OCTET_STREAM.parse().unwrap());
    headers.insert(ACCEPT_RANGES, "bytes".parse().unwrap());

    let range_header = req_headers.get(RANGE).and_then(|val| val.to_str().ok());
    let (status, start, len) = match range_header {
        None => (StatusCode::OK, 0, total),
        Some(raw) => match parse_range(raw, total) {
            Ok(range) => {
                headers.insert(
                    CONTENT_RANGE,
                    build_content_range(range.start, range.end, total)
                        .parse()
                        .unwrap(),
                );
                (StatusCode::PARTIAL_CONTENT, range.start, range.len())
            }
            Err(RangeError::Unsatisfiable) => {
                headers.insert(
                    CONTENT_RANGE,
                    build_unsatisfied_range(total).parse().unwrap(),
                );
                headers.insert(CONTENT_LENGTH, "0".parse().unwrap());
                return with_headers(StatusCode::RANGE_NOT_SATISFIABLE, headers, empty());
            }
            // a Range header we cannot parse is ignored, not refused
            Err(RangeError::Invalid) => (StatusCode::OK, 0, total),
        },
    };
    headers.insert(CONTENT_LENGTH, len.to_string().parse().unwrap());

    if method == Method::HEAD {
        return with_headers(status, headers, empty());
    }

    with_headers(status, headers, spawn_reader(reader, start, len))
}

/// Second-precision If-Modified-Since comparison.
fn unchanged_since(modified: SystemTime, req_headers: &HeaderMap) -> bool {
    let since = match req_headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|val| val.to_str().ok())
        .and_then(|val| httpdate::parse_http_date(val).ok())
    {
        Some(when) => when,
        None => return false,
    };
    epoch_secs(modified) <= epoch_secs(since)
}

fn epoch_secs(when: SystemTime) -> u64 {
    when.duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs())
        .unwrap_or(0)
}

/// Pumps `len` bytes starting at `start` into a streamed body. A failed read
/// aborts the body; a gone client closes the channel and drops the reader,
/// leaving the underlying fetch untouched.
fn spawn_reader(mut reader: FileReader, start: u64, len: u64) -> Body {
    let (tx, body) = channel(8);
    tokio::spawn(async move {
        if let Err(err) = pump(&mut reader, start, len, &tx).await {
            log::debug!("content stream ended early: {err}");
            let _ = tx
                .send(Err(io::Error::new(io::ErrorKind::Interrupted, err)))
                .await;
        }
    });
    body
}

async fn pump(
    reader: &mut FileReader,
    start: u64,
    len: u64,
    tx: &mpsc::Sender<io::Result<Bytes>>,
) -> Result<(), ReadError> {
    reader.seek(SeekFrom::Start(start))?;
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(READ_CHUNK_SIZE as u64) as usize;
        let chunk = reader.read_chunk(want).await?;
        if chunk.is_empty() {
            return Err(ReadError::Aborted);
        }
        remaining -= chunk.len() as u64;
        if tx.send(Ok(chunk)).await.is_err() {
            // client went away; nothing left to serve
            return Ok(());
        }
    }
    Ok(())
}

pub fn with_headers(status: StatusCode, headers: HeaderMap, body: Body) -> Response<Body> {
    let mut builder = Response::builder().status(status);
    for (key, val) in headers.iter() {
        builder = builder.header(key, val);
    }
    builder.body(body).unwrap()
}

pub fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder().status(status).body(empty()).unwrap()
}

pub fn text_response(status: StatusCode, body: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(body.to_string()))
        .unwrap()
}
