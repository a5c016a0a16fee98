use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONTENT_LENGTH, IF_MODIFIED_SINCE, LAST_MODIFIED};
use http::{Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use tokio::sync::watch;

use crate::registry::{Download, Outcome, Progress, Registry};

/// HTTP client for the origin. Compression is refused on every request so
/// Content-Length is authoritative and byte offsets match file offsets.
#[derive(Clone)]
pub struct OriginClient {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl OriginClient {
    pub fn new() -> Self {
        let connector = HttpConnector::new();
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);
        Self { client }
    }

    async fn get(
        &self,
        uri: &Uri,
        if_modified_since: Option<SystemTime>,
    ) -> Result<http::Response<Incoming>> {
        let mut req = http::Request::builder()
            .method(Method::GET)
            .uri(uri.clone())
            .header(ACCEPT_ENCODING, "identity");
        if let Some(when) = if_modified_since {
            req = req.header(IF_MODIFIED_SINCE, httpdate::fmt_http_date(when));
        }
        let req = req
            .body(Full::new(Bytes::new()))
            .context("build origin request")?;
        self.client.request(req).await.context("origin request")
    }
}

impl Default for OriginClient {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FetchJob {
    pub key: String,
    pub url: Uri,
    pub dest: PathBuf,
    pub if_modified_since: Option<SystemTime>,
}

/// Drives one origin fetch to completion and retires its registry entry.
/// Runs on its own task; client disconnects never cancel it, so the cache is
/// warmed even when every tailing reader goes away.
pub async fn run(client: OriginClient, registry: Arc<Registry>, job: FetchJob) {
    match download(&client, &registry, &job).await {
        Ok(FetchResult::Stored) => log::info!("download of {} done", job.key),
        Ok(FetchResult::NotModified) => log::debug!("{} not modified at origin", job.key),
        Err(err) => log::warn!("download of {} failed: {err:#}", job.key),
    }
    registry.retire(&job.key).await;
}

enum FetchResult {
    Stored,
    NotModified,
}

async fn download(
    client: &OriginClient,
    registry: &Registry,
    job: &FetchJob,
) -> Result<FetchResult> {
    let resp = client.get(&job.url, job.if_modified_since).await?;
    let status = resp.status();
    if status == StatusCode::NOT_MODIFIED {
        return Ok(FetchResult::NotModified);
    }
    if !status.is_success() {
        bail!("origin returned {status} for {}", job.url);
    }

    let total = resp
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|val| val.to_str().ok())
        .and_then(|val| val.parse::<u64>().ok())
        .ok_or_else(|| anyhow!("origin response has no usable Content-Length"))?;
    let modified = resp
        .headers()
        .get(LAST_MODIFIED)
        .and_then(|val| val.to_str().ok())
        .and_then(|val| httpdate::parse_http_date(val).ok());

    // A fresh key streams straight into its cache path. Replacing an existing
    // cached file goes through a staging path and a rename, so readers that
    // already hold the old file keep an intact inode.
    let staged = job.dest.exists();
    let write_path = if staged {
        staging_path(&job.dest)
    } else {
        job.dest.clone()
    };

    let file = File::create(&write_path)
        .with_context(|| format!("create {}", write_path.display()))?;
    let (tx, rx) = watch::channel(Progress::Streaming(0));
    registry
        .publish(
            &job.key,
            Arc::new(Download::new(total, write_path.clone(), rx)),
        )
        .await;

    let result = write_body(resp.into_body(), &file, total, &tx).await;
    match result {
        Ok(()) => {
            if let Some(modified) = modified {
                let _ = file.set_modified(modified);
            }
            drop(file);
            if staged {
                if let Err(err) = fs::rename(&write_path, &job.dest) {
                    let _ = fs::remove_file(&write_path);
                    let _ = tx.send(Progress::Done(Outcome::Failed));
                    return Err(err).with_context(|| format!("replace {}", job.dest.display()));
                }
            }
            let _ = tx.send(Progress::Done(Outcome::Complete));
            Ok(FetchResult::Stored)
        }
        Err(err) => {
            drop(file);
            let _ = fs::remove_file(&write_path);
            let _ = tx.send(Progress::Done(Outcome::Failed));
            Err(err)
        }
    }
}

/// Streams the response body to disk, advancing the watermark after each
/// chunk lands in the page cache. The byte count must end up exactly at the
/// declared total; anything else poisons the file.
async fn write_body(
    mut body: Incoming,
    file: &File,
    total: u64,
    tx: &watch::Sender<Progress>,
) -> Result<()> {
    let mut out = file;
    let mut written: u64 = 0;
    while let Some(frame) = body.frame().await {
        let frame = frame.context("read origin body")?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        written += data.len() as u64;
        if written > total {
            bail!("origin sent more than the declared {total} bytes");
        }
        out.write_all(&data).context("write cache file")?;
        let _ = tx.send(Progress::Streaming(written));
    }
    if written != total {
        bail!("origin closed early at {written} of {total} bytes");
    }
    Ok(())
}

fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}
