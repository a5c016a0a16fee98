use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use http::header::IF_MODIFIED_SINCE;
use http::{HeaderMap, Request, Response, Uri};
use hyper::body::Incoming;

use crate::config::Bootstrap;
use crate::constants::MUTABLE_SUFFIXES;
use crate::content::{self, Body};
use crate::fetcher::{self, FetchJob, OriginClient};
use crate::reader::{CachedFileReader, FileReader, GrowingFileReader};
use crate::registry::{Download, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Key was absent; this request started the download and tails it.
    Miss,
    /// Tailing a download another request started.
    Stream,
    Hit,
    /// Served from cache while a revalidation runs in the background.
    Revalidate,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Miss => "MISS",
            CacheStatus::Stream => "STREAM",
            CacheStatus::Hit => "HIT",
            CacheStatus::Revalidate => "REVALIDATE",
        }
    }
}

/// Extracts the cache key from a request path. Only `/repo/<key>` is served;
/// the key is the single path segment after the prefix and may not name the
/// cache directory itself or its parent.
pub fn repo_key(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/repo/")?;
    let key = rest.split('/').next().unwrap_or("");
    if key.is_empty() || key == "." || key == ".." {
        return None;
    }
    Some(key)
}

pub fn is_mutable(key: &str) -> bool {
    MUTABLE_SUFFIXES.iter().any(|suffix| key.ends_with(suffix))
}

/// Per-request classifier. Looks at the cache directory and the download
/// registry, picks a serve strategy, and hands a positioned reader to the
/// content layer. None of the observations are transactional; every
/// interleaving of file appearance and record retirement still yields a
/// correct serve (a saturated growing reader degenerates to a plain read, and
/// a vanished in-flight file falls back to the cached copy).
pub struct Mirror {
    cfg: Arc<Bootstrap>,
    registry: Arc<Registry>,
    origin: OriginClient,
}

impl Mirror {
    pub fn new(cfg: Arc<Bootstrap>) -> Self {
        Self {
            cfg,
            registry: Arc::new(Registry::new()),
            origin: OriginClient::new(),
        }
    }

    pub async fn dispatch(&self, req: &Request<Incoming>, key: &str) -> Result<Response<Body>> {
        let dir = PathBuf::from(&self.cfg.cache.dir);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create cache dir {}", dir.display()))?;
        let path = dir.join(key);

        let meta = tokio::fs::metadata(&path)
            .await
            .ok()
            .filter(|meta| meta.is_file());
        let Some(meta) = meta else {
            return self.serve_absent(req, key, &path).await;
        };

        if let Some(download) = self.registry.lookup(key).await {
            // partial file with a live fetch behind it; tail the download.
            // The registry lock is already released here, serving can block
            // for as long as the download takes.
            if let Some(reader) = open_growing(&download) {
                return Ok(content::serve(
                    req.method(),
                    req.headers(),
                    reader,
                    None,
                    CacheStatus::Stream.as_str(),
                ));
            }
            // record retired and its file moved underneath us; the cached
            // copy is authoritative now
        }

        if is_mutable(key) {
            self.trigger_revalidate(req.headers(), key, &path, &meta).await;
            return self.serve_cached(req, &path, &meta, CacheStatus::Revalidate);
        }

        self.serve_cached(req, &path, &meta, CacheStatus::Hit)
    }

    /// Nothing on disk: become the downloading request or join the one in
    /// progress, then tail the file while it arrives.
    async fn serve_absent(
        &self,
        req: &Request<Incoming>,
        key: &str,
        path: &Path,
    ) -> Result<Response<Body>> {
        let (flight, leader) = self.registry.start_or_join(key).await;
        if leader {
            log::info!("file {key} missing, starting download");
            if let Err(err) = self.spawn_fetch(key, path, None) {
                self.registry.retire(key).await;
                return Err(err);
            }
        }

        if let Some(download) = flight.published().await {
            if let Some(reader) = open_growing(&download) {
                let status = if leader {
                    CacheStatus::Miss
                } else {
                    CacheStatus::Stream
                };
                return Ok(content::serve(
                    req.method(),
                    req.headers(),
                    reader,
                    None,
                    status.as_str(),
                ));
            }
        }

        // The fetch ended without a record we can tail (304, failure, or a
        // fetch so short it already finalized). The filesystem decides.
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("origin fetch for {key} produced nothing"))?;
        self.serve_cached(req, path, &meta, CacheStatus::Hit)
    }

    fn serve_cached(
        &self,
        req: &Request<Incoming>,
        path: &Path,
        meta: &Metadata,
        status: CacheStatus,
    ) -> Result<Response<Body>> {
        let reader = CachedFileReader::open(path)
            .with_context(|| format!("open cached {}", path.display()))?;
        let modified = meta.modified().context("cached file mtime")?;
        Ok(content::serve(
            req.method(),
            req.headers(),
            FileReader::Cached(reader),
            Some(modified),
            status.as_str(),
        ))
    }

    /// Kicks off a conditional refetch for repository metadata without ever
    /// blocking the response that is about to be served from cache.
    async fn trigger_revalidate(
        &self,
        req_headers: &HeaderMap,
        key: &str,
        path: &Path,
        meta: &Metadata,
    ) {
        let (_flight, leader) = self.registry.start_or_join(key).await;
        if !leader {
            return;
        }
        let mtime = meta.modified().ok();
        let since = match (request_modified_since(req_headers), mtime) {
            (Some(header), Some(mtime)) => Some(header.max(mtime)),
            (header, mtime) => header.or(mtime),
        };
        log::debug!("revalidating {key} at origin");
        if let Err(err) = self.spawn_fetch(key, path, since) {
            log::warn!("revalidation of {key} not started: {err:#}");
            self.registry.retire(key).await;
        }
    }

    fn spawn_fetch(&self, key: &str, dest: &Path, since: Option<SystemTime>) -> Result<()> {
        let url: Uri = format!("{}/{}", self.cfg.upstream.url.trim_end_matches('/'), key)
            .parse()
            .with_context(|| format!("build origin url for {key}"))?;
        let job = FetchJob {
            key: key.to_string(),
            url,
            dest: dest.to_path_buf(),
            if_modified_since: since,
        };
        tokio::spawn(fetcher::run(
            self.origin.clone(),
            Arc::clone(&self.registry),
            job,
        ));
        Ok(())
    }
}

fn open_growing(download: &Download) -> Option<FileReader> {
    match GrowingFileReader::open(download) {
        Ok(reader) => Some(FileReader::Growing(reader)),
        Err(err) => {
            log::debug!("in-flight file went away before opening: {err}");
            None
        }
    }
}

fn request_modified_since(headers: &HeaderMap) -> Option<SystemTime> {
    headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|val| val.to_str().ok())
        .and_then(|val| httpdate::parse_http_date(val).ok())
}
