use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub cache: Cache,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.upstream.url.trim().is_empty() {
            return Err(anyhow!("upstream.url is required"));
        }
        let uri: http::Uri = self
            .upstream
            .url
            .parse()
            .with_context(|| format!("parse upstream.url {}", self.upstream.url))?;
        if uri.scheme_str().is_none() || uri.authority().is_none() {
            return Err(anyhow!("upstream.url must be an absolute http url"));
        }
        if self.cache.dir.trim().is_empty() {
            return Err(anyhow!("cache.dir must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub caller: bool,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
    #[serde(default)]
    pub nopid: bool,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default, with = "humantime_serde")]
    pub shutdown_grace: Duration,
    #[serde(default)]
    pub access_log: Option<ServerAccessLog>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            shutdown_grace: Duration::default(),
            access_log: None,
        }
    }
}

fn default_addr() -> String {
    ":9000".to_string()
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerAccessLog {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct Upstream {
    /// Origin base url; `<url>/<key>` is fetched for each cache key.
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct Cache {
    #[serde(default = "default_cache_dir")]
    pub dir: String,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> String {
    "cache".to_string()
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;

    Ok((cfg, ignored))
}
