use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, Notify};

/// Terminal result of a fetch, pushed to every tailing reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    Failed,
}

/// Last published state of an in-progress fetch. `Streaming(n)` means the
/// first `n` bytes of the destination file are written and readable;
/// `Done` is sent exactly once, before the record is retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Streaming(u64),
    Done(Outcome),
}

/// An in-progress download. Published to the registry only once the declared
/// total size is known and the destination file exists; immutable afterwards,
/// with the progress channel as the only mutation path.
#[derive(Debug)]
pub struct Download {
    total_size: u64,
    path: PathBuf,
    progress: watch::Receiver<Progress>,
}

impl Download {
    pub fn new(total_size: u64, path: PathBuf, progress: watch::Receiver<Progress>) -> Self {
        Self {
            total_size,
            path,
            progress,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }
}

/// A single-flight slot, resolved once: `Some` with the published record, or
/// `None` when the fetch ended without one (304, connect failure, bad status).
pub struct Flight {
    notify: Notify,
    slot: Mutex<Option<Option<Arc<Download>>>>,
}

impl Flight {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            slot: Mutex::new(None),
        }
    }

    /// Waits until the flight either publishes its record or ends without one.
    pub async fn published(&self) -> Option<Arc<Download>> {
        loop {
            // register interest before checking the slot so a resolve landing
            // in between is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(val) = self.slot.lock().await.clone() {
                return val;
            }
            notified.await;
        }
    }

    async fn resolve(&self, val: Option<Arc<Download>>) {
        let mut slot = self.slot.lock().await;
        if slot.is_none() {
            *slot = Some(val);
        }
        self.notify.notify_waiters();
    }
}

enum Entry {
    Pending(Arc<Flight>),
    Active {
        flight: Arc<Flight>,
        download: Arc<Download>,
    },
}

/// Process-wide table of cache keys currently being fetched. One fetcher per
/// key at any moment; concurrent starts for the same key join the existing
/// flight. The map lock guards insert/lookup/remove only and is never held
/// across I/O or while a response is being served.
pub struct Registry {
    inner: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Single-flight begin. The leader (second element `true`) must launch the
    /// fetch and guarantee `publish` and/or `retire` are eventually called;
    /// everyone may await the returned flight.
    pub async fn start_or_join(&self, key: &str) -> (Arc<Flight>, bool) {
        let mut map = self.inner.lock().await;
        if let Some(entry) = map.get(key) {
            let flight = match entry {
                Entry::Pending(flight) => Arc::clone(flight),
                Entry::Active { flight, .. } => Arc::clone(flight),
            };
            (flight, false)
        } else {
            let flight = Arc::new(Flight::new());
            map.insert(key.to_string(), Entry::Pending(Arc::clone(&flight)));
            (flight, true)
        }
    }

    /// Returns the published record for `key`, if any. Pending flights are
    /// invisible; a missing record means "not started or already finished"
    /// and callers re-check the filesystem.
    pub async fn lookup(&self, key: &str) -> Option<Arc<Download>> {
        match self.inner.lock().await.get(key) {
            Some(Entry::Active { download, .. }) => Some(Arc::clone(download)),
            _ => None,
        }
    }

    /// Makes the record visible to joiners. Called by the fetcher once the
    /// declared size is known and the destination file exists.
    pub async fn publish(&self, key: &str, download: Arc<Download>) {
        let flight = {
            let mut map = self.inner.lock().await;
            let flight = match map.remove(key) {
                Some(Entry::Pending(flight)) => flight,
                Some(entry) => {
                    map.insert(key.to_string(), entry);
                    return;
                }
                None => return,
            };
            map.insert(
                key.to_string(),
                Entry::Active {
                    flight: Arc::clone(&flight),
                    download: Arc::clone(&download),
                },
            );
            flight
        };
        flight.resolve(Some(download)).await;
    }

    /// Removes the entry for `key`. A flight that never published resolves to
    /// `None` so its joiners stop waiting.
    pub async fn retire(&self, key: &str) {
        let entry = self.inner.lock().await.remove(key);
        if let Some(Entry::Pending(flight)) = entry {
            flight.resolve(None).await;
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
