use std::fmt;
use std::fs::File;
use std::io::{self, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task;

use crate::registry::{Download, Outcome, Progress};

#[derive(Debug)]
pub enum ReadError {
    /// Seek target outside `[0, total_size]`.
    InvalidSeek,
    /// The fetch writing the file was retired with a failure.
    Aborted,
    Io(io::Error),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::InvalidSeek => write!(f, "seek outside of file bounds"),
            ReadError::Aborted => write!(f, "download aborted"),
            ReadError::Io(err) => write!(f, "read failed: {err}"),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> Self {
        ReadError::Io(err)
    }
}

/// Positioned reader handed to the content layer: either tails a file that is
/// still being written, or reads a completed cache file. Dropping a reader
/// releases its handle without affecting other readers of the same file.
pub enum FileReader {
    Growing(GrowingFileReader),
    Cached(CachedFileReader),
}

impl FileReader {
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, ReadError> {
        match self {
            FileReader::Growing(reader) => reader.seek(pos),
            FileReader::Cached(reader) => reader.seek(pos),
        }
    }

    pub async fn read_chunk(&mut self, max: usize) -> Result<Bytes, ReadError> {
        match self {
            FileReader::Growing(reader) => reader.read_chunk(max).await,
            FileReader::Cached(reader) => reader.read_chunk(max).await,
        }
    }
}

/// Reader over a file with a declared final size that a fetcher is still
/// appending to. Reads wait on the fetcher's watermark channel until the
/// requested span is on disk; they never return bytes past the declared size,
/// even if the underlying file briefly grows larger.
pub struct GrowingFileReader {
    file: Arc<File>,
    total_size: u64,
    pos: u64,
    progress: watch::Receiver<Progress>,
}

impl GrowingFileReader {
    pub fn open(download: &Download) -> io::Result<Self> {
        let file = File::open(download.path())?;
        Ok(Self {
            file: Arc::new(file),
            total_size: download.total_size(),
            pos: 0,
            progress: download.progress(),
        })
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, ReadError> {
        self.pos = bounded_seek(pos, self.pos, self.total_size)?;
        Ok(self.pos)
    }

    pub async fn read_chunk(&mut self, max: usize) -> Result<Bytes, ReadError> {
        if self.pos >= self.total_size || max == 0 {
            return Ok(Bytes::new());
        }
        let goal = (self.pos + max as u64).min(self.total_size);
        self.wait_for(goal).await?;
        let chunk = read_at(&self.file, self.pos, (goal - self.pos) as usize).await?;
        if chunk.is_empty() {
            // watermark said the span is there; a shorter file means the
            // writer went away underneath us
            return Err(ReadError::Aborted);
        }
        self.pos += chunk.len() as u64;
        Ok(chunk)
    }

    /// Blocks until the flushed watermark covers `goal` or the file is fully
    /// written. A failed fetch, or a writer that vanished without a terminal
    /// signal, unblocks with `Aborted`.
    async fn wait_for(&mut self, goal: u64) -> Result<(), ReadError> {
        loop {
            match *self.progress.borrow_and_update() {
                Progress::Streaming(flushed) if flushed >= goal => return Ok(()),
                Progress::Done(Outcome::Complete) => return Ok(()),
                Progress::Done(Outcome::Failed) => return Err(ReadError::Aborted),
                Progress::Streaming(_) => {}
            }
            if self.progress.changed().await.is_err() {
                return match *self.progress.borrow() {
                    Progress::Streaming(flushed) if flushed >= goal => Ok(()),
                    Progress::Done(Outcome::Complete) => Ok(()),
                    _ => Err(ReadError::Aborted),
                };
            }
        }
    }
}

/// Plain positioned reader over a completed cache file.
pub struct CachedFileReader {
    file: Arc<File>,
    size: u64,
    pos: u64,
}

impl CachedFileReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            size,
            pos: 0,
        })
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, ReadError> {
        self.pos = bounded_seek(pos, self.pos, self.size)?;
        Ok(self.pos)
    }

    pub async fn read_chunk(&mut self, max: usize) -> Result<Bytes, ReadError> {
        if self.pos >= self.size || max == 0 {
            return Ok(Bytes::new());
        }
        let len = ((self.size - self.pos) as usize).min(max);
        let chunk = read_at(&self.file, self.pos, len).await?;
        self.pos += chunk.len() as u64;
        Ok(chunk)
    }
}

/// Cursor arithmetic shared by both readers. `End(0)` reports the size with
/// no I/O; anything landing outside `[0, size]` is rejected.
fn bounded_seek(pos: SeekFrom, current: u64, size: u64) -> Result<u64, ReadError> {
    let next = match pos {
        SeekFrom::Start(offset) => offset as i128,
        SeekFrom::Current(offset) => current as i128 + offset as i128,
        SeekFrom::End(offset) => size as i128 + offset as i128,
    };
    if next < 0 || next > size as i128 {
        return Err(ReadError::InvalidSeek);
    }
    Ok(next as u64)
}

/// One `pread` off the async runtime. Readers never share a file cursor with
/// each other or with the writer.
async fn read_at(file: &Arc<File>, offset: u64, len: usize) -> io::Result<Bytes> {
    let file = Arc::clone(file);
    task::spawn_blocking(move || {
        let mut buf = vec![0u8; len];
        let n = file.read_at(&mut buf, offset)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    })
    .await
    .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
}
