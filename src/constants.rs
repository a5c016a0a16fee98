pub const CACHE_STATUS_KEY: &str = "X-Cache";

/// Suffixes of repository metadata files that can change at the origin under
/// the same name and therefore need revalidation on every request.
pub const MUTABLE_SUFFIXES: &[&str] = &[".db", ".db.sig", ".files"];

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Read granularity when pumping a file into a response body.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;
