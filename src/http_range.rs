#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
}

impl RangeSpec {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug)]
pub enum RangeError {
    Invalid,
    Unsatisfiable,
}

pub fn parse_range(header: &str, size: u64) -> Result<RangeSpec, RangeError> {
    let header = header.trim();
    if !header.starts_with("bytes=") {
        return Err(RangeError::Invalid);
    }
    let range = &header[6..];
    if range.is_empty() {
        return Err(RangeError::Invalid);
    }

    let parts: Vec<&str> = range.split('-').collect();
    if parts.len() != 2 {
        return Err(RangeError::Invalid);
    }

    let start_str = parts[0].trim();
    let end_str = parts[1].trim();

    if start_str.is_empty() {
        // suffix range: bytes=-N
        let suffix: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
        if suffix == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        let start = size.saturating_sub(suffix);
        let end = size - 1;
        return Ok(RangeSpec { start, end });
    }

    let start: u64 = start_str.parse().map_err(|_| RangeError::Invalid)?;
    if start >= size {
        return Err(RangeError::Unsatisfiable);
    }

    let end = if end_str.is_empty() {
        size - 1
    } else {
        let end_val: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
        if end_val >= size {
            size - 1
        } else {
            end_val
        }
    };

    if end < start {
        return Err(RangeError::Unsatisfiable);
    }

    Ok(RangeSpec { start, end })
}

pub fn build_content_range(start: u64, end: u64, size: u64) -> String {
    format!("bytes {}-{}/{}", start, end, size)
}

pub fn build_unsatisfied_range(size: u64) -> String {
    format!("bytes */{}", size)
}
