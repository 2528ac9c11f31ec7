//! Append-only persistence log for the object cache.
//!
//! Each successful insert appends one binary record; at startup the log is
//! replayed in file order to rebuild the in-memory cache. Loading never
//! writes back what it reads, so the log cannot grow across restarts without
//! new inserts.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};

/// Fixed width of the serialized last-modified marker
pub const LAST_MODIFIED_WIDTH: usize = 32;
/// Maximum serialized hostname length
pub const MAX_HOST_LEN: usize = 2048;
/// Maximum serialized path length
pub const MAX_PATH_LEN: usize = 8192;

/// One serialized cache entry.
///
/// Layout (little-endian): freq u64, port u16, host (u16 length + bytes),
/// path (u16 length + bytes), content (u64 length + bytes), last-modified
/// marker (fixed 32 bytes, space-padded ASCII).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub freq: u64,
    pub port: u16,
    pub host: String,
    pub path: String,
    pub content: Bytes,
    pub last_modified: String,
}

impl CacheRecord {
    /// Serialize this record for appending to the log
    pub fn encode(&self) -> ProxyResult<Vec<u8>> {
        if self.host.len() > MAX_HOST_LEN {
            return Err(ProxyError::persistence("hostname exceeds record bound"));
        }
        if self.path.len() > MAX_PATH_LEN {
            return Err(ProxyError::persistence("path exceeds record bound"));
        }
        if self.last_modified.len() > LAST_MODIFIED_WIDTH {
            return Err(ProxyError::persistence(
                "last-modified marker exceeds fixed width",
            ));
        }

        let mut buf = Vec::with_capacity(
            8 + 2 + 2 + self.host.len() + 2 + self.path.len() + 8 + self.content.len()
                + LAST_MODIFIED_WIDTH,
        );
        buf.extend_from_slice(&self.freq.to_le_bytes());
        buf.extend_from_slice(&self.port.to_le_bytes());
        buf.extend_from_slice(&(self.host.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.host.as_bytes());
        buf.extend_from_slice(&(self.path.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.path.as_bytes());
        buf.extend_from_slice(&(self.content.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.content);

        let mut marker = [b' '; LAST_MODIFIED_WIDTH];
        marker[..self.last_modified.len()].copy_from_slice(self.last_modified.as_bytes());
        buf.extend_from_slice(&marker);

        Ok(buf)
    }

    /// Decode one record from `buf` starting at `*offset`, advancing the
    /// offset past it. Returns `Ok(None)` at a clean end of input; any
    /// truncated or out-of-bounds field is an error.
    pub fn decode(buf: &[u8], offset: &mut usize, max_content_len: u64) -> ProxyResult<Option<Self>> {
        if *offset == buf.len() {
            return Ok(None);
        }

        let freq = read_u64(buf, offset)?;
        let port = read_u16(buf, offset)?;

        let host_len = read_u16(buf, offset)? as usize;
        if host_len > MAX_HOST_LEN {
            return Err(ProxyError::persistence("hostname field exceeds bound"));
        }
        let host = read_str(buf, offset, host_len)?;

        let path_len = read_u16(buf, offset)? as usize;
        if path_len > MAX_PATH_LEN {
            return Err(ProxyError::persistence("path field exceeds bound"));
        }
        let path = read_str(buf, offset, path_len)?;

        let content_len = read_u64(buf, offset)?;
        if content_len > max_content_len {
            // Records over the per-object ceiling are never written, so this
            // length is corrupt.
            return Err(ProxyError::persistence("content length exceeds ceiling"));
        }
        let content = Bytes::copy_from_slice(read_bytes(buf, offset, content_len as usize)?);

        let marker_raw = read_bytes(buf, offset, LAST_MODIFIED_WIDTH)?;
        let last_modified = std::str::from_utf8(marker_raw)
            .map_err(|_| ProxyError::persistence("non-UTF-8 last-modified marker"))?
            .trim_end()
            .to_string();

        Ok(Some(CacheRecord {
            freq,
            port,
            host,
            path,
            content,
            last_modified,
        }))
    }
}

fn read_bytes<'a>(buf: &'a [u8], offset: &mut usize, len: usize) -> ProxyResult<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| ProxyError::persistence("record length overflow"))?;
    if end > buf.len() {
        return Err(ProxyError::persistence("truncated record"));
    }
    let slice = &buf[*offset..end];
    *offset = end;
    Ok(slice)
}

fn read_u64(buf: &[u8], offset: &mut usize) -> ProxyResult<u64> {
    let raw = read_bytes(buf, offset, 8)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(raw);
    Ok(u64::from_le_bytes(arr))
}

fn read_u16(buf: &[u8], offset: &mut usize) -> ProxyResult<u16> {
    let raw = read_bytes(buf, offset, 2)?;
    let mut arr = [0u8; 2];
    arr.copy_from_slice(raw);
    Ok(u16::from_le_bytes(arr))
}

fn read_str(buf: &[u8], offset: &mut usize, len: usize) -> ProxyResult<String> {
    let raw = read_bytes(buf, offset, len)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| ProxyError::persistence("non-UTF-8 string field"))
}

/// Handle to the append side of the persistence log
pub struct CacheLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl CacheLog {
    /// Open (creating if absent) the log for appending
    pub async fn open_append<P: AsRef<Path>>(path: P) -> ProxyResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await
            .map_err(|e| {
                ProxyError::persistence(format!(
                    "failed to open log {}: {}",
                    path.as_ref().display(),
                    e
                ))
            })?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Append one record and flush it
    pub async fn append(&self, record: &CacheRecord) -> ProxyResult<()> {
        let encoded = record.encode()?;
        let mut file = self.file.lock().await;
        file.write_all(&encoded)
            .await
            .map_err(|e| ProxyError::persistence(format!("log append failed: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| ProxyError::persistence(format!("log flush failed: {}", e)))?;
        debug!(
            "appended {} byte record to {}",
            encoded.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Path of the underlying log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Replay the log at `path`, returning the records in file order.
///
/// A missing file yields an empty set. A corrupt or truncated record aborts
/// the replay with a warning; everything decoded so far is kept. This path
/// only reads: it never re-appends replayed records.
pub async fn load_records<P: AsRef<Path>>(path: P, max_content_len: u64) -> Vec<CacheRecord> {
    let path = path.as_ref();
    let buf = match tokio::fs::read(path).await {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("failed to read cache log {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    let mut records = Vec::new();
    let mut offset = 0usize;
    loop {
        match CacheRecord::decode(&buf, &mut offset, max_content_len) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => break,
            Err(e) => {
                warn!(
                    "cache log {} corrupt after {} record(s): {}; keeping what was loaded",
                    path.display(),
                    records.len(),
                    e
                );
                break;
            }
        }
    }
    records
}
