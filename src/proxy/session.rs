//! Per-connection proxy session: the decision between serving from cache,
//! revalidating, and fetching from the origin.
//!
//! Cached content is the raw origin response (status line, headers, body) and
//! is relayed byte-for-byte. Exactly one origin round-trip happens per
//! session, and the client connection is closed on every exit path.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::cache::{CacheKey, ObjectCache};
use crate::error::{ProxyError, ProxyResult};

use super::request::{self, Target};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; recache/0.1)";
const RELAY_CHUNK: usize = 8192;

/// The single terminal outcome of a proxy session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Method other than GET; no origin contact
    NotImplemented,
    /// Unparsable request line or URI; no origin contact
    BadRequest,
    /// Origin connect failed; cache left untouched
    Unreachable,
    /// Cache miss served by a full origin fetch
    Fetched { bytes: u64, cached: bool },
    /// Cache hit revalidated; origin said not modified, cached bytes relayed
    NotModified { bytes: u64 },
    /// Cache hit revalidated; origin sent a new response
    Updated { bytes: u64, cached: bool },
}

/// Run one proxy session over an accepted client connection.
///
/// Parses the request, consults the cache, performs a conditional
/// revalidation or a full fetch against the origin, streams the response to
/// the client, and updates the cache. The stream is consumed and therefore
/// closed on every path.
pub async fn handle_session(
    stream: TcpStream,
    cache: Arc<ObjectCache>,
) -> ProxyResult<SessionOutcome> {
    let (read_half, mut client_writer) = stream.into_split();
    let mut client_reader = BufReader::new(read_half);

    let line = match request::read_request_line(&mut client_reader).await {
        Ok(line) => line,
        Err(e) if e.is_rejection() => {
            debug!("rejected request: {}", e);
            return Ok(SessionOutcome::BadRequest);
        }
        Err(e) => return Err(e),
    };

    if !line.method.eq_ignore_ascii_case("GET") {
        debug!("method not implemented: {}", line.method);
        return Ok(SessionOutcome::NotImplemented);
    }

    let target = match request::parse_target(&line.uri) {
        Ok(target) => target,
        Err(e) => {
            debug!("unparsable URI {:?}: {}", line.uri, e);
            return Ok(SessionOutcome::BadRequest);
        }
    };

    if let Err(e) = request::drain_headers(&mut client_reader).await {
        if e.is_rejection() {
            debug!("rejected header block: {}", e);
            return Ok(SessionOutcome::BadRequest);
        }
        return Err(e);
    }

    let key = CacheKey::new(target.host.clone(), target.path.clone(), target.port);
    let outcome = match cache.find(&key).await {
        Some(hit) => revalidate(&target, key, hit, cache, &mut client_writer).await?,
        None => fetch(&target, key, cache, &mut client_writer).await?,
    };

    // Close our side explicitly; errors here mean the client already left.
    let _ = client_writer.shutdown().await;
    Ok(outcome)
}

/// Revalidate a cache hit with a conditional GET.
///
/// On 304 the cached bytes are relayed and the entry is untouched; any other
/// status is handled exactly like a miss and replaces the entry (unless the
/// new body exceeds the ceiling, in which case the stale entry stays).
async fn revalidate<W>(
    target: &Target,
    key: CacheKey,
    hit: crate::cache::CacheHit,
    cache: Arc<ObjectCache>,
    client: &mut W,
) -> ProxyResult<SessionOutcome>
where
    W: AsyncWrite + Unpin,
{
    let origin = match connect_origin(target).await {
        Ok(origin) => origin,
        Err(e) => {
            warn!("revalidation connect failed, entry untouched: {}", e);
            return Ok(SessionOutcome::Unreachable);
        }
    };
    let (origin_read, mut origin_write) = origin.into_split();
    let mut origin_reader = BufReader::new(origin_read);

    send_origin_request(&mut origin_write, target, Some(&hit.last_modified)).await?;

    let status_line = read_status_line(&mut origin_reader).await?;
    if is_not_modified(&status_line) {
        debug!("origin confirmed {} unchanged, serving cached bytes", key);
        client
            .write_all(&hit.content)
            .await
            .map_err(|e| ProxyError::transfer(format!("client write failed: {}", e)))?;
        return Ok(SessionOutcome::NotModified { bytes: hit.size });
    }

    debug!("origin reports {} modified, refreshing", key);
    let (bytes, body) = relay_and_buffer(
        &mut origin_reader,
        client,
        &status_line,
        cache.max_object_size(),
    )
    .await?;

    let cached = match body {
        Some(body) => cache.insert(key, body, http_date_now()).await,
        // Over the ceiling: the stale entry stays as-is.
        None => false,
    };
    Ok(SessionOutcome::Updated { bytes, cached })
}

/// Fetch a missing object from the origin, streaming it to the client while
/// accumulating up to the per-object ceiling.
async fn fetch<W>(
    target: &Target,
    key: CacheKey,
    cache: Arc<ObjectCache>,
    client: &mut W,
) -> ProxyResult<SessionOutcome>
where
    W: AsyncWrite + Unpin,
{
    let origin = match connect_origin(target).await {
        Ok(origin) => origin,
        Err(e) => {
            warn!("origin connect failed: {}", e);
            return Ok(SessionOutcome::Unreachable);
        }
    };
    let (mut origin_read, mut origin_write) = origin.into_split();

    send_origin_request(&mut origin_write, target, None).await?;

    let (bytes, body) =
        relay_and_buffer(&mut origin_read, client, &[], cache.max_object_size()).await?;

    let cached = match body {
        Some(body) => cache.insert(key, body, http_date_now()).await,
        None => {
            debug!("object of {} bytes exceeds ceiling, streamed uncached", bytes);
            false
        }
    };
    Ok(SessionOutcome::Fetched { bytes, cached })
}

/// Open a connection to the origin server
async fn connect_origin(target: &Target) -> ProxyResult<TcpStream> {
    TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(|e| ProxyError::connect(target.host.clone(), target.port, e.to_string()))
}

/// Write the rewritten origin-relative request line and standard headers
async fn send_origin_request<W>(
    origin: &mut W,
    target: &Target,
    if_modified_since: Option<&str>,
) -> ProxyResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: {}\r\nConnection: close\r\nProxy-Connection: close\r\n",
        target.path, target.host, USER_AGENT
    );
    if let Some(marker) = if_modified_since {
        request.push_str("If-Modified-Since: ");
        request.push_str(marker);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    origin
        .write_all(request.as_bytes())
        .await
        .map_err(|e| ProxyError::transfer(format!("origin write failed: {}", e)))?;
    origin
        .flush()
        .await
        .map_err(|e| ProxyError::transfer(format!("origin flush failed: {}", e)))?;
    Ok(())
}

/// Read the origin's status line, including its line terminator
async fn read_status_line<R>(origin: &mut R) -> ProxyResult<Vec<u8>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = tokio::io::AsyncBufReadExt::read_until(origin, b'\n', &mut line)
        .await
        .map_err(|e| ProxyError::transfer(format!("origin read failed: {}", e)))?;
    if n == 0 {
        return Err(ProxyError::transfer("origin closed before status line"));
    }
    Ok(line)
}

/// Whether a status line carries a 304 Not Modified code
fn is_not_modified(status_line: &[u8]) -> bool {
    std::str::from_utf8(status_line)
        .ok()
        .and_then(|line| line.split_whitespace().nth(1))
        .map(|code| code == "304")
        .unwrap_or(false)
}

/// Relay origin bytes to the client as they arrive, accumulating a copy up
/// to `ceiling` bytes.
///
/// `prefix` (e.g. an already-read status line) is relayed and counted first.
/// Returns the total byte count and the accumulated buffer, or `None` when
/// the total exceeded the ceiling (the client still received everything).
async fn relay_and_buffer<R, W>(
    origin: &mut R,
    client: &mut W,
    prefix: &[u8],
    ceiling: u64,
) -> ProxyResult<(u64, Option<Bytes>)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total: u64 = 0;
    let mut accumulated = BytesMut::new();
    let mut chunk = [0u8; RELAY_CHUNK];

    if !prefix.is_empty() {
        client
            .write_all(prefix)
            .await
            .map_err(|e| ProxyError::transfer(format!("client write failed: {}", e)))?;
        total += prefix.len() as u64;
        if total <= ceiling {
            accumulated.extend_from_slice(prefix);
        }
    }

    loop {
        let n = origin
            .read(&mut chunk)
            .await
            .map_err(|e| ProxyError::transfer(format!("origin read failed: {}", e)))?;
        if n == 0 {
            break;
        }
        client
            .write_all(&chunk[..n])
            .await
            .map_err(|e| ProxyError::transfer(format!("client write failed: {}", e)))?;
        total += n as u64;
        // Accumulate only while the running total is still cacheable.
        if total <= ceiling {
            accumulated.extend_from_slice(&chunk[..n]);
        }
    }

    client
        .flush()
        .await
        .map_err(|e| ProxyError::transfer(format!("client flush failed: {}", e)))?;

    if total <= ceiling {
        Ok((total, Some(accumulated.freeze())))
    } else {
        Ok((total, None))
    }
}

/// Current time as an HTTP-date (IMF-fixdate) last-modified marker
fn http_date_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_not_modified() {
        assert!(is_not_modified(b"HTTP/1.1 304 Not Modified\r\n"));
        assert!(is_not_modified(b"HTTP/1.0 304 Not Modified\r\n"));
        assert!(!is_not_modified(b"HTTP/1.1 200 OK\r\n"));
        assert!(!is_not_modified(b"HTTP/1.1 404 Not Found\r\n"));
        assert!(!is_not_modified(b"garbage\r\n"));
        assert!(!is_not_modified(b""));
    }

    #[test]
    fn test_http_date_format() {
        let date = http_date_now();
        // IMF-fixdate is always 29 characters, e.g.
        // "Sun, 06 Nov 1994 08:49:37 GMT".
        assert_eq!(date.len(), 29);
        assert!(date.ends_with(" GMT"));
        assert_eq!(&date[3..5], ", ");
    }

    #[tokio::test]
    async fn test_relay_and_buffer_within_ceiling() {
        let origin_data = b"HTTP/1.0 200 OK\r\n\r\nhello world";
        let mut origin = &origin_data[..];
        let mut client = Vec::new();

        let (total, body) = relay_and_buffer(&mut origin, &mut client, &[], 1024)
            .await
            .unwrap();
        assert_eq!(total, origin_data.len() as u64);
        assert_eq!(client, origin_data);
        assert_eq!(body.unwrap(), Bytes::from_static(origin_data));
    }

    #[tokio::test]
    async fn test_relay_and_buffer_over_ceiling() {
        let origin_data = vec![b'x'; 100];
        let mut origin = &origin_data[..];
        let mut client = Vec::new();

        let (total, body) = relay_and_buffer(&mut origin, &mut client, &[], 99)
            .await
            .unwrap();
        // The client still receives everything; the buffer is discarded.
        assert_eq!(total, 100);
        assert_eq!(client, origin_data);
        assert!(body.is_none());
    }

    #[tokio::test]
    async fn test_relay_and_buffer_exactly_at_ceiling() {
        let origin_data = vec![b'x'; 100];
        let mut origin = &origin_data[..];
        let mut client = Vec::new();

        let (total, body) = relay_and_buffer(&mut origin, &mut client, &[], 100)
            .await
            .unwrap();
        assert_eq!(total, 100);
        assert_eq!(body.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_relay_and_buffer_prefix_counts() {
        let prefix = b"HTTP/1.1 200 OK\r\n";
        let rest = b"\r\nbody";
        let mut origin = &rest[..];
        let mut client = Vec::new();

        let (total, body) = relay_and_buffer(&mut origin, &mut client, prefix, 1024)
            .await
            .unwrap();
        assert_eq!(total, (prefix.len() + rest.len()) as u64);
        assert_eq!(client, [&prefix[..], &rest[..]].concat());
        assert_eq!(body.unwrap(), Bytes::from([&prefix[..], &rest[..]].concat()));
    }
}
