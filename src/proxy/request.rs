//! Client request-line reading and absolute-URI parsing.
//!
//! The proxy accepts forward-proxy requests of the form
//! `GET http://host[:port]/path HTTP/x.x`. All input is bounded: over-length
//! lines and unbounded header blocks are rejected as protocol errors, never
//! buffered.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::cache::persist::{MAX_HOST_LEN, MAX_PATH_LEN};
use crate::error::{ProxyError, ProxyResult};

/// Maximum accepted length of a single request or header line
pub const MAX_LINE_LEN: usize = 8192;
/// Maximum number of client headers drained per request
pub const MAX_HEADER_COUNT: usize = 100;

/// The three tokens of a client request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub uri: String,
    pub version: String,
}

/// An absolute URI resolved to its origin coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub path: String,
    pub port: u16,
}

/// Read one CRLF-terminated line, rejecting over-length input.
///
/// The length bound is enforced while reading: a line that crosses
/// `MAX_LINE_LEN` is rejected with the excess left unread, so an arbitrarily
/// long line never accumulates in memory.
async fn read_line_bounded<R: AsyncBufRead + Unpin>(reader: &mut R) -> ProxyResult<String> {
    let mut line: Vec<u8> = Vec::new();
    loop {
        let available = reader
            .fill_buf()
            .await
            .map_err(|e| ProxyError::transfer(format!("client read failed: {}", e)))?;
        if available.is_empty() {
            if line.is_empty() {
                return Err(ProxyError::protocol("client closed before sending a request"));
            }
            break;
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                if line.len() + idx > MAX_LINE_LEN {
                    return Err(ProxyError::protocol("request line exceeds length bound"));
                }
                line.extend_from_slice(&available[..idx]);
                reader.consume(idx + 1);
                break;
            }
            None => {
                let n = available.len();
                if line.len() + n > MAX_LINE_LEN {
                    return Err(ProxyError::protocol("request line exceeds length bound"));
                }
                line.extend_from_slice(available);
                reader.consume(n);
            }
        }
    }
    while line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map_err(|_| ProxyError::protocol("request line is not valid UTF-8"))
}

/// Read and tokenize the client's request line
pub async fn read_request_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> ProxyResult<RequestLine> {
    let line = read_line_bounded(reader).await?;
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(uri), Some(version), None) => Ok(RequestLine {
            method: method.to_string(),
            uri: uri.to_string(),
            version: version.to_string(),
        }),
        _ => Err(ProxyError::protocol(format!(
            "malformed request line: {:?}",
            line
        ))),
    }
}

/// Consume and discard the client's header block up to the blank line
pub async fn drain_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> ProxyResult<()> {
    for _ in 0..MAX_HEADER_COUNT {
        let line = read_line_bounded(reader).await?;
        if line.is_empty() {
            return Ok(());
        }
    }
    Err(ProxyError::protocol("header block exceeds count bound"))
}

/// Parse an absolute `http://host[:port]/path` URI into a [`Target`].
///
/// The scheme must be http (case-insensitive); an omitted port defaults to
/// 80 and an omitted path to `/`.
pub fn parse_target(uri: &str) -> ProxyResult<Target> {
    let rest = uri
        .split_once("://")
        .and_then(|(scheme, rest)| scheme.eq_ignore_ascii_case("http").then_some(rest))
        .ok_or_else(|| ProxyError::protocol(format!("unsupported URI scheme: {:?}", uri)))?;

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    let (host, port) = match authority.split_once(':') {
        Some((host, port_str)) => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| ProxyError::protocol(format!("invalid port: {:?}", port_str)))?;
            (host, port)
        }
        None => (authority, 80),
    };

    if host.is_empty() {
        return Err(ProxyError::protocol("empty hostname in URI"));
    }
    // Components must fit the persistence record bounds.
    if host.len() > MAX_HOST_LEN || path.len() > MAX_PATH_LEN {
        return Err(ProxyError::protocol("URI component exceeds length bound"));
    }

    Ok(Target {
        host: host.to_string(),
        path: path.to_string(),
        port,
    })
}
