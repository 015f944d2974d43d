//! HTTP/1.x request heads read straight off the client socket.

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("failed to read request head: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("request head exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("connection closed mid request head")]
    Truncated,
}

/// Parsed request line and headers, with header values kept as raw bytes so
/// they can be forwarded untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent (path plus optional query).
    pub target: String,
    /// Minor HTTP version: `0` for HTTP/1.0, `1` for HTTP/1.1.
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// Try to parse a complete head from the start of `buf`.  Returns the
    /// head and its length in bytes, or `None` if more input is needed.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, httparse::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        // A complete parse always fills these in.
        let head = Self {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            version: req.version.unwrap_or(1),
            headers: req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
        };
        Ok(Some((head, len)))
    }

    /// Path component of the target.
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    /// Raw query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, query)| query)
    }

    /// First value of header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }
}

/// First value of query parameter `name` in a raw query string.
pub fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (key == name).then_some(value)
    })
}

/// Whether the query carries `go-get=1`.
pub fn is_discovery(query: Option<&str>) -> bool {
    query_param(query, "go-get") == Some("1")
}

/// Read from `stream` until a complete request head has been buffered.
///
/// Returns `Ok(None)` if the peer closed the connection before sending
/// anything.  On success the returned buffer holds the head followed by
/// whatever body bytes arrived in the same reads.
pub async fn read_head<S>(
    stream: &mut S,
    limit: usize,
) -> Result<Option<(RequestHead, BytesMut, usize)>, HeadError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        if let Some((head, len)) = RequestHead::parse(&buf)? {
            return Ok(Some((head, buf, len)));
        }
        if buf.len() >= limit {
            return Err(HeadError::TooLarge { limit });
        }
        buf.reserve(READ_CHUNK);
        if stream.read_buf(&mut buf).await? == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(HeadError::Truncated)
            };
        }
    }
}
