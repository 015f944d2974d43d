//! Reference-advertisement rewriting.
//!
//! The `info/refs` response of the smart HTTP protocol is a sequence of
//! packet lines, each prefixed with a 4-character hex length that includes
//! itself:
//!
//! ```text
//! 001e# service=git-upload-pack\n
//! 0000
//! 0155<oid> HEAD\0<capabilities>\n
//! 003f<oid> refs/heads/master\n
//! 003c<oid> refs/tags/v1.0\n
//! 0000
//! ```
//!
//! [`inject_head`] scans the upstream bytes line by line until it sees the
//! advertisement of the target branch and swaps its object id for the pinned
//! commit.  Everything before that line is buffered and returned; everything
//! after it is left in the reader for the caller to stream through verbatim.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, trace, warn};

use super::ProxyError;
use crate::path::COMMIT_HASH_LEN;

/// Width of the pkt-line length prefix.
const PKT_LEN_WIDTH: usize = 4;

/// Read `reader` up to and including the advertisement of
/// `refs/heads/<target_ref>` and return those bytes with the advertised
/// object id replaced by `commit_hash`.
///
/// The matching line keeps its original length prefix.  Only the first match
/// is rewritten; the reader is left positioned right after it.  Reaching the
/// end of the stream (or a read error) first yields
/// [`ProxyError::RefNotFoundBeforeStreamEnd`].
pub async fn inject_head<R>(
    reader: &mut R,
    commit_hash: &str,
    target_ref: &str,
) -> Result<Vec<u8>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let suffix = format!("refs/heads/{target_ref}\n");
    let mut out = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).await;
        let complete = matches!(read, Ok(n) if n > 0) && line.ends_with(b"\n");
        if !complete {
            if let Err(e) = read {
                warn!(error = %e, "upstream read failed while scanning refs");
            }
            return Err(ProxyError::RefNotFoundBeforeStreamEnd {
                target_ref: target_ref.to_string(),
            });
        }

        if !line.ends_with(suffix.as_bytes()) {
            trace!(len = line.len(), "passing ref line through");
            out.extend_from_slice(&line);
            continue;
        }

        let prefix = &line[..PKT_LEN_WIDTH];
        let rewritten_len = PKT_LEN_WIDTH + COMMIT_HASH_LEN + 1 + suffix.len();
        if pkt_len(prefix) != Some(rewritten_len) {
            debug!(
                declared = ?pkt_len(prefix),
                rewritten_len,
                "length prefix does not match the rewritten ref line"
            );
        }

        out.extend_from_slice(prefix);
        out.extend_from_slice(commit_hash.as_bytes());
        out.push(b' ');
        out.extend_from_slice(suffix.as_bytes());
        debug!(%target_ref, %commit_hash, "advertised ref pinned");
        return Ok(out);
    }
}

/// Decode a 4-character hex pkt-line length.
pub fn pkt_len(prefix: &[u8]) -> Option<usize> {
    if prefix.len() != PKT_LEN_WIDTH {
        return None;
    }
    let s = std::str::from_utf8(prefix).ok()?;
    usize::from_str_radix(s, 16).ok()
}
