use crate::deadline::Deadline;
use crate::errors::ProxyError;
use memchr::memmem;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Header names are lower-cased on the way in; values are trimmed and lower-cased too.
/// Non-framing headers are never consulted, only carried in the raw block.
pub(crate) type Headers = HashMap<Vec<u8>, Vec<u8>>;

/// How a body's length is determined on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Fixed(usize),
    Chunked,
    /// Only ever a response framing; forwarded until the upstream closes.
    UntilClose,
    None,
}

pub(crate) struct ParsedHead {
    pub(crate) first_line: (Vec<u8>, Vec<u8>, Vec<u8>),
    pub(crate) headers: Headers,
    /// The exact bytes from the start-line through the terminating CRLFCRLF, forwarded verbatim.
    pub(crate) raw: Vec<u8>,
}

impl ParsedHead {
    pub(crate) fn method(&self) -> &[u8] {
        &self.first_line.0
    }

    /// Picks the request-body framing: `content-length` beats `transfer-encoding`
    /// when both are present, and no body is assumed when neither is.
    pub(crate) fn request_framing(&self) -> Result<Framing, ProxyError> {
        framing_from_headers(&self.headers, false)
    }

    /// Picks the response-body framing; falls back to until-close when neither header is set.
    pub(crate) fn response_framing(&self) -> Result<Framing, ProxyError> {
        framing_from_headers(&self.headers, true)
    }

    pub(crate) fn wants_close(&self) -> bool {
        self.headers
            .get(b"connection".as_slice())
            .map(|v| v.as_slice() == b"close")
            .unwrap_or(false)
    }
}

fn framing_from_headers(headers: &Headers, until_close_fallback: bool) -> Result<Framing, ProxyError> {
    if let Some(len) = headers.get(b"content-length".as_slice()) {
        let len = std::str::from_utf8(len)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(ProxyError::MalformedRequest("invalid content-length"))?;
        return Ok(Framing::Fixed(len));
    }
    if headers
        .get(b"transfer-encoding".as_slice())
        .map(|v| v.as_slice() == b"chunked")
        .unwrap_or(false)
    {
        return Ok(Framing::Chunked);
    }
    Ok(if until_close_fallback {
        Framing::UntilClose
    } else {
        Framing::None
    })
}

/// Reads a start-line + header block, terminated by `CRLFCRLF`, from `reader`.
///
/// Bytes read past the terminator (e.g. the start of a pipelined next
/// request) are returned in `leftover` so the caller can feed them back
/// into the next call instead of dropping them.
pub(crate) async fn read_headers<R: AsyncRead + Unpin>(
    reader: &mut R,
    leftover: &mut Vec<u8>,
    deadline: &Deadline,
    read_cap: std::time::Duration,
) -> Result<Option<ParsedHead>, ProxyError> {
    let budget = deadline.budget(read_cap);
    let fut = read_headers_inner(reader, leftover);
    match tokio::time::timeout(budget, fut).await {
        Ok(inner) => inner,
        Err(_) => Err(ProxyError::Timeout),
    }
}

async fn read_headers_inner<R: AsyncRead + Unpin>(
    reader: &mut R,
    leftover: &mut Vec<u8>,
) -> Result<Option<ParsedHead>, ProxyError> {
    let mut buf = std::mem::take(leftover);
    let mut scanned_from = 0;
    let terminator_at = loop {
        if let Some(pos) = memmem::find(&buf[scanned_from..], b"\r\n\r\n") {
            break scanned_from + pos;
        }
        scanned_from = buf.len().saturating_sub(3);

        let mut chunk = [0u8; 8192];
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(ProxyError::Io)?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(ProxyError::ClientClosed)
            };
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let header_end = terminator_at + 4;
    let raw = buf[..header_end].to_vec();
    *leftover = buf[header_end..].to_vec();

    let head = &raw[..terminator_at];
    let mut lines = head.split(|&b| b == b'\n').map(strip_cr);
    let first = lines.next().unwrap_or(b"");
    let mut tokens = first.split(|&b| b == b' ').filter(|t| !t.is_empty());
    let (a, b, c) = (
        tokens.next().ok_or(ProxyError::MalformedRequest("missing start-line token"))?,
        tokens.next().ok_or(ProxyError::MalformedRequest("missing start-line token"))?,
        tokens.next().ok_or(ProxyError::MalformedRequest("missing start-line token"))?,
    );
    let first_line = (a.to_vec(), b.to_vec(), c.to_vec());

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = memmem::find(line, b":")
            .ok_or(ProxyError::MalformedRequest("header line missing ':'"))?;
        let field = line[..colon].to_ascii_lowercase();
        let value = trim_ascii(&line[colon + 1..]).to_ascii_lowercase();
        headers.insert(field, value);
    }

    Ok(Some(ParsedHead {
        first_line,
        headers,
        raw,
    }))
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &bytes[start..end]
}
