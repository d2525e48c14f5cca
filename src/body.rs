use crate::deadline::Deadline;
use crate::errors::ProxyError;
use memchr::memmem;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Forwarding chunk size; both the read side and the write side are bounded to this.
const BUF: usize = 262_144;

pub(crate) struct IoBudget {
    pub(crate) read: Duration,
    pub(crate) write: Duration,
}

async fn read_some<R: AsyncRead + Unpin>(
    reader: &mut R,
    deadline: &Deadline,
    cap: Duration,
    buf: &mut [u8],
) -> Result<usize, ProxyError> {
    let budget = deadline.budget(cap);
    tokio::time::timeout(budget, reader.read(buf))
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(ProxyError::Io)
}

async fn write_all<W: AsyncWrite + Unpin>(
    writer: &mut W,
    deadline: &Deadline,
    cap: Duration,
    buf: &[u8],
    on_err: fn(std::io::Error) -> ProxyError,
) -> Result<(), ProxyError> {
    let budget = deadline.budget(cap);
    tokio::time::timeout(budget, writer.write_all(buf))
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(on_err)
}

/// Forwards exactly `n` bytes, first draining `leftover`, then reading fresh.
/// A short read before `n` bytes are seen calls `on_eof` to report whichever
/// peer closed mid-frame.
pub(crate) async fn forward_fixed<R, W>(
    n: usize,
    reader: &mut R,
    leftover: &mut Vec<u8>,
    writer: &mut W,
    deadline: &Deadline,
    budget: &IoBudget,
    on_write_err: fn(std::io::Error) -> ProxyError,
    on_eof: fn() -> ProxyError,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = n;

    if !leftover.is_empty() {
        let take = leftover.len().min(remaining);
        write_all(writer, deadline, budget.write, &leftover[..take], on_write_err).await?;
        leftover.drain(..take);
        remaining -= take;
    }

    let mut chunk = vec![0u8; BUF.min(remaining.max(1))];
    while remaining > 0 {
        let want = remaining.min(chunk.len());
        let n_read = read_some(reader, deadline, budget.read, &mut chunk[..want]).await?;
        if n_read == 0 {
            return Err(on_eof());
        }
        write_all(writer, deadline, budget.write, &chunk[..n_read], on_write_err).await?;
        remaining -= n_read;
    }
    Ok(())
}

/// Forwards a chunked body chunk-by-chunk, writing each chunk-size line through
/// before parsing it, and reading the trailer block as a second, separate read
/// once the terminating zero-size chunk is seen.
pub(crate) async fn forward_chunked<R, W>(
    reader: &mut R,
    leftover: &mut Vec<u8>,
    writer: &mut W,
    deadline: &Deadline,
    budget: &IoBudget,
    on_write_err: fn(std::io::Error) -> ProxyError,
    on_eof: fn() -> ProxyError,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = read_line(reader, leftover, deadline, budget.read, on_eof).await?;
        write_all(writer, deadline, budget.write, &line, on_write_err).await?;

        let size_str = match memmem::find(&line, b";") {
            Some(pos) => &line[..pos],
            None => trim_crlf(&line),
        };
        let size = std::str::from_utf8(size_str)
            .ok()
            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
            .ok_or(ProxyError::MalformedRequest("invalid chunk size"))?;

        if size == 0 {
            let trailer = read_until_crlfcrlf(reader, leftover, deadline, budget.read, on_eof).await?;
            write_all(writer, deadline, budget.write, &trailer, on_write_err).await?;
            return Ok(());
        }

        forward_fixed(
            size + 2,
            reader,
            leftover,
            writer,
            deadline,
            budget,
            on_write_err,
            on_eof,
        )
        .await?;
    }
}

/// Reads in `BUF`-sized blocks until the source hits EOF, forwarding each block.
/// Used only for responses carrying neither `content-length` nor chunked framing;
/// the caller must treat the connection as non-reusable afterward.
pub(crate) async fn forward_until_close<R, W>(
    reader: &mut R,
    leftover: &mut Vec<u8>,
    writer: &mut W,
    deadline: &Deadline,
    budget: &IoBudget,
    on_write_err: fn(std::io::Error) -> ProxyError,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !leftover.is_empty() {
        write_all(writer, deadline, budget.write, leftover, on_write_err).await?;
        leftover.clear();
    }

    let mut chunk = vec![0u8; BUF];
    loop {
        let n = match read_some(reader, deadline, budget.read, &mut chunk).await {
            Ok(n) => n,
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
        if write_all(writer, deadline, budget.write, &chunk[..n], on_write_err)
            .await
            .is_err()
        {
            break;
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}

async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut R,
    leftover: &mut Vec<u8>,
    deadline: &Deadline,
    read_cap: Duration,
    on_eof: fn() -> ProxyError,
) -> Result<Vec<u8>, ProxyError> {
    loop {
        if let Some(pos) = memmem::find(leftover, b"\r\n") {
            let line = leftover[..pos + 2].to_vec();
            leftover.drain(..pos + 2);
            return Ok(line);
        }
        let mut chunk = [0u8; 4096];
        let n = read_some(reader, deadline, read_cap, &mut chunk).await?;
        if n == 0 {
            return Err(on_eof());
        }
        leftover.extend_from_slice(&chunk[..n]);
    }
}

async fn read_until_crlfcrlf<R: AsyncRead + Unpin>(
    reader: &mut R,
    leftover: &mut Vec<u8>,
    deadline: &Deadline,
    read_cap: Duration,
    on_eof: fn() -> ProxyError,
) -> Result<Vec<u8>, ProxyError> {
    loop {
        if let Some(pos) = memmem::find(leftover, b"\r\n\r\n") {
            let block = leftover[..pos + 4].to_vec();
            leftover.drain(..pos + 4);
            return Ok(block);
        }
        let mut chunk = [0u8; 4096];
        let n = read_some(reader, deadline, read_cap, &mut chunk).await?;
        if n == 0 {
            return Err(on_eof());
        }
        leftover.extend_from_slice(&chunk[..n]);
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn budget() -> IoBudget {
        IoBudget {
            read: Duration::from_secs(1),
            write: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn forwards_fixed_body_exactly() {
        let mut src: &[u8] = b"hello world";
        let mut leftover = Vec::new();
        let mut out = Vec::new();
        let deadline = Deadline::new(Duration::from_secs(1));
        forward_fixed(
            5,
            &mut src,
            &mut leftover,
            &mut out,
            &deadline,
            &budget(),
            ProxyError::BackendWrite,
            || ProxyError::UpstreamClosed,
        )
        .await
        .unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn fixed_body_drains_leftover_first() {
        let mut src: &[u8] = b"world";
        let mut leftover = b"hello".to_vec();
        let mut out = Vec::new();
        let deadline = Deadline::new(Duration::from_secs(1));
        forward_fixed(
            10,
            &mut src,
            &mut leftover,
            &mut out,
            &deadline,
            &budget(),
            ProxyError::BackendWrite,
            || ProxyError::UpstreamClosed,
        )
        .await
        .unwrap();
        assert_eq!(out, b"helloworld");
    }

    #[tokio::test]
    async fn short_read_on_fixed_is_peer_closed() {
        let mut src: &[u8] = b"ab";
        let mut leftover = Vec::new();
        let mut out = Vec::new();
        let deadline = Deadline::new(Duration::from_secs(1));
        let err = forward_fixed(
            5,
            &mut src,
            &mut leftover,
            &mut out,
            &deadline,
            &budget(),
            ProxyError::BackendWrite,
            || ProxyError::UpstreamClosed,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamClosed));
    }

    #[tokio::test]
    async fn forwards_chunked_body_verbatim() {
        let mut src: &[u8] = b"5\r\nhello\r\n0\r\n\r\n";
        let mut leftover = Vec::new();
        let mut out = Vec::new();
        let deadline = Deadline::new(Duration::from_secs(1));
        forward_chunked(
            &mut src,
            &mut leftover,
            &mut out,
            &deadline,
            &budget(),
            ProxyError::BackendWrite,
            || ProxyError::UpstreamClosed,
        )
        .await
        .unwrap();
        assert_eq!(out, b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn forwards_until_close() {
        let mut src: &[u8] = b"arbitrary bytes, no framing header";
        let mut leftover = Vec::new();
        let mut out = Vec::new();
        let deadline = Deadline::new(Duration::from_secs(1));
        forward_until_close(
            &mut src,
            &mut leftover,
            &mut out,
            &deadline,
            &budget(),
            ProxyError::ClientWrite,
        )
        .await
        .unwrap();
        assert_eq!(out, b"arbitrary bytes, no framing header");
    }
}
