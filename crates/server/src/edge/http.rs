use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::consts::{HTTP_WRITE_TIMEOUT_MS, REQUEST_BODY_MAX, REQUEST_HEAD_MAX};

/// A parsed request head. `raw` keeps the exact bytes read off the socket
/// (head plus any body bytes that happened to be buffered with it), because
/// the whole thing is replayed to the agent on a proxied request.
pub struct RequestHead {
    pub raw: Vec<u8>,
    pub head_len: usize,
    pub method: String,
    pub path: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut headers);
        let status = parsed
            .parse(&raw)
            .map_err(|e| anyhow::anyhow!("malformed request head: {}", e))?;
        let head_len = match status {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => anyhow::bail!("truncated request head"),
        };
        let method = parsed.method.unwrap_or("").to_string();
        let path = parsed.path.unwrap_or("/").to_string();
        let collected = parsed
            .headers
            .iter()
            .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
            .collect();
        Ok(RequestHead {
            raw,
            head_len,
            method,
            path,
            headers: collected,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Host header without the port part.
    pub fn host(&self) -> Option<&str> {
        self.header("Host").map(strip_port)
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        let cookies = self.header("Cookie")?;
        for pair in cookies.split(';') {
            if let Some((k, v)) = pair.trim().split_once('=')
                && k == name
            {
                return Some(v.to_string());
            }
        }
        None
    }

    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [v6addr]:port
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    }
}

/// Read until the blank line that ends the head. Bytes past it stay in the
/// returned buffer.
pub async fn read_request_head<R>(stream: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed before the request head");
        }
        buf.extend_from_slice(&chunk[..n]);
        if find_head_end(&buf).is_some() {
            return Ok(buf);
        }
        if buf.len() > REQUEST_HEAD_MAX {
            anyhow::bail!("request head too large");
        }
    }
}

pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|idx| idx + 4)
}

/// Content-Length bytes of body, completing what the head read already
/// buffered.
pub async fn read_body<R>(stream: &mut R, head: &RequestHead) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let want = head.content_length();
    if want > REQUEST_BODY_MAX {
        anyhow::bail!("request body too large");
    }
    let mut body = head.raw[head.head_len..].to_vec();
    while body.len() < want {
        let mut chunk = vec![0u8; want - body.len()];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed mid body");
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(want);
    Ok(body)
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        303 => "See Other",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "Unknown",
    }
}

/// Write a complete HTTP/1.1 response onto a hijacked socket.
pub async fn write_response<W>(
    stream: &mut W,
    status: u16,
    content_type: &str,
    extra_headers: &[String],
    body: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        reason(status),
        content_type,
        body.len()
    );
    for header in extra_headers {
        head.push_str(header);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    tokio::time::timeout(Duration::from_millis(HTTP_WRITE_TIMEOUT_MS), async {
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(body).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| anyhow::anyhow!("response write timed out"))??;
    Ok(())
}
