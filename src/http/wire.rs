//! HTTP/1.x wire handling: reading requests off client streams, writing
//! responses back, and rendering transactions as raw text for display.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::transaction::{reason_phrase, Headers, HttpRequest, HttpResponse, HttpTransaction};

/// Largest request body the proxy will buffer
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Headers that only apply to a single connection and must not be forwarded
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A request as read from a client connection
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    /// Request target as sent: absolute URL, origin path, or `host:port` for CONNECT
    pub target: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl ParsedRequest {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Whether the client expects the connection closed after this exchange
    pub fn wants_close(&self) -> bool {
        let connection = self
            .headers
            .get("connection")
            .or_else(|| self.headers.get("proxy-connection"))
            .map(|v| v.to_ascii_lowercase());

        match connection.as_deref() {
            Some(v) if v.contains("close") => true,
            Some(v) if v.contains("keep-alive") => false,
            _ => self.version.eq_ignore_ascii_case("HTTP/1.0"),
        }
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Read one request. Returns `Ok(None)` on a clean EOF before any bytes.
pub async fn read_request<R>(reader: &mut R) -> io::Result<Option<ParsedRequest>>
where
    R: AsyncBufRead + Unpin,
{
    let mut request_line = String::new();
    loop {
        request_line.clear();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(None);
        }
        // Tolerate stray CRLFs between pipelined requests
        if !request_line.trim().is_empty() {
            break;
        }
    }

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(invalid(format!("invalid request line: {:?}", request_line.trim())));
    }

    let method = parts[0].to_string();
    let target = parts[1].to_string();
    let version = parts[2].to_string();

    let headers = read_headers(reader).await?;

    let body = if method.eq_ignore_ascii_case("CONNECT") {
        Vec::new()
    } else {
        read_body(reader, &headers).await?
    };

    Ok(Some(ParsedRequest {
        method,
        target,
        version,
        headers,
        body,
    }))
}

async fn read_headers<R>(reader: &mut R) -> io::Result<Headers>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Headers::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside headers",
            ));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        match line.split_once(':') {
            Some((name, value)) => headers.append(name.trim(), value.trim()),
            None => return Err(invalid(format!("malformed header line: {:?}", line))),
        }
    }
    Ok(headers)
}

async fn read_body<R>(reader: &mut R, headers: &Headers) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let chunked = headers
        .get("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    if chunked {
        return read_chunked(reader).await;
    }

    let length = match headers.get("content-length") {
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| invalid(format!("invalid content-length: {:?}", v)))?,
        None => 0,
    };

    if length > MAX_BODY_SIZE {
        return Err(invalid(format!("body of {} bytes exceeds limit", length)));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn read_chunked<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        if reader.read_line(&mut size_line).await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated chunked body"));
        }
        let size_str = size_line.trim().split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| invalid(format!("invalid chunk size: {:?}", size_str)))?;

        if size == 0 {
            // Trailers end with an empty line
            read_headers(reader).await?;
            break;
        }
        if size > MAX_BODY_SIZE - body.len() {
            return Err(invalid("chunked body exceeds limit"));
        }

        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;

        let mut crlf = String::new();
        reader.read_line(&mut crlf).await?;
    }
    Ok(body)
}

/// Write a response to the client, relaying the body bytes as received.
///
/// The body is always sent de-chunked with an explicit `content-length`.
pub async fn write_response<W>(writer: &mut W, response: &HttpResponse, close: bool) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = if response.reason.is_empty() {
        reason_phrase(response.status)
    } else {
        response.reason.as_str()
    };

    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, reason);
    for (name, value) in response.headers.iter() {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" || HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str(&format!("content-length: {}\r\n", response.body.len()));
    if close {
        head.push_str("connection: close\r\n");
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&response.body).await?;
    writer.flush().await
}

/// Write a short plain-text response generated by the proxy itself
pub async fn write_simple_response<W>(writer: &mut W, status: u16, message: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response = HttpResponse::new(status);
    response.headers.append("content-type", "text/plain; charset=utf-8");
    response.body = format!("{}\r\n", message).into_bytes();
    write_response(writer, &response, true).await
}

/// Render a request as raw HTTP/1.1 text
pub fn format_request(request: &HttpRequest) -> String {
    let (path, host) = match url::Url::parse(&request.url) {
        Ok(u) => {
            let mut path = u.path().to_string();
            if let Some(q) = u.query() {
                path.push('?');
                path.push_str(q);
            }
            let host = u.host_str().map(|h| match u.port() {
                Some(p) => format!("{}:{}", h, p),
                None => h.to_string(),
            });
            (path, host)
        }
        Err(_) => (request.url.clone(), None),
    };

    let mut out = format!("{} {} HTTP/1.1\r\n", request.method, path);
    if let (Some(host), false) = (host, request.headers.contains("host")) {
        out.push_str(&format!("Host: {}\r\n", host));
    }
    for (name, value) in request.headers.iter() {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("\r\n");
    out.push_str(&request.body_text());
    out
}

/// Render a response as raw HTTP text, showing the decoded body
pub fn format_response(response: &HttpResponse) -> String {
    let mut out = format!("{} {} {}\r\n", response.http_version, response.status, response.reason);
    for (name, value) in response.headers.iter() {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("\r\n");
    out.push_str(&response.body_text());
    out
}

/// Render a full exchange for display
pub fn format_transaction(transaction: &HttpTransaction) -> String {
    let mut out = format_request(&transaction.request);
    out.push_str("\r\n\r\n");
    match (&transaction.response, &transaction.error) {
        (Some(response), _) => out.push_str(&format_response(response)),
        (None, Some(error)) => out.push_str(&format!("<error: {}>", error)),
        (None, None) => out.push_str("<pending>"),
    }
    out
}
