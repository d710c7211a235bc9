//! Outbound send path shared by the proxy and flow steps

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::str::FromStr;
use std::time::{Duration, Instant};

use super::transaction::{Headers, HttpRequest, HttpResponse, HttpTransaction};
use super::wire::HOP_BY_HOP;
use crate::app::Config;
use crate::error::{GleipError, Result};

/// Per-request send options
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Follow 3xx responses instead of returning them
    pub follow_redirects: bool,

    /// Overrides the sender's default timeout
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// HTTP sender wrapper
///
/// Holds two pooled clients so the redirect policy can be chosen per request.
/// Neither client decompresses bodies: what the origin sent is what we keep.
#[derive(Clone)]
pub struct HttpSender {
    /// Client that returns redirects as-is
    direct: reqwest::Client,

    /// Client that follows redirects
    following: reqwest::Client,

    /// Default timeout
    default_timeout: Duration,
}

impl HttpSender {
    /// Create a new sender
    pub fn new(config: &Config) -> Result<Self> {
        let default_timeout = Duration::from_secs(config.proxy.upstream_timeout_secs);
        let build = |policy: reqwest::redirect::Policy| {
            reqwest::Client::builder()
                .timeout(default_timeout)
                .redirect(policy)
                .danger_accept_invalid_certs(!config.proxy.verify_upstream_tls)
                .no_proxy()
                .build()
                .map_err(|e| GleipError::network("client", e))
        };

        Ok(Self {
            direct: build(reqwest::redirect::Policy::none())?,
            following: build(reqwest::redirect::Policy::limited(config.proxy.max_redirects))?,
            default_timeout,
        })
    }

    /// Send a request and return the response with its round trip time in ms
    pub async fn execute(&self, request: &HttpRequest, options: &SendOptions) -> Result<(HttpResponse, u64)> {
        let start = Instant::now();

        let method = reqwest::Method::from_str(&request.method)
            .map_err(|e| GleipError::network(&request.url, format!("invalid method: {}", e)))?;

        let client = if options.follow_redirects {
            &self.following
        } else {
            &self.direct
        };

        let mut builder = client
            .request(method, &request.url)
            .headers(outbound_headers(&request.headers))
            .timeout(options.timeout.unwrap_or(self.default_timeout));

        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(|e| describe(&request.url, e))?;

        let status = response.status();
        let http_version = format!("{:?}", response.version());
        let headers: Headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).to_string()))
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| describe(&request.url, e))?
            .to_vec();

        let duration_ms = start.elapsed().as_millis() as u64;

        let mut result = HttpResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            http_version,
            headers,
            body,
            decoded_body: None,
        };
        result.decode();

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            status = result.status,
            duration_ms,
            "Outbound request completed"
        );

        Ok((result, duration_ms))
    }

    /// Send a request and wrap the exchange as a completed transaction
    pub async fn send(&self, request: &HttpRequest, options: &SendOptions) -> Result<HttpTransaction> {
        let (response, duration_ms) = self.execute(request, options).await?;
        let mut transaction = HttpTransaction::new(request.clone());
        transaction.complete(response, duration_ms);
        Ok(transaction)
    }
}

/// Copy headers for the origin, leaving out connection-scoped ones.
/// Length is derived from the body; an explicit Host is sent as given and
/// the client only fills it in from the URL when it is absent.
fn outbound_headers(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers.iter() {
        let lower = key.to_ascii_lowercase();
        if lower == "content-length" || HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        match (HeaderName::from_str(key), HeaderValue::from_str(value)) {
            (Ok(name), Ok(val)) => {
                map.append(name, val);
            }
            _ => tracing::debug!(header = key, "Skipping header that is not valid on the wire"),
        }
    }
    map
}

fn describe(target: &str, error: reqwest::Error) -> GleipError {
    let reason = if error.is_timeout() {
        "timed out".to_string()
    } else if error.is_connect() {
        format!("connection failed: {}", error)
    } else {
        error.to_string()
    };
    GleipError::network(target, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_origin;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn sender() -> HttpSender {
        HttpSender::new(&Config::default()).unwrap()
    }

    #[tokio::test]
    async fn test_send_returns_completed_transaction() {
        let origin = spawn_origin(|req| {
            let mut resp = HttpResponse::new(200);
            resp.headers.append("X-Method", &req.method);
            resp.body = req.body.clone();
            resp
        })
        .await;

        let request = HttpRequest::new("POST", &format!("{}/echo", origin))
            .with_header("Connection", "keep-alive")
            .with_body("ping");
        let tx = sender().send(&request, &SendOptions::default()).await.unwrap();

        assert!(tx.is_complete());
        let response = tx.response.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("x-method"), Some("POST"));
        assert_eq!(response.body, b"ping");
    }

    #[tokio::test]
    async fn test_explicit_host_header_reaches_origin() {
        let origin = spawn_origin(|req| {
            let mut resp = HttpResponse::new(200);
            resp.body = req.headers.get("host").unwrap_or("").as_bytes().to_vec();
            resp
        })
        .await;
        let sender = sender();

        let vhost = HttpRequest::new("GET", &format!("{}/", origin)).with_header("Host", "admin.internal");
        let (response, _) = sender.execute(&vhost, &SendOptions::default()).await.unwrap();
        assert_eq!(response.body_text(), "admin.internal");

        let plain = HttpRequest::new("GET", &format!("{}/", origin));
        let (response, _) = sender.execute(&plain, &SendOptions::default()).await.unwrap();
        assert_eq!(format!("http://{}", response.body_text()), origin);
    }

    #[tokio::test]
    async fn test_redirects_are_per_request() {
        let origin = spawn_origin(|req| {
            if req.target.ends_with("/start") {
                let mut resp = HttpResponse::new(302);
                resp.headers.append("Location", "/end");
                resp
            } else {
                let mut resp = HttpResponse::new(200);
                resp.body = b"landed".to_vec();
                resp
            }
        })
        .await;

        let request = HttpRequest::new("GET", &format!("{}/start", origin));
        let sender = sender();

        let (direct, _) = sender.execute(&request, &SendOptions::default()).await.unwrap();
        assert_eq!(direct.status, 302);

        let (followed, _) = sender
            .execute(&request, &SendOptions::default().follow_redirects(true))
            .await
            .unwrap();
        assert_eq!(followed.status, 200);
        assert_eq!(followed.body_text(), "landed");
    }

    #[tokio::test]
    async fn test_encoded_body_kept_raw_and_decoded() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"ok\":true}").unwrap();
        let wire = encoder.finish().unwrap();
        let wire_clone = wire.clone();

        let origin = spawn_origin(move |_| {
            let mut resp = HttpResponse::new(200);
            resp.headers.append("Content-Encoding", "gzip");
            resp.body = wire_clone.clone();
            resp
        })
        .await;

        let request = HttpRequest::new("GET", &origin);
        let (response, _) = sender().execute(&request, &SendOptions::default()).await.unwrap();

        assert_eq!(response.body, wire);
        assert_eq!(response.body_text(), "{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let request = HttpRequest::new("GET", &format!("http://{}/", addr));
        let err = sender()
            .execute(&request, &SendOptions::default().timeout(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, GleipError::Network { .. }));
    }
}
