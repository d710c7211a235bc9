//! HTTP transaction types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header list preserving insertion order and original name casing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, compared case-insensitively
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace the first header called `name` (dropping duplicates), or append it
    pub fn set(&mut self, name: &str, value: &str) {
        match self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(pos) => {
                self.0[pos].1 = value.to_string();
                let mut idx = 0;
                self.0.retain(|(k, _)| {
                    let keep = idx <= pos || !k.eq_ignore_ascii_case(name);
                    idx += 1;
                    keep
                });
            }
            None => self.append(name, value),
        }
    }

    /// Append a header even if one with the same name exists
    pub fn append(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }

    /// Remove every header called `name`
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// HTTP request as captured or as sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// HTTP method
    pub method: String,

    /// Absolute URL
    pub url: String,

    /// Request headers
    pub headers: Headers,

    /// Request body
    #[serde(default)]
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            url: url.to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Host part of the URL, if it parses
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// HTTP response
///
/// `body` holds the bytes as received on the wire (still content-encoded);
/// `decoded_body` holds the decompressed form when the response declared a
/// content-encoding. Relaying uses the former, extraction and display the latter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,

    /// Reason phrase
    pub reason: String,

    /// HTTP version
    pub http_version: String,

    /// Response headers
    pub headers: Headers,

    /// Body bytes exactly as received
    #[serde(default)]
    pub body: Vec<u8>,

    /// Decompressed body when a content-encoding was applied
    #[serde(default)]
    pub decoded_body: Option<Vec<u8>>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            http_version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            body: Vec::new(),
            decoded_body: None,
        }
    }

    /// Body to use for extraction and display
    pub fn logical_body(&self) -> &[u8] {
        self.decoded_body.as_deref().unwrap_or(&self.body)
    }

    /// Logical body as text
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(self.logical_body()).to_string()
    }

    /// Fill `decoded_body` from the content-encoding header
    pub fn decode(&mut self) {
        let encoding = self.headers.get("content-encoding").map(str::to_string);
        match super::decode::decode_body(encoding.as_deref(), &self.body) {
            Ok(decoded) => self.decoded_body = decoded,
            Err(e) => {
                tracing::warn!(
                    encoding = encoding.as_deref().unwrap_or(""),
                    "Failed to decode response body: {}",
                    e
                );
                self.decoded_body = None;
            }
        }
    }
}

/// One captured request/response exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTransaction {
    /// Unique ID
    pub id: String,

    /// The request
    pub request: HttpRequest,

    /// The response, absent until completed
    pub response: Option<HttpResponse>,

    /// When the request was captured
    pub created_at: DateTime<Utc>,

    /// When the response arrived (or the exchange failed)
    pub completed_at: Option<DateTime<Utc>>,

    /// Round trip time in milliseconds
    pub duration_ms: Option<u64>,

    /// Whether an operator edited the request before it was sent
    pub intercepted: bool,

    /// Failure reason if the exchange did not complete
    pub error: Option<String>,
}

impl HttpTransaction {
    pub fn new(request: HttpRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request,
            response: None,
            created_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            intercepted: false,
            error: None,
        }
    }

    pub fn complete(&mut self, response: HttpResponse, duration_ms: u64) {
        self.response = Some(response);
        self.duration_ms = Some(duration_ms);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, reason: impl ToString) {
        self.error = Some(reason.to_string());
        self.completed_at = Some(Utc::now());
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }
}

/// Canonical reason phrase for a status code
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        444 => "Dropped",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
