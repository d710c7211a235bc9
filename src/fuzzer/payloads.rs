//! Payload sources and insertion points for fuzzing

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use crate::chef::{self, ChefAction};
use crate::error::{GleipError, Result};
use crate::http::HttpRequest;

/// Where a fuzz step gets its payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PayloadSource {
    /// Inline list
    List { payloads: Vec<String> },

    /// Wordlist file, one payload per line
    File { path: PathBuf },
}

impl Default for PayloadSource {
    fn default() -> Self {
        PayloadSource::List { payloads: Vec::new() }
    }
}

impl PayloadSource {
    /// Load the payload list. Wordlists skip blank lines and `#` comments.
    pub fn load(&self) -> Result<Vec<String>> {
        match self {
            PayloadSource::List { payloads } => Ok(payloads.clone()),
            PayloadSource::File { path } => {
                let file = File::open(path).map_err(|e| {
                    GleipError::InvalidStep(format!("failed to open wordlist {}: {}", path.display(), e))
                })?;

                let mut payloads = Vec::new();
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    let line = line.trim_end_matches('\r');
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    payloads.push(line.to_string());
                }
                Ok(payloads)
            }
        }
    }
}

/// Subset of the payload list to run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRange {
    /// First payload index to use
    #[serde(default)]
    pub start: usize,

    /// Maximum number of payloads from `start`
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Pair payloads with their list index, keeping only the configured range
pub fn select(payloads: Vec<String>, range: Option<PayloadRange>) -> Vec<(usize, String)> {
    let range = range.unwrap_or_default();
    payloads
        .into_iter()
        .enumerate()
        .skip(range.start)
        .take(range.limit.unwrap_or(usize::MAX))
        .collect()
}

/// Run the processing chain over a raw payload
pub fn process(payload: &str, processing: &[ChefAction]) -> Result<String> {
    chef::execute(processing, payload)
}

const MARKER: char = '§';

/// Byte spans of each `§name§` insertion point, delimiters included
fn marker_spans(text: &str) -> Vec<(usize, usize)> {
    let width = MARKER.len_utf8();
    let mut spans = Vec::new();
    let mut offset = 0;

    while let Some(open) = text[offset..].find(MARKER) {
        let open = offset + open;
        match text[open + width..].find(MARKER) {
            Some(close) => {
                let end = open + width + close + width;
                spans.push((open, end));
                offset = end;
            }
            None => break,
        }
    }
    spans
}

/// Names of the `§name§` insertion points in `text`
pub fn markers(text: &str) -> Vec<String> {
    let width = MARKER.len_utf8();
    marker_spans(text)
        .into_iter()
        .map(|(start, end)| text[start + width..end - width].to_string())
        .collect()
}

/// Replace every insertion point with `payload`
pub fn fill_markers(text: &str, payload: &str) -> String {
    let mut filled = String::with_capacity(text.len());
    let mut last = 0;
    for (start, end) in marker_spans(text) {
        filled.push_str(&text[last..start]);
        filled.push_str(payload);
        last = end;
    }
    filled.push_str(&text[last..]);
    filled
}

/// Whether a request contains any insertion point
pub fn has_markers(request: &HttpRequest) -> bool {
    let body = String::from_utf8_lossy(&request.body);
    !markers(&request.url).is_empty()
        || !markers(&body).is_empty()
        || request
            .headers
            .iter()
            .any(|(k, v)| !markers(k).is_empty() || !markers(v).is_empty())
}

/// Copy of `request` with every insertion point replaced by `payload`
pub fn apply_payload(request: &HttpRequest, payload: &str) -> HttpRequest {
    let body = String::from_utf8_lossy(&request.body);
    HttpRequest {
        method: request.method.clone(),
        url: fill_markers(&request.url, payload),
        headers: request
            .headers
            .iter()
            .map(|(k, v)| (fill_markers(k, payload), fill_markers(v, payload)))
            .collect(),
        body: fill_markers(&body, payload).into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_wordlist_skips_comments_and_blanks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "# usernames\nadmin\r\n\nroot\n#skip\nguest").unwrap();

        let source = PayloadSource::File {
            path: file.path().to_path_buf(),
        };
        assert_eq!(source.load().unwrap(), vec!["admin", "root", "guest"]);
    }

    #[test]
    fn test_missing_wordlist_is_error() {
        let source = PayloadSource::File {
            path: PathBuf::from("/nonexistent/wordlist.txt"),
        };
        assert!(source.load().is_err());
    }

    #[test]
    fn test_select_range_keeps_original_indices() {
        let payloads: Vec<String> = (0..6).map(|i| format!("p{}", i)).collect();
        let selected = select(payloads.clone(), Some(PayloadRange { start: 2, limit: Some(3) }));
        assert_eq!(
            selected,
            vec![(2, "p2".to_string()), (3, "p3".to_string()), (4, "p4".to_string())]
        );
        assert_eq!(select(payloads, None).len(), 6);
    }

    #[test]
    fn test_every_marker_gets_the_payload() {
        let request = HttpRequest::new("POST", "http://t/login?u=§user§")
            .with_header("X-Marker", "§user§-§other§")
            .with_body("name=§user§&pin=$1");

        assert!(has_markers(&request));
        let filled = apply_payload(&request, "a$1b");
        assert_eq!(filled.url, "http://t/login?u=a$1b");
        assert_eq!(filled.headers.get("x-marker"), Some("a$1b-a$1b"));
        assert_eq!(filled.body_text(), "name=a$1b&pin=$1");
        assert_eq!(markers("§a§ and §b§"), vec!["a", "b"]);
        assert_eq!(fill_markers("open § only", "x"), "open § only");
    }

    #[test]
    fn test_processing_chain() {
        let chain = vec![ChefAction::new("url_encode")];
        assert_eq!(process("a b", &chain).unwrap(), "a%20b");
        assert_eq!(process("raw", &[]).unwrap(), "raw");
    }
}
