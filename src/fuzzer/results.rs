//! Fuzzing result collection

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::http::HttpTransaction;

/// Outcome of one payload iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzResult {
    /// Index of the payload in the step's payload list
    pub index: usize,

    /// Payload as sent, after processing
    pub payload: String,

    /// HTTP status code
    pub status: Option<u16>,

    /// Response length in bytes (decoded)
    pub length: Option<usize>,

    /// Round trip time in milliseconds
    pub duration_ms: Option<u64>,

    /// ID of the transaction that carried this payload
    pub transaction_id: Option<String>,

    /// Error message if the request failed
    pub error: Option<String>,
}

impl FuzzResult {
    pub fn from_transaction(index: usize, payload: String, transaction: &HttpTransaction) -> Self {
        let response = transaction.response.as_ref();
        Self {
            index,
            payload,
            status: response.map(|r| r.status),
            length: response.map(|r| r.logical_body().len()),
            duration_ms: transaction.duration_ms,
            transaction_id: Some(transaction.id.clone()),
            error: transaction.error.clone(),
        }
    }

    pub fn failed(index: usize, payload: String, error: impl ToString) -> Self {
        Self {
            index,
            payload,
            status: None,
            length: None,
            duration_ms: None,
            transaction_id: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Results of one fuzz step, append-only while it runs
#[derive(Debug, Clone, Default)]
pub struct FuzzResultSet {
    results: Vec<FuzzResult>,

    /// Status code distribution
    status_distribution: BTreeMap<u16, usize>,
}

impl FuzzResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a result
    pub fn add(&mut self, result: FuzzResult) {
        if let Some(status) = result.status {
            *self.status_distribution.entry(status).or_insert(0) += 1;
        }
        self.results.push(result);
    }

    /// Order results by payload index once collection is over
    pub fn finalize(&mut self) {
        self.results.sort_by_key(|r| r.index);
    }

    pub fn results(&self) -> &[FuzzResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<FuzzResult> {
        self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_error()).count()
    }

    pub fn status_distribution(&self) -> &BTreeMap<u16, usize> {
        &self.status_distribution
    }

    /// One-line summary, e.g. `12 results (200: 10, 403: 2)`
    pub fn summary(&self) -> String {
        let mut summary = format!("{} results", self.results.len());
        if !self.status_distribution.is_empty() {
            let statuses: Vec<String> = self
                .status_distribution
                .iter()
                .map(|(status, count)| format!("{}: {}", status, count))
                .collect();
            summary.push_str(&format!(" ({})", statuses.join(", ")));
        }
        let errors = self.error_count();
        if errors > 0 {
            summary.push_str(&format!(", {} errors", errors));
        }
        summary
    }
}
