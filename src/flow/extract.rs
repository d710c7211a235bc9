//! Variable extraction from transactions

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::chef::actions::{json_path, json_to_string};
use crate::error::{GleipError, Result};
use crate::http::HttpTransaction;

/// Where in the response a value comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ExtractSource {
    /// Status code as a decimal string
    Status,

    /// Response header, matched case-insensitively
    Header { name: String },

    /// Regex over the decoded body; capture group 1 if the pattern has one
    Body { pattern: String },

    /// Dotted path into a JSON body, e.g. `data.items.0.id`
    BodyJson { path: String },
}

/// Binds one variable from a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRule {
    /// Variable to bind
    pub variable: String,

    #[serde(flatten)]
    pub source: ExtractSource,
}

impl ExtractionRule {
    pub fn new(variable: &str, source: ExtractSource) -> Self {
        Self {
            variable: variable.to_string(),
            source,
        }
    }

    fn locator(&self) -> String {
        match &self.source {
            ExtractSource::Status => "status".to_string(),
            ExtractSource::Header { name } => format!("header '{}'", name),
            ExtractSource::Body { pattern } => format!("body pattern '{}'", pattern),
            ExtractSource::BodyJson { path } => format!("JSON path '{}'", path),
        }
    }

    fn not_found(&self) -> GleipError {
        GleipError::Extraction {
            variable: self.variable.clone(),
            locator: self.locator(),
        }
    }
}

/// Compute the value `rule` points at. An empty match is a value; a missing
/// locator is an error.
pub fn extract(rule: &ExtractionRule, transaction: &HttpTransaction) -> Result<String> {
    let response = transaction.response.as_ref().ok_or_else(|| rule.not_found())?;

    match &rule.source {
        ExtractSource::Status => Ok(response.status.to_string()),

        ExtractSource::Header { name } => response
            .headers
            .get(name)
            .map(str::to_string)
            .ok_or_else(|| rule.not_found()),

        ExtractSource::Body { pattern } => {
            let regex = Regex::new(pattern)
                .map_err(|e| GleipError::InvalidStep(format!("invalid extraction pattern '{}': {}", pattern, e)))?;
            let body = response.body_text();
            let captures = regex.captures(&body).ok_or_else(|| rule.not_found())?;
            let matched = if regex.captures_len() > 1 {
                captures.get(1)
            } else {
                captures.get(0)
            };
            // a group that did not participate counts as not found
            matched.map(|m| m.as_str().to_string()).ok_or_else(|| rule.not_found())
        }

        ExtractSource::BodyJson { path } => {
            let document: serde_json::Value =
                serde_json::from_slice(response.logical_body()).map_err(|_| rule.not_found())?;
            json_path(&document, path)
                .map(json_to_string)
                .ok_or_else(|| rule.not_found())
        }
    }
}
