//! Transform pipeline ("chef")
//!
//! An ordered list of string actions applied strictly left to right. Each
//! action sees the output of the one before it.

pub mod actions;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ActionError, GleipError, Result};

/// Maximum characters kept in a preview before the ellipsis
pub const PREVIEW_LIMIT: usize = 200;

/// One step of a transform pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChefAction {
    /// Action name, e.g. `base64_decode`; empty means pass-through
    #[serde(default)]
    pub action_type: String,

    /// Action options, e.g. `find`/`replace`
    #[serde(default)]
    pub options: HashMap<String, String>,

    /// Cached preview of the pipeline output after this action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

impl ChefAction {
    pub fn new(action_type: &str) -> Self {
        Self {
            action_type: action_type.to_string(),
            ..Default::default()
        }
    }

    pub fn with_option(mut self, name: &str, value: &str) -> Self {
        self.options.insert(name.to_string(), value.to_string());
        self
    }
}

/// Run one action, tagging failures with its 1-based position
fn apply(index: usize, action: &ChefAction, input: &str) -> Result<String> {
    actions::run(&action.action_type, &action.options, input).map_err(|e| match e {
        ActionError::UnknownAction(name) => GleipError::UnknownAction { index, action: name },
        source => GleipError::Transform {
            index,
            action: action.action_type.clone(),
            source,
        },
    })
}

/// Run every action in order; the first failure aborts the rest
pub fn execute(actions: &[ChefAction], input: &str) -> Result<String> {
    actions
        .iter()
        .enumerate()
        .try_fold(input.to_string(), |value, (i, action)| apply(i + 1, action, &value))
}

/// Preview of the value after the action at `index` (0-based)
pub fn sequential_preview(actions: &[ChefAction], input: &str, index: usize) -> Option<String> {
    if index >= actions.len() {
        return None;
    }
    all_sequential_previews(&actions[..=index], input).pop()
}

/// Previews after each action. Once an action fails, it and every later
/// action show the same `Error: ...` text.
pub fn all_sequential_previews(actions: &[ChefAction], input: &str) -> Vec<String> {
    let mut previews = Vec::with_capacity(actions.len());
    let mut current: std::result::Result<String, String> = Ok(input.to_string());

    for (i, action) in actions.iter().enumerate() {
        current = match current {
            Ok(value) => apply(i + 1, action, &value).map_err(|e| format!("Error: {}", e)),
            failed => failed,
        };
        previews.push(match &current {
            Ok(value) => truncate_preview(value),
            Err(message) => message.clone(),
        });
    }
    previews
}

/// Refresh the cached previews in place
pub fn refresh_previews(actions: &mut [ChefAction], input: &str) {
    let previews = all_sequential_previews(actions, input);
    for (action, preview) in actions.iter_mut().zip(previews) {
        action.preview = Some(preview);
    }
}

/// Cut `value` to the preview length, marking the cut with `...`
pub fn truncate_preview(value: &str) -> String {
    match value.char_indices().nth(PREVIEW_LIMIT) {
        Some((cut, _)) => format!("{}...", &value[..cut]),
        None => value.to_string(),
    }
}
