//! Error types for Gleip
//!
//! Every failure names where it happened (connection, step or chef action)
//! together with the underlying cause.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T, E = GleipError> = std::result::Result<T, E>;

/// Main error type for proxy and flow operations
#[derive(Error, Debug)]
pub enum GleipError {
    /// Connection or timeout talking to an origin server
    #[error("Network error ({target}): {reason}")]
    Network { target: String, reason: String },

    /// TLS handshake or certificate generation failure
    #[error("TLS error for {host}: {reason}")]
    Tls { host: String, reason: String },

    /// A chef action rejected its input
    #[error("Chef action {index} ({action}) failed: {source}")]
    Transform {
        index: usize,
        action: String,
        #[source]
        source: ActionError,
    },

    /// A chef action type nobody knows how to run
    #[error("Chef action {index} has unknown type '{action}'")]
    UnknownAction { index: usize, action: String },

    /// The extraction locator matched nothing
    #[error("Failed to extract '{variable}': {locator} not found")]
    Extraction { variable: String, locator: String },

    /// A `{{name}}` placeholder referenced a variable that is not bound
    #[error("Unbound variable '{0}'")]
    UnboundVariable(String),

    /// Script executor failure
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    /// Operator stopped the run
    #[error("Cancelled by operator")]
    Cancelled,

    /// Error raised inside a flow step
    #[error("Step {index} ({name}): {source}")]
    Step {
        index: usize,
        name: String,
        #[source]
        source: Box<GleipError>,
    },

    /// Invalid step definition
    #[error("Invalid step definition: {0}")]
    InvalidStep(String),

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Proxy server errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Flow definition storage errors
    #[error("Flow store error: {0}")]
    Store(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single chef action on its input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("missing option '{0}'")]
    MissingOption(String),

    #[error("invalid option '{name}': {reason}")]
    InvalidOption { name: String, reason: String },

    #[error("unknown action '{0}'")]
    UnknownAction(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {path}")]
    ReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write configuration file: {path}")]
    WriteError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("Could not determine {0} directory")]
    NoDirectory(&'static str),
}

/// Proxy server errors
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to start proxy on {addr}: {reason}")]
    StartError { addr: String, reason: String },

    #[error("Invalid proxy request from {peer}: {reason}")]
    InvalidRequest { peer: String, reason: String },
}

/// Scripting engine errors
#[derive(Error, Debug, Clone)]
pub enum ScriptError {
    #[error("Script execution failed: {0}")]
    ExecutionError(String),

    #[error("Script timeout after {0}ms")]
    Timeout(u64),

    #[error("Script returned invalid variables: {0}")]
    InvalidOutput(String),
}

impl GleipError {
    /// Wrap an error with the step it happened in
    pub fn in_step(self, index: usize, name: &str) -> Self {
        GleipError::Step {
            index,
            name: name.to_string(),
            source: Box::new(self),
        }
    }

    /// Whether this error (or the one it wraps) is an operator cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            GleipError::Cancelled => true,
            GleipError::Step { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    pub(crate) fn network(target: impl Into<String>, reason: impl ToString) -> Self {
        GleipError::Network {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn tls(host: impl Into<String>, reason: impl ToString) -> Self {
        GleipError::Tls {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            GleipError::Network { .. } => format!("Network issue: {}", self.user_hint()),
            GleipError::Tls { .. } => format!("TLS issue: {}", self.user_hint()),
            GleipError::Config(e) => format!("Configuration problem: {}", e.user_hint()),
            GleipError::Script(e) => format!("Script issue: {}", e.user_hint()),
            GleipError::Step { index, name, source } => {
                format!("Step {} ({}) failed. {}", index, name, source.user_message())
            }
            _ => self.to_string(),
        }
    }
}

/// Trait for providing user-friendly hints
pub trait UserHint {
    fn user_hint(&self) -> String;
}

impl UserHint for GleipError {
    fn user_hint(&self) -> String {
        match self {
            GleipError::Network { target, reason } => {
                format!("Could not reach {} ({}). Check that it is running and accessible.", target, reason)
            }
            GleipError::Tls { host, .. } => {
                format!("Could not establish TLS for '{}'. Check that the proxy CA is trusted.", host)
            }
            GleipError::UnboundVariable(name) => {
                format!("Variable '{}' is used before any step sets it.", name)
            }
            _ => self.to_string(),
        }
    }
}

impl UserHint for ConfigError {
    fn user_hint(&self) -> String {
        match self {
            ConfigError::ReadError { path, .. } => {
                format!("Could not read '{}'. Check if the file exists and you have read permissions.", path)
            }
            ConfigError::WriteError { path, .. } => {
                format!("Could not write '{}'. Check that the directory is writable.", path)
            }
            ConfigError::ParseError(_) => {
                "The configuration file has invalid syntax. Check for TOML formatting errors.".into()
            }
            ConfigError::ValidationError { field, reason } => {
                format!("Invalid value for '{}': {}", field, reason)
            }
            ConfigError::NoDirectory(kind) => {
                format!("No {} directory is available. Pass explicit paths in the configuration.", kind)
            }
        }
    }
}

impl UserHint for ScriptError {
    fn user_hint(&self) -> String {
        match self {
            ScriptError::Timeout(ms) => {
                format!("Script exceeded {}ms time limit. Check for infinite loops.", ms)
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_names_location() {
        let err = GleipError::UnboundVariable("token".into()).in_step(2, "login");
        let message = err.to_string();
        assert!(message.contains("Step 2 (login)"));
        assert!(message.contains("token"));
    }

    #[test]
    fn test_cancelled_detection_through_step() {
        assert!(GleipError::Cancelled.in_step(0, "fuzz").is_cancelled());
        assert!(!GleipError::UnboundVariable("x".into()).is_cancelled());
    }

    #[test]
    fn test_transform_error_message() {
        let err = GleipError::Transform {
            index: 1,
            action: "base64_decode".into(),
            source: ActionError::InvalidInput("bad padding".into()),
        };
        assert_eq!(
            err.to_string(),
            "Chef action 1 (base64_decode) failed: invalid input: bad padding"
        );
    }
}
