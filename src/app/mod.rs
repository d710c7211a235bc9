//! Application core module
//!
//! Configuration and the typed event bus shared by the proxy and flow runner.

mod config;
mod events;

pub use config::{Config, FlowsConfig, FuzzerConfig, GeneralConfig, ProxyConfig, ScriptingConfig, TlsConfig};
pub use events::{AppEvent, EventSink};
