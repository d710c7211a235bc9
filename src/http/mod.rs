//! HTTP module
//!
//! Transaction types, the outbound send path, content decoding and the
//! HTTP/1.x wire codec used by the proxy listener.

mod client;
pub mod decode;
mod transaction;
pub mod wire;

pub use client::{HttpSender, SendOptions};
pub use transaction::{reason_phrase, Headers, HttpRequest, HttpResponse, HttpTransaction};
