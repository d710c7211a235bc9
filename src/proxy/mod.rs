//! Intercepting proxy module
//!
//! Plain HTTP forwarding, CONNECT tunnels with TLS interception, the
//! intercept queue and captured history.

mod history;
mod intercept;
mod server;
mod tls;

pub use history::ProxyHistory;
pub use intercept::{EntryStatus, InterceptDecision, InterceptQueue, InterceptQueueEntry};
pub use server::ProxyServer;
pub use tls::{CertificateAuthority, CertificateProvider, LeafCertificate};
