//! Fuzzer module - payload fuzzing for flow fuzz steps
//!
//! A fuzz step marks insertion points in a request template with `§name§`,
//! loads a payload list and sends one request per payload through a bounded
//! worker pool.

mod engine;
mod payloads;
mod results;

pub use engine::{FuzzEngine, FuzzJob, FuzzOutcome};
pub use payloads::{apply_payload, fill_markers, has_markers, markers, process, select, PayloadRange, PayloadSource};
pub use results::{FuzzResult, FuzzResultSet};
