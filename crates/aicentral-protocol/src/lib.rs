//! Wire-format layer for aicentral.
//!
//! This crate intentionally does **not** depend on any HTTP stack. It knows
//! the shapes of OpenAI-compatible requests and responses — call kinds and
//! their URL paths, usage payloads, SSE framing — while higher layers perform
//! IO.

pub mod call;
pub mod sse;
pub mod tokenize;
pub mod usage;

pub use call::CallKind;
pub use sse::{SseScanner, StreamSummary};
pub use tokenize::TokenEstimator;
pub use usage::{UsagePayload, extract_usage, inject_model, prompt_text};
