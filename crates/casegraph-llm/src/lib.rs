//! Rate-limited LLM client wrapper for CaseGraph.
//!
//! Strategies and the pipeline consume the raw `LlmProvider` contract; this
//! crate adds the operational layer on top of any provider: per-model
//! token-bucket rate limiting, deterministic completion caching, and retry
//! with exponential backoff.

pub mod client;
pub mod rate_limiter;

pub use client::{LlmClient, LlmClientMetrics, LlmClientMetricsSnapshot};
pub use rate_limiter::RateLimiter;
