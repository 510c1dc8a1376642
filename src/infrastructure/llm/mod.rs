//! LLM transport: HTTP client, provider fallback, rate limiting,
//! retry.

pub mod client;
pub mod retry;

pub use client::HttpLlmClient;
pub use retry::RetryPolicy;
