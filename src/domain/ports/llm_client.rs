//! LLM service port.

use async_trait::async_trait;

use crate::domain::error::LlmError;

/// Parameters of a single completion call.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Ask the provider for a JSON-only reply when it supports the
    /// hint. The generator never requests executable code.
    pub json_only: bool,
}

impl LlmRequest {
    pub fn json(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 1024,
            temperature: 0.7,
            json_only: true,
        }
    }
}

/// Reply text plus the provider that produced it.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
}

/// Request/response text API with provider-specific quotas behind it.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Issue one completion call, already routed through rate limiting
    /// and the provider fallback chain.
    async fn request(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Whether any provider currently has a usable key.
    fn is_configured(&self) -> bool;
}
