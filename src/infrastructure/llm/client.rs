//! HTTP LLM client with a provider fallback chain.
//!
//! Each provider carries its own key, model, and request-rate quota
//! (token bucket via `governor`). The primary provider is tried first;
//! quota or auth exhaustion moves down the chain for the rest of the
//! run. Transient failures retry with exponential backoff before the
//! chain advances.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};

use crate::domain::error::LlmError;
use crate::domain::models::config::{LlmConfig, ProviderConfig};
use crate::domain::ports::llm_client::{LlmClient, LlmRequest, LlmResponse};

use super::retry::RetryPolicy;

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

struct Provider {
    config: ProviderConfig,
    api_key: Option<String>,
    limiter: DefaultDirectRateLimiter,
    /// Set when the provider's quota or credentials are gone for the
    /// rest of the run.
    exhausted: AtomicBool,
}

/// Production LLM client behind the `LlmClient` port.
pub struct HttpLlmClient {
    http: reqwest::Client,
    providers: Vec<Provider>,
    retry: RetryPolicy,
}

impl HttpLlmClient {
    /// Build from configuration, reading each provider's key from its
    /// environment variable. Providers without keys stay in the chain
    /// but are skipped.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(4)
            .build()
            .context("Failed to build HTTP client")?;

        let providers = config
            .providers
            .iter()
            .map(|p| {
                let api_key = std::env::var(&p.api_key_env).ok().filter(|k| !k.is_empty());
                if api_key.is_none() {
                    tracing::warn!(
                        provider = %p.name,
                        env = %p.api_key_env,
                        "LLM provider has no API key and will be skipped"
                    );
                }
                let rpm = NonZeroU32::new(p.requests_per_minute.max(1))
                    .expect("clamped to at least 1");
                Provider {
                    config: p.clone(),
                    api_key,
                    limiter: RateLimiter::direct(Quota::per_minute(rpm)),
                    exhausted: AtomicBool::new(false),
                }
            })
            .collect();

        Ok(Self {
            http,
            providers,
            retry: RetryPolicy::default(),
        })
    }

    async fn call_provider(
        &self,
        provider: &Provider,
        request: &LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        let api_key = provider
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::AuthenticationFailed(provider.config.name.clone()))?;

        let system = request
            .json_only
            .then_some("Reply with a single JSON object. No prose, no code fences.");
        let body = MessageRequest {
            model: &provider.config.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system,
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .http
            .post(format!("{}/v1/messages", provider.config.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(0)
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text, &provider.config.name));
        }

        let parsed: MessageResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let text = parsed
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text.as_str())
            .collect::<String>();
        if text.is_empty() {
            return Err(LlmError::InvalidResponse(
                "response carried no text blocks".to_string(),
            ));
        }
        Ok(LlmResponse {
            text,
            provider: provider.config.name.clone(),
            model: parsed.model,
        })
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str, provider: &str) -> LlmError {
    match status.as_u16() {
        401 | 403 => LlmError::AuthenticationFailed(provider.to_string()),
        402 => LlmError::QuotaExhausted(provider.to_string()),
        429 => {
            // A hard quota message ends the provider for the run; plain
            // rate pressure retries.
            if body.contains("quota") || body.contains("credit") {
                LlmError::QuotaExhausted(provider.to_string())
            } else {
                LlmError::RateLimited(body.chars().take(200).collect())
            }
        }
        500..=599 => LlmError::Transport(format!("server error {status}")),
        _ => LlmError::InvalidResponse(format!("unexpected status {status}: {body}")),
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn request(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        for (index, provider) in self.providers.iter().enumerate() {
            if provider.api_key.is_none() || provider.exhausted.load(Ordering::Relaxed) {
                continue;
            }
            provider.limiter.until_ready().await;

            let outcome = self
                .retry
                .execute(|| self.call_provider(provider, &request))
                .await;
            match outcome {
                Ok(response) => {
                    if index > 0 {
                        tracing::warn!(
                            provider = %provider.config.name,
                            "LLM request served by fallback provider"
                        );
                    }
                    return Ok(response);
                }
                Err(
                    err @ (LlmError::QuotaExhausted(_) | LlmError::AuthenticationFailed(_)),
                ) => {
                    tracing::warn!(
                        provider = %provider.config.name,
                        error = %err,
                        "LLM provider exhausted; advancing the fallback chain"
                    );
                    provider.exhausted.store(true, Ordering::Relaxed);
                }
                Err(err) => {
                    tracing::warn!(
                        provider = %provider.config.name,
                        error = %err,
                        "LLM provider failed; advancing the fallback chain"
                    );
                }
            }
        }
        Err(LlmError::AllProvidersExhausted)
    }

    fn is_configured(&self) -> bool {
        self.providers
            .iter()
            .any(|p| p.api_key.is_some() && !p.exhausted.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_config(name: &str, base_url: &str, key_env: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            base_url: base_url.to_string(),
            model: "test-model".to_string(),
            api_key_env: key_env.to_string(),
            requests_per_minute: 600,
        }
    }

    fn config_for(urls: &[(&str, &str, &str)]) -> LlmConfig {
        LlmConfig {
            providers: urls
                .iter()
                .map(|(n, u, e)| provider_config(n, u, e))
                .collect(),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_unconfigured_without_keys() {
        let config = config_for(&[(
            "primary",
            "http://localhost:1",
            "ALPHALOOP_TEST_NO_SUCH_KEY",
        )]);
        let client = HttpLlmClient::from_config(&config).unwrap();
        assert!(!client.is_configured());
    }

    #[tokio::test]
    async fn test_success_path_parses_text_blocks() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_body(
                r#"{"content":[{"type":"text","text":"{\"ok\":1}"}],"model":"test-model"}"#,
            )
            .create_async()
            .await;

        std::env::set_var("ALPHALOOP_TEST_KEY_A", "k");
        let config = config_for(&[("primary", &server.url(), "ALPHALOOP_TEST_KEY_A")]);
        let client = HttpLlmClient::from_config(&config).unwrap();
        let response = client.request(LlmRequest::json("hi")).await.unwrap();
        assert_eq!(response.text, "{\"ok\":1}");
        assert_eq!(response.provider, "primary");
    }

    #[tokio::test]
    async fn test_quota_exhaustion_falls_back_to_secondary() {
        let mut primary = mockito::Server::new_async().await;
        let _quota = primary
            .mock("POST", "/v1/messages")
            .with_status(429)
            .with_body(r#"{"error":"monthly quota exceeded"}"#)
            .create_async()
            .await;
        let mut secondary = mockito::Server::new_async().await;
        let _ok = secondary
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_body(
                r#"{"content":[{"type":"text","text":"fallback"}],"model":"test-model"}"#,
            )
            .create_async()
            .await;

        std::env::set_var("ALPHALOOP_TEST_KEY_B", "k");
        std::env::set_var("ALPHALOOP_TEST_KEY_C", "k");
        let config = config_for(&[
            ("primary", &primary.url(), "ALPHALOOP_TEST_KEY_B"),
            ("secondary", &secondary.url(), "ALPHALOOP_TEST_KEY_C"),
        ]);
        let client = HttpLlmClient::from_config(&config).unwrap();

        let response = client.request(LlmRequest::json("hi")).await.unwrap();
        assert_eq!(response.provider, "secondary");
        // The primary is now marked exhausted and skipped outright.
        let again = client.request(LlmRequest::json("hi")).await.unwrap();
        assert_eq!(again.provider, "secondary");
    }

    #[tokio::test]
    async fn test_all_providers_exhausted() {
        let mut server = mockito::Server::new_async().await;
        let _auth = server
            .mock("POST", "/v1/messages")
            .with_status(401)
            .with_body("{}")
            .create_async()
            .await;
        std::env::set_var("ALPHALOOP_TEST_KEY_D", "k");
        let config = config_for(&[("primary", &server.url(), "ALPHALOOP_TEST_KEY_D")]);
        let client = HttpLlmClient::from_config(&config).unwrap();
        let err = client.request(LlmRequest::json("hi")).await.unwrap_err();
        assert!(matches!(err, LlmError::AllProvidersExhausted));
    }

    #[test]
    fn test_status_classification() {
        let s = |code: u16| reqwest::StatusCode::from_u16(code).unwrap();
        assert!(matches!(
            classify_status(s(401), "", "p"),
            LlmError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            classify_status(s(429), "monthly quota exceeded", "p"),
            LlmError::QuotaExhausted(_)
        ));
        assert!(matches!(
            classify_status(s(429), "slow down", "p"),
            LlmError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(s(503), "", "p"),
            LlmError::Transport(_)
        ));
    }
}
