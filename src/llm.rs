//! Argus LLM Bridge - Outbound provider calls for the threat pipeline
//!
//! The provider contract: POST `{base_url}/responses` with a model, a
//! system+user input pair, optional search tools and an optional structured
//! output format; the response carries an output array, token usage and an
//! optional canonical citation list.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::config_cache::{ConfigCache, ConfigKey};
use crate::errors::ApiError;
use crate::vault::CredentialVault;

pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(240);
pub const DEDUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const MANAGEMENT_TIMEOUT: Duration = Duration::from_secs(15);

const RETRY_DELAYS_SECS: [u64; 3] = [2, 4, 8];

const DEFAULT_BASE_URL: &str = "https://api.x.ai/v1";
const DEFAULT_SEARCH_MODEL: &str = "grok-4-fast";
const DEFAULT_DEDUP_MODEL: &str = "grok-3-mini";

/// Per-model $/1M token rates, with a default fallback for unknown models.
const MODEL_RATES: &[(&str, f64, f64)] = &[
    ("grok-4", 3.0, 15.0),
    ("grok-4-fast", 0.20, 0.50),
    ("grok-3", 3.0, 15.0),
    ("grok-3-mini", 0.30, 0.50),
];
const DEFAULT_RATES: (f64, f64) = (2.0, 10.0);

/// Fixed surcharge per social-stream tool invocation ($5 per thousand).
const SOCIAL_SEARCH_SURCHARGE: f64 = 5.0 / 1000.0;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider rejected credentials")]
    Auth,
    #[error("provider rejected request: {0}")]
    BadRequest(String),
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("malformed provider response: {0}")]
    Parse(String),
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        ApiError::Upstream(err.to_string())
    }
}

// ============ Wire Types ============

#[derive(Debug, Clone, Serialize)]
pub struct ProviderRequest {
    pub model: String,
    pub input: Vec<InputMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<TextOptions>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputMessage {
    pub role: String,
    pub content: String,
}

impl InputMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ToolSpec {
    /// Real-time social-stream search, date-bounded at day granularity.
    #[serde(rename = "social_search")]
    SocialSearch {
        #[serde(skip_serializing_if = "Option::is_none")]
        from_date: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        to_date: Option<String>,
    },
    #[serde(rename = "web_search")]
    WebSearch {
        #[serde(skip_serializing_if = "Option::is_none")]
        allowed_domains: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TextOptions {
    pub format: TextFormat,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextFormat {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<JsonValue>,
}

impl TextOptions {
    pub fn json_schema(name: &str, schema: JsonValue) -> Self {
        Self {
            format: TextFormat {
                kind: "json_schema".to_string(),
                name: Some(name.to_string()),
                schema: Some(schema),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderResponse {
    #[serde(default)]
    pub output: Vec<OutputItem>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub citations: Option<Vec<String>>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<Vec<ContentItem>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

impl ProviderResponse {
    /// Concatenated assistant text from the output array.
    pub fn message_text(&self) -> Option<String> {
        let mut text = String::new();
        for item in &self.output {
            if item.kind != "message" {
                continue;
            }
            if let Some(content) = &item.content {
                for part in content {
                    if part.kind == "output_text" {
                        if let Some(t) = &part.text {
                            text.push_str(t);
                        }
                    }
                }
            }
        }
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn social_search_calls(&self) -> usize {
        self.output
            .iter()
            .filter(|item| item.kind == "social_search_call")
            .count()
    }
}

/// Resolved provider settings. The API key lives encrypted in the config
/// store and is decrypted through the credential vault on resolution.
#[derive(Debug, Clone)]
pub struct AiSettings {
    pub base_url: String,
    pub api_key: String,
    pub search_model: String,
    pub dedup_model: String,
}

pub struct LlmClient {
    http: reqwest::Client,
    config: Arc<ConfigCache>,
    vault: Arc<CredentialVault>,
}

impl LlmClient {
    pub fn new(config: Arc<ConfigCache>, vault: Arc<CredentialVault>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            vault,
        }
    }

    pub async fn settings(&self) -> Result<AiSettings, ApiError> {
        let api_key = match std::env::var("LLM_API_KEY") {
            Ok(key) if !key.is_empty() => key,
            _ => {
                let encrypted = self
                    .config
                    .get_string(ConfigKey::AiApiKey)
                    .await?
                    .ok_or_else(|| ApiError::Upstream("no AI API key configured".to_string()))?;
                self.vault.decrypt(&encrypted).await?
            }
        };

        Ok(AiSettings {
            base_url: self
                .config
                .get_string(ConfigKey::AiBaseUrl)
                .await?
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            search_model: self
                .config
                .get_string(ConfigKey::AiSearchModel)
                .await?
                .unwrap_or_else(|| DEFAULT_SEARCH_MODEL.to_string()),
            dedup_model: self
                .config
                .get_string(ConfigKey::AiDedupModel)
                .await?
                .unwrap_or_else(|| DEFAULT_DEDUP_MODEL.to_string()),
        })
    }

    /// Execute one provider call with retries. Transient failures back off
    /// 2s/4s/8s; credential rejections abort immediately.
    pub async fn respond(
        &self,
        settings: &AiSettings,
        request: &ProviderRequest,
        timeout: Duration,
    ) -> Result<ProviderResponse, LlmError> {
        let mut last_err = None;
        for (attempt, delay_secs) in std::iter::once(None)
            .chain(RETRY_DELAYS_SECS.iter().copied().map(Some))
            .enumerate()
        {
            if let Some(delay) = delay_secs {
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            match self.attempt(settings, request, timeout).await {
                Ok(response) => return Ok(response),
                Err(LlmError::Transient(message)) => {
                    warn!(attempt = attempt + 1, error = %message, "Provider call failed, retrying");
                    last_err = Some(LlmError::Transient(message));
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| LlmError::Transient("retries exhausted".to_string())))
    }

    async fn attempt(
        &self,
        settings: &AiSettings,
        request: &ProviderRequest,
        timeout: Duration,
    ) -> Result<ProviderResponse, LlmError> {
        let response = self
            .http
            .post(format!("{}/responses", settings.base_url))
            .bearer_auth(&settings.api_key)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<ProviderResponse>()
                .await
                .map_err(|e| LlmError::Parse(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(LlmError::Auth),
            StatusCode::TOO_MANY_REQUESTS => Err(LlmError::Transient(body)),
            status if status.is_client_error() => Err(LlmError::BadRequest(body)),
            status => Err(LlmError::Transient(format!("{status}: {body}"))),
        }
    }

    /// Connectivity probe against the configured search model.
    pub async fn test_connection(&self) -> Result<(AiSettings, ProviderResponse), ApiError> {
        let settings = self.settings().await?;
        let request = ProviderRequest {
            model: settings.search_model.clone(),
            input: vec![
                InputMessage::system("You are a connectivity probe. Reply with the single word OK."),
                InputMessage::user("ping"),
            ],
            tools: None,
            tool_choice: None,
            text: None,
        };
        let response = self.respond(&settings, &request, TEST_TIMEOUT).await?;
        Ok((settings, response))
    }

    /// Ask the model for up to five reputable news domains for an area.
    pub async fn suggest_sources(
        &self,
        area: &str,
    ) -> Result<(AiSettings, ProviderResponse, Vec<String>), ApiError> {
        let settings = self.settings().await?;
        let request = ProviderRequest {
            model: settings.search_model.clone(),
            input: vec![
                InputMessage::system(
                    "Return a JSON array of at most 5 hostnames of reputable local news \
                     outlets for the given area. Hostnames only, no scheme, no commentary.",
                ),
                InputMessage::user(area.to_string()),
            ],
            tools: None,
            tool_choice: None,
            text: None,
        };
        let response = self.respond(&settings, &request, MANAGEMENT_TIMEOUT).await?;

        let domains = response
            .message_text()
            .and_then(|text| serde_json::from_str::<Vec<String>>(strip_fences(&text)).ok())
            .unwrap_or_default();
        Ok((settings, response, domains))
    }
}

/// Estimated call cost: token rates by model plus the social-search surcharge.
pub fn estimate_cost(model: &str, usage: Usage, social_search_calls: usize) -> f64 {
    let (input_rate, output_rate) = MODEL_RATES
        .iter()
        .find(|(name, _, _)| *name == model)
        .map(|(_, input, output)| (*input, *output))
        .unwrap_or(DEFAULT_RATES);

    (usage.input_tokens as f64 / 1_000_000.0) * input_rate
        + (usage.output_tokens as f64 / 1_000_000.0) * output_rate
        + social_search_calls as f64 * SOCIAL_SEARCH_SURCHARGE
}

/// Models sometimes wrap JSON in markdown fences despite instructions.
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = ProviderRequest {
            model: "grok-4-fast".to_string(),
            input: vec![InputMessage::system("sys"), InputMessage::user("usr")],
            tools: Some(vec![
                ToolSpec::SocialSearch {
                    from_date: Some("2026-07-31".to_string()),
                    to_date: Some("2026-08-01".to_string()),
                },
                ToolSpec::WebSearch {
                    allowed_domains: Some(vec!["example.com".to_string()]),
                },
            ]),
            tool_choice: Some("auto".to_string()),
            text: Some(TextOptions::json_schema("threats", json!({"type": "array"}))),
        };

        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["input"][0]["role"], "system");
        assert_eq!(wire["tools"][0]["type"], "social_search");
        assert_eq!(wire["tools"][1]["type"], "web_search");
        assert_eq!(wire["tool_choice"], "auto");
        assert_eq!(wire["text"]["format"]["type"], "json_schema");
    }

    #[test]
    fn test_response_text_and_tool_counting() {
        let raw = json!({
            "output": [
                {"type": "social_search_call", "query": "seattle incident"},
                {"type": "social_search_call", "query": "seattle police"},
                {"type": "message", "role": "assistant", "content": [
                    {"type": "output_text", "text": "[{\"a\""},
                    {"type": "output_text", "text": ":1}]"}
                ]}
            ],
            "usage": {"input_tokens": 100, "output_tokens": 50, "total_tokens": 150},
            "model": "grok-4-fast"
        });
        let response: ProviderResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(response.message_text().as_deref(), Some("[{\"a\":1}]"));
        assert_eq!(response.social_search_calls(), 2);
        assert_eq!(response.usage.total_tokens, 150);
    }

    #[test]
    fn test_cost_estimation_with_surcharge() {
        let usage = Usage {
            input_tokens: 1_000_000,
            output_tokens: 500_000,
            total_tokens: 1_500_000,
        };
        let cost = estimate_cost("grok-4-fast", usage, 2);
        // 1M * 0.20/1M + 0.5M * 0.50/1M + 2 * 0.005
        assert!((cost - (0.20 + 0.25 + 0.01)).abs() < 1e-9);

        // Unknown models fall back to the default rates.
        let fallback = estimate_cost("unknown-model", usage, 0);
        assert!((fallback - (2.0 + 5.0)).abs() < 1e-9);
    }

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("[1,2]"), "[1,2]");
        assert_eq!(strip_fences("```json\n[1,2]\n```"), "[1,2]");
        assert_eq!(strip_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }
}
