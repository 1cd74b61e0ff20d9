use crate::prompt::{self, SYSTEM_PROMPT};
use crate::LlmProvider;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tickerpulse_core::{CoreError, LlmConfig, LlmError, PostAnalysis, RawPost};
use tracing::{debug, error, warn};

const PROVIDER: &str = "openai";

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// OpenAI-compatible chat completions client.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    http_client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(
        api_key: String,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, CoreError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            http_client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    /// Returns `None` when no API key is configured.
    pub fn from_config(config: &LlmConfig) -> Result<Option<Self>, CoreError> {
        match config.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Ok(Some(Self::new(
                key.to_string(),
                config.base_url.clone(),
                config.model.clone(),
                config.timeout_secs,
            )?)),
            _ => Ok(None),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn status_error(&self, status: StatusCode, retry_after: Option<u64>) -> CoreError {
        let provider = PROVIDER.to_string();
        match status {
            StatusCode::UNAUTHORIZED => LlmError::AuthenticationFailed { provider }.into(),
            StatusCode::FORBIDDEN => LlmError::InvalidApiKey { provider }.into(),
            StatusCode::PAYMENT_REQUIRED => LlmError::InsufficientCredits { provider }.into(),
            StatusCode::NOT_FOUND => LlmError::ModelNotAvailable {
                model: self.model.clone(),
            }
            .into(),
            StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimitExceeded {
                provider,
                retry_after: retry_after.unwrap_or(60),
            }
            .into(),
            StatusCode::SERVICE_UNAVAILABLE => LlmError::ServiceUnavailable { provider }.into(),
            s if s.is_server_error() => LlmError::ServerError {
                provider,
                status_code: s.as_u16(),
            }
            .into(),
            s => CoreError::RequestFailed {
                message: format!("{} rejected the request", PROVIDER),
                status_code: Some(s.as_u16()),
            },
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn analyze_batch(&self, posts: &[RawPost]) -> Result<Vec<PostAnalysis>, CoreError> {
        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt::user_prompt(posts) }
            ],
            "response_format": prompt::response_format(posts.len())
        });

        debug!("Requesting analysis of {} posts from {}", posts.len(), self.model);
        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::Llm(LlmError::RequestTimeout {
                        provider: PROVIDER.to_string(),
                    })
                } else {
                    CoreError::Network(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            error!("{} returned status {}", PROVIDER, status);
            return Err(self.status_error(status, retry_after));
        }

        let completion: ChatCompletion = response.json().await.map_err(|e| {
            LlmError::InvalidResponseFormat {
                provider: PROVIDER.to_string(),
                details: e.to_string(),
            }
        })?;

        let choice = completion.choices.into_iter().next().ok_or_else(|| {
            LlmError::InvalidResponseFormat {
                provider: PROVIDER.to_string(),
                details: "no choices in completion".to_string(),
            }
        })?;

        if let Some(refusal) = choice.message.refusal {
            warn!("{} refused the batch: {}", PROVIDER, refusal);
            return Err(LlmError::ContentFiltered { reason: refusal }.into());
        }
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(LlmError::ContentFiltered {
                reason: "content_filter".to_string(),
            }
            .into());
        }

        let content = choice.message.content.ok_or_else(|| LlmError::InvalidResponseFormat {
            provider: PROVIDER.to_string(),
            details: "empty message content".to_string(),
        })?;

        let analyses = prompt::parse_reply(PROVIDER, &content)?;
        if analyses.len() != posts.len() {
            warn!(
                "{} returned {} analyses for {} posts",
                PROVIDER,
                analyses.len(),
                posts.len()
            );
        }
        Ok(analyses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use tickerpulse_core::Source;

    #[derive(Clone)]
    struct Fake {
        status: AxumStatus,
        content: String,
        seen: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    }

    async fn completions(
        State(fake): State<Fake>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        fake.seen.lock().unwrap().push((auth, body));

        if fake.status != AxumStatus::OK {
            return (fake.status, "upstream failure").into_response();
        }
        Json(json!({
            "choices": [{
                "message": { "role": "assistant", "content": fake.content },
                "finish_reason": "stop"
            }]
        }))
        .into_response()
    }

    async fn spawn(fake: Fake) -> String {
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(fake);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    fn fake(status: AxumStatus, content: &str) -> Fake {
        Fake {
            status,
            content: content.to_string(),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn posts(n: usize) -> Vec<RawPost> {
        (0..n)
            .map(|i| RawPost {
                id: format!("t3_{}", i),
                source: Source::Reddit,
                author: "a".to_string(),
                body: format!("post {}", i),
                created_at: Utc::now(),
                score: 0,
                comment_count: 0,
                parent_id: None,
                channel: None,
                permalink: None,
            })
            .collect()
    }

    #[test]
    fn test_from_config_without_key() {
        let config = LlmConfig::default();
        assert!(OpenAiProvider::from_config(&config).unwrap().is_none());

        let config = LlmConfig {
            api_key: Some("   ".to_string()),
            ..LlmConfig::default()
        };
        assert!(OpenAiProvider::from_config(&config).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_analyze_batch_success() {
        let content = r#"{"analyses": [
            {"ticker": "NVDA", "sentiment_score": 0.8, "sentiment_label": "positive",
             "confidence": 0.9, "key_themes": ["ai"], "actionability_score": 0.6,
             "has_catalyst": true, "reasoning": "earnings"},
            {"ticker": null, "sentiment_score": -0.5, "sentiment_label": "negative",
             "confidence": 0.7, "key_themes": [], "actionability_score": 0.2,
             "has_catalyst": false, "reasoning": "macro fear"}
        ]}"#;
        let fake = fake(AxumStatus::OK, content);
        let seen = fake.seen.clone();
        let base_url = spawn(fake).await;

        let provider = OpenAiProvider::new("sk-test".to_string(), base_url, "gpt-test", 5).unwrap();
        let analyses = provider.analyze_batch(&posts(2)).await.unwrap();

        assert_eq!(analyses.len(), 2);
        assert_eq!(analyses[0].ticker.as_deref(), Some("NVDA"));
        assert_eq!(analyses[1].ticker, None);

        let requests = seen.lock().unwrap();
        let (auth, body) = &requests[0];
        assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(
            body["response_format"]["json_schema"]["schema"]["properties"]["analyses"]["maxItems"],
            2
        );
    }

    #[tokio::test]
    async fn test_server_error_maps_to_retryable_llm_error() {
        let base_url = spawn(fake(AxumStatus::INTERNAL_SERVER_ERROR, "")).await;
        let provider = OpenAiProvider::new("sk-test".to_string(), base_url, "gpt-test", 5).unwrap();

        let err = provider.analyze_batch(&posts(1)).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Llm(LlmError::ServerError {
                status_code: 500,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth_failure() {
        let base_url = spawn(fake(AxumStatus::UNAUTHORIZED, "")).await;
        let provider = OpenAiProvider::new("sk-bad".to_string(), base_url, "gpt-test", 5).unwrap();

        let err = provider.analyze_batch(&posts(1)).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Llm(LlmError::AuthenticationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_content_is_invalid_response() {
        let base_url = spawn(fake(AxumStatus::OK, "not json at all")).await;
        let provider = OpenAiProvider::new("sk-test".to_string(), base_url, "gpt-test", 5).unwrap();

        let err = provider.analyze_batch(&posts(1)).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Llm(LlmError::InvalidResponseFormat { .. })
        ));
    }
}
