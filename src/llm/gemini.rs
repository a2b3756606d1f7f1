//! Client for the Gemini `generateContent` REST endpoint.
//!
//! Only the pieces the model evaluator needs are modelled: a system
//! instruction, one user prompt, a temperature and Google Search grounding.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::EvaluationError;

/// Default Gemini REST root.
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Model used when none is configured.
pub const DEFAULT_EVALUATOR_MODEL: &str = "gemini-3-flash-preview";

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff in milliseconds.
const BASE_RETRY_DELAY_MS: u64 = 5000;

/// Grounded answers can take a while.
const REQUEST_TIMEOUT_SECS: u64 = 180;

/// One `generateContent` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub contents: Vec<Content>,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
}

impl GenerateRequest {
    /// A single-turn request with the given prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system_instruction: None,
            contents: vec![Content::text(prompt)],
            generation_config: GenerationConfig { temperature: 0.1 },
            tools: Vec::new(),
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(Content::text(instruction));
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.generation_config.temperature = temperature;
        self
    }

    /// Enables Google Search grounding.
    pub fn with_search_grounding(mut self) -> Self {
        self.tools.push(Tool {
            google_search: GoogleSearch {},
        });
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![Part { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationConfig {
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub google_search: GoogleSearch,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoogleSearch {}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

/// Gemini REST client bound to one model.
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    retry_delay: Duration,
}

impl GeminiClient {
    /// Creates a client; an empty model means [`DEFAULT_EVALUATOR_MODEL`].
    ///
    /// # Errors
    ///
    /// Returns `EvaluationError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, EvaluationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| EvaluationError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        let model = model.into();
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: GEMINI_BASE_URL.to_string(),
            model: if model.is_empty() {
                DEFAULT_EVALUATOR_MODEL.to_string()
            } else {
                model
            },
            retry_delay: Duration::from_millis(BASE_RETRY_DELAY_MS),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sends the request and returns the text of the first candidate part.
    pub async fn generate(&self, request: &GenerateRequest) -> Result<String, EvaluationError> {
        let url = format!("{}/{}:generateContent", self.base_url, self.model);
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1));
                tokio::time::sleep(delay).await;
                tracing::warn!(attempt = attempt + 1, "Retrying Gemini request");
            }

            match self.send(&url, request).await {
                Ok(text) => return Ok(text),
                Err(err) if is_transient_error(&err) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %err,
                        "Gemini request failed, will retry"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            EvaluationError::RequestFailed("Max retries exceeded with no error captured".to_string())
        }))
    }

    async fn send(&self, url: &str, request: &GenerateRequest) -> Result<String, EvaluationError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| EvaluationError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EvaluationError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorResponse>(&body)
                .ok()
                .map(|e| e.error.message)
                .filter(|m| !m.is_empty())
                .unwrap_or(body);
            return Err(EvaluationError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| EvaluationError::ParseError(e.to_string()))?;

        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .and_then(|content| content.parts.into_iter().next())
            .map(|part| part.text)
            .ok_or(EvaluationError::EmptyResponse)
    }
}

fn is_transient_error(error: &EvaluationError) -> bool {
    match error {
        EvaluationError::RequestFailed(_) => true,
        EvaluationError::ApiError { code, .. } => *code >= 500 || *code == 429,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> GeminiClient {
        GeminiClient::new("gm-test-key", "")
            .expect("client builds")
            .with_base_url(server.base_url())
            .with_retry_delay(Duration::from_millis(5))
    }

    #[test]
    fn test_request_serialization() {
        let request = GenerateRequest::new("pick one")
            .with_system_instruction("be an expert")
            .with_search_grounding();

        let value = serde_json::to_value(&request).expect("serializes");
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "be an expert");
        assert_eq!(value["contents"][0]["parts"][0]["text"], "pick one");
        assert_eq!(value["tools"][0], json!({"googleSearch": {}}));
        assert!((value["generationConfig"]["temperature"].as_f64().unwrap_or_default() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_default_model() {
        let client = GeminiClient::new("k", "").expect("client builds");
        assert_eq!(client.model(), DEFAULT_EVALUATOR_MODEL);
    }

    #[tokio::test]
    async fn test_generate_returns_first_part() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/gemini-3-flash-preview:generateContent")
                .header("x-goog-api-key", "gm-test-key");
            then.status(200).json_body(json!({
                "candidates": [{"content": {"parts": [{"text": "a/b:free"}, {"text": "ignored"}]}}]
            }));
        });

        let text = client(&server)
            .generate(&GenerateRequest::new("pick"))
            .await
            .expect("generate succeeds");

        mock.assert();
        assert_eq!(text, "a/b:free");
    }

    #[tokio::test]
    async fn test_generate_empty_candidates() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST);
            then.status(200).json_body(json!({"candidates": []}));
        });

        let result = client(&server).generate(&GenerateRequest::new("pick")).await;
        assert!(matches!(result, Err(EvaluationError::EmptyResponse)));
    }

    #[tokio::test]
    async fn test_generate_structured_api_error() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST);
            then.status(400)
                .json_body(json!({"error": {"code": 400, "message": "API key not valid"}}));
        });

        let result = client(&server).generate(&GenerateRequest::new("pick")).await;

        mock.assert_calls(1);
        match result {
            Err(EvaluationError::ApiError { code, message }) => {
                assert_eq!(code, 400);
                assert_eq!(message, "API key not valid");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_retries_rate_limit() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST);
            then.status(429).body("slow down");
        });

        let result = client(&server).generate(&GenerateRequest::new("pick")).await;

        mock.assert_calls(3);
        assert!(matches!(result, Err(EvaluationError::ApiError { code: 429, .. })));
    }
}
