//! OpenRouter model catalog.
//!
//! The `/models` endpoint returns the whole catalog (several hundred entries)
//! in one response with no server-side filtering, so free models are picked
//! out client-side.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::CatalogError;

/// Default OpenRouter API endpoint.
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff in milliseconds.
const BASE_RETRY_DELAY_MS: u64 = 1000;

/// Request timeout in seconds. The full catalog is large.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Per-token pricing as reported by the catalog (decimal strings).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default, deserialize_with = "null_as_default")]
    pub prompt: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub completion: String,
}

/// A model that may be chosen for translation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateModel {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default)]
    pub context_length: Option<u64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub pricing: Pricing,
}

/// The catalog sends explicit `null` for unknown fields.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl CandidateModel {
    /// Creates a candidate with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            ..Default::default()
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the context window size.
    pub fn with_context_length(mut self, tokens: u64) -> Self {
        self.context_length = Some(tokens);
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the per-token prices.
    pub fn with_pricing(mut self, prompt: impl Into<String>, completion: impl Into<String>) -> Self {
        self.pricing = Pricing {
            prompt: prompt.into(),
            completion: completion.into(),
        };
        self
    }

    /// A model is free if its id carries the `:free` suffix or both prices are zero.
    pub fn is_free(&self) -> bool {
        self.id.ends_with(":free") || (self.pricing.prompt == "0" && self.pricing.completion == "0")
    }
}

/// Source of candidate models.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Lists every model the catalog knows about.
    async fn list_models(&self) -> Result<Vec<CandidateModel>, CatalogError>;

    /// Lists only the free models.
    async fn free_models(&self) -> Result<Vec<CandidateModel>, CatalogError> {
        let models = self.list_models().await?;
        Ok(models.into_iter().filter(CandidateModel::is_free).collect())
    }
}

/// HTTP client for the OpenRouter catalog.
pub struct OpenRouterCatalog {
    client: Client,
    api_key: String,
    base_url: String,
    retry_delay: Duration,
}

impl OpenRouterCatalog {
    /// Creates a catalog client for the public endpoint.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>) -> Result<Self, CatalogError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| CatalogError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: OPENROUTER_BASE_URL.to_string(),
            retry_delay: Duration::from_millis(BASE_RETRY_DELAY_MS),
        })
    }

    /// Points the client at a different API root.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets the base delay between retries.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn fetch_with_retry(&self) -> Result<Vec<CandidateModel>, CatalogError> {
        let url = format!("{}/models", self.base_url);
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1));
                tokio::time::sleep(delay).await;
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying model catalog request"
                );
            }

            match self.fetch(&url).await {
                Ok(models) => return Ok(models),
                Err(err) if is_transient_error(&err) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %err,
                        "Model catalog request failed, will retry"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            CatalogError::RequestFailed("Max retries exceeded with no error captured".to_string())
        }))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<CandidateModel>, CatalogError> {
        let response = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", "https://github.com/fusionn-subs")
            .header("X-Title", "fusionn-subs")
            .send()
            .await
            .map_err(|e| CatalogError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CatalogError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            return Err(CatalogError::ApiError {
                code: status.as_u16(),
                message: body,
            });
        }

        parse_catalog(&body)
    }
}

/// Parses a catalog body, with or without the `data` wrapper.
///
/// Entries that fail to decode are skipped with a warning.
pub fn parse_catalog(body: &str) -> Result<Vec<CandidateModel>, CatalogError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| CatalogError::ParseError(e.to_string()))?;

    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(mut object) => match object.remove("data") {
            Some(Value::Array(entries)) => entries,
            Some(other) => {
                return Err(CatalogError::ParseError(format!(
                    "expected `data` to be an array, got {}",
                    json_kind(&other)
                )))
            }
            None => return Err(CatalogError::ParseError("missing `data` field".to_string())),
        },
        other => {
            return Err(CatalogError::ParseError(format!(
                "expected an object or array, got {}",
                json_kind(&other)
            )))
        }
    };

    let total = entries.len();
    let models: Vec<CandidateModel> = entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(model) => Some(model),
            Err(e) => {
                tracing::warn!(index, error = %e, "Skipping malformed catalog entry");
                None
            }
        })
        .collect();

    if models.len() < total {
        tracing::warn!(skipped = total - models.len(), total, "Some catalog entries were skipped");
    }
    Ok(models)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl ModelCatalog for OpenRouterCatalog {
    async fn list_models(&self) -> Result<Vec<CandidateModel>, CatalogError> {
        let models = self.fetch_with_retry().await?;
        tracing::debug!(count = models.len(), "Fetched model catalog");
        Ok(models)
    }
}

fn is_transient_error(error: &CatalogError) -> bool {
    match error {
        CatalogError::RequestFailed(_) => true,
        CatalogError::ApiError { code, .. } => *code >= 500 || *code == 429,
        CatalogError::ParseError(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn catalog(server: &MockServer) -> OpenRouterCatalog {
        OpenRouterCatalog::new("or-test-key")
            .expect("client builds")
            .with_base_url(server.base_url())
            .with_retry_delay(Duration::from_millis(5))
    }

    #[test]
    fn test_is_free() {
        assert!(CandidateModel::new("google/gemma-3-27b-it:free").is_free());
        assert!(CandidateModel::new("vendor/model").with_pricing("0", "0").is_free());
        assert!(!CandidateModel::new("vendor/model").with_pricing("0", "0.000002").is_free());
        assert!(!CandidateModel::new("vendor/model").is_free());
    }

    #[test]
    fn test_parse_catalog_wrapped_and_bare() {
        let wrapped = r#"{"data":[{"id":"a/b:free","name":"A","context_length":131072,"pricing":{"prompt":"0","completion":"0"}}]}"#;
        let models = parse_catalog(wrapped).expect("wrapped parses");
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].context_length, Some(131072));

        let bare = r#"[{"id":"a/b"},{"id":"c/d:free","description":"d"}]"#;
        let models = parse_catalog(bare).expect("bare parses");
        assert_eq!(models.len(), 2);
        assert_eq!(models[1].description, "d");
    }

    #[test]
    fn test_parse_catalog_tolerates_null_fields() {
        let body = r#"{"data":[
            {"id":"a/b:free","name":null,"description":null,"context_length":null,"pricing":{"prompt":null,"completion":null}},
            {"id":"c/d:free","name":"C","pricing":null},
            {"name":"no id"},
            {"id":"e/f","description":"paid","pricing":{"prompt":"0.000001","completion":"0.000002"}}
        ]}"#;

        let models = parse_catalog(body).expect("nulls are tolerated");

        let ids: Vec<_> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a/b:free", "c/d:free", "e/f"]);
        assert!(models[0].name.is_empty());
        assert!(models[0].description.is_empty());
        assert_eq!(models[0].context_length, None);
        assert_eq!(models[0].pricing, Pricing::default());
        assert_eq!(models[1].pricing, Pricing::default());
        assert_eq!(models[2].pricing.completion, "0.000002");
    }

    #[test]
    fn test_parse_catalog_rejects_garbage() {
        assert!(matches!(parse_catalog("not json"), Err(CatalogError::ParseError(_))));

        match parse_catalog(r#"{"data":"oops"}"#) {
            Err(CatalogError::ParseError(msg)) => assert!(msg.contains("`data`"), "{msg}"),
            other => panic!("unexpected result: {other:?}"),
        }
        match parse_catalog(r#"{"models":[]}"#) {
            Err(CatalogError::ParseError(msg)) => assert!(msg.contains("missing"), "{msg}"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_free_models_filters_catalog() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/models")
                .header("Authorization", "Bearer or-test-key")
                .header("X-Title", "fusionn-subs");
            then.status(200).json_body(json!({
                "data": [
                    {"id": "google/gemma-3-27b-it:free", "name": "Gemma 3 27B"},
                    {"id": "openai/gpt-4o", "pricing": {"prompt": "0.0000025", "completion": "0.00001"}},
                    {"id": "deepseek/deepseek-v3", "pricing": {"prompt": "0", "completion": "0"}}
                ]
            }));
        });

        let models = catalog(&server).free_models().await.expect("catalog fetch");

        mock.assert();
        let ids: Vec<_> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["google/gemma-3-27b-it:free", "deepseek/deepseek-v3"]);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET).path("/models");
            then.status(503).body("unavailable");
        });

        let result = catalog(&server).list_models().await;

        mock.assert_calls(3);
        assert!(matches!(result, Err(CatalogError::ApiError { code: 503, .. })));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET).path("/models");
            then.status(401).body("bad key");
        });

        let result = catalog(&server).list_models().await;

        mock.assert_calls(1);
        assert!(matches!(result, Err(CatalogError::ApiError { code: 401, .. })));
    }
}
