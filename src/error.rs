//! Error types for fusionn-subs operations.
//!
//! Defines the error types shared across subsystems:
//! - Job record validation
//! - Subtitle translation through the external tool
//! - Model catalog and evaluation service calls
//! - Model selection
//! - Downstream callback delivery
//! - Job queue access and the worker loop
//! - Configuration loading

use std::time::Duration;

use thiserror::Error;

/// Errors raised when a dequeued job record is unusable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("message.path is required")]
    MissingPath,
}

/// Errors that can occur while translating a job with the external tool.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("Invalid message: {0}")]
    InvalidJob(#[from] JobError),

    #[error("Failed to start translation script '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Translation script timed out after {0:?}")]
    Timeout(Duration),

    #[error("Translation script exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Translation output not found at '{0}'")]
    OutputMissing(String),

    #[error("Translation script reported failure: {0}")]
    ReportedFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while fetching the model catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to parse model catalog: {0}")]
    ParseError(String),
}

/// Errors that can occur while asking the generative service to rank models.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("No models provided")]
    NoModels,

    #[error("Failed to build evaluation prompt: {0}")]
    Prompt(#[from] tera::Error),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to parse evaluation response: {0}")]
    ParseError(String),

    #[error("Empty response from evaluation service")]
    EmptyResponse,

    #[error("Selected model '{selected}' not found in available models (raw response: {raw:?}, available: {available:?})")]
    UnknownModel {
        selected: String,
        raw: String,
        available: Vec<String>,
    },
}

/// Errors that can occur during one model selection cycle.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("Fetch models: {0}")]
    Catalog(#[from] CatalogError),

    #[error("No free models available")]
    NoFreeModels,

    #[error("Select model: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Fallback model is required")]
    MissingFallback,

    #[error("Model selector is already running")]
    AlreadyRunning,
}

/// Errors that can occur while notifying the downstream service.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("Send callback: {0}")]
    RequestFailed(String),

    #[error("Callback failed: status {status}, body: {body}")]
    Rejected { status: u16, body: String },
}

/// Errors that can occur while talking to the job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Reasons a dequeued job was dropped.
#[derive(Debug, Error)]
pub enum JobFailure {
    #[error("Translate: {0}")]
    Translate(#[from] TranslateError),

    #[error("Callback: {0}")]
    Notify(#[from] CallbackError),
}

/// Terminal results of the worker loop.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker cancelled")]
    Cancelled,

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_error_display() {
        let err = TranslateError::NonZeroExit {
            code: 2,
            stderr: "boom".to_string(),
        };
        assert!(err.to_string().contains("code 2"));
        assert!(err.to_string().contains("boom"));

        let err = TranslateError::Timeout(Duration::from_secs(900));
        assert!(err.to_string().contains("900"));

        let err = TranslateError::from(JobError::MissingPath);
        assert!(err.to_string().contains("message.path is required"));
    }

    #[test]
    fn test_unknown_model_error_lists_candidates() {
        let err = EvaluationError::UnknownModel {
            selected: "nope".to_string(),
            raw: "nope, sorry".to_string(),
            available: vec!["a/b:free".to_string(), "c/d:free".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("nope, sorry"));
        assert!(text.contains("a/b:free"));
        assert!(text.contains("c/d:free"));
    }

    #[test]
    fn test_selection_error_wraps_sources() {
        let err = SelectionError::from(CatalogError::ApiError {
            code: 503,
            message: "unavailable".to_string(),
        });
        assert!(err.to_string().starts_with("Fetch models"));

        let err = SelectionError::from(EvaluationError::EmptyResponse);
        assert!(err.to_string().starts_with("Select model"));
    }
}
