//! Worker configuration.
//!
//! Configuration is read from a YAML file and then overridden by environment
//! variables, so container deployments can inject secrets without touching
//! the file. A missing file is not an error; defaults plus the environment
//! are used instead.
//!
//! ```yaml
//! redis:
//!   url: redis://localhost:6379
//!   queue: translate_queue
//! callback:
//!   url: http://merger:4664/api/v1/async_merge
//! translator:
//!   target_language: Chinese
//!   output_suffix: chs
//! openrouter:
//!   api_key: sk-or-...
//!   auto_select_model: true
//!   fallback_model: google/gemini-2.0-flash-exp:free
//!   evaluator:
//!     schedule_hour: 3
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default config file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

/// Complete worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub callback: CallbackConfig,
    pub translator: TranslatorConfig,
    pub worker: WorkerSettings,
    pub openrouter: OpenRouterConfig,
    pub gemini: GeminiConfig,
}

/// Queue connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub queue: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            queue: "translate_queue".to_string(),
        }
    }
}

/// Downstream completion callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: 15,
            max_retries: 3,
        }
    }
}

/// Settings shared by every translation provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    pub target_language: String,
    pub output_suffix: String,
    pub script_timeout_secs: u64,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            target_language: "Chinese".to_string(),
            output_suffix: "chs".to_string(),
            script_timeout_secs: 15 * 60,
        }
    }
}

/// Queue polling and backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub poll_timeout_secs: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 5,
            initial_backoff_ms: 1000,
            max_backoff_secs: 30,
        }
    }
}

/// OpenRouter translation and automatic model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub model: String,
    pub auto_select_model: bool,
    pub fallback_model: String,
    pub instruction: String,
    pub max_batch_size: u32,
    pub rate_limit: u32,
    pub script_path: String,
    pub work_dir: String,
    pub base_url: String,
    pub evaluator: EvaluatorConfig,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: String::new(),
            auto_select_model: false,
            fallback_model: String::new(),
            instruction: String::new(),
            max_batch_size: 0,
            rate_limit: 0,
            script_path: "/opt/llm-subtrans/llm-subtrans.sh".to_string(),
            work_dir: "/opt/llm-subtrans".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            evaluator: EvaluatorConfig::default(),
        }
    }
}

/// The generative model that ranks candidate translation models.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Key for the evaluation service; falls back to `gemini.api_key`.
    pub gemini_api_key: String,
    pub model: String,
    /// Local hour of day (0-23) for the daily evaluation.
    pub schedule_hour: u32,
    pub base_url: String,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            model: "gemini-3-flash-preview".to_string(),
            schedule_hour: 3,
            base_url: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
        }
    }
}

/// Gemini translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub instruction: String,
    pub max_batch_size: u32,
    pub rate_limit: u32,
    pub script_path: String,
    pub work_dir: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-2.5-flash".to_string(),
            instruction: String::new(),
            max_batch_size: 20,
            rate_limit: 8,
            script_path: "/opt/llm-subtrans/gemini-subtrans.sh".to_string(),
            work_dir: "/opt/llm-subtrans".to_string(),
        }
    }
}

impl Config {
    /// Loads the config file (if present) and applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, an
    /// override has an invalid value, or validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the YAML file, falling back to defaults when it does not exist.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults and environment");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies environment overrides using `lookup` to read variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`, `REDIS_QUEUE`
    /// - `CALLBACK_URL`
    /// - `OPENROUTER_API_KEY`, `OPENROUTER_MODEL`
    /// - `GEMINI_API_KEY`, `GEMINI_MODEL`
    /// - `TARGET_LANGUAGE`, `OUTPUT_SUFFIX`
    /// - `GEMINI_SCRIPT_PATH`, `GEMINI_WORKDIR`
    /// - `LLM_SUBTRANS_SCRIPT_PATH`, `LLM_SUBTRANS_DIR`
    /// - `MODEL_EVAL_HOUR`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string_overrides: [(&str, &mut String); 13] = [
            ("REDIS_URL", &mut self.redis.url),
            ("REDIS_QUEUE", &mut self.redis.queue),
            ("CALLBACK_URL", &mut self.callback.url),
            ("OPENROUTER_API_KEY", &mut self.openrouter.api_key),
            ("OPENROUTER_MODEL", &mut self.openrouter.model),
            ("GEMINI_API_KEY", &mut self.gemini.api_key),
            ("GEMINI_MODEL", &mut self.gemini.model),
            ("TARGET_LANGUAGE", &mut self.translator.target_language),
            ("OUTPUT_SUFFIX", &mut self.translator.output_suffix),
            ("GEMINI_SCRIPT_PATH", &mut self.gemini.script_path),
            ("GEMINI_WORKDIR", &mut self.gemini.work_dir),
            ("LLM_SUBTRANS_SCRIPT_PATH", &mut self.openrouter.script_path),
            ("LLM_SUBTRANS_DIR", &mut self.openrouter.work_dir),
        ];

        for (key, field) in string_overrides {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *field = value;
            }
        }

        if let Some(value) = lookup("MODEL_EVAL_HOUR").filter(|v| !v.is_empty()) {
            self.openrouter.evaluator.schedule_hour =
                value.trim().parse().map_err(|e| ConfigError::InvalidValue {
                    key: "MODEL_EVAL_HOUR".to_string(),
                    message: format!("{e}"),
                })?;
        }

        Ok(())
    }

    /// Validates required settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| -> Result<(), ConfigError> {
            Err(ConfigError::ValidationFailed(msg.to_string()))
        };

        if self.redis.url.is_empty() {
            return fail("redis.url is required");
        }
        if self.redis.queue.is_empty() {
            return fail("redis.queue is required");
        }
        if self.callback.url.is_empty() {
            return fail("callback.url is required");
        }
        if self.openrouter.api_key.is_empty() && self.gemini.api_key.is_empty() {
            return fail("either openrouter.api_key or gemini.api_key is required");
        }
        if self.worker.poll_timeout_secs == 0 {
            return fail("worker.poll_timeout_secs must be greater than 0");
        }
        if self.worker.initial_backoff_ms == 0 {
            return fail("worker.initial_backoff_ms must be greater than 0");
        }
        if self.translator.script_timeout_secs == 0 {
            return fail("translator.script_timeout_secs must be greater than 0");
        }

        if self.auto_select_enabled() {
            if self.openrouter.fallback_model.is_empty() {
                return fail("openrouter.fallback_model is required when auto_select_model is enabled");
            }
            if self.evaluator_api_key().is_empty() {
                return fail(
                    "openrouter.evaluator.gemini_api_key or gemini.api_key is required when auto_select_model is enabled",
                );
            }
        } else if !self.openrouter.api_key.is_empty() && self.openrouter.model.is_empty() {
            return fail("openrouter.model is required when auto_select_model is disabled");
        }

        Ok(())
    }

    /// Whether the model selector should drive the OpenRouter translator.
    pub fn auto_select_enabled(&self) -> bool {
        !self.openrouter.api_key.is_empty() && self.openrouter.auto_select_model
    }

    /// Key for the evaluation service, reusing the Gemini key if unset.
    pub fn evaluator_api_key(&self) -> &str {
        if self.openrouter.evaluator.gemini_api_key.is_empty() {
            &self.gemini.api_key
        } else {
            &self.openrouter.evaluator.gemini_api_key
        }
    }

    /// Effective settings with secrets masked, sorted by key.
    pub fn safe_log_values(&self) -> BTreeMap<&'static str, String> {
        let mut values = BTreeMap::new();
        values.insert("redis.url", self.redis.url.clone());
        values.insert("redis.queue", self.redis.queue.clone());
        values.insert("callback.url", self.callback.url.clone());
        values.insert("callback.timeout_secs", self.callback.timeout_secs.to_string());
        values.insert("callback.max_retries", self.callback.max_retries.to_string());
        values.insert("translator.target_language", self.translator.target_language.clone());
        values.insert("translator.output_suffix", self.translator.output_suffix.clone());
        values.insert(
            "translator.script_timeout_secs",
            self.translator.script_timeout_secs.to_string(),
        );
        values.insert("worker.poll_timeout_secs", self.worker.poll_timeout_secs.to_string());
        values.insert("openrouter.api_key", mask_secret(&self.openrouter.api_key));
        values.insert("openrouter.model", self.openrouter.model.clone());
        values.insert(
            "openrouter.auto_select_model",
            self.openrouter.auto_select_model.to_string(),
        );
        values.insert("openrouter.fallback_model", self.openrouter.fallback_model.clone());
        values.insert("openrouter.script_path", self.openrouter.script_path.clone());
        values.insert(
            "openrouter.evaluator.gemini_api_key",
            mask_secret(&self.openrouter.evaluator.gemini_api_key),
        );
        values.insert("openrouter.evaluator.model", self.openrouter.evaluator.model.clone());
        values.insert(
            "openrouter.evaluator.schedule_hour",
            self.openrouter.evaluator.schedule_hour.to_string(),
        );
        values.insert("gemini.api_key", mask_secret(&self.gemini.api_key));
        values.insert("gemini.model", self.gemini.model.clone());
        values.insert("gemini.script_path", self.gemini.script_path.clone());
        values
    }
}

/// Masks a secret, keeping only the first four characters.
pub fn mask_secret(value: &str) -> String {
    const KEEP: usize = 4;
    let total = value.chars().count();
    if total <= KEEP {
        return "*".repeat(total);
    }
    let head: String = value.chars().take(KEEP).collect();
    format!("{}{}", head, "*".repeat(total - KEEP))
}
