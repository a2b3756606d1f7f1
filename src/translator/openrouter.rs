//! OpenRouter translator using `llm-subtrans.sh`.
//!
//! The active model sits behind a read/write lock. The model selector swaps
//! it through [`OpenRouterTranslator::update_model`] while translations run;
//! each translation reads one consistent snapshot before spawning the script.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use super::process::execute_translation;
use super::{ScriptSettings, Translator};
use crate::config::Config;
use crate::error::TranslateError;
use crate::job::JobMessage;

/// Environment variable the OpenRouter script reads its key from.
pub const OPENROUTER_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// Requests per minute used when none is configured.
const DEFAULT_RATE_LIMIT: u32 = 10;

/// Translator whose model can be changed at runtime.
pub struct OpenRouterTranslator {
    settings: ScriptSettings,
    api_key: String,
    model: RwLock<String>,
}

impl OpenRouterTranslator {
    /// Creates a translator. A zero rate limit becomes 10 requests per minute.
    pub fn new(
        mut settings: ScriptSettings,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        if settings.rate_limit == 0 {
            settings.rate_limit = DEFAULT_RATE_LIMIT;
        }
        Self {
            settings,
            api_key: api_key.into(),
            model: RwLock::new(model.into()),
        }
    }

    /// Creates a translator from the `openrouter` and `translator` config sections.
    pub fn from_config(config: &Config) -> Self {
        let openrouter = &config.openrouter;
        let settings = ScriptSettings::from_parts(
            &config.translator,
            &openrouter.script_path,
            &openrouter.work_dir,
            &openrouter.instruction,
            openrouter.max_batch_size,
            openrouter.rate_limit,
        );
        Self::new(settings, openrouter.api_key.clone(), openrouter.model.clone())
    }

    /// Replaces the model used by subsequent translations.
    pub fn update_model(&self, new_model: &str) {
        let old_model = {
            let mut model = self.model.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *model, new_model.to_string())
        };

        if old_model != new_model {
            info!(from = %old_model, to = %new_model, "Translator model updated");
        }
    }

    /// Snapshot of the current model.
    pub fn model(&self) -> String {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Effective requests-per-minute limit.
    pub fn rate_limit(&self) -> u32 {
        self.settings.rate_limit
    }
}

#[async_trait]
impl Translator for OpenRouterTranslator {
    async fn translate(&self, job: &JobMessage) -> Result<String, TranslateError> {
        job.validate()?;

        let output_path = job.output_path(&self.settings.output_suffix);
        let current_model = self.model();
        let args = self
            .settings
            .build_args(job, &output_path, Some(("--model", current_model.as_str())));
        let invocation = self
            .settings
            .invocation(args)
            .with_env(OPENROUTER_KEY_ENV, &self.api_key);

        info!(
            input = %job.path,
            output = %output_path,
            model = %current_model,
            "Starting translation (OpenRouter)"
        );
        debug!(command = %invocation.command_line(), "Translation command");

        execute_translation(&invocation, &output_path).await
    }
}
