//! Gemini translator using `gemini-subtrans.sh`.

use async_trait::async_trait;
use tracing::{debug, info};

use super::process::execute_translation;
use super::{ScriptSettings, Translator};
use crate::config::Config;
use crate::error::TranslateError;
use crate::job::JobMessage;

/// Environment variable the Gemini script reads its key from.
pub const GEMINI_KEY_ENV: &str = "GEMINI_API_KEY";

/// Translator bound to a single Gemini model.
pub struct GeminiTranslator {
    settings: ScriptSettings,
    api_key: String,
    model: String,
}

impl GeminiTranslator {
    /// Creates a translator for the given script settings and model.
    pub fn new(settings: ScriptSettings, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            settings,
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Creates a translator from the `gemini` and `translator` config sections.
    pub fn from_config(config: &Config) -> Self {
        let gemini = &config.gemini;
        let settings = ScriptSettings::from_parts(
            &config.translator,
            &gemini.script_path,
            &gemini.work_dir,
            &gemini.instruction,
            gemini.max_batch_size,
            gemini.rate_limit,
        );
        Self::new(settings, gemini.api_key.clone(), gemini.model.clone())
    }

    /// The configured model; empty means the script default.
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Translator for GeminiTranslator {
    async fn translate(&self, job: &JobMessage) -> Result<String, TranslateError> {
        job.validate()?;

        let output_path = job.output_path(&self.settings.output_suffix);
        let model_flag = (!self.model.is_empty()).then(|| ("-m", self.model.as_str()));
        let args = self.settings.build_args(job, &output_path, model_flag);
        let invocation = self
            .settings
            .invocation(args)
            .with_env(GEMINI_KEY_ENV, &self.api_key);

        info!(
            input = %job.path,
            output = %output_path,
            model = %self.model,
            "Starting translation (Gemini)"
        );
        debug!(command = %invocation.command_line(), "Translation command");

        execute_translation(&invocation, &output_path).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::translator::{write_fake_tool, SCRIPT_LOCK};

    #[tokio::test]
    async fn test_translate_passes_key_through_env_only() {
        let _guard = SCRIPT_LOCK.lock().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = write_fake_tool(dir.path(), GEMINI_KEY_ENV);
        let input = dir.path().join("movie.eng.srt");
        std::fs::write(&input, "1\n00:00:01,000 --> 00:00:02,000\nHello\n").expect("write input");

        let mut settings = ScriptSettings::new(&tool);
        settings.working_dir = Some(dir.path().to_path_buf());
        let translator = GeminiTranslator::new(settings, "gm-secret-key", "gemini-2.5-flash");

        let job = JobMessage::new(input.to_string_lossy());
        let output = translator.translate(&job).await.expect("translation succeeds");

        let expected = dir.path().join("movie.chs.srt");
        assert_eq!(output, expected.to_string_lossy());
        assert!(expected.exists());

        let args = std::fs::read_to_string(dir.path().join("args.txt")).expect("args recorded");
        assert!(!args.contains("gm-secret-key"));
        assert!(args.contains("-m\ngemini-2.5-flash\n"));

        let key = std::fs::read_to_string(dir.path().join("key.txt")).expect("key recorded");
        assert_eq!(key, "gm-secret-key");
    }

    #[tokio::test]
    async fn test_translate_rejects_empty_path_without_spawning() {
        let translator = GeminiTranslator::new(
            ScriptSettings::new("/nonexistent/gemini-subtrans.sh"),
            "key",
            "",
        );

        let result = translator.translate(&JobMessage::new("")).await;

        assert!(matches!(result, Err(TranslateError::InvalidJob(_))));
    }
}
