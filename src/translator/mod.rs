//! Subtitle translation through the external `llm-subtrans` scripts.
//!
//! Two provider conventions are supported:
//!
//! - **Gemini** ([`GeminiTranslator`]): the model is fixed at construction.
//! - **OpenRouter** ([`OpenRouterTranslator`]): the model can be swapped at
//!   runtime by the model selector.
//!
//! The variant is chosen once at startup by [`TranslationProvider::from_config`];
//! an OpenRouter key takes priority over a Gemini key.
//!
//! # Example
//!
//! ```rust,ignore
//! use fusionn_subs::translator::{TranslationProvider, Translator};
//!
//! let provider = TranslationProvider::from_config(&config)?;
//! let output = provider.translate(&job).await?;
//! ```

pub mod failure;
pub mod gemini;
pub mod openrouter;
pub mod process;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Config, TranslatorConfig};
use crate::error::{ConfigError, TranslateError};
use crate::job::JobMessage;

pub use failure::{classify_output, ScriptOutcome, FAILURE_INDICATORS};
pub use gemini::GeminiTranslator;
pub use openrouter::OpenRouterTranslator;
pub use process::{execute_translation, run_script, ScriptInvocation, ScriptOutput};

/// Something that can turn a job into a translated subtitle file.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translates the job's subtitle and returns the output path.
    async fn translate(&self, job: &JobMessage) -> Result<String, TranslateError>;
}

/// Settings shared by both script conventions.
#[derive(Debug, Clone)]
pub struct ScriptSettings {
    /// Path of the translation script.
    pub script_path: PathBuf,
    /// Working directory for the script.
    pub working_dir: Option<PathBuf>,
    /// Language to translate into (e.g. "Chinese").
    pub target_language: String,
    /// Suffix used to derive the output path.
    pub output_suffix: String,
    /// Extra instruction text for the translating model.
    pub instruction: String,
    /// Maximum number of lines per batch, 0 for the script default.
    pub max_batch_size: u32,
    /// Requests per minute, 0 for the script default.
    pub rate_limit: u32,
    /// Hard limit for one script run.
    pub timeout: Duration,
}

impl ScriptSettings {
    /// Creates settings for the given script with default limits.
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            working_dir: None,
            target_language: "Chinese".to_string(),
            output_suffix: "chs".to_string(),
            instruction: String::new(),
            max_batch_size: 0,
            rate_limit: 0,
            timeout: Duration::from_secs(15 * 60),
        }
    }

    pub(crate) fn from_parts(
        translator: &TranslatorConfig,
        script_path: &str,
        work_dir: &str,
        instruction: &str,
        max_batch_size: u32,
        rate_limit: u32,
    ) -> Self {
        Self {
            script_path: PathBuf::from(script_path),
            working_dir: (!work_dir.is_empty()).then(|| PathBuf::from(work_dir)),
            target_language: translator.target_language.clone(),
            output_suffix: translator.output_suffix.clone(),
            instruction: instruction.to_string(),
            max_batch_size,
            rate_limit,
            timeout: Duration::from_secs(translator.script_timeout_secs),
        }
    }

    /// Builds the script arguments for one job.
    ///
    /// The credential is deliberately absent; it travels in the environment.
    pub(crate) fn build_args(
        &self,
        job: &JobMessage,
        output_path: &str,
        model_flag: Option<(&str, &str)>,
    ) -> Vec<String> {
        let mut args = vec![
            job.path.clone(),
            "-o".to_string(),
            output_path.to_string(),
            "-l".to_string(),
            self.target_language.clone(),
        ];

        if let Some((flag, model)) = model_flag {
            args.push(flag.to_string());
            args.push(model.to_string());
        }

        let overview = job.overview.trim();
        if !overview.is_empty() {
            args.push("-d".to_string());
            args.push(overview.to_string());
        }

        if !self.instruction.is_empty() {
            args.push("--instruction".to_string());
            args.push(self.instruction.clone());
        }

        if self.rate_limit > 0 {
            args.push("--ratelimit".to_string());
            args.push(self.rate_limit.to_string());
        }

        if self.max_batch_size > 0 {
            args.push("--maxbatchsize".to_string());
            args.push(self.max_batch_size.to_string());
        }

        args
    }

    pub(crate) fn invocation(&self, args: Vec<String>) -> ScriptInvocation {
        let mut invocation = ScriptInvocation::new(&self.script_path)
            .with_args(args)
            .with_timeout(self.timeout);
        if let Some(dir) = &self.working_dir {
            invocation = invocation.with_working_dir(dir);
        }
        invocation
    }
}

/// The translation backend chosen at startup.
pub enum TranslationProvider {
    /// Gemini script with a fixed model.
    Fixed(GeminiTranslator),
    /// OpenRouter script whose model the selector can change.
    Retargetable(Arc<OpenRouterTranslator>),
}

impl TranslationProvider {
    /// Picks the provider from whichever credential is configured.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if neither credential is set.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        if !config.openrouter.api_key.is_empty() {
            return Ok(Self::Retargetable(Arc::new(
                OpenRouterTranslator::from_config(config),
            )));
        }

        if !config.gemini.api_key.is_empty() {
            return Ok(Self::Fixed(GeminiTranslator::from_config(config)));
        }

        Err(ConfigError::ValidationFailed(
            "no translator configured: either openrouter.api_key or gemini.api_key required"
                .to_string(),
        ))
    }

    /// Short provider name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fixed(_) => "gemini",
            Self::Retargetable(_) => "openrouter",
        }
    }

    /// Model the next translation will use.
    pub fn current_model(&self) -> String {
        match self {
            Self::Fixed(translator) => translator.model().to_string(),
            Self::Retargetable(translator) => translator.model(),
        }
    }

    /// The retargetable translator, if that variant was chosen.
    pub fn retargetable(&self) -> Option<Arc<OpenRouterTranslator>> {
        match self {
            Self::Fixed(_) => None,
            Self::Retargetable(translator) => Some(Arc::clone(translator)),
        }
    }
}

#[async_trait]
impl Translator for TranslationProvider {
    async fn translate(&self, job: &JobMessage) -> Result<String, TranslateError> {
        match self {
            Self::Fixed(translator) => translator.translate(job).await,
            Self::Retargetable(translator) => translator.translate(job).await,
        }
    }
}

/// Serializes tests that spawn processes.
///
/// Writing a script and exec'ing it while another thread forks can fail with
/// ETXTBSY, so every spawning test holds this lock.
#[cfg(test)]
pub(crate) static SCRIPT_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Writes a fake translation tool into `dir`.
///
/// The tool records its arguments in `args.txt`, the credential it received
/// through the environment in `key.txt`, and writes the file named by `-o`.
#[cfg(all(test, unix))]
pub(crate) fn write_fake_tool(dir: &std::path::Path, key_var: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = format!(
        r#"#!/bin/sh
dir=$(dirname "$0")
printf '%s\n' "$@" > "$dir/args.txt"
printf '%s' "${key_var}" > "$dir/key.txt"
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
echo "translated" > "$out"
echo "Translation complete"
"#
    );

    let path = dir.join("fake-subtrans.sh");
    std::fs::write(&path, script).expect("write fake tool");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fake tool");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ScriptSettings {
        ScriptSettings::new("/opt/llm-subtrans/llm-subtrans.sh")
    }

    #[test]
    fn test_build_args_minimal() {
        let job = JobMessage::new("/m/a.eng.srt");
        let args = settings().build_args(&job, "/m/a.chs.srt", None);
        assert_eq!(args, vec!["/m/a.eng.srt", "-o", "/m/a.chs.srt", "-l", "Chinese"]);
    }

    #[test]
    fn test_build_args_all_options() {
        let mut settings = settings();
        settings.instruction = "Keep names in English".to_string();
        settings.rate_limit = 8;
        settings.max_batch_size = 20;
        let job = JobMessage::new("/m/a.eng.srt").with_overview("  A heist movie  ");

        let args = settings.build_args(&job, "/m/a.chs.srt", Some(("--model", "x/y:free")));

        assert_eq!(
            args,
            vec![
                "/m/a.eng.srt",
                "-o",
                "/m/a.chs.srt",
                "-l",
                "Chinese",
                "--model",
                "x/y:free",
                "-d",
                "A heist movie",
                "--instruction",
                "Keep names in English",
                "--ratelimit",
                "8",
                "--maxbatchsize",
                "20",
            ]
        );
    }

    #[test]
    fn test_build_args_skips_blank_overview() {
        let job = JobMessage::new("a.srt").with_overview("   ");
        let args = settings().build_args(&job, "a.chs.srt", None);
        assert!(!args.contains(&"-d".to_string()));
    }

    #[test]
    fn test_provider_prefers_openrouter() {
        let mut config = Config::default();
        config.openrouter.api_key = "or-key".to_string();
        config.gemini.api_key = "gm-key".to_string();

        let provider = TranslationProvider::from_config(&config).expect("provider");
        assert_eq!(provider.name(), "openrouter");
        assert!(provider.retargetable().is_some());
    }

    #[test]
    fn test_provider_falls_back_to_gemini() {
        let mut config = Config::default();
        config.gemini.api_key = "gm-key".to_string();

        let provider = TranslationProvider::from_config(&config).expect("provider");
        assert_eq!(provider.name(), "gemini");
        assert!(provider.retargetable().is_none());
        assert_eq!(provider.current_model(), config.gemini.model);
    }

    #[test]
    fn test_provider_requires_a_credential() {
        let result = TranslationProvider::from_config(&Config::default());
        assert!(matches!(result, Err(ConfigError::ValidationFailed(_))));
    }
}
