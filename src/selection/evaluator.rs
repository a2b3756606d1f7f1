//! Ranking candidate models with a generative model.

use async_trait::async_trait;
use serde::Serialize;
use tera::{Context, Tera};
use tracing::{debug, info, warn};

use crate::error::EvaluationError;
use crate::llm::{CandidateModel, GeminiClient, GenerateRequest};

/// Picks the best translation model from a list of candidates.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Returns the id of the chosen model, which is always one of `models`.
    async fn select_best_model(&self, models: &[CandidateModel]) -> Result<String, EvaluationError>;
}

fn system_instruction(target_language: &str) -> String {
    format!(
        "You are an AI model evaluation expert specializing in language translation systems. \
Your task is to select the BEST model for English to {target_language} subtitle translation. \
Use deep reasoning and research capabilities to make an informed decision."
    )
}

const EVALUATION_TEMPLATE: &str = r#"Select the single best model for translating English subtitles (SRT) into {{ target_language }}.

Evaluate every candidate against these criteria, in order of importance:
1. Translation quality from English into {{ target_language }}: natural, idiomatic phrasing suitable for subtitles.
2. Instruction following: keeps the numbered subtitle structure intact and never merges, drops or invents lines.
3. Reliability: stable availability on the free tier and a context window large enough for batches of subtitle lines.
4. Exclude models specialized for code generation, embeddings, vision-only or safety classification.

Prefer larger, recent general-purpose chat models. Use search to check recent evaluations when unsure.

Candidates ({{ models | length }}):
{% for model in models %}
- id: {{ model.id }}
  name: {{ model.name }}
  context_length: {% if model.context_length %}{{ model.context_length }}{% else %}unknown{% endif %}
  description: {{ model.description | truncate(length=300) }}
{% endfor %}

Respond with ONLY the exact model id from the list above. No explanation, no formatting."#;

#[derive(Serialize)]
struct PromptModel<'a> {
    id: &'a str,
    name: &'a str,
    context_length: Option<u64>,
    description: String,
}

/// Renders the evaluation prompt listing every candidate.
pub fn build_prompt(models: &[CandidateModel], target_language: &str) -> Result<String, EvaluationError> {
    let prompt_models: Vec<PromptModel<'_>> = models
        .iter()
        .map(|m| PromptModel {
            id: &m.id,
            name: &m.name,
            context_length: m.context_length,
            description: m.description.split_whitespace().collect::<Vec<_>>().join(" "),
        })
        .collect();

    let mut context = Context::new();
    context.insert("models", &prompt_models);
    context.insert("target_language", target_language);

    Ok(Tera::one_off(EVALUATION_TEMPLATE, &context, false)?)
}

/// Reduces a free-form answer to a bare model id.
///
/// Keeps the first line, then the first whitespace-free word.
pub fn parse_selection(raw: &str) -> &str {
    let mut selected = raw.trim();
    if let Some(idx) = selected.find('\n') {
        selected = &selected[..idx];
    }
    if let Some(idx) = selected.find(' ') {
        selected = &selected[..idx];
    }
    selected.trim()
}

/// Matches a parsed selection against the candidates.
///
/// An exact id wins. Otherwise the first candidate whose id contains the
/// selection, or is contained in it, is used.
pub fn resolve_selection(raw: &str, models: &[CandidateModel]) -> Result<String, EvaluationError> {
    let selected = parse_selection(raw);

    if let Some(model) = models.iter().find(|m| m.id == selected) {
        return Ok(model.id.clone());
    }

    if !selected.is_empty() {
        let suggestions: Vec<&str> = models
            .iter()
            .map(|m| m.id.as_str())
            .filter(|id| id.contains(selected) || selected.contains(id))
            .collect();

        if let Some(first) = suggestions.first() {
            warn!(
                selected = %selected,
                candidates = ?suggestions,
                using = %first,
                "Evaluator returned an unknown model id, using closest match"
            );
            return Ok((*first).to_string());
        }
    }

    Err(EvaluationError::UnknownModel {
        selected: selected.to_string(),
        raw: raw.to_string(),
        available: models.iter().map(|m| m.id.clone()).collect(),
    })
}

/// Evaluator backed by Gemini with search grounding.
pub struct GeminiEvaluator {
    client: GeminiClient,
    target_language: String,
}

impl GeminiEvaluator {
    pub fn new(client: GeminiClient) -> Self {
        Self {
            client,
            target_language: "Chinese".to_string(),
        }
    }

    /// Sets the language the candidates are judged on.
    pub fn with_target_language(mut self, language: impl Into<String>) -> Self {
        self.target_language = language.into();
        self
    }
}

#[async_trait]
impl Evaluator for GeminiEvaluator {
    async fn select_best_model(&self, models: &[CandidateModel]) -> Result<String, EvaluationError> {
        if models.is_empty() {
            return Err(EvaluationError::NoModels);
        }

        let prompt = build_prompt(models, &self.target_language)?;
        let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        info!(count = models.len(), evaluator = %self.client.model(), "Evaluating models");
        debug!(models = ?ids, "Models to evaluate");
        debug!(prompt = %prompt, "Evaluation prompt");

        let request = GenerateRequest::new(prompt)
            .with_system_instruction(system_instruction(&self.target_language))
            .with_temperature(0.1)
            .with_search_grounding();

        let raw = self.client.generate(&request).await?;
        info!(raw = ?raw, "Evaluator response");

        let selected = resolve_selection(&raw, models)?;
        info!(model = %selected, "Selected model");
        Ok(selected)
    }
}
