//! Automatic translation model selection.
//!
//! [`ModelSelector`] fetches free models from a [`crate::llm::ModelCatalog`],
//! asks an [`Evaluator`] to pick one, and pushes changes to registered
//! callbacks. The active model resolves through three tiers: the latest
//! selection, the last known good selection, and a static fallback.

pub mod evaluator;
pub mod selector;

pub use evaluator::{build_prompt, parse_selection, resolve_selection, Evaluator, GeminiEvaluator};
pub use selector::{should_evaluate, ModelSelector, ModelUpdateCallback, SelectorConfig, DEFAULT_SCHEDULE_HOUR};
