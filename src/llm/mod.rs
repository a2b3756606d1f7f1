//! Remote model services used by automatic model selection.
//!
//! - [`catalog`]: the OpenRouter model catalog and free-model filtering.
//! - [`gemini`]: the Gemini `generateContent` endpoint used to rank candidates.
//!
//! ```ignore
//! use fusionn_subs::llm::{ModelCatalog, OpenRouterCatalog};
//!
//! let catalog = OpenRouterCatalog::new(api_key)?;
//! let free = catalog.free_models().await?;
//! ```

pub mod catalog;
pub mod gemini;

pub use catalog::{parse_catalog, CandidateModel, ModelCatalog, OpenRouterCatalog, Pricing};
pub use gemini::{GeminiClient, GenerateRequest, DEFAULT_EVALUATOR_MODEL};
