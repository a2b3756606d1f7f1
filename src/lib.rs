//! fusionn-subs: subtitle translation queue worker.
//!
//! Jobs arrive on a Redis list, are translated by an external `llm-subtrans`
//! script, and a downstream service is notified with the result. When the
//! OpenRouter backend is used, the translation model can be re-picked daily
//! from the free models in the OpenRouter catalog.

pub mod callback;
pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod llm;
pub mod selection;
pub mod translator;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use error::{
    CallbackError, CatalogError, ConfigError, EvaluationError, JobError, JobFailure, QueueError,
    SelectionError, TranslateError, WorkerError,
};
pub use job::JobMessage;
