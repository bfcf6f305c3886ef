//! Text-generation backends.
//!
//! The gateway only sees [`GenerationEngine`]: a blocking call that turns a
//! prompt into a [`GenerationResult`]. Which implementation is used is decided
//! once at startup by [`build_engine`].

mod mock;
#[cfg(feature = "tch-backend")]
mod torch;

use std::sync::Arc;

use thiserror::Error;

use crate::config::AppConfig;

pub use mock::{MOCK_RESPONSE, MockEngine};
#[cfg(feature = "tch-backend")]
pub use torch::TorchEngine;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine output does not start with the prompt")]
    PromptMismatch,
    #[error("{0}")]
    Backend(String),
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("generation task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
}

/// Decoded engine output.
///
/// Engines must return the prompt followed by the continuation. The
/// constructor rejects anything else, so `generated_segment` never mis-slices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    full_text: String,
    prompt_len: usize,
}

impl GenerationResult {
    pub fn new(prompt: &str, full_text: String) -> Result<Self, EngineError> {
        if !full_text.starts_with(prompt) {
            return Err(EngineError::PromptMismatch);
        }
        Ok(Self {
            full_text,
            prompt_len: prompt.len(),
        })
    }

    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    pub fn generated_segment(&self) -> &str {
        &self.full_text[self.prompt_len..]
    }
}

pub trait GenerationEngine: Send + Sync {
    /// Runs one generation to completion. May block for a long time.
    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationResult, EngineError>;

    fn is_mock(&self) -> bool {
        false
    }
}

pub fn build_engine(config: &AppConfig) -> Result<Arc<dyn GenerationEngine>, EngineError> {
    if config.use_mock {
        return Ok(Arc::new(MockEngine::new()));
    }

    #[cfg(feature = "tch-backend")]
    {
        Ok(Arc::new(TorchEngine::load(config)?))
    }

    #[cfg(not(feature = "tch-backend"))]
    {
        Err(EngineError::Unavailable(
            "built without a model backend; enable the `tch-backend` feature or set USE_MOCK_GENERATION=1"
                .into(),
        ))
    }
}
