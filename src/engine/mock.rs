use super::{EngineError, GenerationEngine, GenerationParams, GenerationResult};

pub const MOCK_RESPONSE: &str = "This is a mock response.";

/// Returns a canned continuation immediately, for tests and demos.
#[derive(Debug, Clone)]
pub struct MockEngine {
    response: String,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::with_response(MOCK_RESPONSE)
    }

    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationEngine for MockEngine {
    fn generate(
        &self,
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<GenerationResult, EngineError> {
        GenerationResult::new(prompt, format!("{prompt}{}", self.response))
    }

    fn is_mock(&self) -> bool {
        true
    }
}
