use std::path::Path;

use parking_lot::Mutex;
use tch::{Device, IValue, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;
use tracing::info;

use super::{EngineError, GenerationEngine, GenerationParams, GenerationResult};
use crate::config::AppConfig;

const END_OF_TEXT: &str = "<|endoftext|>";

/// TorchScript causal LM driven token by token on the configured device.
///
/// A single module instance serves all requests; calls are serialized by the
/// module mutex.
pub struct TorchEngine {
    tokenizer: Tokenizer,
    module: Mutex<tch::CModule>,
    device: Device,
    eos_token: Option<i64>,
}

impl TorchEngine {
    pub fn load(config: &AppConfig) -> Result<Self, EngineError> {
        info!(
            model_id = %config.model_id,
            module = %config.module_path.display(),
            "loading model"
        );
        let tokenizer = Tokenizer::from_file(config.tokenizer_path.as_path())
            .map_err(|e| EngineError::Unavailable(format!("tokenizer: {e}")))?;
        let module = load_module(&config.module_path, config.device)?;
        let eos_token = tokenizer.token_to_id(END_OF_TEXT).map(i64::from);

        Ok(Self {
            tokenizer,
            module: Mutex::new(module),
            device: config.device,
            eos_token,
        })
    }

    fn next_token(
        &self,
        module: &tch::CModule,
        ids: &[i64],
        temperature: f64,
    ) -> Result<i64, EngineError> {
        let input = Tensor::from_slice(ids)
            .reshape([1, ids.len() as i64])
            .to(self.device);
        let output = module
            .forward_is(&[IValue::Tensor(input)])
            .map_err(|e| EngineError::Backend(e.to_string()))?;

        // traced models return either bare logits or (logits, past)
        let logits = match output {
            IValue::Tensor(t) => t,
            IValue::Tuple(ref items) => match items.first() {
                Some(IValue::Tensor(t)) => t.shallow_clone(),
                _ => return Err(EngineError::Backend("expected logits tensor".into())),
            },
            _ => return Err(EngineError::Backend("unexpected model output".into())),
        };

        let last = logits.select(1, -1).squeeze();
        let token = if temperature <= 0.0 {
            last.argmax(0, false).int64_value(&[])
        } else {
            (&last / temperature)
                .softmax(-1, Kind::Float)
                .multinomial(1, false)
                .int64_value(&[0])
        };
        Ok(token)
    }
}

fn load_module(path: &Path, device: Device) -> Result<tch::CModule, EngineError> {
    if !path.exists() {
        return Err(EngineError::Unavailable(format!(
            "model artifact missing: {}",
            path.display()
        )));
    }
    let mut module = tch::CModule::load_on_device(path, device)
        .map_err(|e| EngineError::Unavailable(e.to_string()))?;
    module.set_eval();
    Ok(module)
}

/// Sampled ids back into tokenizer ids; anything outside `u32` means the
/// model and tokenizer disagree.
fn vocab_ids(ids: &[i64]) -> Result<Vec<u32>, EngineError> {
    ids.iter()
        .map(|&id| {
            u32::try_from(id)
                .map_err(|_| EngineError::Backend(format!("token id {id} outside the vocabulary")))
        })
        .collect()
}

impl GenerationEngine for TorchEngine {
    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationResult, EngineError> {
        let encoding = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| EngineError::Backend(format!("tokenizer: {e}")))?;
        let mut ids: Vec<i64> = encoding.get_ids().iter().map(|&id| i64::from(id)).collect();
        if ids.is_empty() {
            return Err(EngineError::Backend("prompt produced no tokens".into()));
        }

        no_grad(|| {
            let module = self.module.lock();
            for _ in 0..params.max_new_tokens {
                let token = self.next_token(&module, &ids, params.temperature)?;
                if Some(token) == self.eos_token {
                    break;
                }
                ids.push(token);
            }
            Ok::<(), EngineError>(())
        })?;

        let ids = vocab_ids(&ids)?;
        let full_text = self
            .tokenizer
            .decode(&ids, true)
            .map_err(|e| EngineError::Backend(format!("tokenizer: {e}")))?;

        GenerationResult::new(prompt, full_text)
    }
}
