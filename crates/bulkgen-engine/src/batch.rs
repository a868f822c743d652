use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bulkgen_contracts::batch::BatchState;
use bulkgen_contracts::images::{AspectRatio, GeneratedImage, GenerationRequest};
use bulkgen_contracts::prompts::Prompt;
use thiserror::Error;

use crate::error::BatchError;
use crate::error_chain_text;
use crate::providers::ImageProvider;

/// Inputs for one run: every prompt is generated `count_per_prompt` times.
#[derive(Clone)]
pub struct BatchSpec {
    pub prompts: Vec<Prompt>,
    pub count_per_prompt: u32,
    pub aspect_ratio: AspectRatio,
    pub credential: String,
    pub model: String,
}

impl BatchSpec {
    pub fn total_units(&self) -> u64 {
        self.prompts.len() as u64 * u64::from(self.count_per_prompt)
    }

    /// Units in issuance order: prompt-major, repetition-minor.
    pub fn units(&self) -> impl Iterator<Item = &Prompt> + '_ {
        self.prompts
            .iter()
            .flat_map(move |prompt| (0..self.count_per_prompt).map(move |_| prompt))
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        if self.credential.trim().is_empty() {
            return Err(BatchError::MissingCredential);
        }
        if self.prompts.is_empty() {
            return Err(BatchError::InvalidBatch("no prompts loaded".to_string()));
        }
        if self.count_per_prompt == 0 {
            return Err(BatchError::InvalidBatch(
                "images per prompt must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for BatchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSpec")
            .field("prompts", &self.prompts.len())
            .field("count_per_prompt", &self.count_per_prompt)
            .field("aspect_ratio", &self.aspect_ratio)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Shared flag checked between units; setting it stops the run before the
/// next provider call.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A run that stopped early. `state` holds every result produced before the
/// failure, with `state.error` set.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct BatchAborted {
    pub source: BatchError,
    pub state: BatchState,
}

impl BatchAborted {
    pub(crate) fn new(source: BatchError, state: BatchState) -> Self {
        let state = state.with_error(source.to_string());
        Self { source, state }
    }
}

pub struct BatchOrchestrator<'a> {
    provider: &'a dyn ImageProvider,
    cancel: Option<CancelFlag>,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(provider: &'a dyn ImageProvider) -> Self {
        Self {
            provider,
            cancel: None,
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Runs every unit strictly one after another.
    ///
    /// `observer` sees a fresh snapshot after each completed unit, before the
    /// next provider call is issued. Invalid input fails before any call and
    /// without any observation.
    pub fn run(
        &self,
        spec: &BatchSpec,
        observer: &mut dyn FnMut(&BatchState),
    ) -> Result<BatchState, BatchAborted> {
        let total = spec.total_units();
        let mut state = BatchState::new(total);
        if let Err(err) = spec.validate() {
            return Err(BatchAborted::new(err, state));
        }

        tracing::info!(
            provider = self.provider.name(),
            model = %spec.model,
            total_units = total,
            "starting batch"
        );

        for (unit_index, prompt) in spec.units().enumerate() {
            let unit_index = unit_index as u64;
            if self
                .cancel
                .as_ref()
                .map(CancelFlag::is_cancelled)
                .unwrap_or(false)
            {
                tracing::info!(completed = state.completed, total, "batch cancelled");
                let err = BatchError::Cancelled {
                    completed: state.completed,
                    total,
                };
                return Err(BatchAborted::new(err, state));
            }

            let request = GenerationRequest {
                prompt: prompt.clone(),
                aspect_ratio: spec.aspect_ratio,
                credential: spec.credential.clone(),
                model: spec.model.clone(),
                unit_index,
            };
            let reference = match self.provider.generate(&request) {
                Ok(reference) => reference,
                Err(err) => {
                    let message = error_chain_text(&err, 2048);
                    tracing::warn!(
                        unit = unit_index + 1,
                        total,
                        error = %message,
                        "generation failed; aborting batch"
                    );
                    let err = BatchError::Generation {
                        unit: unit_index + 1,
                        total,
                        prompt: prompt.to_string(),
                        message,
                        source: err.into(),
                    };
                    return Err(BatchAborted::new(err, state));
                }
            };

            state = state.with_result(GeneratedImage::new(prompt.clone(), reference));
            tracing::debug!(completed = state.completed, total, "unit completed");
            observer(&state);
        }

        tracing::info!(total_units = total, "batch complete");
        Ok(state)
    }
}
