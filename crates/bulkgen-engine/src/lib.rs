use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use bulkgen_contracts::batch::{ArchiveRef, BatchState};
use bulkgen_contracts::events::{EventPayload, EventWriter, RunEvent};
use bulkgen_contracts::models::ModelSelector;
use bulkgen_contracts::runs::summary::{write_summary, RunSummary};
use serde_json::{json, Map, Value};

pub mod archive;
pub mod batch;
pub mod error;
pub mod fetch;
pub mod providers;

pub use archive::{archive_entry_name, build_archive, Archive, ARCHIVE_FILE_NAME};
pub use batch::{BatchAborted, BatchOrchestrator, BatchSpec, CancelFlag};
pub use error::{ArchiveError, BatchError};
pub use fetch::{HttpImageFetcher, ImageFetcher};
pub use providers::{default_provider_registry, ImageProvider, ImageProviderRegistry};

#[derive(Debug, Clone)]
pub struct PlanPreview {
    pub prompts: u64,
    pub count_per_prompt: u32,
    pub total_units: u64,
    pub model: String,
    pub provider: String,
    pub fallback_reason: Option<String>,
}

/// One output directory's worth of runs: owns the providers, the fetcher and
/// the run log, and turns a finished batch into `generated_images.zip`.
pub struct BulkEngine {
    out_dir: PathBuf,
    events: EventWriter,
    summary_path: PathBuf,
    model_selector: ModelSelector,
    providers: ImageProviderRegistry,
    fetcher: Box<dyn ImageFetcher>,
    cancel: Mutex<CancelFlag>,
}

impl BulkEngine {
    pub fn new(
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        Self::with_components(
            out_dir,
            events_path,
            default_provider_registry(),
            Box::new(HttpImageFetcher::new()),
        )
    }

    pub fn with_components(
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        providers: ImageProviderRegistry,
        fetcher: Box<dyn ImageFetcher>,
    ) -> anyhow::Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)?;
        let run_id = out_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("bulkgen-run")
            .to_string();
        let events = EventWriter::new(events_path.into(), run_id);
        let summary_path = out_dir.join("summary.json");

        Ok(Self {
            out_dir,
            events,
            summary_path,
            model_selector: ModelSelector::new(None),
            providers,
            fetcher,
            cancel: Mutex::new(CancelFlag::new()),
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn run_id(&self) -> &str {
        self.events.run_id()
    }

    /// Handle that stops the current (or next) run before its next unit.
    /// Each finished run retires its flag, so a cancelled run never leaks
    /// into the one after it.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn retire_cancel_flag(&self) {
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = CancelFlag::new();
    }

    pub fn preview_plan(&self, spec: &BatchSpec) -> Result<PlanPreview, BatchError> {
        let selection = self
            .model_selector
            .select(Some(spec.model.as_str()))
            .map_err(BatchError::InvalidBatch)?;
        if self.providers.get(&selection.model.provider).is_none() {
            let available = self.providers.names().join(", ");
            return Err(BatchError::InvalidBatch(format!(
                "provider '{}' not registered (available: [{}])",
                selection.model.provider, available
            )));
        }
        Ok(PlanPreview {
            prompts: spec.prompts.len() as u64,
            count_per_prompt: spec.count_per_prompt,
            total_units: spec.total_units(),
            model: selection.model.name,
            provider: selection.model.provider,
            fallback_reason: selection.fallback_reason,
        })
    }

    /// Generates every unit, then packages the results.
    ///
    /// A failed generation or archive step still returns every image produced
    /// so far inside the error. `summary.json` is rewritten on every outcome.
    pub fn run(
        &self,
        spec: &BatchSpec,
        observer: &mut dyn FnMut(&BatchState),
    ) -> Result<BatchState, BatchAborted> {
        let started_at = now_utc_iso();
        let cancel = self.cancel_flag();
        self.emit(
            RunEvent::RunStarted,
            map_object(json!({
                "out_dir": self.out_dir.to_string_lossy().to_string(),
            })),
        );

        let outcome = self.run_inner(spec, cancel, observer);
        self.retire_cancel_flag();
        match &outcome {
            Ok(state) => self.finish(state, started_at),
            Err(aborted) => self.finish(&aborted.state, started_at),
        }
        outcome
    }

    fn run_inner(
        &self,
        spec: &BatchSpec,
        cancel: CancelFlag,
        observer: &mut dyn FnMut(&BatchState),
    ) -> Result<BatchState, BatchAborted> {
        let plan = match spec.validate().and_then(|()| self.preview_plan(spec)) {
            Ok(plan) => plan,
            Err(err) => return Err(self.abort(err, BatchState::new(spec.total_units()))),
        };
        if let Some(reason) = &plan.fallback_reason {
            tracing::warn!(model = %plan.model, "{reason}");
        }
        self.emit(
            RunEvent::PlanPreview,
            map_object(json!({
                "plan": {
                    "prompts": plan.prompts,
                    "count_per_prompt": plan.count_per_prompt,
                    "total_units": plan.total_units,
                    "aspect_ratio": spec.aspect_ratio.label(),
                    "model": plan.model,
                    "provider": plan.provider,
                    "fallback_reason": plan.fallback_reason,
                }
            })),
        );

        let resolved = BatchSpec {
            model: plan.model.clone(),
            ..spec.clone()
        };
        let Some(provider) = self.providers.get(&plan.provider) else {
            let err = BatchError::InvalidBatch(format!(
                "provider '{}' not registered",
                plan.provider
            ));
            return Err(self.abort(err, BatchState::new(spec.total_units())));
        };

        let events = self.events.clone();
        let orchestrator =
            BatchOrchestrator::new(provider).with_cancel_flag(cancel);
        let result = orchestrator.run(&resolved, &mut |state: &BatchState| {
            if let Some(image) = state.results.last() {
                let kind = image.reference_kind();
                let mut payload = map_object(json!({
                    "completed": state.completed,
                    "total": state.total_units,
                    "prompt": image.prompt.as_str(),
                    "reference_kind": kind,
                }));
                if kind == "http_url" {
                    payload.insert("reference".to_string(), json!(image.reference));
                }
                if let Err(err) = events.emit(RunEvent::UnitCompleted, payload) {
                    tracing::warn!(error = %err, "failed to record unit_completed event");
                }
            }
            observer(state);
        });

        let state = match result {
            Ok(state) => state,
            Err(aborted) => {
                self.emit_failure(&aborted.source);
                return Err(aborted);
            }
        };

        let (archive, path) = match build_archive(&state.results, self.fetcher.as_ref())
            .and_then(|archive| archive.write_to(&self.out_dir).map(|path| (archive, path)))
        {
            Ok(written) => written,
            Err(err) => return Err(self.abort(BatchError::from(err), state)),
        };
        let archive_ref = ArchiveRef {
            path: path.clone(),
            file_name: archive.file_name.clone(),
            entries: archive.entries.len() as u64,
            sha256: archive.sha256(),
        };
        tracing::info!(path = %path.display(), entries = archive_ref.entries, "archive written");
        self.emit(
            RunEvent::ArchiveCreated,
            map_object(json!({
                "path": path.to_string_lossy().to_string(),
                "file_name": archive_ref.file_name,
                "entries": archive.entries,
                "sha256": archive_ref.sha256,
            })),
        );
        Ok(state.with_archive(archive_ref))
    }

    fn abort(&self, err: BatchError, state: BatchState) -> BatchAborted {
        self.emit_failure(&err);
        BatchAborted::new(err, state)
    }

    fn emit_failure(&self, err: &BatchError) {
        let event = match err {
            BatchError::Cancelled { .. } => RunEvent::BatchCancelled,
            BatchError::Archive(_) => RunEvent::ArchiveFailed,
            _ => RunEvent::GenerationFailed,
        };
        self.emit(
            event,
            map_object(json!({
                "kind": err.kind(),
                "error": err.to_string(),
            })),
        );
    }

    fn finish(&self, state: &BatchState, started_at: String) {
        let summary = RunSummary {
            run_id: self.run_id().to_string(),
            started_at,
            finished_at: now_utc_iso(),
            total_units: state.total_units,
            completed_units: state.completed,
            archive_path: state
                .archive
                .as_ref()
                .map(|archive| archive.path.to_string_lossy().to_string()),
            error: state.error.clone(),
        };
        let extra = map_object(json!({
            "events_path": self.events.path().to_string_lossy().to_string(),
        }));
        if let Err(err) = write_summary(&self.summary_path, &summary, Some(&extra)) {
            tracing::warn!(error = %err, "failed to write run summary");
        }
        self.emit(
            RunEvent::RunFinished,
            map_object(json!({
                "summary_path": self.summary_path.to_string_lossy().to_string(),
                "ok": state.error.is_none(),
            })),
        );
    }

    /// The run log is best-effort; a failed append never discards generated images.
    fn emit(&self, event: RunEvent, payload: EventPayload) {
        if let Err(err) = self.events.emit(event, payload) {
            tracing::warn!(event = %event, error = %err, "failed to record run event");
        }
    }
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}
