pub mod advisor;
pub mod backend;
pub mod classify;
pub mod config;
pub mod parse;
pub mod preprocess;

use std::fmt;
use std::time::Instant;

use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};
use verdant_contracts::errors::ErrorKind;
use verdant_contracts::events::{now_utc_iso, EventWriter};
use verdant_contracts::models::{ModelChain, ModelSelector};
use verdant_contracts::plant::AnalysisResult;
use verdant_contracts::store::{AppendOutcome, FileBlobStore, ResultStore, ANALYSIS_RESULTS_KEY};

use crate::advisor::{AdvisorError, AdvisorErrorKind, PlantAdvisor};
use crate::backend::GenerativeBackend;
use crate::config::PipelineConfig;
use crate::preprocess::{ImageData, ImagePreprocessor};

pub const QUOTA_USER_MESSAGE: &str =
    "The plant analysis service has reached its usage limit. Please try again later.";
pub const GENERIC_USER_MESSAGE: &str = "Failed to analyze the image. Please try again.";

/// Steps of one analysis, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Stage {
    Preprocess,
    Identify,
    AssessHealth,
    RecommendCare,
    Compress,
    Assemble,
    Persist,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preprocess => "preprocess",
            Self::Identify => "identify",
            Self::AssessHealth => "assess_health",
            Self::RecommendCare => "recommend_care",
            Self::Compress => "compress",
            Self::Assemble => "assemble",
            Self::Persist => "persist",
        }
    }
}

/// Why an analysis produced no result. Only the three model stages abort.
#[derive(Debug, Clone)]
pub struct AnalysisError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub cause: AdvisorErrorKind,
    pub message: String,
}

impl AnalysisError {
    fn from_advisor(stage: Stage, err: AdvisorError) -> Self {
        Self {
            stage,
            kind: err.class,
            cause: err.kind,
            message: err.message,
        }
    }

    pub fn is_quota(&self) -> bool {
        self.kind == ErrorKind::Quota
    }

    pub fn user_message(&self) -> &'static str {
        if self.is_quota() {
            QUOTA_USER_MESSAGE
        } else {
            GENERIC_USER_MESSAGE
        }
    }
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed ({}): {}",
            self.stage.as_str(),
            self.kind.as_str(),
            self.message
        )
    }
}

impl std::error::Error for AnalysisError {}

/// Resolves the primary/secondary models for one capability, honouring any
/// models named in the config.
pub fn select_chain(config: &PipelineConfig, capability: &str) -> Result<ModelChain> {
    ModelSelector::new(None)
        .select_chain(
            config.primary_model.as_deref(),
            config.secondary_model.as_deref(),
            capability,
        )
        .map_err(|message| anyhow!(message))
}

/// Runs preprocess, identify, assess health, recommend care, compress,
/// assemble and persist for one image.
pub struct Analyzer {
    preprocessor: ImagePreprocessor,
    advisor: PlantAdvisor,
    store: ResultStore,
    events: EventWriter,
    current: Option<AnalysisResult>,
    last_storage_outcome: Option<AppendOutcome>,
    last_warnings: Vec<String>,
}

impl Analyzer {
    pub fn new(
        preprocessor: ImagePreprocessor,
        advisor: PlantAdvisor,
        store: ResultStore,
        events: EventWriter,
    ) -> Self {
        Self {
            preprocessor,
            advisor,
            store,
            events,
            current: None,
            last_storage_outcome: None,
            last_warnings: Vec::new(),
        }
    }

    /// File-backed store under the config home, vision-capable model chain.
    pub fn from_config(
        config: &PipelineConfig,
        backend: Box<dyn GenerativeBackend>,
        events: EventWriter,
    ) -> Result<Self> {
        let chain = select_chain(config, verdant_contracts::models::CAPABILITY_VISION)?;
        let blobs = FileBlobStore::new(config.store_dir()).with_quota(config.store_quota_bytes);
        let store = ResultStore::load(
            Box::new(blobs),
            ANALYSIS_RESULTS_KEY,
            config.max_stored_results,
        );

        events.emit(
            "session_started",
            map_object(json!({
                "backend": backend.name(),
                "models": chain.names(),
                "fallback_reasons": chain.fallback_reasons,
                "stored_results": store.len(),
                "store_dir": config.store_dir().to_string_lossy().to_string(),
            })),
        )?;

        let advisor = PlantAdvisor::new(backend, chain, events.clone());
        Ok(Self::new(
            ImagePreprocessor::new(config),
            advisor,
            store,
            events,
        ))
    }

    pub fn analyze(
        &mut self,
        image: &ImageData,
        plant_id: Option<&str>,
    ) -> Result<AnalysisResult, AnalysisError> {
        let started = Instant::now();
        self.last_warnings.clear();
        self.last_storage_outcome = None;
        self.emit(
            "analysis_started",
            json!({
                "image_digest": image.digest(),
                "mime_type": image.mime_type,
                "width": image.width,
                "height": image.height,
                "plant_id": plant_id,
                "models": self.advisor.chain().names(),
            }),
        );

        let normalized = self.preprocessor.normalize(image);
        for warning in &normalized.warnings {
            self.warn(Stage::Preprocess, warning.clone());
        }
        self.stage_completed(
            Stage::Preprocess,
            json!({
                "resized": normalized.resized,
                "transcoded": normalized.transcoded,
                "mime_type": normalized.image.mime_type,
                "width": normalized.image.width,
                "height": normalized.image.height,
            }),
        );
        let prepared = normalized.image;

        let identification = self
            .advisor
            .identify(&prepared)
            .map_err(|err| self.fail(Stage::Identify, err))?;
        self.stage_completed(
            Stage::Identify,
            json!({
                "common_name": identification.common_name,
                "confidence": identification.confidence_score,
            }),
        );

        let health = self
            .advisor
            .assess_health(&prepared)
            .map_err(|err| self.fail(Stage::AssessHealth, err))?;
        self.stage_completed(
            Stage::AssessHealth,
            json!({
                "status": health.status.label(),
                "issues": health.issues.len(),
            }),
        );

        let care = self
            .advisor
            .recommend_care(
                &identification.common_name,
                Some(&identification.scientific_name),
            )
            .map_err(|err| self.fail(Stage::RecommendCare, err))?;
        self.stage_completed(Stage::RecommendCare, json!({}));

        let stored_image = match self.preprocessor.compress_for_storage(&prepared) {
            Ok(compressed) => compressed,
            Err(err) => {
                self.warn(
                    Stage::Compress,
                    format!("Storage compression failed; keeping the analysed image ({err:#})."),
                );
                prepared
            }
        };
        self.stage_completed(
            Stage::Compress,
            json!({
                "bytes": stored_image.bytes.len(),
                "width": stored_image.width,
                "height": stored_image.height,
            }),
        );

        let result = AnalysisResult {
            id: uuid::Uuid::new_v4().to_string(),
            plant_id: plant_id.map(str::to_string),
            captured_at: now_utc_iso(),
            image: stored_image.to_data_url(),
            identification,
            health,
            care,
        };
        self.stage_completed(Stage::Assemble, json!({ "id": result.id }));

        let outcome = self.store.append(result.clone());
        if outcome.is_degraded() {
            self.emit(
                "store_degraded",
                json!({
                    "id": result.id,
                    "outcome": outcome.as_str(),
                    "reason": outcome.reason(),
                    "retained": self.store.len(),
                }),
            );
            self.warn(
                Stage::Persist,
                format!(
                    "Result history could not be saved in full ({}).",
                    outcome.as_str()
                ),
            );
        }
        self.stage_completed(
            Stage::Persist,
            json!({
                "outcome": outcome.as_str(),
                "stored_results": self.store.len(),
            }),
        );
        self.last_storage_outcome = Some(outcome);
        self.current = Some(result.clone());

        self.emit(
            "analysis_completed",
            json!({
                "id": result.id,
                "plant_id": result.plant_id,
                "health": result.health_label(),
                "warnings": self.last_warnings.len(),
                "elapsed_ms": started.elapsed().as_millis() as u64,
            }),
        );
        Ok(result)
    }

    pub fn current_analysis(&self) -> Option<&AnalysisResult> {
        self.current.as_ref()
    }

    pub fn clear_current_analysis(&mut self) {
        self.current = None;
    }

    pub fn history(&self) -> &[AnalysisResult] {
        self.store.load_all()
    }

    pub fn history_for_plant(&self, plant_id: &str) -> Vec<&AnalysisResult> {
        self.store.for_plant(plant_id)
    }

    pub fn last_storage_outcome(&self) -> Option<&AppendOutcome> {
        self.last_storage_outcome.as_ref()
    }

    /// Non-fatal problems from the most recent `analyze` call.
    pub fn last_warnings(&self) -> &[String] {
        &self.last_warnings
    }

    fn fail(&self, stage: Stage, err: AdvisorError) -> AnalysisError {
        let failure = AnalysisError::from_advisor(stage, err);
        self.emit(
            "analysis_failed",
            json!({
                "stage": stage.as_str(),
                "kind": failure.kind.as_str(),
                "cause": failure.cause.as_str(),
                "error": failure.message,
            }),
        );
        failure
    }

    fn warn(&mut self, stage: Stage, message: String) {
        self.emit(
            "analysis_warning",
            json!({
                "stage": stage.as_str(),
                "message": message,
            }),
        );
        self.last_warnings.push(message);
    }

    fn stage_completed(&self, stage: Stage, detail: Value) {
        let mut payload = map_object(detail);
        payload.insert("stage".to_string(), json!(stage.as_str()));
        let _ = self.events.emit("stage_completed", payload);
    }

    // Event log failures never abort an analysis.
    fn emit(&self, event_type: &str, payload: Value) {
        let _ = self.events.emit(event_type, map_object(payload));
    }
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
