use chrono::{SecondsFormat, Utc};
use thiserror::Error;

use crate::codec::EncodedImage;
use crate::prompt::{
    assemble, AnalysisRequest, FewShotHistory, ImageSample, PromptError, SampleLabel,
    DEFAULT_INSTRUCTION,
};
use crate::runs::summary::SessionSummary;

pub const DEFAULT_MAX_SAMPLES_PER_LABEL: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("already holding {limit} {label} samples")]
    SampleLimit { label: SampleLabel, limit: usize },
}

/// Everything one operator has uploaded. Never shared between sessions.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    started_at: String,
    instruction: String,
    model: String,
    max_samples_per_label: usize,
    samples: Vec<ImageSample>,
    history: FewShotHistory,
    last_result: Option<String>,
    analyses_succeeded: u64,
    analyses_failed: u64,
    saved_results: Vec<String>,
}

impl Session {
    pub fn new(model: impl Into<String>) -> Self {
        let id = format!("session-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        Self::with_id(id, model)
    }

    pub fn with_id(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            instruction: DEFAULT_INSTRUCTION.to_string(),
            model: model.into(),
            max_samples_per_label: DEFAULT_MAX_SAMPLES_PER_LABEL,
            samples: Vec::new(),
            history: FewShotHistory::new(),
            last_result: None,
            analyses_succeeded: 0,
            analyses_failed: 0,
            saved_results: Vec::new(),
        }
    }

    pub fn with_max_samples_per_label(mut self, limit: usize) -> Self {
        self.max_samples_per_label = limit;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> &str {
        &self.started_at
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn set_instruction(&mut self, instruction: impl Into<String>) {
        self.instruction = instruction.into();
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn max_samples_per_label(&self) -> usize {
        self.max_samples_per_label
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    pub fn count(&self, label: SampleLabel) -> usize {
        self.samples
            .iter()
            .filter(|sample| sample.label() == label)
            .count()
    }

    pub fn history(&self) -> &FewShotHistory {
        &self.history
    }

    pub fn last_result(&self) -> Option<&str> {
        self.last_result.as_deref()
    }

    pub fn set_last_result(&mut self, text: impl Into<String>) {
        self.last_result = Some(text.into());
    }

    pub fn record_analysis(&mut self, succeeded: bool) {
        if succeeded {
            self.analyses_succeeded += 1;
        } else {
            self.analyses_failed += 1;
        }
    }

    pub fn record_saved(&mut self, path: impl Into<String>) {
        self.saved_results.push(path.into());
    }

    pub fn analysis_count(&self) -> u64 {
        self.analyses_succeeded + self.analyses_failed
    }

    pub fn summary(&self, finished_at: impl Into<String>) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            started_at: self.started_at.clone(),
            finished_at: finished_at.into(),
            model: self.model.clone(),
            good_samples: self.count(SampleLabel::Good) as u64,
            bad_samples: self.count(SampleLabel::Bad) as u64,
            few_shot_turns: self.history.turns().len() as u64,
            analyses_succeeded: self.analyses_succeeded,
            analyses_failed: self.analyses_failed,
            results_saved: self.saved_results.clone(),
        }
    }

    /// Records the sample and returns whether it became a few-shot turn.
    pub fn add_sample(&mut self, sample: ImageSample) -> Result<bool, SessionError> {
        let label = sample.label();
        if self.count(label) >= self.max_samples_per_label {
            return Err(SessionError::SampleLimit {
                label,
                limit: self.max_samples_per_label,
            });
        }
        let added = self.history.add_turn(&sample);
        self.samples.push(sample);
        Ok(added)
    }

    pub fn build_request(&self, target: &EncodedImage) -> Result<AnalysisRequest, PromptError> {
        assemble(&self.history, target, &self.instruction, &self.model)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.history.clear();
        self.last_result = None;
    }
}
