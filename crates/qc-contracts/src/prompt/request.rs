use thiserror::Error;

use crate::codec::EncodedImage;

use super::history::FewShotHistory;
use super::message::{ChatMessage, ContentPart};

pub const SYSTEM_DIRECTIVE: &str = "You are an expert at analyzing images for quality control purposes. Provide detailed observations about any defects, damages, or quality issues.";

pub const DEFAULT_INSTRUCTION: &str = "You have been provided examples images of boxes on a conveyer belt. Identify any similarities or differences compared to the good and bad images, and provide a brief description if the box is damaged or not";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromptError {
    #[error("malformed request: target image is empty")]
    MalformedRequest,
}

/// A fully assembled analysis call. Built fresh per call and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub model: String,
    pub system_directive: String,
    pub history: Vec<ChatMessage>,
    pub target: EncodedImage,
    pub instruction: String,
}

impl AnalysisRequest {
    /// System directive, every history entry, then one turn bundling the target image and instruction.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(self.system_directive.clone()));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user_parts(vec![
            ContentPart::image(&self.target),
            ContentPart::text(self.instruction.clone()),
        ]));
        messages
    }

    pub fn entry_count(&self) -> usize {
        self.history.len() + 2
    }

    pub fn image_count(&self) -> usize {
        self.history
            .iter()
            .map(ChatMessage::image_count)
            .sum::<usize>()
            + 1
    }
}

pub fn assemble(
    history: &FewShotHistory,
    target: &EncodedImage,
    instruction: &str,
    model: &str,
) -> Result<AnalysisRequest, PromptError> {
    if target.is_empty() {
        return Err(PromptError::MalformedRequest);
    }
    Ok(AnalysisRequest {
        model: model.to_string(),
        system_directive: SYSTEM_DIRECTIVE.to_string(),
        history: history.entries(),
        target: target.clone(),
        instruction: instruction.to_string(),
    })
}
