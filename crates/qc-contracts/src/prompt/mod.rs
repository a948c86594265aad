mod history;
mod message;
mod request;
mod sample;

pub use history::{FewShotHistory, FewShotTurn};
pub use message::{ChatMessage, ContentPart, ImageUrl, MessageContent, Role};
pub use request::{
    assemble, AnalysisRequest, PromptError, DEFAULT_INSTRUCTION, SYSTEM_DIRECTIVE,
};
pub use sample::{ImageSample, SampleLabel};
