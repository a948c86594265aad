//! Data contracts for few-shot visual quality inspection: image encoding,
//! annotated samples, conversation assembly, and the session journal.

pub mod chat;
pub mod codec;
pub mod events;
pub mod models;
pub mod prompt;
pub mod runs;
pub mod session;
