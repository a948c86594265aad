use serde::{Deserialize, Serialize};

use crate::codec::EncodedImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One part of a multimodal message body, tagged the way the chat completions API expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    ImageUrl { image_url: ImageUrl },
    Text { text: String },
}

impl ContentPart {
    pub fn image(image: &EncodedImage) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl {
                url: image.data_uri(),
            },
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::ImageUrl { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }

    pub fn image_count(&self) -> usize {
        match &self.content {
            MessageContent::Text(_) => 0,
            MessageContent::Parts(parts) => parts.iter().filter(|part| part.is_image()).count(),
        }
    }

    pub fn text_parts(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Text(text) => vec![text.as_str()],
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::codec::EncodedImage;

    use super::{ChatMessage, ContentPart};

    #[test]
    fn user_parts_serialize_to_chat_completions_shape() -> anyhow::Result<()> {
        let image = EncodedImage::from_bytes(&[0xFF, 0xD8, 0xFF, 0x00], None);
        let message =
            ChatMessage::user_parts(vec![ContentPart::image(&image), ContentPart::text("why?")]);
        let value = serde_json::to_value(&message)?;
        assert_eq!(
            value,
            json!({
                "role": "user",
                "content": [
                    {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,/9j/AA=="}},
                    {"type": "text", "text": "why?"}
                ]
            })
        );
        Ok(())
    }

    #[test]
    fn plain_text_messages_serialize_content_as_string() -> anyhow::Result<()> {
        let value = serde_json::to_value(ChatMessage::assistant("dented corner"))?;
        assert_eq!(
            value,
            json!({"role": "assistant", "content": "dented corner"})
        );
        Ok(())
    }
}
