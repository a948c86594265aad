use crate::codec::EncodedImage;

use super::message::{ChatMessage, ContentPart};
use super::sample::{ImageSample, SampleLabel};

/// An annotated example: an image-only user turn followed by the annotation as the assistant answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FewShotTurn {
    pub label: SampleLabel,
    pub image: EncodedImage,
    pub annotation: String,
}

impl FewShotTurn {
    pub fn input(&self) -> ChatMessage {
        ChatMessage::user_parts(vec![ContentPart::image(&self.image)])
    }

    pub fn output(&self) -> ChatMessage {
        ChatMessage::assistant(self.annotation.clone())
    }
}

/// Append-only few-shot context, in the order samples were added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FewShotHistory {
    turns: Vec<FewShotTurn>,
}

impl FewShotHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the sample's two entries when it carries an annotation; otherwise leaves the history untouched.
    pub fn add_turn(&mut self, sample: &ImageSample) -> bool {
        let Some(annotation) = sample.grounding_annotation() else {
            return false;
        };
        self.turns.push(FewShotTurn {
            label: sample.label(),
            image: sample.encoded().clone(),
            annotation: annotation.to_string(),
        });
        true
    }

    pub fn turns(&self) -> &[FewShotTurn] {
        &self.turns
    }

    /// Number of conversation entries, two per turn.
    pub fn len(&self) -> usize {
        self.turns.len() * 2
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn entries(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .flat_map(|turn| [turn.input(), turn.output()])
            .collect()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[cfg(test)]
mod tests {
    use crate::prompt::message::{MessageContent, Role};
    use crate::prompt::sample::{ImageSample, SampleLabel};

    use super::FewShotHistory;

    fn sample(label: SampleLabel, seed: u8, annotation: Option<&str>) -> ImageSample {
        ImageSample::new(
            label,
            format!("sample-{seed}.jpg"),
            vec![0xFF, 0xD8, 0xFF, seed],
            annotation.map(str::to_string),
        )
    }

    #[test]
    fn annotated_sample_adds_two_entries() {
        let mut history = FewShotHistory::new();
        assert!(history.add_turn(&sample(SampleLabel::Good, 1, Some("clean box"))));
        assert_eq!(history.len(), 2);
        assert!(history.add_turn(&sample(SampleLabel::Bad, 2, Some("dented corner"))));
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn missing_or_empty_annotation_leaves_history_unchanged() {
        let mut history = FewShotHistory::new();
        history.add_turn(&sample(SampleLabel::Good, 1, Some("clean box")));
        let before = history.clone();

        assert!(!history.add_turn(&sample(SampleLabel::Bad, 2, None)));
        assert!(!history.add_turn(&sample(SampleLabel::Bad, 3, Some(""))));
        assert_eq!(history, before);
    }

    #[test]
    fn whitespace_annotation_is_kept_verbatim() {
        let mut history = FewShotHistory::new();
        assert!(history.add_turn(&sample(SampleLabel::Good, 1, Some("   "))));
        assert_eq!(history.len(), 2);
        assert_eq!(
            history.entries()[1].content,
            MessageContent::Text("   ".to_string())
        );
    }

    #[test]
    fn entries_follow_insertion_order_image_then_text() {
        let mut history = FewShotHistory::new();
        history.add_turn(&sample(SampleLabel::Bad, 1, Some("first")));
        history.add_turn(&sample(SampleLabel::Good, 2, Some("second")));
        history.add_turn(&sample(SampleLabel::Bad, 3, Some("third")));

        let entries = history.entries();
        assert_eq!(entries.len(), 6);
        for (idx, expected) in ["first", "second", "third"].iter().enumerate() {
            let input = &entries[idx * 2];
            let output = &entries[idx * 2 + 1];
            assert_eq!(input.role, Role::User);
            assert_eq!(input.image_count(), 1);
            assert!(input.text_parts().is_empty());
            assert_eq!(output.role, Role::Assistant);
            assert_eq!(output.content, MessageContent::Text((*expected).to_string()));
        }
        assert_eq!(history.turns()[0].label, SampleLabel::Bad);
        assert_eq!(history.turns()[1].label, SampleLabel::Good);
    }
}
