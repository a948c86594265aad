use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::{fingerprint, EncodedImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleLabel {
    Good,
    Bad,
}

impl SampleLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Bad => "bad",
        }
    }
}

impl fmt::Display for SampleLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference image uploaded by the operator. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSample {
    label: SampleLabel,
    name: String,
    raw: Vec<u8>,
    encoded: EncodedImage,
    annotation: Option<String>,
}

impl ImageSample {
    pub fn new(
        label: SampleLabel,
        name: impl Into<String>,
        raw: Vec<u8>,
        annotation: Option<String>,
    ) -> Self {
        let name = name.into();
        let encoded = EncodedImage::from_bytes(&raw, Some(Path::new(&name)));
        Self {
            label,
            name,
            raw,
            encoded,
            annotation,
        }
    }

    pub fn label(&self) -> SampleLabel {
        self.label
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn encoded(&self) -> &EncodedImage {
        &self.encoded
    }

    /// Only an empty annotation counts as absent; whitespace is kept as typed.
    pub fn grounding_annotation(&self) -> Option<&str> {
        self.annotation.as_deref().filter(|value| !value.is_empty())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.raw)
    }
}
