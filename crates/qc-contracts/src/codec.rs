use std::fmt;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64 image payload: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),
}

/// Standard padded base64 of the raw bytes. Total over all inputs, empty included.
pub fn encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(BASE64.decode(text)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Png,
    Jpeg,
}

impl MediaType {
    pub fn as_mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    /// Magic bytes first, then the file extension, then JPEG.
    pub fn detect(bytes: &[u8], path: Option<&Path>) -> Self {
        if let Some(kind) = Self::sniff(bytes) {
            return kind;
        }
        path.and_then(Self::from_path).unwrap_or(Self::Jpeg)
    }

    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(Self::Png);
        }
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Self::Jpeg);
        }
        None
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.to_ascii_lowercase())?;
        match ext.as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_mime())
    }
}

/// True when the file name carries one of the accepted upload extensions.
pub fn is_supported_image_name(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    [".png", ".jpg", ".jpeg"]
        .iter()
        .any(|suffix| lowered.ends_with(suffix))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    media_type: MediaType,
    data: String,
}

impl EncodedImage {
    pub fn from_bytes(bytes: &[u8], path: Option<&Path>) -> Self {
        Self {
            media_type: MediaType::detect(bytes, path),
            data: encode(bytes),
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.media_type.as_mime(), self.data)
    }
}

/// Short hex digest used to refer to an image in logs and the event journal.
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..6])
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{decode, encode, fingerprint, is_supported_image_name, EncodedImage, MediaType};

    #[test]
    fn round_trips_arbitrary_bytes_including_empty() -> anyhow::Result<()> {
        let samples: Vec<Vec<u8>> = vec![
            Vec::new(),
            vec![0],
            vec![0xFF, 0xD8, 0xFF, 0xE0],
            (0..=255u8).collect(),
            vec![7; 4099],
        ];
        for bytes in samples {
            assert_eq!(decode(&encode(&bytes))?, bytes);
        }
        assert_eq!(encode(&[]), "");
        Ok(())
    }

    #[test]
    fn decode_rejects_non_base64_text() {
        assert!(decode("not*base64!").is_err());
    }

    #[test]
    fn media_type_prefers_magic_bytes_over_extension() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0];
        assert_eq!(
            MediaType::detect(&png, Some(Path::new("mislabeled.jpg"))),
            MediaType::Png
        );
        assert_eq!(
            MediaType::detect(b"????", Some(Path::new("box.PNG"))),
            MediaType::Png
        );
        assert_eq!(MediaType::detect(b"????", None), MediaType::Jpeg);
    }

    #[test]
    fn data_uri_declares_media_type() {
        let image = EncodedImage::from_bytes(&[0xFF, 0xD8, 0xFF, 0x00], None);
        assert_eq!(image.data_uri(), "data:image/jpeg;base64,/9j/AA==");
        assert!(!image.is_empty());
        assert!(EncodedImage::from_bytes(&[], None).is_empty());
    }

    #[test]
    fn supported_names_are_case_insensitive() {
        assert!(is_supported_image_name("a.PNG"));
        assert!(is_supported_image_name("b.Jpeg"));
        assert!(is_supported_image_name("c.jpg"));
        assert!(!is_supported_image_name("d.gif"));
        assert!(!is_supported_image_name("png"));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        assert_eq!(fingerprint(b"box"), fingerprint(b"box"));
        assert_ne!(fingerprint(b"box"), fingerprint(b"bag"));
        assert_eq!(fingerprint(b"box").len(), 12);
    }
}
