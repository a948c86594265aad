use std::path::Path;

use anyhow::Context;
use serde_json::{json, Map, Value};

use crate::prompt::AnalysisRequest;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Outcome fields recorded alongside the request shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptOutcome {
    pub provider: String,
    pub succeeded: bool,
    pub error_kind: Option<String>,
    pub text: String,
    pub elapsed_s: f64,
}

pub fn build_receipt(
    request: &AnalysisRequest,
    target_fingerprint: &str,
    outcome: &ReceiptOutcome,
    receipt_path: &Path,
) -> Value {
    let messages = serde_json::to_value(request.messages()).unwrap_or(Value::Null);
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "request".to_string(),
        json!({
            "model": request.model,
            "entries": request.entry_count(),
            "images": request.image_count(),
            "instruction": request.instruction,
            "target_fingerprint": target_fingerprint,
            "messages": sanitize_payload(&messages),
        }),
    );
    root.insert(
        "outcome".to_string(),
        json!({
            "provider": outcome.provider,
            "succeeded": outcome.succeeded,
            "error_kind": outcome.error_kind,
            "text": outcome.text,
            "elapsed_s": outcome.elapsed_s,
        }),
    );
    root.insert(
        "receipt_path".to_string(),
        Value::String(receipt_path.to_string_lossy().to_string()),
    );
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

// Inline image data is replaced by its length so receipts stay small.
fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
        Value::String(text) => {
            if text.starts_with("data:") {
                Value::String(format!("<omitted {} chars>", text.len()))
            } else {
                value.clone()
            }
        }
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, row)| (key.clone(), sanitize_payload(row)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use crate::codec::EncodedImage;
    use crate::prompt::{assemble, FewShotHistory, ImageSample, SampleLabel};

    use super::{build_receipt, write_receipt, ReceiptOutcome, RECEIPT_SCHEMA_VERSION};

    #[test]
    fn receipt_records_shape_without_image_data() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let receipt_path = temp.path().join("receipts/receipt-001.json");

        let mut history = FewShotHistory::new();
        history.add_turn(&ImageSample::new(
            SampleLabel::Good,
            "good.jpg",
            vec![0xFF, 0xD8, 0xFF, 9],
            Some("clean box".to_string()),
        ));
        let target = EncodedImage::from_bytes(&[0xFF, 0xD8, 0xFF, 1], None);
        let request = assemble(&history, &target, "Inspect", "gpt-4o")?;
        let outcome = ReceiptOutcome {
            provider: "openai".to_string(),
            succeeded: true,
            error_kind: None,
            text: "No defects.".to_string(),
            elapsed_s: 1.25,
        };

        let payload = build_receipt(&request, "abc123", &outcome, &receipt_path);
        write_receipt(&receipt_path, &payload)?;

        let raw = std::fs::read_to_string(&receipt_path)?;
        assert!(!raw.contains("base64,"));
        let parsed: Value = serde_json::from_str(&raw)?;
        assert_eq!(parsed["schema_version"], json!(RECEIPT_SCHEMA_VERSION));
        assert_eq!(parsed["request"]["entries"], json!(4));
        assert_eq!(parsed["request"]["images"], json!(2));
        assert_eq!(parsed["request"]["messages"][2]["content"], json!("clean box"));
        assert_eq!(
            parsed["request"]["messages"][1]["content"][0]["image_url"]["url"],
            json!("<omitted 31 chars>")
        );
        assert_eq!(parsed["outcome"]["text"], json!("No defects."));
        Ok(())
    }

    #[test]
    fn write_failure_names_the_blocked_directory() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let blocker = temp.path().join("receipts");
        std::fs::write(&blocker, b"not a directory")?;
        let err = write_receipt(&blocker.join("receipt-001.json"), &json!({}))
            .unwrap_err();
        assert!(format!("{err:#}").contains(&blocker.display().to_string()));
        Ok(())
    }
}
