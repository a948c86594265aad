use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use qc_contracts::codec::{fingerprint, is_supported_image_name, EncodedImage};
use qc_contracts::events::{
    EventPayload, EventWriter, ANALYSIS_FAILED, ANALYSIS_FINISHED, ANALYSIS_STARTED,
    RESULT_SAVED, SAMPLE_ADDED, SAMPLE_SKIPPED, SESSION_FINISHED, SESSION_RESET,
    SESSION_STARTED,
};
use qc_contracts::models::{ModelSelection, ModelSelector};
use qc_contracts::prompt::{AnalysisRequest, ImageSample, SampleLabel};
use qc_contracts::runs::receipts::{build_receipt, write_receipt, ReceiptOutcome};
use qc_contracts::runs::results::save_result;
use qc_contracts::runs::summary::write_summary;
use qc_contracts::session::{Session, DEFAULT_MAX_SAMPLES_PER_LABEL};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 1000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const FAILURE_PREFIX: &str = "An error occurred during image analysis: ";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_output_tokens: u32,
    pub timeout: Duration,
    pub max_samples_per_label: usize,
    pub results_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            timeout: DEFAULT_TIMEOUT,
            max_samples_per_label: DEFAULT_MAX_SAMPLES_PER_LABEL,
            results_dir: PathBuf::from("."),
        }
    }
}

impl EngineConfig {
    /// Process environment first, then `.env` in the working directory.
    pub fn from_env() -> Self {
        let dotenv = env::current_dir()
            .map(|dir| read_dotenv(&dir.join(".env")))
            .unwrap_or_default();
        Self::from_lookup(|key| {
            non_empty_env(key).or_else(|| {
                dotenv
                    .get(key)
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
        })
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(base) = lookup("OPENAI_API_BASE") {
            let trimmed = base.trim().trim_end_matches('/').to_string();
            if !trimmed.is_empty() {
                config.api_base = trimmed;
            }
        }
        config.api_key = lookup("OPENAI_API_KEY");
        config
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_dotenv(path: &Path) -> HashMap<String, String> {
    fs::read_to_string(path)
        .map(|content| parse_dotenv(&content))
        .unwrap_or_default()
}

/// `KEY=VALUE` lines; `export ` prefixes, `#` comments and one level of matching quotes are handled.
fn parse_dotenv(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").map_or(line, str::trim_start);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePreview {
    pub width: u32,
    pub height: u32,
    pub format: String,
}

/// Decodes the bytes far enough to show what was uploaded.
pub fn preview_image(bytes: &[u8]) -> Result<ImagePreview> {
    let format = image::guess_format(bytes)
        .map(|format| format!("{format:?}").to_ascii_lowercase())
        .context("unrecognized image format")?;
    let decoded = image::load_from_memory(bytes).context("failed to decode image")?;
    Ok(ImagePreview {
        width: decoded.width(),
        height: decoded.height(),
        format,
    })
}

/// Remote call failure, classified. Callers usually only see the flattened text.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("OPENAI_API_KEY is not set")]
    MissingCredential,
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication failed ({status}): {body}")]
    Auth { status: u16, body: String },
    #[error("rate limited ({status}): {body}")]
    RateLimited { status: u16, body: String },
    #[error("request failed ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("no analysis provider registered for '{0}'")]
    ProviderUnavailable(String),
}

impl AnalysisError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network",
            Self::Auth { .. } => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::Api { .. } => "api",
            Self::MalformedResponse(_) => "malformed_response",
            Self::ProviderUnavailable(_) => "provider_unavailable",
        }
    }

    fn from_transport(err: reqwest::Error) -> Self {
        let detail = error_chain_text(&err, 512);
        if err.is_timeout() {
            Self::Timeout(detail)
        } else {
            Self::Network(detail)
        }
    }

    fn from_status(status: u16, body: &str) -> Self {
        let body = truncate_text(body.trim(), 512);
        match status {
            401 | 403 => Self::Auth { status, body },
            429 => Self::RateLimited { status, body },
            _ => Self::Api { status, body },
        }
    }
}

/// Text shown to the operator. On failure `text` is the flattened diagnostic and `error` keeps the kind.
#[derive(Debug)]
pub struct AnalysisResult {
    pub text: String,
    pub error: Option<AnalysisError>,
}

impl AnalysisResult {
    pub fn success(text: String) -> Self {
        Self { text, error: None }
    }

    pub fn failure(error: AnalysisError) -> Self {
        Self {
            text: format!("{FAILURE_PREFIX}{error}"),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub trait AnalysisProvider: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(&self, request: &AnalysisRequest) -> Result<String, AnalysisError>;
}

#[derive(Default)]
pub struct AnalysisProviderRegistry {
    providers: BTreeMap<String, Box<dyn AnalysisProvider>>,
}

impl AnalysisProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: AnalysisProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn AnalysisProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

struct DryrunProvider;

impl AnalysisProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn analyze(&self, request: &AnalysisRequest) -> Result<String, AnalysisError> {
        Ok(format!(
            "Dry run with {model}: {examples} few-shot examples, {images} images, {entries} entries. Instruction: {instruction}",
            model = request.model,
            examples = request.history.len() / 2,
            images = request.image_count(),
            entries = request.entry_count(),
            instruction = request.instruction,
        ))
    }
}

pub struct OpenAiProvider {
    api_base: String,
    api_key: Option<String>,
    max_output_tokens: u32,
    http: HttpClient,
}

impl OpenAiProvider {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            max_output_tokens: config.max_output_tokens,
            http,
        })
    }

    fn payload(&self, request: &AnalysisRequest) -> Value {
        json!({
            "model": request.model,
            "messages": request.messages(),
            "max_tokens": self.max_output_tokens,
        })
    }
}

impl AnalysisProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn analyze(&self, request: &AnalysisRequest) -> Result<String, AnalysisError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(AnalysisError::MissingCredential)?;
        let endpoint = format!("{}/chat/completions", self.api_base);
        let payload = self.payload(request);
        debug!(
            "POST {endpoint} model={} entries={} images={}",
            request.model,
            request.entry_count(),
            request.image_count()
        );

        let response = self
            .http
            .post(endpoint)
            .bearer_auth(api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .map_err(AnalysisError::from_transport)?;
        let status = response.status();
        let body = response.text().map_err(AnalysisError::from_transport)?;
        if !status.is_success() {
            return Err(AnalysisError::from_status(status.as_u16(), &body));
        }
        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            AnalysisError::MalformedResponse(format!("invalid JSON payload: {err}"))
        })?;
        extract_completion_text(&parsed).ok_or_else(|| {
            AnalysisError::MalformedResponse(
                "response carried no choices[0].message.content".to_string(),
            )
        })
    }
}

/// First choice's content, verbatim. Part lists are joined without separators.
fn extract_completion_text(response: &Value) -> Option<String> {
    let content = response
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?;
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.concat())
            }
        }
        _ => None,
    }
}

fn default_provider_registry(config: &EngineConfig) -> Result<AnalysisProviderRegistry> {
    let mut providers = AnalysisProviderRegistry::new();
    providers.register(DryrunProvider);
    providers.register(OpenAiProvider::new(config)?);
    Ok(providers)
}

#[derive(Debug, Error)]
pub enum BrowseError {
    #[error("Folder not found: {}", .0.display())]
    FolderNotFound(PathBuf),
    #[error("No image files found in {}", .0.display())]
    NoImages(PathBuf),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Names of `.png`/`.jpg`/`.jpeg` files directly inside `dir`, sorted.
pub fn list_folder_images(dir: &Path) -> Result<Vec<String>, BrowseError> {
    if !dir.is_dir() {
        return Err(BrowseError::FolderNotFound(dir.to_path_buf()));
    }
    let entries = fs::read_dir(dir).map_err(|source| BrowseError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| BrowseError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if !entry.path().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if is_supported_image_name(&name) {
            names.push(name);
        }
    }
    if names.is_empty() {
        return Err(BrowseError::NoImages(dir.to_path_buf()));
    }
    names.sort();
    Ok(names)
}

/// Resolves a pick by exact file name or 1-based index.
pub fn pick_image<'a>(names: &'a [String], selection: &str) -> Option<&'a str> {
    let selection = selection.trim();
    if let Some(name) = names.iter().find(|name| name.as_str() == selection) {
        return Some(name.as_str());
    }
    let index = selection.parse::<usize>().ok()?;
    names
        .get(index.checked_sub(1)?)
        .map(|name| name.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleAdded {
    pub preview: ImagePreview,
    pub grounded: bool,
}

pub struct InspectionEngine {
    out_dir: PathBuf,
    events: EventWriter,
    config: EngineConfig,
    model_selector: ModelSelector,
    providers: AnalysisProviderRegistry,
    receipt_seq: AtomicU64,
}

impl InspectionEngine {
    pub fn new(
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        config: EngineConfig,
    ) -> Result<Self> {
        let providers = default_provider_registry(&config)?;
        Self::with_providers(out_dir, events_path, config, providers)
    }

    pub fn with_providers(
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        config: EngineConfig,
        providers: AnalysisProviderRegistry,
    ) -> Result<Self> {
        let out_dir = out_dir.into();
        fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        let run_id = out_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("qc-run")
            .to_string();
        let events = EventWriter::new(events_path.into(), run_id);
        Ok(Self {
            out_dir,
            events,
            config,
            model_selector: ModelSelector::new(None),
            providers,
            receipt_seq: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn model_selector(&self) -> &ModelSelector {
        &self.model_selector
    }

    pub fn open_session(&self) -> Result<Session> {
        let mut session = Session::new(self.config.model.clone())
            .with_max_samples_per_label(self.config.max_samples_per_label);
        let selection = self.select_model(&mut session, Some(self.config.model.as_str()))?;
        self.emit(
            &session,
            SESSION_STARTED,
            json!({
                "model": selection.model.name,
                "max_samples_per_label": session.max_samples_per_label(),
                "out_dir": self.out_dir.to_string_lossy(),
                "providers": self.providers.names(),
            }),
        )?;
        info!("session {} started with {}", session.id(), session.model());
        Ok(session)
    }

    /// Switches the session to a vision-capable model, falling back to the default one.
    pub fn select_model(
        &self,
        session: &mut Session,
        requested: Option<&str>,
    ) -> Result<ModelSelection> {
        let selection = self.model_selector.vision(requested)?;
        if let Some(reason) = &selection.fallback_reason {
            if requested.is_some() {
                warn!("{reason}");
            }
        }
        session.set_model(selection.model.name.clone());
        Ok(selection)
    }

    pub fn add_sample(
        &self,
        session: &mut Session,
        label: SampleLabel,
        name: &str,
        bytes: Vec<u8>,
        annotation: Option<String>,
    ) -> Result<SampleAdded> {
        let preview =
            preview_image(&bytes).with_context(|| format!("cannot preview {label} image {name}"))?;
        let size = bytes.len();
        let sample = ImageSample::new(label, name, bytes, annotation);
        let sample_fingerprint = sample.fingerprint();
        let media_type = sample.encoded().media_type();
        let grounded = session.add_sample(sample)?;

        let event_type = if grounded {
            SAMPLE_ADDED
        } else {
            SAMPLE_SKIPPED
        };
        self.emit(
            session,
            event_type,
            json!({
                "label": label.as_str(),
                "name": name,
                "bytes": size,
                "media_type": media_type.as_mime(),
                "fingerprint": sample_fingerprint,
                "width": preview.width,
                "height": preview.height,
                "history_entries": session.history().len(),
            }),
        )?;
        if grounded {
            info!("added {label} example {name} ({sample_fingerprint})");
        } else {
            info!("{label} image {name} has no annotation; kept out of the few-shot context");
        }
        Ok(SampleAdded { preview, grounded })
    }

    pub fn add_sample_file(
        &self,
        session: &mut Session,
        label: SampleLabel,
        path: &Path,
        annotation: Option<String>,
    ) -> Result<SampleAdded> {
        let (name, bytes) = read_upload(path)?;
        self.add_sample(session, label, &name, bytes, annotation)
    }

    /// Assembles and sends one analysis. Remote failures come back inside the result, never as `Err`.
    pub fn analyze(
        &self,
        session: &mut Session,
        name: &str,
        bytes: &[u8],
    ) -> Result<AnalysisResult> {
        let target = EncodedImage::from_bytes(bytes, Some(Path::new(name)));
        let request = session.build_request(&target)?;
        let target_fingerprint = fingerprint(bytes);
        self.emit(
            session,
            ANALYSIS_STARTED,
            json!({
                "model": request.model,
                "target": name,
                "target_fingerprint": target_fingerprint,
                "entries": request.entry_count(),
                "images": request.image_count(),
            }),
        )?;

        let provider_name = self.provider_name_for(&request.model);
        let started = Instant::now();
        let result = self.run_analysis(&provider_name, &request);
        let elapsed_s = started.elapsed().as_secs_f64();

        session.record_analysis(result.is_success());
        session.set_last_result(result.text.clone());

        let error_kind = result.error.as_ref().map(AnalysisError::kind);
        let receipt_path = self.next_receipt_path(session);
        let receipt = build_receipt(
            &request,
            &target_fingerprint,
            &ReceiptOutcome {
                provider: provider_name.clone(),
                succeeded: result.is_success(),
                error_kind: error_kind.map(str::to_string),
                text: result.text.clone(),
                elapsed_s,
            },
            &receipt_path,
        );
        // Past this point the reply exists; receipt and journal failures only warn.
        if let Err(err) = write_receipt(&receipt_path, &receipt) {
            warn!("analysis receipt not written: {err:#}");
        }

        let event_type = if result.is_success() {
            ANALYSIS_FINISHED
        } else {
            ANALYSIS_FAILED
        };
        let recorded = self.emit(
            session,
            event_type,
            json!({
                "provider": provider_name,
                "model": request.model,
                "elapsed_s": elapsed_s,
                "chars": result.text.chars().count(),
                "error_kind": error_kind,
                "receipt_path": receipt_path.to_string_lossy(),
            }),
        );
        if let Err(err) = recorded {
            warn!("{event_type} not journaled: {err:#}");
        }
        Ok(result)
    }

    pub fn analyze_file(&self, session: &mut Session, path: &Path) -> Result<AnalysisResult> {
        let (name, bytes) = read_upload(path)?;
        self.analyze(session, &name, &bytes)
    }

    /// Calls the provider once and flattens any failure into the result text.
    pub fn run_analysis(&self, provider_name: &str, request: &AnalysisRequest) -> AnalysisResult {
        let outcome = match self.providers.get(provider_name) {
            Some(provider) => provider.analyze(request),
            None => Err(AnalysisError::ProviderUnavailable(provider_name.to_string())),
        };
        match outcome {
            Ok(text) => AnalysisResult::success(text),
            Err(err) => {
                error!("Error analyzing image: {err}");
                AnalysisResult::failure(err)
            }
        }
    }

    pub fn save_result(&self, session: &mut Session) -> Result<PathBuf> {
        let Some(text) = session.last_result() else {
            bail!("no analysis result to save yet");
        };
        let now = chrono::Local::now().naive_local();
        let path = save_result(&self.config.results_dir, text, now)?;
        session.record_saved(path.to_string_lossy().to_string());
        self.emit(
            session,
            RESULT_SAVED,
            json!({ "path": path.to_string_lossy() }),
        )?;
        Ok(path)
    }

    pub fn reset_session(&self, session: &mut Session) -> Result<()> {
        let dropped = session.samples().len();
        session.reset();
        self.emit(session, SESSION_RESET, json!({ "samples_dropped": dropped }))?;
        Ok(())
    }

    pub fn finish(&self, session: &Session) -> Result<PathBuf> {
        let finished_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false);
        let summary = session.summary(finished_at);
        let path = self.out_dir.join(format!("{}-summary.json", session.id()));
        let mut extra = Map::new();
        extra.insert(
            "events_path".to_string(),
            Value::String(self.events.path().to_string_lossy().to_string()),
        );
        write_summary(&path, &summary, Some(&extra))?;
        self.emit(
            session,
            SESSION_FINISHED,
            json!({
                "analyses": session.analysis_count(),
                "summary_path": path.to_string_lossy(),
            }),
        )?;
        Ok(path)
    }

    fn provider_name_for(&self, model: &str) -> String {
        self.model_selector
            .registry
            .get(model)
            .map(|spec| spec.provider.clone())
            .unwrap_or_else(|| "openai".to_string())
    }

    fn next_receipt_path(&self, session: &Session) -> PathBuf {
        let seq = self.receipt_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.out_dir
            .join("receipts")
            .join(format!("{}-{:03}.json", session.id(), seq))
    }

    fn emit(&self, session: &Session, event_type: &str, payload: Value) -> Result<Value> {
        let mut payload: EventPayload = map_object(payload);
        payload.insert(
            "session_id".to_string(),
            Value::String(session.id().to_string()),
        );
        self.events.emit(event_type, payload)
    }
}

/// Reads an operator-chosen file, applying the upload file-type filter.
pub fn read_upload(path: &Path) -> Result<(String, Vec<u8>)> {
    let name = path
        .file_name()
        .and_then(|value| value.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.to_string_lossy().to_string());
    if !is_supported_image_name(&name) {
        bail!("{} is not a .png, .jpg or .jpeg file", path.display());
    }
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok((name, bytes))
}

fn error_chain_text(err: &dyn std::error::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&dyn std::error::Error> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(String::as_str) != Some(trimmed) {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
