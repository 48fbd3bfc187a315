use std::env;
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use reverie_contracts::artifact::{
    language_for_hint, DreamSubmission, InterpretationArtifact, MoonJournalEntry,
};
use reverie_contracts::error::WorkflowError;
use reverie_contracts::events::{EventLog, EventPayload};
use reverie_contracts::images::{image_object_path, GeneratedImage, ImageOutcome, ImageRequest};
use reverie_contracts::quota::{commit_merge, quota_document_key, utc_date_key, QuotaRecord};
use reverie_contracts::ratelimit::RateLimiter;
use reverie_contracts::reference::{InterpretationContext, ReferenceRecord, ScenarioEntry};
use reverie_contracts::store::{DocumentMerge, DocumentStore};
use reverie_contracts::symbols::aliases::AliasTable;
use reverie_contracts::symbols::injector::inject_missed_symbols;
use reverie_contracts::symbols::MAX_SYMBOLS;
use reverie_contracts::template::{PromptTemplate, SlotValues};

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub json_mode: bool,
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct TextResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone)]
pub struct ImageGenRequest {
    pub prompt: String,
    pub size: String,
    pub count: u64,
}

pub trait TextGenerator: Send + Sync {
    fn complete(&self, request: &TextRequest) -> Result<TextResponse>;
}

pub trait ImageGenerator: Send + Sync {
    fn generate(&self, request: &ImageGenRequest) -> Result<Vec<u8>>;
}

pub trait ReferenceLookup: Send + Sync {
    /// `Ok(None)` means the collaborator holds no usable record for the key.
    /// Errors are absorbed by the pipeline as "no record" for that key.
    fn fetch(&self, canonical_key: &str) -> Result<Option<ReferenceRecord>>;
}

pub trait ObjectStore: Send + Sync {
    fn is_available(&self) -> Result<()>;
    fn exists(&self, object_path: &str) -> Result<bool>;
    fn write_public(&self, object_path: &str, bytes: &[u8], content_type: &str) -> Result<()>;
    fn public_url(&self, object_path: &str) -> String;
}

pub trait QuotaStore: Send + Sync {
    fn read(&self, user_id: &str) -> Result<QuotaRecord>;
    fn merge(&self, user_id: &str, merge: &DocumentMerge) -> Result<()>;
}

// ---------------------------------------------------------------------------
// network-backed collaborators

pub struct OpenAiTextClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl OpenAiTextClient {
    pub fn from_env() -> Result<Self> {
        let api_key = openai_api_key()
            .context("OPENAI_API_KEY or OPENAI_API_KEY_BACKUP not set")?;
        Ok(Self {
            api_base: openai_api_base(),
            api_key,
            http: HttpClient::new(),
        })
    }
}

impl TextGenerator for OpenAiTextClient {
    fn complete(&self, request: &TextRequest) -> Result<TextResponse> {
        let endpoint = format!("{}/chat/completions", self.api_base);
        let mut payload = map_object(json!({
            "model": &request.model,
            "messages": &request.messages,
            "temperature": request.temperature,
        }));
        if request.json_mode {
            payload.insert(
                "response_format".to_string(),
                json!({"type": "json_object"}),
            );
        }
        if let Some(max_tokens) = request.max_tokens {
            payload.insert("max_tokens".to_string(), json!(max_tokens));
        }

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&Value::Object(payload))
            .send()
            .with_context(|| format!("text generation request failed ({endpoint})"))?;
        let parsed = response_json_or_error("text generation", response)?;

        let content = parsed
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("text generation response carried no message content"))?;
        let usage = parsed
            .get("usage")
            .and_then(|usage| serde_json::from_value(usage.clone()).ok());
        Ok(TextResponse { content, usage })
    }
}

pub struct OpenAiImageClient {
    api_base: String,
    api_key: String,
    model: String,
    http: HttpClient,
}

impl OpenAiImageClient {
    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = openai_api_key()
            .context("OPENAI_API_KEY or OPENAI_API_KEY_BACKUP not set")?;
        Ok(Self {
            api_base: openai_api_base(),
            api_key,
            model: model.into(),
            http: HttpClient::new(),
        })
    }

    fn download_image(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading generated image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            bail!("generated image download failed ({code})");
        }
        Ok(response
            .bytes()
            .context("failed reading generated image bytes")?
            .to_vec())
    }
}

impl ImageGenerator for OpenAiImageClient {
    fn generate(&self, request: &ImageGenRequest) -> Result<Vec<u8>> {
        let endpoint = format!("{}/images/generations", self.api_base);
        let payload = json!({
            "model": &self.model,
            "prompt": &request.prompt,
            "n": request.count.max(1),
            "size": &request.size,
            "response_format": "b64_json",
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("image generation request failed ({endpoint})"))?;
        let parsed = response_json_or_error("image generation", response)?;

        let rows = parsed
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for row in rows {
            if let Some(b64) = row.get("b64_json").and_then(Value::as_str) {
                return BASE64
                    .decode(b64.as_bytes())
                    .context("image base64 decode failed");
            }
            if let Some(url) = row.get("url").and_then(Value::as_str) {
                return self.download_image(url);
            }
        }
        bail!("image generation response returned no images");
    }
}

pub struct JournalLookupClient {
    api_base: String,
    http: HttpClient,
}

impl JournalLookupClient {
    pub fn from_env() -> Self {
        Self {
            api_base: non_empty_env("REVERIE_LOOKUP_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://dreamboatjournal.com/api".to_string()),
            http: HttpClient::new(),
        }
    }
}

impl ReferenceLookup for JournalLookupClient {
    fn fetch(&self, canonical_key: &str) -> Result<Option<ReferenceRecord>> {
        let endpoint = format!("{}/meaning/{canonical_key}", self.api_base);
        let response = self
            .http
            .get(&endpoint)
            .send()
            .with_context(|| format!("reference lookup request failed ({endpoint})"))?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let record: ReferenceRecord = response
            .json()
            .context("reference lookup returned invalid JSON")?;
        Ok(if record.is_empty() { None } else { Some(record) })
    }
}

/// Directory-backed object store. Objects live under `root/{object_path}`
/// and are addressed publicly as `{public_base}/{object_path}`.
pub struct DirBucket {
    root: PathBuf,
    public_base: String,
}

impl DirBucket {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.into(),
        }
    }

    fn object_file(&self, object_path: &str) -> PathBuf {
        self.root.join(object_path)
    }
}

impl ObjectStore for DirBucket {
    fn is_available(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("storage root unavailable ({})", self.root.display()))
    }

    fn exists(&self, object_path: &str) -> Result<bool> {
        Ok(self.object_file(object_path).is_file())
    }

    fn write_public(&self, object_path: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        let file = self.object_file(object_path);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&file, bytes).with_context(|| format!("failed to write {}", file.display()))
    }

    fn public_url(&self, object_path: &str) -> String {
        format!("{}/{}", self.public_base.trim_end_matches('/'), object_path)
    }
}

/// Quota records persisted through the document store, keyed per user.
pub struct DocumentQuotaStore {
    documents: DocumentStore,
}

impl DocumentQuotaStore {
    pub fn new(documents: DocumentStore) -> Self {
        Self { documents }
    }
}

impl QuotaStore for DocumentQuotaStore {
    fn read(&self, user_id: &str) -> Result<QuotaRecord> {
        Ok(QuotaRecord::from_document(
            &self
                .documents
                .get(&quota_document_key(user_id))
                .unwrap_or_default(),
        ))
    }

    fn merge(&self, user_id: &str, merge: &DocumentMerge) -> Result<()> {
        self.documents.merge(&quota_document_key(user_id), merge)
    }
}

// ---------------------------------------------------------------------------
// dryrun collaborators

/// Offline text generation: canned responses keyed off the call shape so the
/// CLI and tests run without keys or network.
pub struct DryrunTextClient;

const DRYRUN_VOCABULARY: &[&str] = &[
    "dog", "snake", "stairs", "teeth", "house", "water", "bird", "sea",
];

impl TextGenerator for DryrunTextClient {
    fn complete(&self, request: &TextRequest) -> Result<TextResponse> {
        let system = request
            .messages
            .first()
            .map(|message| message.content.as_str())
            .unwrap_or_default();
        let user = request
            .messages
            .last()
            .map(|message| message.content.as_str())
            .unwrap_or_default();

        let content = if system.contains("dominant symbols") {
            let lowered = user.to_lowercase();
            let symbols: Vec<String> = DRYRUN_VOCABULARY
                .iter()
                .filter(|term| lowered.contains(*term))
                .take(MAX_SYMBOLS)
                .map(|term| term.to_uppercase())
                .collect();
            json!({ "symbols": symbols }).to_string()
        } else if system.starts_with("Detect the language") {
            "English".to_string()
        } else if system.contains("Jungian") {
            json!({
                "title": "Dryrun Dream",
                "definition": "Offline interpretation stub.",
                "interpretation": "A quiet first passage rendered offline.\n\nA quiet second passage rendered offline.",
                "cosmicCommentary": null,
            })
            .to_string()
        } else if system.contains("Art Director") {
            let summary = user.trim_start_matches("Dream: ");
            format!(
                "Create a dreamlike color field composition of: {}",
                truncate_text(summary, 160)
            )
        } else {
            format!(
                "Notice how your dreams echo through the day. (offline {})",
                short_digest(user)
            )
        };
        Ok(TextResponse {
            content,
            usage: None,
        })
    }
}

/// Offline image generation: a solid-color PNG whose color is derived from a
/// SHA-256 digest of the prompt, so identical prompts stay identical.
pub struct DryrunImageClient;

impl ImageGenerator for DryrunImageClient {
    fn generate(&self, request: &ImageGenRequest) -> Result<Vec<u8>> {
        let (width, height) = parse_dims(&request.size);
        let (r, g, b) = color_from_prompt(&request.prompt);
        let mut canvas = RgbImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .context("failed to encode dryrun image")?;
        Ok(bytes)
    }
}

/// Offline reference lookup with a couple of built-in records.
pub struct DryrunLookupClient;

impl ReferenceLookup for DryrunLookupClient {
    fn fetch(&self, canonical_key: &str) -> Result<Option<ReferenceRecord>> {
        let record = match canonical_key {
            "stairs" => Some(ReferenceRecord {
                meaning: Some("Stairs mark passage between levels of awareness.".to_string()),
                scenarios: vec![ScenarioEntry {
                    title: "Climbing without arriving".to_string(),
                    description: "Effort routed toward the wrong goal.".to_string(),
                }],
                supplementary_commentary: Some(
                    "New Moon favors fresh ascents; Full Moon favors release.".to_string(),
                ),
                ..ReferenceRecord::default()
            }),
            "dog" => Some(ReferenceRecord {
                meaning: Some("Dogs carry loyalty and instinct.".to_string()),
                ..ReferenceRecord::default()
            }),
            _ => None,
        };
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// engine

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub text_model: String,
    pub image_model: String,
    pub image_size: String,
    pub storage_namespace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            text_model: "gpt-4o-mini".to_string(),
            image_model: "dall-e-3".to_string(),
            image_size: "1024x1024".to_string(),
            storage_namespace: "dream_images".to_string(),
        }
    }
}

/// The collaborator set handed to the engine once at construction; every
/// seam is a trait object so callers and tests can substitute.
pub struct Collaborators {
    pub text: Box<dyn TextGenerator>,
    pub images: Box<dyn ImageGenerator>,
    pub lookup: Box<dyn ReferenceLookup>,
    pub storage: Box<dyn ObjectStore>,
    pub quota: Box<dyn QuotaStore>,
}

impl Collaborators {
    pub fn from_env(
        config: &EngineConfig,
        storage_root: impl Into<PathBuf>,
        public_base: &str,
        documents: DocumentStore,
    ) -> Result<Self> {
        Ok(Self {
            text: Box::new(OpenAiTextClient::from_env()?),
            images: Box::new(OpenAiImageClient::from_env(config.image_model.clone())?),
            lookup: Box::new(JournalLookupClient::from_env()),
            storage: Box::new(DirBucket::new(storage_root, public_base)),
            quota: Box::new(DocumentQuotaStore::new(documents)),
        })
    }

    pub fn dryrun(
        storage_root: impl Into<PathBuf>,
        public_base: &str,
        documents: DocumentStore,
    ) -> Self {
        Self {
            text: Box::new(DryrunTextClient),
            images: Box::new(DryrunImageClient),
            lookup: Box::new(DryrunLookupClient),
            storage: Box::new(DirBucket::new(storage_root, public_base)),
            quota: Box::new(DocumentQuotaStore::new(documents)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuidanceText {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

pub struct DreamEngine {
    config: EngineConfig,
    collaborators: Collaborators,
    aliases: AliasTable,
    limiter: RateLimiter,
    events: EventLog,
}

impl DreamEngine {
    pub fn new(
        config: EngineConfig,
        collaborators: Collaborators,
        limiter: RateLimiter,
        events: EventLog,
    ) -> Result<Self> {
        events.emit(
            "engine_started",
            map_object(json!({
                "text_model": &config.text_model,
                "image_model": &config.image_model,
            })),
        )?;
        Ok(Self {
            config,
            collaborators,
            aliases: AliasTable::new(),
            limiter,
            events,
        })
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// The multi-pass interpretation pipeline: extraction, fail-safe
    /// injection, aliased parallel lookup, language detection, context
    /// assembly, synthesis.
    pub fn interpret(
        &self,
        caller: Option<&str>,
        submission: &DreamSubmission,
    ) -> Result<InterpretationArtifact, WorkflowError> {
        self.limiter.check("interpret_dream", caller_key(caller))?;
        if submission.text.trim().is_empty() {
            return Err(WorkflowError::InvalidInput("dream_text"));
        }

        let mut symbols = self.extract_symbols(&submission.text);
        let injected = inject_missed_symbols(&self.aliases, &submission.text, &mut symbols);
        let _ = self.events.emit(
            "symbols_selected",
            map_object(json!({
                "symbols": &symbols,
                "injected": &injected,
            })),
        );

        let resolved = self.fetch_references(&symbols);
        let context = InterpretationContext::assemble(&resolved);
        let language = self.detect_language(&submission.text)?;
        let (artifact, usage) = self.synthesize(submission, &context, &language)?;

        let _ = self.events.emit(
            "interpretation_completed",
            map_object(json!({
                "language": language,
                "reference_blocks": context.blocks.len(),
                "usage": usage,
            })),
        );
        Ok(artifact)
    }

    /// The idempotent, quota-gated image workflow. Stage order and failure
    /// policy: preflight and quota failures are fatal and precede any
    /// generation spend; a transient idempotency-check error is a miss.
    pub fn generate_dream_image(
        &self,
        request: &ImageRequest,
    ) -> Result<ImageOutcome, WorkflowError> {
        let user_id = request.user_id.trim();
        self.limiter.check(
            "generate_dream_image",
            if user_id.is_empty() { "anonymous" } else { user_id },
        )?;
        if user_id.is_empty() {
            return Err(WorkflowError::Unauthenticated);
        }
        if request.dream_text.trim().is_empty() {
            return Err(WorkflowError::InvalidInput("dream_text"));
        }
        if request.dream_id.trim().is_empty() {
            return Err(WorkflowError::InvalidInput("dream_id"));
        }

        self.collaborators
            .storage
            .is_available()
            .map_err(WorkflowError::StorageUnavailable)?;

        let path = image_object_path(&self.config.storage_namespace, user_id, &request.dream_id);
        match self.collaborators.storage.exists(&path) {
            Ok(true) => {
                let image_url = self.collaborators.storage.public_url(&path);
                let _ = self
                    .events
                    .emit("image_cached", map_object(json!({ "path": &path })));
                return Ok(ImageOutcome::Cached { image_url });
            }
            Ok(false) => {}
            Err(err) => self.events.soft_fail("idempotency_check_failed", &err),
        }

        let date_key = utc_date_key();
        let record = self.collaborators.quota.read(user_id)?;
        if request.is_trial {
            if record.trial_exhausted() {
                let _ = self.events.emit(
                    "quota_rejected",
                    map_object(json!({ "kind": "trial_lifetime" })),
                );
                return Err(WorkflowError::TrialQuotaExhausted);
            }
        } else if record.daily_exhausted(&date_key) {
            let _ = self.events.emit(
                "quota_rejected",
                map_object(json!({ "kind": "daily", "date_key": date_key })),
            );
            return Err(WorkflowError::DailyQuotaExhausted);
        }

        let refined_prompt = self.refine_prompt(&request.dream_text)?;
        let bytes = self.collaborators.images.generate(&ImageGenRequest {
            prompt: refined_prompt.clone(),
            size: self.config.image_size.clone(),
            count: 1,
        })?;

        self.collaborators
            .storage
            .write_public(&path, &bytes, "image/png")?;
        let persisted = GeneratedImage {
            storage_path: path.clone(),
            public_url: self.collaborators.storage.public_url(&path),
            refined_prompt,
        };

        self.collaborators
            .quota
            .merge(user_id, &commit_merge(&date_key, &persisted.refined_prompt))?;
        let _ = self.events.emit(
            "image_persisted",
            map_object(json!({
                "path": &persisted.storage_path,
                "size_bytes": bytes.len(),
            })),
        );

        Ok(ImageOutcome::Generated {
            image_url: persisted.public_url,
            refined_prompt: persisted.refined_prompt,
        })
    }

    /// Single-call daily guidance tip in the hinted language.
    pub fn daily_tip(
        &self,
        caller: Option<&str>,
        language_hint: Option<&str>,
    ) -> Result<GuidanceText, WorkflowError> {
        self.limiter.check("daily_tip", caller_key(caller))?;
        let language = language_for_hint(language_hint);
        let response = self.collaborators.text.complete(&TextRequest {
            model: self.config.text_model.clone(),
            messages: vec![
                ChatMessage::system(daily_tip_prompt(language)),
                ChatMessage::user("Generate today's dream guidance tip."),
            ],
            temperature: 0.8,
            json_mode: false,
            max_tokens: Some(150),
        })?;
        let guidance = GuidanceText {
            text: response.content,
            usage: response.usage,
        };
        let _ = self.events.emit(
            "daily_tip_completed",
            map_object(json!({ "usage": &guidance.usage })),
        );
        Ok(guidance)
    }

    /// Weekly pattern analysis over the week's dream texts.
    pub fn weekly_patterns(
        &self,
        caller: Option<&str>,
        dreams: &[String],
        language_hint: Option<&str>,
    ) -> Result<GuidanceText, WorkflowError> {
        self.limiter.check("analyze_dreams", caller_key(caller))?;
        if dreams.is_empty() {
            return Err(WorkflowError::InvalidInput("dreams"));
        }
        let language = language_for_hint(language_hint);

        let mut slots = SlotValues::new();
        slots.insert("language".to_string(), language.to_string());
        if dreams.len() < 5 {
            slots.insert(
                "limited_note".to_string(),
                "Due to limited dream data, analysis is based on general trends.".to_string(),
            );
        }
        let system = weekly_patterns_template()
            .render(&slots)
            .map_err(WorkflowError::Internal)?;

        let response = self.collaborators.text.complete(&TextRequest {
            model: self.config.text_model.clone(),
            messages: vec![
                ChatMessage::system(system),
                ChatMessage::user(format!(
                    "Here are the dreams for the week:\n\n{}",
                    dreams.join("\n\n")
                )),
            ],
            temperature: 0.7,
            json_mode: false,
            max_tokens: None,
        })?;
        let guidance = GuidanceText {
            text: response.content,
            usage: response.usage,
        };
        let _ = self.events.emit(
            "analyze_dreams_completed",
            map_object(json!({ "dreams": dreams.len(), "usage": &guidance.usage })),
        );
        Ok(guidance)
    }

    /// Moon-phase correlation analysis over dated journal entries.
    pub fn moon_sync(
        &self,
        caller: Option<&str>,
        entries: &[MoonJournalEntry],
        language_hint: Option<&str>,
    ) -> Result<GuidanceText, WorkflowError> {
        self.limiter.check("moon_sync", caller_key(caller))?;
        if entries.is_empty() {
            return Err(WorkflowError::InvalidInput("dream_data"));
        }
        let language = language_for_hint(language_hint);

        let response = self.collaborators.text.complete(&TextRequest {
            model: self.config.text_model.clone(),
            messages: vec![
                ChatMessage::system(moon_sync_prompt(language)),
                ChatMessage::user(format!(
                    "Here is the dream journal data with moon phase and cosmic event info:\n\n{}",
                    moon_transcript(entries)
                )),
            ],
            temperature: 0.7,
            json_mode: false,
            max_tokens: None,
        })?;
        let guidance = GuidanceText {
            text: response.content,
            usage: response.usage,
        };
        let _ = self.events.emit(
            "moon_sync_completed",
            map_object(json!({ "entries": entries.len(), "usage": &guidance.usage })),
        );
        Ok(guidance)
    }

    /// Extraction is non-fatal: malformed or unparsable output yields an
    /// empty candidate list and an event, never an error.
    fn extract_symbols(&self, text: &str) -> Vec<String> {
        let request = TextRequest {
            model: self.config.text_model.clone(),
            messages: vec![
                ChatMessage::system(EXTRACTION_SYSTEM_PROMPT),
                ChatMessage::user(text),
            ],
            temperature: 0.1,
            json_mode: true,
            max_tokens: None,
        };
        let outcome = self
            .collaborators
            .text
            .complete(&request)
            .and_then(|response| parse_symbol_list(&response.content));
        match outcome {
            Ok(symbols) => symbols,
            Err(err) => {
                self.events.soft_fail("extraction_failed", &err);
                Vec::new()
            }
        }
    }

    /// Fan-out: one scoped thread per candidate, joined in spawn order so the
    /// fan-in order equals candidate order regardless of completion order.
    /// Each fetch is fault-isolated; failures become "no record".
    fn fetch_references(&self, symbols: &[String]) -> Vec<(String, Option<ReferenceRecord>)> {
        let outcomes: Vec<Result<Option<ReferenceRecord>>> = thread::scope(|scope| {
            let handles: Vec<_> = symbols
                .iter()
                .map(|symbol| {
                    let key = self.aliases.resolve(symbol);
                    let lookup = self.collaborators.lookup.as_ref();
                    scope.spawn(move || lookup.fetch(&key))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("lookup worker panicked")))
                })
                .collect()
        });

        symbols
            .iter()
            .zip(outcomes)
            .map(|(symbol, outcome)| {
                let record = match outcome {
                    Ok(record) => record,
                    Err(err) => {
                        let mut payload = EventPayload::new();
                        payload.insert("symbol".to_string(), Value::String(symbol.clone()));
                        payload.insert("error".to_string(), Value::String(format!("{err:#}")));
                        let _ = self.events.emit("lookup_failed", payload);
                        None
                    }
                };
                (symbol.clone(), record)
            })
            .collect()
    }

    fn detect_language(&self, text: &str) -> Result<String> {
        let response = self.collaborators.text.complete(&TextRequest {
            model: self.config.text_model.clone(),
            messages: vec![
                ChatMessage::system(LANGUAGE_DETECT_SYSTEM_PROMPT),
                ChatMessage::user(text),
            ],
            temperature: 0.0,
            json_mode: false,
            max_tokens: Some(20),
        })?;
        let language = response.content.trim().to_string();
        if language.is_empty() {
            bail!("language detection returned empty output");
        }
        Ok(language)
    }

    fn synthesize(
        &self,
        submission: &DreamSubmission,
        context: &InterpretationContext,
        language: &str,
    ) -> Result<(InterpretationArtifact, Option<TokenUsage>)> {
        let mut slots = SlotValues::new();
        slots.insert(
            "reference_section".to_string(),
            context.reference_section(),
        );
        slots.insert("dream_text".to_string(), submission.text.clone());
        if let Some(mood) = &submission.mood {
            slots.insert("mood".to_string(), mood.clone());
        }
        slots.insert("language".to_string(), language.to_string());
        if let Some(commentary) = &context.commentary {
            slots.insert("commentary_source".to_string(), commentary.clone());
        }
        let system = synthesis_template().render(&slots)?;

        let response = self.collaborators.text.complete(&TextRequest {
            model: self.config.text_model.clone(),
            messages: vec![
                ChatMessage::system(system),
                ChatMessage::user(format!("Interpret this dream in {language}.")),
            ],
            temperature: 0.7,
            json_mode: true,
            max_tokens: None,
        })?;

        let artifact = match serde_json::from_str::<Value>(&response.content) {
            Ok(payload) => InterpretationArtifact::resolve_defaults(&payload),
            Err(_) => InterpretationArtifact::fallback_from_text(&response.content),
        };
        Ok((artifact, response.usage))
    }

    fn refine_prompt(&self, dream_text: &str) -> Result<String> {
        let response = self.collaborators.text.complete(&TextRequest {
            model: self.config.text_model.clone(),
            messages: vec![
                ChatMessage::system(REFINE_SYSTEM_PROMPT),
                ChatMessage::user(format!("Dream: {dream_text}")),
            ],
            temperature: 1.0,
            json_mode: false,
            max_tokens: Some(300),
        })?;
        let refined = response.content.trim().to_string();
        if refined.is_empty() {
            bail!("prompt refinement returned empty output");
        }
        Ok(refined)
    }
}

fn caller_key(caller: Option<&str>) -> &str {
    caller
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("anonymous")
}

// ---------------------------------------------------------------------------
// prompts

const EXTRACTION_SYSTEM_PROMPT: &str = r#"Analyze the dream and extract 1-3 dominant symbols.
The dream may be in ANY language.

RULES:
1. EXTRACT ONLY **TANGIBLE NOUNS** (Objects, Animals, Places).
2. DO NOT extract abstract concepts (e.g., "Fear", "Running").
3. DO NOT extract verbs (e.g., "Chasing").
4. CONVERT to **UNIVERSAL ENGLISH KEYWORDS** (Singular, Uppercase).

Examples:
- "I was running from a big dog" -> { "symbols": ["DOG"] } (Ignore "Running")
- "Merdiven çıkıyordum ama yoruldum" -> { "symbols": ["STAIRS"] } (Ignore "Climbing", "Tired")
- "Dişlerim dökülüyordu" -> { "symbols": ["TEETH"] }

Output ONLY a valid JSON object with a "symbols" key."#;

const LANGUAGE_DETECT_SYSTEM_PROMPT: &str = "Detect the language of the following text. Respond with ONLY the language name in English (e.g., 'English', 'Turkish', 'Spanish', 'German', 'Portuguese', 'Dutch'). Nothing else.";

const REFINE_SYSTEM_PROMPT: &str = r#"You are an AI Art Director.

Transform the user's dream into an image-generation prompt using the following STRICT TEMPLATE.

TEMPLATE:
"Create a dreamlike color field composition with softly integrated silhouettes, interpreting the following dream through emotion, atmosphere, and symbolic presence rather than literal imagery.
Human and animal forms should appear as simple, indistinct silhouettes, gently blended into the scene, with no facial features, age, gender, or identifiable traits.
Convey a sense of place through layered color fields, soft depth, and gradual transitions of light, allowing the environment to feel spacious and immersive without concrete details.
Use natural asymmetry and subtle variation in scale and distance so figures feel part of a flowing dream space rather than arranged or posed.
The overall mood should remain calm, soothing, and quietly uplifting, with harmonious colors and balanced, organic composition that avoids darkness, sharp contrast, or unsettling imagery.
This image is a symbolic, emotional visualization of a dream, not a realistic scene: [INSERT CONCISE VISUAL SUMMARY OF DREAM HERE]"

INSTRUCTIONS:
1. Extract the key visual elements from the user's dream.
2. Insert them into the [INSERT CONCISE VISUAL SUMMARY OF DREAM HERE] slot.
3. Output ONLY the final populated prompt."#;

fn synthesis_template() -> PromptTemplate {
    PromptTemplate::new()
        .literal(
            "### ROLE\nYou are the resident Jungian dream analyst. Ground your reading in the \
             [REFERENCE DATA] whenever it is present; otherwise use your own Jungian knowledge.\n\
             For ascent dreams where the dreamer cannot move forward or stays stuck, read the \
             block as stalled life energy or effort channeled toward the wrong place, never as \
             plain failure.\n",
        )
        .section(
            "reference_section",
            PromptTemplate::new()
                .literal("\n")
                .slot("reference_section")
                .literal("\n"),
        )
        .literal("\n### DREAM\n\"")
        .slot("dream_text")
        .literal("\"\n")
        .section(
            "mood",
            PromptTemplate::new()
                .literal("Reported mood on waking: ")
                .slot("mood")
                .literal("\n"),
        )
        .literal(
            "\n### ANALYSIS RULES\n\
             1. Source check: compare the narrative with {SYM_SCENARIOS}; build on a matching \
             scenario, otherwise work from {SYM_BODY}. Put the encyclopedic {SYM_INTRO} text \
             into the \"definition\" field.\n\
             2. Present each symbol as a message from the unconscious and frame the dream as an \
             invitation to confrontation or inner transformation.\n\
             3. Length and structure (CRITICAL): \"definition\" is one or two sentences; \
             \"interpretation\" MUST be TWO paragraphs separated by a blank line (\\n\\n) and at \
             most 100 words in total.\n\
             4. Tone: mystical yet modern and clear, never judgmental. No markdown emphasis. \
             Never show the {SYM_...} tags to the reader.\n\
             5. Write every output field in ",
        )
        .slot("language")
        .literal(".\n")
        .section_or_else(
            "commentary_source",
            PromptTemplate::new()
                .literal(
                    "6. Translate the COMMENTARY SOURCE below into ",
                )
                .slot("language")
                .literal(
                    " — never leave it in its source language. Format it as one item per line, \
                     not prose, with moon-phase emoji (🌑 🌓 🌕 🌗) where phases appear; split it \
                     into short lines even when no phase is named.\n",
                ),
            PromptTemplate::new()
                .literal("6. There is no commentary source; set \"cosmicCommentary\" to null.\n"),
        )
        .literal(
            "\n### OUTPUT FORMAT (JSON)\nRespond with only this JSON object:\n{\n    \
             \"title\": \"Short, engaging title (in the output language)\",\n    \
             \"definition\": \"Concise symbol definition taken from {SYM_INTRO}\",\n    \
             \"interpretation\": \"Two paragraphs separated by \\n\\n\",\n    \
             \"cosmicCommentary\": \"Formatted line-per-item commentary, or null\"\n}\n",
        )
        .section(
            "commentary_source",
            PromptTemplate::new()
                .literal("\n### COMMENTARY SOURCE (translate and format)\n\"")
                .slot("commentary_source")
                .literal("\"\n"),
        )
}

fn daily_tip_prompt(language: &str) -> String {
    format!(
        "You are a gentle dream-guidance assistant.\n\n\
         Generate a single, short daily suggestion (\"Dream Tip\") for the user. This is NOT a \
         dream interpretation; it should feel supportive, reflective, and related to dream \
         awareness, emotional clarity, or inner exploration.\n\n\
         RULES:\n\
         - Warm, calm, inspirational tone; the tip must fit into 1-3 sentences.\n\
         - STRICT BAN: never use the words \"healing\", \"journey\", \"process\", \
         \"improvement\", \"step\", or \"grow\".\n\
         - Soft guidance only: no advice, instruction, diagnosis, or predictions, and no \
         language implying what the user should do, become, or change.\n\
         - Keep it an open-ended invitation (e.g., \"You might reflect on...\", \"Notice \
         how...\").\n\
         - Keep the suggestion actionable but light (journaling, reflection, breathing, \
         noticing emotions); nothing therapy-like or medical.\n\
         - Soft, poetic style suited to a dream-themed app; universal, never about the user's \
         specific life.\n\n\
         Reply in {language}."
    )
}

fn weekly_patterns_template() -> PromptTemplate {
    PromptTemplate::new()
        .literal(
            "You are a weekly dream-pattern analysis assistant. Look at all dreams provided for \
             the week and identify patterns, recurring themes, emotional trends, and symbolic \
             clusters. Stay calm, observational, and insightful.\n",
        )
        .section(
            "limited_note",
            PromptTemplate::new()
                .literal(
                    "\nLIMITED DATA RULE: fewer than five dreams were provided, so begin your \
                     analysis with this exact sentence: \"",
                )
                .slot("limited_note")
                .literal("\"\n"),
        )
        .literal(
            "\nRULES:\n\
             - Do NOT interpret dreams individually.\n\
             - Identify repeated themes, symbols, moods, or scenes across the week; describe how \
             feelings shift from one dream to the next; highlight subconscious tendencies and \
             symbolic clusters that appear in multiple dreams.\n\
             - STRICTLY FORBIDDEN: advice, instruction, prediction, or diagnosis. Every \
             observation stays descriptive, never prescriptive.\n\
             - Speak DIRECTLY to the reader as \"you/your\"; never refer to them in the third \
             person.\n\
             - No bold markup and no bullet points; every section is flowing prose.\n\n\
             OUTPUT STRUCTURE (STRICT MARKDOWN): use \"### n)\" headers, in this order:\n\
             ### 1) RECURRING THEMES\n\
             ### 2) EMOTIONAL CYCLES\n\
             ### 3) SUBCONSCIOUS TENDENCIES\n\
             ### 4) SYMBOL NETWORK\n\
             ### 5) WEEKLY SUMMARY\n\
             ### 6) AWARENESS TIP\n\n\
             Your response must be in ",
        )
        .slot("language")
        .literal(".")
}

fn moon_sync_prompt(language: &str) -> String {
    format!(
        "You are a cosmic dream-analysis assistant specializing in moon-phase correlations and \
         astronomical events.\n\n\
         You will receive dream journal data with moon phase, astronomical events (Super Moon, \
         Blood Moon, eclipses — CRITICAL if present), vividness, mood and intensity, word \
         count, and the dream text. Connect the dreamer's subconscious state to the lunar \
         cycle.\n\n\
         SECTIONS (use \"### n)\" headers):\n\
         ### 1) MOON PHASE IMPACT — the dominant phase of the period, its known psychological \
         effects, connected to the recorded moods and intensity.\n\
         ### 2) COSMIC & ASTRONOMICAL EVENTS — when special events appear in the data they MUST \
         be the focus here, correlated with vividness and intensity; otherwise discuss the \
         general lunar flow between phases.\n\
         ### 3) DREAM INTENSITY & CLARITY — analyze the triad of word count, mood intensity, \
         and vividness; never quote numeric scales, use descriptive words (Light, Moderate, \
         Deep, Intense; Vague, Hazy, Clear, Vivid).\n\
         ### 4) COSMIC INSIGHTS — synthesize themes, phases, events, and emotion into the \
         period's underlying message.\n\
         ### 5) LUNAR GUIDANCE — one specific, actionable alignment practice fitting the \
         current phase and the dreamer's state.\n\n\
         TONE: gentle, mystical but grounded, non-judgmental. Address the dreamer directly as \
         \"you\"; never \"the user\" or \"the dreamer\". Flowing paragraphs, no bullet points, \
         no bold text.\n\n\
         Write in {language}."
    )
}

fn moon_transcript(entries: &[MoonJournalEntry]) -> String {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let events = if entry.astronomical_events.is_empty() {
                "None".to_string()
            } else {
                entry.astronomical_events.join(", ")
            };
            let date = entry.date.split('T').next().unwrap_or(entry.date.as_str());
            format!(
                "Dream {} ({}):\nPhase: {} ({})\nCosmic Events: {}\nMood: {} (Intensity: {}/3)\n\
                 Vividness: {}/3\nWord Count: {}\nContent: {}",
                index + 1,
                date,
                entry.moon_phase,
                if entry.is_waxing { "Waxing" } else { "Waning" },
                events,
                entry.mood,
                entry.mood_intensity,
                entry.vividness,
                entry.word_count,
                truncate_text(&entry.text, 300),
            )
        })
        .collect::<Vec<String>>()
        .join("\n\n")
}

// ---------------------------------------------------------------------------
// helpers

/// Accepts `{"symbols": [...]}` (or the `keywords` spelling, or a bare
/// array), normalizes to uppercase, dedupes, and caps at the candidate limit.
fn parse_symbol_list(content: &str) -> Result<Vec<String>> {
    let parsed: Value =
        serde_json::from_str(content).context("extraction returned invalid JSON")?;
    let rows = if let Some(rows) = parsed.as_array() {
        rows.clone()
    } else {
        parsed
            .get("symbols")
            .or_else(|| parsed.get("keywords"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };

    let mut symbols: Vec<String> = Vec::new();
    for row in rows {
        let Some(term) = row.as_str() else { continue };
        let normalized = term.trim().to_uppercase();
        if normalized.is_empty() || symbols.contains(&normalized) {
            continue;
        }
        symbols.push(normalized);
        if symbols.len() == MAX_SYMBOLS {
            break;
        }
    }
    Ok(symbols)
}

fn openai_api_base() -> String {
    non_empty_env("REVERIE_OPENAI_API_BASE")
        .or_else(|| non_empty_env("OPENAI_API_BASE"))
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
}

fn openai_api_key() -> Option<String> {
    non_empty_env("OPENAI_API_KEY").or_else(|| non_empty_env("OPENAI_API_KEY_BACKUP"))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn response_json_or_error(collaborator: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{collaborator} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{collaborator} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{collaborator} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn parse_dims(size: &str) -> (u32, u32) {
    let mut parts = size.split('x');
    let width = parts.next().and_then(|value| value.parse().ok());
    let height = parts.next().and_then(|value| value.parse().ok());
    match (width, height) {
        (Some(width), Some(height)) => (width, height),
        _ => (1024, 1024),
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn short_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
