use std::collections::BTreeMap;
use std::env;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use image::{DynamicImage, Rgb, RgbImage};
use reqwest::Client as HttpClient;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use uuid::Uuid;

use mirage_contracts::credentials::{mask, CredentialResolver, CredentialStore};
use mirage_contracts::errors::GenerationError;
use mirage_contracts::events::{EventPayload, EventWriter};
use mirage_contracts::generations::{
    GeneratedImage, GenerationRecord, GenerationStore, ImageGeneration, LoadingGeneration,
    MediaItem, MediaKind, StoreMutation, VideoGeneration,
};
use mirage_contracts::models::{
    MediaModelSelector, CAP_IMAGE, CAP_IMAGE_TO_VIDEO, CAP_TEXT_TO_VIDEO,
};

/// The image model rejects prompts longer than this.
pub const IMAGE_PROMPT_LIMIT: usize = 512;

const IMAGE_SAMPLE_COUNT: u64 = 2;
const VIDEO_SAMPLE_COUNT: u64 = 2;
const VIDEO_ASPECT_RATIO: &str = "16:9";
const DRYRUN_IMAGE_DIM: u32 = 256;

#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub backoff: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(15),
            backoff: Duration::from_secs(1),
        }
    }
}

/// Execute a request with a per-attempt timeout and exponential backoff.
///
/// Client errors (4xx) and successes return immediately; a timeout is
/// terminal and never retried; only 5xx responses and transport failures
/// are retried. Exhausting the attempt budget surfaces the last error.
pub async fn fetch_with_retry(
    client: &HttpClient,
    request: reqwest::Request,
    options: &RetryOptions,
) -> Result<reqwest::Response, GenerationError> {
    let max_attempts = options.max_attempts.max(1);
    let mut last_error = GenerationError::Network("request was never attempted".to_string());

    for attempt in 1..=max_attempts {
        let Some(attempt_request) = request.try_clone() else {
            return Err(GenerationError::Network(
                "request body is not replayable".to_string(),
            ));
        };

        match tokio::time::timeout(options.timeout, client.execute(attempt_request)).await {
            Err(_) => return Err(GenerationError::Timeout),
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                if status < 500 {
                    return Ok(response);
                }
                let body = response.text().await.unwrap_or_default();
                last_error = GenerationError::Provider {
                    status,
                    message: truncate_text(&body, 512),
                };
            }
            Ok(Err(err)) => {
                last_error = GenerationError::Network(err.to_string());
            }
        }

        if attempt < max_attempts {
            let delay = options.backoff * 2u32.pow(attempt - 1);
            tokio::time::sleep(delay).await;
        }
    }

    Err(last_error)
}

async fn response_json_or_error(
    provider: &str,
    response: reqwest::Response,
) -> Result<Value, GenerationError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().await.map_err(|err| {
        GenerationError::Network(format!("{provider} response body read failed: {err}"))
    })?;
    if !status.is_success() {
        return Err(GenerationError::Provider {
            status: code,
            message: truncate_text(&body, 512),
        });
    }
    serde_json::from_str(&body).map_err(|_| GenerationError::Provider {
        status: code,
        message: format!("{provider} returned invalid JSON payload"),
    })
}

/// Transient handle for a provider-side long-running video job. Owned by the
/// poller for the duration of one request; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub name: String,
    pub done: bool,
    pub video_uris: Vec<String>,
}

impl Operation {
    fn from_payload(payload: &Value, fallback_name: &str) -> Self {
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(fallback_name)
            .to_string();
        let done = payload.get("done").and_then(Value::as_bool).unwrap_or(false);
        let mut video_uris = Vec::new();
        extract_video_uris(payload, &mut video_uris);
        Self {
            name,
            done,
            video_uris,
        }
    }
}

fn extract_video_uris(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Array(rows) => {
            for row in rows {
                extract_video_uris(row, out);
            }
        }
        Value::Object(obj) => {
            if let Some(uri) = obj
                .get("uri")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
            {
                if !out.iter().any(|existing| existing == uri) {
                    out.push(uri.to_string());
                }
            }
            for key in [
                "response",
                "generateVideoResponse",
                "generatedSamples",
                "generatedVideos",
                "videos",
                "video",
            ] {
                if let Some(nested) = obj.get(key) {
                    extract_video_uris(nested, out);
                }
            }
        }
        _ => {}
    }
}

/// External generation endpoints, grouped per hosting provider.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_images(
        &self,
        model: &str,
        prompt: &str,
        api_key: &str,
    ) -> Result<Vec<GeneratedImage>, GenerationError>;

    async fn start_video(
        &self,
        model: &str,
        prompt: &str,
        source_image: Option<&str>,
        api_key: &str,
    ) -> Result<Operation, GenerationError>;

    async fn fetch_operation(
        &self,
        operation_name: &str,
        api_key: &str,
    ) -> Result<Operation, GenerationError>;
}

#[derive(Default)]
pub struct MediaProviderRegistry {
    providers: BTreeMap<String, Box<dyn MediaProvider>>,
}

impl MediaProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: MediaProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn MediaProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_media_provider_registry() -> MediaProviderRegistry {
    let mut providers = MediaProviderRegistry::new();
    providers.register(DryrunProvider);
    providers.register(GoogleMediaProvider::new());
    providers
}

/// Google generative-media transport: Imagen predict for images, Veo
/// predictLongRunning plus operation GETs for video. The key travels as the
/// `key` query parameter on every call.
pub struct GoogleMediaProvider {
    api_base: String,
    http: HttpClient,
    retry: RetryOptions,
}

impl GoogleMediaProvider {
    pub fn new() -> Self {
        let api_base = env::var("MIRAGE_API_BASE")
            .ok()
            .or_else(|| env::var("GEMINI_API_BASE").ok())
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string());
        Self::with_base(api_base)
    }

    pub fn with_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
            retry: RetryOptions::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    fn predict_endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:predict", self.api_base, model)
    }

    fn long_running_endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:predictLongRunning", self.api_base, model)
    }

    fn operation_endpoint(&self, operation_name: &str) -> String {
        format!("{}/{}", self.api_base, operation_name.trim_start_matches('/'))
    }

    fn extract_predictions(response_payload: &Value) -> Vec<(String, Option<String>)> {
        let mut out = Vec::new();
        let predictions = response_payload
            .get("predictions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for row in predictions {
            let Some(obj) = row.as_object() else {
                continue;
            };
            if let Some(encoded) = obj
                .get("bytesBase64Encoded")
                .or_else(|| obj.get("bytes_base64_encoded"))
                .and_then(Value::as_str)
            {
                out.push((
                    encoded.to_string(),
                    obj.get("mimeType")
                        .or_else(|| obj.get("mime_type"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                ));
                continue;
            }

            let generated = obj
                .get("image")
                .and_then(Value::as_object)
                .or_else(|| obj.get("generatedImage").and_then(Value::as_object))
                .cloned()
                .unwrap_or_default();
            if let Some(encoded) = generated
                .get("imageBytes")
                .or_else(|| generated.get("bytesBase64Encoded"))
                .and_then(Value::as_str)
            {
                out.push((
                    encoded.to_string(),
                    generated
                        .get("mimeType")
                        .or_else(|| generated.get("mime_type"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                ));
            }
        }
        out
    }
}

impl Default for GoogleMediaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaProvider for GoogleMediaProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn generate_images(
        &self,
        model: &str,
        prompt: &str,
        api_key: &str,
    ) -> Result<Vec<GeneratedImage>, GenerationError> {
        let endpoint = self.predict_endpoint(model);
        let payload = json!({
            "instances": [{
                "prompt": prompt,
            }],
            "parameters": {
                "sampleCount": IMAGE_SAMPLE_COUNT,
            },
        });
        let request = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .json(&payload)
            .build()
            .map_err(|err| GenerationError::Network(err.to_string()))?;
        let response = fetch_with_retry(&self.http, request, &self.retry).await?;
        let response_payload = response_json_or_error("Imagen", response).await?;

        let images: Vec<GeneratedImage> = Self::extract_predictions(&response_payload)
            .into_iter()
            .map(|(encoded, mime)| GeneratedImage {
                url: data_url(mime.as_deref().unwrap_or("image/png"), &encoded),
                raw_bytes: Some(encoded),
                is_sample: false,
            })
            .collect();
        if images.is_empty() {
            return Err(GenerationError::Provider {
                status: 500,
                message: "Imagen returned no images".to_string(),
            });
        }
        Ok(images)
    }

    async fn start_video(
        &self,
        model: &str,
        prompt: &str,
        source_image: Option<&str>,
        api_key: &str,
    ) -> Result<Operation, GenerationError> {
        let endpoint = self.long_running_endpoint(model);
        let mut instance = Map::new();
        instance.insert("prompt".to_string(), Value::String(prompt.to_string()));
        if let Some(encoded) = source_image {
            instance.insert(
                "image".to_string(),
                json!({
                    "bytesBase64Encoded": encoded,
                    "mimeType": "image/png",
                }),
            );
        }
        let payload = json!({
            "instances": [Value::Object(instance)],
            "parameters": {
                "aspectRatio": VIDEO_ASPECT_RATIO,
                "sampleCount": VIDEO_SAMPLE_COUNT,
            },
        });
        let request = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .json(&payload)
            .build()
            .map_err(|err| GenerationError::Network(err.to_string()))?;
        let response = fetch_with_retry(&self.http, request, &self.retry).await?;
        let response_payload = response_json_or_error("Veo", response).await?;

        let operation = Operation::from_payload(&response_payload, "");
        if operation.name.is_empty() && !operation.done {
            return Err(GenerationError::Provider {
                status: 500,
                message: "Veo did not return an operation handle".to_string(),
            });
        }
        Ok(operation)
    }

    async fn fetch_operation(
        &self,
        operation_name: &str,
        api_key: &str,
    ) -> Result<Operation, GenerationError> {
        let endpoint = self.operation_endpoint(operation_name);
        let request = self
            .http
            .get(&endpoint)
            .query(&[("key", api_key)])
            .build()
            .map_err(|err| GenerationError::Network(err.to_string()))?;
        let response = fetch_with_retry(&self.http, request, &self.retry).await?;
        let response_payload = response_json_or_error("Veo poll", response).await?;
        Ok(Operation::from_payload(&response_payload, operation_name))
    }
}

/// Offline stand-in: deterministic placeholder images derived from the
/// prompt, and video operations that complete on the first status check.
/// Keeps studio sessions usable without a key and engine tests hermetic.
pub struct DryrunProvider;

impl DryrunProvider {
    fn video_uris(tag: &str) -> Vec<String> {
        (0..VIDEO_SAMPLE_COUNT)
            .map(|index| format!("https://dryrun.invalid/videos/{tag}-{index}.mp4?sig=local"))
            .collect()
    }
}

#[async_trait]
impl MediaProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn generate_images(
        &self,
        _model: &str,
        prompt: &str,
        _api_key: &str,
    ) -> Result<Vec<GeneratedImage>, GenerationError> {
        let mut images = Vec::new();
        for index in 0..IMAGE_SAMPLE_COUNT {
            let color = color_from_prompt(prompt, index);
            let bytes = encode_placeholder_png(DRYRUN_IMAGE_DIM, DRYRUN_IMAGE_DIM, color)?;
            let encoded = BASE64.encode(&bytes);
            images.push(GeneratedImage {
                url: data_url("image/png", &encoded),
                raw_bytes: Some(encoded),
                is_sample: false,
            });
        }
        Ok(images)
    }

    async fn start_video(
        &self,
        _model: &str,
        prompt: &str,
        _source_image: Option<&str>,
        _api_key: &str,
    ) -> Result<Operation, GenerationError> {
        let tag = short_id(prompt);
        Ok(Operation {
            name: format!("operations/dryrun-{tag}"),
            done: true,
            video_uris: Self::video_uris(&tag),
        })
    }

    async fn fetch_operation(
        &self,
        operation_name: &str,
        _api_key: &str,
    ) -> Result<Operation, GenerationError> {
        let tag = operation_name
            .rsplit('-')
            .next()
            .unwrap_or("local")
            .to_string();
        Ok(Operation {
            name: operation_name.to_string(),
            done: true,
            video_uris: Self::video_uris(&tag),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        // 60 checks 10 seconds apart: a 10-minute budget.
        Self {
            interval: Duration::from_secs(10),
            max_attempts: 60,
        }
    }
}

/// Drive a long-running operation to completion: wait, re-query, repeat.
///
/// Suspends only the calling task. Returns the bare video URIs on success;
/// exhausting the attempt budget while the job is still pending is a
/// `PollTimeout`, distinct from transport failures so callers can offer
/// resubmission.
pub async fn poll_operation(
    provider: &dyn MediaProvider,
    mut operation: Operation,
    api_key: &str,
    config: &PollerConfig,
    events: &EventWriter,
    record_id: Uuid,
) -> Result<Vec<String>, GenerationError> {
    let mut attempts = 0u32;
    while !operation.done && attempts < config.max_attempts {
        tokio::time::sleep(config.interval).await;
        operation = provider.fetch_operation(&operation.name, api_key).await?;
        attempts += 1;
        emit_or_warn(
            events,
            "poll_attempt",
            json_object(json!({
                "record_id": record_id.to_string(),
                "attempt": attempts,
                "done": operation.done,
            })),
        );
    }
    if !operation.done {
        return Err(GenerationError::PollTimeout { attempts });
    }
    Ok(operation.video_uris)
}

/// Append the retrieval key the host requires for authenticated media
/// fetches. The keyed URL stays inside the in-memory record; logs carry the
/// bare URI only.
pub fn keyed_media_url(uri: &str, api_key: &str) -> String {
    let separator = if uri.contains('?') { '&' } else { '?' };
    format!("{uri}{separator}key={api_key}")
}

/// Drop the retrieval key from a keyed URL, for summaries and logs.
pub fn strip_key_param(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.starts_with("key="))
        .collect();
    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", kept.join("&"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Image,
    TextToVideo,
    ImageToVideo,
}

impl RequestKind {
    pub fn capability(&self) -> &'static str {
        match self {
            Self::Image => CAP_IMAGE,
            Self::TextToVideo => CAP_TEXT_TO_VIDEO,
            Self::ImageToVideo => CAP_IMAGE_TO_VIDEO,
        }
    }

    pub fn media_kind(&self) -> MediaKind {
        match self {
            Self::Image => MediaKind::Image,
            Self::TextToVideo | Self::ImageToVideo => MediaKind::Video,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::TextToVideo => "video",
            Self::ImageToVideo => "image-video",
        }
    }
}

/// A source frame for image-to-video conversion: a display reference plus
/// the base64 payload the provider consumes.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub reference: String,
    pub bytes: String,
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub kind: RequestKind,
    pub prompt: String,
    pub source_image: Option<SourceImage>,
}

impl DispatchRequest {
    pub fn image(prompt: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Image,
            prompt: prompt.into(),
            source_image: None,
        }
    }

    pub fn text_to_video(prompt: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::TextToVideo,
            prompt: prompt.into(),
            source_image: None,
        }
    }

    pub fn image_to_video(prompt: impl Into<String>, source: SourceImage) -> Self {
        Self {
            kind: RequestKind::ImageToVideo,
            prompt: prompt.into(),
            source_image: Some(source),
        }
    }
}

/// Handle to one dispatched generation: the record id already visible in the
/// store, and the task driving the request to its terminal state. Dropping
/// the handle does not cancel the task.
#[derive(Debug)]
pub struct DispatchTicket {
    pub id: Uuid,
    pub handle: JoinHandle<Result<(), GenerationError>>,
}

pub struct SessionOptions {
    pub events: EventWriter,
    pub credentials: CredentialResolver,
    pub registry: MediaProviderRegistry,
    pub selector: MediaModelSelector,
    pub poller: PollerConfig,
    pub image_model: Option<String>,
    pub video_model: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            events: EventWriter::disabled(format!("studio-{}", Uuid::new_v4())),
            credentials: CredentialResolver::new(CredentialStore::new()),
            registry: default_media_provider_registry(),
            selector: MediaModelSelector::new(None),
            poller: PollerConfig::default(),
            image_model: None,
            video_model: None,
        }
    }
}

struct SessionShared {
    store: Mutex<GenerationStore>,
    credentials: CredentialResolver,
    registry: MediaProviderRegistry,
    selector: MediaModelSelector,
    poller: PollerConfig,
    events: EventWriter,
    image_model: Mutex<Option<String>>,
    video_model: Mutex<Option<String>>,
}

/// One studio session: the generation lifecycle store plus the dispatcher
/// that feeds it. Cloning shares the session.
#[derive(Clone)]
pub struct StudioSession {
    shared: Arc<SessionShared>,
}

impl StudioSession {
    pub fn new(options: SessionOptions) -> anyhow::Result<Self> {
        let session = Self {
            shared: Arc::new(SessionShared {
                store: Mutex::new(GenerationStore::new()),
                credentials: options.credentials,
                registry: options.registry,
                selector: options.selector,
                poller: options.poller,
                events: options.events,
                image_model: Mutex::new(options.image_model),
                video_model: Mutex::new(options.video_model),
            }),
        };
        session.shared.events.emit(
            "session_started",
            json_object(json!({
                "providers": session.shared.registry.names(),
            })),
        )?;
        Ok(session)
    }

    pub fn events(&self) -> &EventWriter {
        &self.shared.events
    }

    pub fn credentials(&self) -> &CredentialResolver {
        &self.shared.credentials
    }

    pub fn emit_event(&self, event_type: &str, payload: EventPayload) {
        emit_or_warn(&self.shared.events, event_type, payload);
    }

    pub fn set_image_model(&self, model: Option<String>) {
        *lock(&self.shared.image_model) = model;
    }

    pub fn image_model(&self) -> Option<String> {
        lock(&self.shared.image_model).clone()
    }

    pub fn set_video_model(&self, model: Option<String>) {
        *lock(&self.shared.video_model) = model;
    }

    pub fn video_model(&self) -> Option<String> {
        lock(&self.shared.video_model).clone()
    }

    /// Append sample records behind live ones, so a fresh session opens with
    /// a populated feed.
    pub fn seed_samples(&self, records: Vec<GenerationRecord>) {
        lock(&self.shared.store).seed(records);
    }

    pub fn snapshot(&self) -> Vec<GenerationRecord> {
        lock(&self.shared.store).iter().cloned().collect()
    }

    pub fn record(&self, id: Uuid) -> Option<GenerationRecord> {
        lock(&self.shared.store).get(id).cloned()
    }

    pub fn media_items(&self) -> Vec<MediaItem> {
        lock(&self.shared.store).project_media_items()
    }

    pub fn locate(&self, record_id: Uuid, item_index: usize) -> Result<usize, GenerationError> {
        lock(&self.shared.store).locate(record_id, item_index)
    }

    /// Validate, insert the loading placeholder, then launch the remote call
    /// as its own task. The placeholder is in the store before this returns,
    /// so readers see the request immediately.
    pub fn dispatch(&self, request: DispatchRequest) -> Result<DispatchTicket, GenerationError> {
        let prompt = request.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(GenerationError::empty_prompt());
        }
        if request.kind == RequestKind::Image && prompt.chars().count() > IMAGE_PROMPT_LIMIT {
            return Err(GenerationError::prompt_too_long(IMAGE_PROMPT_LIMIT));
        }
        if request.kind == RequestKind::ImageToVideo && request.source_image.is_none() {
            return Err(GenerationError::missing_source_image());
        }

        let Some(api_key) = self.shared.credentials.resolve() else {
            return Err(GenerationError::CredentialMissing);
        };

        let requested_model = match request.kind {
            RequestKind::Image => self.image_model(),
            RequestKind::TextToVideo | RequestKind::ImageToVideo => self.video_model(),
        };
        let selection = self
            .shared
            .selector
            .select(requested_model.as_deref(), request.kind.capability())
            .map_err(|message| GenerationError::Provider {
                status: 500,
                message,
            })?;
        if self.shared.registry.get(&selection.model.provider).is_none() {
            return Err(GenerationError::Provider {
                status: 500,
                message: format!("no provider registered for '{}'", selection.model.provider),
            });
        }

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let model = selection.model.name.clone();
        let provider_name = selection.model.provider.clone();
        let source_reference = request
            .source_image
            .as_ref()
            .map(|source| source.reference.clone());
        lock(&self.shared.store).insert(GenerationRecord::Loading(LoadingGeneration {
            id,
            prompt: prompt.clone(),
            kind: request.kind.media_kind(),
            created_at,
            source_image: source_reference.clone(),
        }));
        emit_or_warn(
            &self.shared.events,
            "generation_requested",
            json_object(json!({
                "record_id": id.to_string(),
                "kind": request.kind.as_str(),
                "model": model,
                "provider": provider_name,
                "fallback_reason": selection.fallback_reason,
                "prompt_chars": prompt.chars().count(),
                "api_key": mask(&api_key),
            })),
        );

        let shared = Arc::clone(&self.shared);
        let kind = request.kind;
        let source_image = request.source_image;
        let handle = tokio::spawn(async move {
            let outcome = run_generation(
                &shared,
                id,
                kind,
                &model,
                &provider_name,
                &prompt,
                source_image.as_ref(),
                source_reference,
                created_at,
                &api_key,
            )
            .await;
            settle_generation(&shared, id, kind, outcome)
        });

        Ok(DispatchTicket { id, handle })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_generation(
    shared: &Arc<SessionShared>,
    id: Uuid,
    kind: RequestKind,
    model: &str,
    provider_name: &str,
    prompt: &str,
    source_image: Option<&SourceImage>,
    source_reference: Option<String>,
    created_at: chrono::DateTime<Utc>,
    api_key: &str,
) -> Result<GenerationRecord, GenerationError> {
    let provider = shared
        .registry
        .get(provider_name)
        .ok_or_else(|| GenerationError::Provider {
            status: 500,
            message: format!("no provider registered for '{provider_name}'"),
        })?;

    match kind {
        RequestKind::Image => {
            let images = provider.generate_images(model, prompt, api_key).await?;
            Ok(GenerationRecord::Image(ImageGeneration {
                id,
                prompt: prompt.to_string(),
                created_at,
                images,
            }))
        }
        RequestKind::TextToVideo | RequestKind::ImageToVideo => {
            let operation = provider
                .start_video(
                    model,
                    prompt,
                    source_image.map(|source| source.bytes.as_str()),
                    api_key,
                )
                .await?;
            let uris = poll_operation(
                provider,
                operation,
                api_key,
                &shared.poller,
                &shared.events,
                id,
            )
            .await?;
            if uris.is_empty() {
                return Err(GenerationError::Provider {
                    status: 500,
                    message: "Veo returned no video URIs".to_string(),
                });
            }
            let videos = uris
                .iter()
                .map(|uri| keyed_media_url(uri, api_key))
                .collect();
            Ok(GenerationRecord::Video(VideoGeneration {
                id,
                prompt: prompt.to_string(),
                created_at,
                videos,
                source_image: source_reference,
            }))
        }
    }
}

/// Apply the terminal mutation for a finished task: replace the loading
/// record on success, remove it on failure. The one place a record changes
/// after insertion.
fn settle_generation(
    shared: &Arc<SessionShared>,
    id: Uuid,
    kind: RequestKind,
    outcome: Result<GenerationRecord, GenerationError>,
) -> Result<(), GenerationError> {
    match outcome {
        Ok(terminal) => {
            let media_count = terminal.media_len();
            let mutation = lock(&shared.store).transition(id, terminal);
            if mutation == StoreMutation::MissingId {
                emit_or_warn(
                    &shared.events,
                    "store_inconsistency",
                    json_object(json!({
                        "record_id": id.to_string(),
                        "operation": "transition",
                    })),
                );
            }
            emit_or_warn(
                &shared.events,
                "generation_completed",
                json_object(json!({
                    "record_id": id.to_string(),
                    "kind": kind.as_str(),
                    "media_count": media_count,
                })),
            );
            Ok(())
        }
        Err(error) => {
            let mutation = lock(&shared.store).remove(id);
            if mutation == StoreMutation::MissingId {
                emit_or_warn(
                    &shared.events,
                    "store_inconsistency",
                    json_object(json!({
                        "record_id": id.to_string(),
                        "operation": "remove",
                    })),
                );
            }
            emit_or_warn(
                &shared.events,
                "generation_failed",
                json_object(json!({
                    "record_id": id.to_string(),
                    "kind": kind.as_str(),
                    "status": error.status_code(),
                    "credential_failure": error.is_credential_failure(),
                    "error": error.to_string(),
                })),
            );
            Err(error)
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn emit_or_warn(events: &EventWriter, event_type: &str, payload: EventPayload) {
    if let Err(err) = events.emit(event_type, payload) {
        eprintln!("mirage: event write failed ({event_type}): {err:#}");
    }
}

fn json_object(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

fn data_url(mime: &str, encoded: &str) -> String {
    format!("data:{mime};base64,{encoded}")
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn color_from_prompt(prompt: &str, index: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(index.to_le_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn short_id(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    hex::encode(&digest[..4])
}

fn encode_placeholder_png(
    width: u32,
    height: u32,
    color: (u8, u8, u8),
) -> Result<Vec<u8>, GenerationError> {
    let canvas = RgbImage::from_pixel(width, height, Rgb([color.0, color.1, color.2]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|err| GenerationError::Provider {
            status: 500,
            message: format!("placeholder image encode failed: {err}"),
        })?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use mirage_contracts::credentials::{CredentialResolver, CredentialStore};
    use mirage_contracts::errors::GenerationError;
    use mirage_contracts::events::EventWriter;
    use mirage_contracts::generations::{GeneratedImage, GenerationRecord, MediaKind};
    use mirage_contracts::models::MediaModelSelector;

    use super::{
        default_media_provider_registry, fetch_with_retry, keyed_media_url, poll_operation,
        strip_key_param, DispatchRequest, DryrunProvider, GoogleMediaProvider, MediaProvider,
        MediaProviderRegistry, Operation, PollerConfig, RetryOptions, SessionOptions, SourceImage,
        StudioSession,
    };

    fn quick_retry() -> RetryOptions {
        RetryOptions {
            max_attempts: 3,
            timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(20),
        }
    }

    fn quick_poller() -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(1),
            max_attempts: 60,
        }
    }

    fn session_with(
        registry: MediaProviderRegistry,
        key: Option<&str>,
    ) -> anyhow::Result<StudioSession> {
        let credentials = CredentialResolver::with_default(
            CredentialStore::new(),
            key.map(str::to_string),
        );
        StudioSession::new(SessionOptions {
            credentials,
            registry,
            selector: MediaModelSelector::new(None),
            poller: quick_poller(),
            events: EventWriter::disabled("studio-test"),
            image_model: None,
            video_model: None,
        })
    }

    /// Scripted provider: two images per request, operations that finish
    /// after a configurable number of status checks.
    struct ScriptedProvider {
        image_calls: Arc<AtomicU32>,
        poll_calls: Arc<AtomicU32>,
        done_after: Option<u32>,
        fail_images: bool,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                image_calls: Arc::new(AtomicU32::new(0)),
                poll_calls: Arc::new(AtomicU32::new(0)),
                done_after: Some(1),
                fail_images: false,
                gate: None,
            }
        }

        fn never_done() -> Self {
            Self {
                done_after: None,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl MediaProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "google"
        }

        async fn generate_images(
            &self,
            _model: &str,
            prompt: &str,
            _api_key: &str,
        ) -> Result<Vec<GeneratedImage>, GenerationError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.image_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_images {
                return Err(GenerationError::Provider {
                    status: 500,
                    message: "scripted failure".to_string(),
                });
            }
            Ok((0..2)
                .map(|index| GeneratedImage {
                    url: format!("data:image/png;base64,{prompt}-{index}"),
                    raw_bytes: Some(format!("{prompt}-{index}")),
                    is_sample: false,
                })
                .collect())
        }

        async fn start_video(
            &self,
            _model: &str,
            _prompt: &str,
            _source_image: Option<&str>,
            _api_key: &str,
        ) -> Result<Operation, GenerationError> {
            Ok(Operation {
                name: "operations/scripted-1".to_string(),
                done: false,
                video_uris: Vec::new(),
            })
        }

        async fn fetch_operation(
            &self,
            operation_name: &str,
            _api_key: &str,
        ) -> Result<Operation, GenerationError> {
            let calls = self.poll_calls.fetch_add(1, Ordering::SeqCst) + 1;
            let done = self.done_after.map(|after| calls >= after).unwrap_or(false);
            Ok(Operation {
                name: operation_name.to_string(),
                done,
                video_uris: if done {
                    vec![
                        "https://host/videos/a?alt=media".to_string(),
                        "https://host/videos/b?alt=media".to_string(),
                    ]
                } else {
                    Vec::new()
                },
            })
        }
    }

    fn registry_of(provider: ScriptedProvider) -> MediaProviderRegistry {
        let mut registry = MediaProviderRegistry::new();
        registry.register(provider);
        registry
    }

    // --- resilient fetch ---

    #[tokio::test]
    async fn fetch_retries_server_errors_then_succeeds() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let request = client.get(format!("{}/flaky", server.uri())).build()?;
        let options = quick_retry();

        let started = Instant::now();
        let response = fetch_with_retry(&client, request, &options).await?;
        assert_eq!(response.status().as_u16(), 200);
        // Two failures mean two backoff waits: 20ms + 40ms.
        assert!(started.elapsed() >= Duration::from_millis(60));
        Ok(())
    }

    #[tokio::test]
    async fn fetch_returns_client_errors_without_retry() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let request = client.get(format!("{}/bad", server.uri())).build()?;
        let response = fetch_with_retry(&client, request, &quick_retry()).await?;
        assert_eq!(response.status().as_u16(), 404);
        Ok(())
    }

    #[tokio::test]
    async fn fetch_timeout_is_terminal_after_one_attempt() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_millis(250)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let request = client.get(format!("{}/slow", server.uri())).build()?;
        let options = RetryOptions {
            max_attempts: 3,
            timeout: Duration::from_millis(50),
            backoff: Duration::from_millis(5),
        };
        let error = fetch_with_retry(&client, request, &options)
            .await
            .expect_err("timeout expected");
        assert_eq!(error, GenerationError::Timeout);
        Ok(())
    }

    #[tokio::test]
    async fn fetch_surfaces_last_error_when_attempts_exhausted() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(2)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let request = client.get(format!("{}/down", server.uri())).build()?;
        let options = RetryOptions {
            max_attempts: 2,
            timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(5),
        };
        let error = fetch_with_retry(&client, request, &options)
            .await
            .expect_err("exhaustion expected");
        assert!(matches!(
            error,
            GenerationError::Provider { status: 503, .. }
        ));
        Ok(())
    }

    // --- Google transport ---

    #[tokio::test]
    async fn imagen_predict_decodes_predictions() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/imagen-4.0-generate-preview-06-06:predict"))
            .and(query_param("key", "test-key"))
            .and(body_partial_json(json!({
                "instances": [{"prompt": "a red cube"}],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "predictions": [
                    {"bytesBase64Encoded": "QUJD", "mimeType": "image/png"},
                    {"image": {"imageBytes": "REVG"}},
                ],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = GoogleMediaProvider::with_base(server.uri()).with_retry(quick_retry());
        let images = provider
            .generate_images("imagen-4.0-generate-preview-06-06", "a red cube", "test-key")
            .await?;
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].url, "data:image/png;base64,QUJD");
        assert_eq!(images[0].raw_bytes.as_deref(), Some("QUJD"));
        assert_eq!(images[1].url, "data:image/png;base64,REVG");
        Ok(())
    }

    #[tokio::test]
    async fn imagen_predict_maps_provider_errors() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/imagen-4.0-generate-preview-06-06:predict"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string("API key not valid. Please pass a valid API key."),
            )
            .mount(&server)
            .await;

        let provider = GoogleMediaProvider::with_base(server.uri()).with_retry(quick_retry());
        let error = provider
            .generate_images("imagen-4.0-generate-preview-06-06", "a red cube", "bad")
            .await
            .expect_err("provider error expected");
        assert!(matches!(
            &error,
            GenerationError::Provider { status: 400, message } if message.contains("API key")
        ));
        assert!(error.is_credential_failure());
        Ok(())
    }

    #[tokio::test]
    async fn veo_start_and_poll_roundtrip() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/veo-2.0-generate-001:predictLongRunning"))
            .and(query_param("key", "test-key"))
            .and(body_partial_json(json!({
                "parameters": {"aspectRatio": "16:9", "sampleCount": 2},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "operations/veo-123",
                "done": false,
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/operations/veo-123"))
            .and(query_param("key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "operations/veo-123",
                "done": true,
                "response": {
                    "generateVideoResponse": {
                        "generatedSamples": [
                            {"video": {"uri": "https://host/v/1?alt=media"}},
                            {"video": {"uri": "https://host/v/2?alt=media"}},
                        ],
                    },
                },
            })))
            .mount(&server)
            .await;

        let provider = GoogleMediaProvider::with_base(server.uri()).with_retry(quick_retry());
        let operation = provider
            .start_video(
                "veo-2.0-generate-001",
                "sunset",
                Some("QUJD"),
                "test-key",
            )
            .await?;
        assert_eq!(operation.name, "operations/veo-123");
        assert!(!operation.done);

        let polled = provider
            .fetch_operation("operations/veo-123", "test-key")
            .await?;
        assert!(polled.done);
        assert_eq!(
            polled.video_uris,
            vec![
                "https://host/v/1?alt=media".to_string(),
                "https://host/v/2?alt=media".to_string(),
            ]
        );
        Ok(())
    }

    // --- poller ---

    #[tokio::test]
    async fn poller_returns_uris_once_operation_completes() -> anyhow::Result<()> {
        let provider = ScriptedProvider {
            done_after: Some(3),
            ..ScriptedProvider::new()
        };
        let poll_calls = Arc::clone(&provider.poll_calls);
        let operation = provider.start_video("m", "p", None, "k").await?;
        let uris = poll_operation(
            &provider,
            operation,
            "k",
            &quick_poller(),
            &EventWriter::disabled("studio-test"),
            Uuid::new_v4(),
        )
        .await?;
        assert_eq!(uris.len(), 2);
        assert_eq!(poll_calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn poller_times_out_after_attempt_budget() -> anyhow::Result<()> {
        let provider = ScriptedProvider::never_done();
        let poll_calls = Arc::clone(&provider.poll_calls);
        let operation = provider.start_video("m", "p", None, "k").await?;
        let error = poll_operation(
            &provider,
            operation,
            "k",
            &quick_poller(),
            &EventWriter::disabled("studio-test"),
            Uuid::new_v4(),
        )
        .await
        .expect_err("poll timeout expected");
        assert_eq!(error, GenerationError::PollTimeout { attempts: 60 });
        assert_eq!(error.status_code(), 408);
        assert_eq!(poll_calls.load(Ordering::SeqCst), 60);
        Ok(())
    }

    #[tokio::test]
    async fn poller_skips_the_loop_when_already_done() -> anyhow::Result<()> {
        let provider = DryrunProvider;
        let operation = provider.start_video("m", "sunset", None, "k").await?;
        assert!(operation.done);
        let uris = poll_operation(
            &provider,
            operation,
            "k",
            &quick_poller(),
            &EventWriter::disabled("studio-test"),
            Uuid::new_v4(),
        )
        .await?;
        assert_eq!(uris.len(), 2);
        Ok(())
    }

    // --- keyed URLs ---

    #[test]
    fn keyed_media_url_picks_the_separator() {
        assert_eq!(
            keyed_media_url("https://host/v/1?alt=media", "k1"),
            "https://host/v/1?alt=media&key=k1"
        );
        assert_eq!(keyed_media_url("https://host/v/1", "k1"), "https://host/v/1?key=k1");
    }

    #[test]
    fn strip_key_param_removes_only_the_key() {
        assert_eq!(
            strip_key_param("https://host/v/1?alt=media&key=secret"),
            "https://host/v/1?alt=media"
        );
        assert_eq!(strip_key_param("https://host/v/1?key=secret"), "https://host/v/1");
        assert_eq!(strip_key_param("https://host/v/1"), "https://host/v/1");
    }

    // --- dispatcher ---

    #[tokio::test]
    async fn dispatch_rejects_long_image_prompts_before_any_call() -> anyhow::Result<()> {
        let provider = ScriptedProvider::new();
        let image_calls = Arc::clone(&provider.image_calls);
        let session = session_with(registry_of(provider), Some("test-key"))?;

        let error = session
            .dispatch(DispatchRequest::image("x".repeat(513)))
            .expect_err("validation error expected");
        assert!(matches!(error, GenerationError::Validation(_)));
        assert_eq!(error.status_code(), 400);
        assert_eq!(image_calls.load(Ordering::SeqCst), 0);
        assert!(session.snapshot().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn dispatch_rejects_empty_prompts_and_missing_sources() -> anyhow::Result<()> {
        let session = session_with(registry_of(ScriptedProvider::new()), Some("test-key"))?;
        assert!(matches!(
            session.dispatch(DispatchRequest::image("   ")),
            Err(GenerationError::Validation(_))
        ));
        assert!(matches!(
            session.dispatch(DispatchRequest {
                kind: super::RequestKind::ImageToVideo,
                prompt: "animate this".to_string(),
                source_image: None,
            }),
            Err(GenerationError::Validation(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn dispatch_requires_a_credential() -> anyhow::Result<()> {
        let session = session_with(registry_of(ScriptedProvider::new()), None)?;
        let error = session
            .dispatch(DispatchRequest::image("a red cube"))
            .expect_err("credential gate expected");
        assert_eq!(error, GenerationError::CredentialMissing);
        assert_eq!(error.status_code(), 401);
        assert!(session.snapshot().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn dispatch_shows_loading_then_replaces_with_images() -> anyhow::Result<()> {
        let gate = Arc::new(Notify::new());
        let provider = ScriptedProvider {
            gate: Some(Arc::clone(&gate)),
            ..ScriptedProvider::new()
        };
        let session = session_with(registry_of(provider), Some("test-key"))?;

        let ticket = session.dispatch(DispatchRequest::image("a red cube"))?;
        let head = session.snapshot().into_iter().next().expect("head record");
        assert_eq!(head.id(), ticket.id);
        assert!(head.is_loading());
        assert_eq!(head.kind(), MediaKind::Image);

        gate.notify_one();
        ticket.handle.await??;

        let head = session.snapshot().into_iter().next().expect("head record");
        assert_eq!(head.id(), ticket.id);
        match head {
            GenerationRecord::Image(generation) => assert_eq!(generation.images.len(), 2),
            other => panic!("expected image record, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn failed_dispatch_leaves_no_loading_record() -> anyhow::Result<()> {
        let provider = ScriptedProvider {
            fail_images: true,
            ..ScriptedProvider::new()
        };
        let session = session_with(registry_of(provider), Some("test-key"))?;

        let ticket = session.dispatch(DispatchRequest::image("a red cube"))?;
        let error = ticket.handle.await?.expect_err("scripted failure expected");
        assert!(matches!(error, GenerationError::Provider { status: 500, .. }));
        assert!(session.snapshot().is_empty());
        assert!(session.record(ticket.id).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn video_dispatch_polls_and_stores_keyed_urls() -> anyhow::Result<()> {
        let provider = ScriptedProvider {
            done_after: Some(2),
            ..ScriptedProvider::new()
        };
        let session = session_with(registry_of(provider), Some("test-key"))?;

        let source = SourceImage {
            reference: "data:image/png;base64,QUJD".to_string(),
            bytes: "QUJD".to_string(),
        };
        let ticket = session.dispatch(DispatchRequest::image_to_video("sunset", source))?;
        ticket.handle.await??;

        let record = session.record(ticket.id).expect("video record");
        match record {
            GenerationRecord::Video(generation) => {
                assert_eq!(generation.videos.len(), 2);
                assert!(generation
                    .videos
                    .iter()
                    .all(|url| url.ends_with("&key=test-key")));
                assert_eq!(
                    generation.source_image.as_deref(),
                    Some("data:image/png;base64,QUJD")
                );
            }
            other => panic!("expected video record, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn poll_timeout_removes_the_record_and_classifies_as_408() -> anyhow::Result<()> {
        let provider = ScriptedProvider::never_done();
        let session = session_with(registry_of(provider), Some("test-key"))?;

        let ticket = session.dispatch(DispatchRequest::text_to_video("a slow epic"))?;
        let error = ticket.handle.await?.expect_err("poll timeout expected");
        assert_eq!(error, GenerationError::PollTimeout { attempts: 60 });
        assert!(error.retryable_by_resubmission());
        assert!(session.snapshot().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn interleaved_dispatches_settle_independently() -> anyhow::Result<()> {
        let slow_gate = Arc::new(Notify::new());
        let mut registry = MediaProviderRegistry::new();
        registry.register(ScriptedProvider {
            gate: Some(Arc::clone(&slow_gate)),
            ..ScriptedProvider::new()
        });
        let session = session_with(registry, Some("test-key"))?;

        let slow = session.dispatch(DispatchRequest::image("slow request"))?;
        let fast = session.dispatch(DispatchRequest::text_to_video("fast request"))?;
        fast.handle.await??;

        // The fast video completed while the slow image is still gated.
        let records = session.snapshot();
        assert_eq!(records.len(), 2);
        assert!(!records[0].is_loading());
        assert!(records[1].is_loading());

        slow_gate.notify_one();
        slow.handle.await??;
        assert!(session.snapshot().iter().all(|record| !record.is_loading()));
        Ok(())
    }

    #[tokio::test]
    async fn dispatch_events_mask_the_credential() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let credentials = CredentialResolver::with_default(
            CredentialStore::new(),
            Some("AIzaSyExampleValue".to_string()),
        );
        let session = StudioSession::new(SessionOptions {
            credentials,
            registry: registry_of(ScriptedProvider::new()),
            selector: MediaModelSelector::new(None),
            poller: quick_poller(),
            events: EventWriter::new(&events_path, "studio-events"),
            image_model: None,
            video_model: None,
        })?;

        let ticket = session.dispatch(DispatchRequest::image("a red cube"))?;
        ticket.handle.await??;

        let raw = std::fs::read_to_string(&events_path)?;
        assert!(raw.contains("generation_requested"));
        assert!(raw.contains("generation_completed"));
        assert!(raw.contains("AIza...alue"));
        assert!(!raw.contains("AIzaSyExampleValue"));
        Ok(())
    }

    // --- dryrun provider ---

    #[tokio::test]
    async fn dryrun_images_are_deterministic_png_data_urls() -> anyhow::Result<()> {
        let provider = DryrunProvider;
        let first = provider.generate_images("dryrun-media-1", "boat", "k").await?;
        let second = provider.generate_images("dryrun-media-1", "boat", "k").await?;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].url, second[0].url);
        assert!(first[0].url.starts_with("data:image/png;base64,"));
        assert_ne!(first[0].url, first[1].url);
        Ok(())
    }

    #[tokio::test]
    async fn default_registry_exposes_google_and_dryrun() {
        let registry = default_media_provider_registry();
        assert_eq!(registry.names(), vec!["dryrun".to_string(), "google".to_string()]);
    }
}
