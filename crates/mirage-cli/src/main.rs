use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use mirage_contracts::credentials::{mask, CredentialResolver, CredentialStore};
use mirage_contracts::events::EventWriter;
use mirage_contracts::generations::{
    GeneratedImage, GenerationRecord, ImageGeneration, MediaItem, MediaKind, VideoGeneration,
};
use mirage_contracts::models::MediaModelSelector;
use mirage_contracts::summary::{now_utc_iso, write_summary, RunSummary};
use mirage_engine::{
    default_media_provider_registry, strip_key_param, DispatchRequest, DispatchTicket,
    PollerConfig, SessionOptions, SourceImage, StudioSession,
};

const DRYRUN_MODEL: &str = "dryrun-media-1";
const DRYRUN_SESSION_KEY: &str = "dryrun-local-key";
const GALLERY_PROMPT_WIDTH: usize = 60;

// 1x1 transparent PNG, enough for the seeded sample feed to be animatable.
const SAMPLE_PIXEL_B64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8BQDwAEhQGAhKmMIQAAAABJRU5ErkJggg==";

#[derive(Debug, Parser)]
#[command(name = "mirage", version, about = "Prompt-to-media studio over hosted generative APIs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive session: type prompts, watch the gallery fill in.
    Studio(StudioArgs),
    /// One generation, artifacts and a summary written to --out.
    Run(RunArgs),
}

#[derive(Debug, Parser)]
struct StudioArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    video_model: Option<String>,
    /// Use the offline dryrun provider instead of the hosted API.
    #[arg(long)]
    dryrun: bool,
    /// Start with an empty gallery instead of the seeded samples.
    #[arg(long)]
    no_samples: bool,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, value_enum, default_value = "image")]
    kind: RunKind,
    /// Source frame for image-video runs.
    #[arg(long)]
    source_image: Option<PathBuf>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    video_model: Option<String>,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RunKind {
    Image,
    Video,
    #[value(name = "image-video")]
    ImageVideo,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mirage error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    match cli.command {
        Command::Studio(args) => {
            runtime.block_on(run_studio(args))?;
            Ok(0)
        }
        Command::Run(args) => runtime.block_on(run_once(args)),
    }
}

fn build_session(
    out: &Path,
    events: Option<PathBuf>,
    api_key: Option<&str>,
    image_model: Option<String>,
    video_model: Option<String>,
    dryrun: bool,
) -> Result<StudioSession> {
    fs::create_dir_all(out)
        .with_context(|| format!("failed to create output directory {}", out.display()))?;
    let events_path = events.unwrap_or_else(|| out.join("events.jsonl"));
    let session_id = format!("studio-{}", Uuid::new_v4());

    let store = CredentialStore::new();
    if let Some(key) = api_key {
        store.set(key);
    }
    if dryrun {
        store.set(DRYRUN_SESSION_KEY);
    }

    let (image_model, video_model) = if dryrun {
        (
            Some(DRYRUN_MODEL.to_string()),
            Some(DRYRUN_MODEL.to_string()),
        )
    } else {
        (image_model, video_model)
    };

    StudioSession::new(SessionOptions {
        events: EventWriter::new(events_path, session_id),
        credentials: CredentialResolver::new(store),
        registry: default_media_provider_registry(),
        selector: MediaModelSelector::new(None),
        poller: PollerConfig::default(),
        image_model,
        video_model,
    })
    .context("failed to start studio session")
}

async fn run_studio(args: StudioArgs) -> Result<()> {
    let session = build_session(
        &args.out,
        args.events.clone(),
        args.api_key.as_deref(),
        args.image_model.clone(),
        args.video_model.clone(),
        args.dryrun,
    )?;
    if !args.no_samples {
        session.seed_samples(sample_generations());
    }

    println!("Mirage studio started. Type a prompt to generate images, /help for commands.");
    let mut pending: Vec<DispatchTicket> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        reap_finished(&session, &mut pending).await;
        print!("> ");
        io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if !input.starts_with('/') {
            submit(&session, &mut pending, DispatchRequest::image(input));
            continue;
        }

        let parts = shell_words::split(input).unwrap_or_else(|_| vec![input.to_string()]);
        let command = parts.first().map(String::as_str).unwrap_or_default();
        match command {
            "/help" => {
                println!("Commands:");
                println!("  <prompt>                 generate images");
                println!("  /video <prompt>          generate videos from text");
                println!("  /animate <n> [prompt]    animate gallery image n");
                println!("  /key <value>|clear       set or clear the session API key");
                println!("  /model image|video <m>   override the model for a kind");
                println!("  /gallery                 list the media feed");
                println!("  /open <n>                show feed item n in full");
                println!("  /status                  list generation records");
                println!("  /wait                    block until in-flight work settles");
                println!("  /quit                    leave the studio");
            }
            "/video" => {
                let prompt = input.trim_start_matches("/video").trim();
                if prompt.is_empty() {
                    println!("/video requires a prompt");
                } else {
                    submit(&session, &mut pending, DispatchRequest::text_to_video(prompt));
                }
            }
            "/animate" => match animate_request(&session, &parts) {
                Ok(request) => submit(&session, &mut pending, request),
                Err(err) => println!("Animate failed: {err:#}"),
            },
            "/key" => {
                let value = parts.get(1).map(String::as_str).unwrap_or_default();
                if value.is_empty() {
                    println!("/key requires a value (or 'clear')");
                } else if value == "clear" {
                    session.credentials().store().clear();
                    session.emit_event(
                        "credential_updated",
                        json_object(json!({"api_key": Value::Null})),
                    );
                    println!("Session API key cleared.");
                } else {
                    session.credentials().store().set(value);
                    session.emit_event(
                        "credential_updated",
                        json_object(json!({"api_key": mask(value)})),
                    );
                    println!("Session API key saved ({}).", mask(value));
                }
            }
            "/model" => {
                let kind = parts.get(1).map(String::as_str).unwrap_or_default();
                let model = parts.get(2).cloned();
                match (kind, model) {
                    ("image", Some(model)) => {
                        println!("Image model set to {model}");
                        session.set_image_model(Some(model));
                    }
                    ("video", Some(model)) => {
                        println!("Video model set to {model}");
                        session.set_video_model(Some(model));
                    }
                    _ => println!("/model requires: /model image|video <name>"),
                }
            }
            "/gallery" => print_gallery(&session),
            "/open" => match parts.get(1).map(String::as_str).unwrap_or_default().parse() {
                Ok(index) => print_item(&session, index),
                Err(_) => println!("/open requires a feed index"),
            },
            "/status" => print_status(&session),
            "/wait" => {
                while !pending.is_empty() {
                    let ticket = pending.remove(0);
                    report_outcome(&session, ticket).await;
                }
            }
            "/quit" | "/exit" => break,
            other => println!("Unknown command {other}. Type /help."),
        }
    }

    if !pending.is_empty() {
        println!("Waiting for {} in-flight generation(s)…", pending.len());
        for ticket in pending {
            report_outcome(&session, ticket).await;
        }
    }
    Ok(())
}

async fn run_once(args: RunArgs) -> Result<i32> {
    let session = build_session(
        &args.out,
        args.events.clone(),
        args.api_key.as_deref(),
        args.image_model.clone(),
        args.video_model.clone(),
        args.dryrun,
    )?;
    let started_at = now_utc_iso();
    let summary_path = args.out.join("summary.json");

    let request = match args.kind {
        RunKind::Image => DispatchRequest::image(args.prompt.as_str()),
        RunKind::Video => DispatchRequest::text_to_video(args.prompt.as_str()),
        RunKind::ImageVideo => {
            let path = args
                .source_image
                .as_ref()
                .context("--source-image is required for image-video runs")?;
            let bytes = fs::read(path)
                .with_context(|| format!("failed to read source image {}", path.display()))?;
            DispatchRequest::image_to_video(
                args.prompt.as_str(),
                SourceImage {
                    reference: path.display().to_string(),
                    bytes: BASE64.encode(bytes),
                },
            )
        }
    };
    let kind_text = request.kind.as_str().to_string();

    let summary_base = |success: bool, finished_at: String| RunSummary {
        session_id: session.events().session_id().to_string(),
        prompt: args.prompt.clone(),
        kind: kind_text.clone(),
        success,
        started_at: started_at.clone(),
        finished_at,
        artifacts: Vec::new(),
    };

    let ticket = match session.dispatch(request) {
        Ok(ticket) => ticket,
        Err(err) => {
            let mut extra = Map::new();
            extra.insert("error".to_string(), json!(err.to_string()));
            extra.insert("status".to_string(), json!(err.status_code()));
            write_summary(&summary_path, &summary_base(false, now_utc_iso()), Some(&extra))?;
            eprintln!("mirage: {err}");
            return Ok(1);
        }
    };

    let outcome = ticket.handle.await.context("generation task aborted")?;
    let finished_at = now_utc_iso();
    match outcome {
        Ok(()) => {
            let record = session
                .record(ticket.id)
                .context("completed record missing from store")?;
            let artifacts = write_artifacts(&args.out, &record)?;
            let mut summary = summary_base(true, finished_at);
            summary.artifacts = artifacts;
            write_summary(&summary_path, &summary, None)?;
            println!(
                "Generated {} media item(s); summary at {}",
                record.media_len(),
                summary_path.display()
            );
            Ok(0)
        }
        Err(err) => {
            let mut extra = Map::new();
            extra.insert("error".to_string(), json!(err.to_string()));
            extra.insert("status".to_string(), json!(err.status_code()));
            write_summary(&summary_path, &summary_base(false, finished_at), Some(&extra))?;
            eprintln!("mirage: {err}");
            Ok(1)
        }
    }
}

fn submit(session: &StudioSession, pending: &mut Vec<DispatchTicket>, request: DispatchRequest) {
    let kind_text = request.kind.as_str();
    match session.dispatch(request) {
        Ok(ticket) => {
            println!("→ queued {kind_text} generation {}", short(ticket.id));
            pending.push(ticket);
        }
        Err(err) if err.is_credential_failure() => {
            println!("✗ {err} Use /key <value> to add one.");
        }
        Err(err) => println!("✗ {err}"),
    }
}

async fn reap_finished(session: &StudioSession, pending: &mut Vec<DispatchTicket>) {
    let mut index = 0;
    while index < pending.len() {
        if pending[index].handle.is_finished() {
            let ticket = pending.remove(index);
            report_outcome(session, ticket).await;
        } else {
            index += 1;
        }
    }
}

async fn report_outcome(session: &StudioSession, ticket: DispatchTicket) {
    let id = ticket.id;
    match ticket.handle.await {
        Ok(Ok(())) => {
            let Some(record) = session.record(id) else {
                println!("✓ generation {} finished", short(id));
                return;
            };
            match session.locate(id, 0) {
                Ok(position) => println!(
                    "✓ {} generation {} finished with {} item(s); view with /open {position}",
                    record.kind().as_str(),
                    short(id),
                    record.media_len(),
                ),
                Err(_) => println!(
                    "✓ {} generation {} finished with {} item(s)",
                    record.kind().as_str(),
                    short(id),
                    record.media_len(),
                ),
            }
        }
        Ok(Err(err)) if err.is_credential_failure() => {
            println!(
                "✗ generation {} failed: {err} Use /key <value> to add one.",
                short(id)
            );
        }
        Ok(Err(err)) => println!("✗ generation {} failed: {err}", short(id)),
        Err(join_err) => eprintln!("mirage: generation task failed: {join_err}"),
    }
}

fn animate_request(session: &StudioSession, parts: &[String]) -> Result<DispatchRequest> {
    let index: usize = parts
        .get(1)
        .context("/animate requires a feed index")?
        .parse()
        .context("feed index must be a number")?;
    let items = session.media_items();
    let item = items
        .get(index)
        .with_context(|| format!("no feed item {index}; see /gallery"))?;
    let records = session.snapshot();
    let source = source_image_for_item(&records, item)?;
    let prompt = if parts.len() > 2 {
        parts[2..].join(" ")
    } else {
        format!("{} - animated video", item.prompt)
    };
    Ok(DispatchRequest::image_to_video(prompt, source))
}

fn source_image_for_item(records: &[GenerationRecord], item: &MediaItem) -> Result<SourceImage> {
    if item.kind != MediaKind::Image {
        bail!("only images can be animated");
    }
    let (record_id, index) = parse_media_item_id(&item.id)?;
    let record = records
        .iter()
        .find(|record| record.id() == record_id)
        .context("record for media item not found")?;
    let GenerationRecord::Image(generation) = record else {
        bail!("media item does not belong to an image record");
    };
    let image = generation
        .images
        .get(index)
        .context("image index out of range")?;

    if let Some(bytes) = &image.raw_bytes {
        return Ok(SourceImage {
            reference: item.url.clone(),
            bytes: bytes.clone(),
        });
    }
    if let Some((_, encoded)) = image.url.split_once(";base64,") {
        return Ok(SourceImage {
            reference: item.url.clone(),
            bytes: encoded.to_string(),
        });
    }
    let path = Path::new(&image.url);
    if path.exists() {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read sample image {}", path.display()))?;
        return Ok(SourceImage {
            reference: image.url.clone(),
            bytes: BASE64.encode(bytes),
        });
    }
    bail!("no image bytes available for {}", item.id);
}

/// Split a composite feed id back into its record id and item index. The
/// record id itself contains dashes, so parse from the right.
fn parse_media_item_id(id: &str) -> Result<(Uuid, usize)> {
    let mut parts = id.rsplitn(3, '-');
    let index: usize = parts
        .next()
        .context("malformed media item id")?
        .parse()
        .context("malformed media item index")?;
    parts.next().context("malformed media item id")?;
    let record = parts.next().context("malformed media item id")?;
    Ok((Uuid::parse_str(record)?, index))
}

fn print_gallery(session: &StudioSession) {
    let items = session.media_items();
    if items.is_empty() {
        println!("The gallery is empty. Type a prompt to generate something.");
        return;
    }
    for (index, item) in items.iter().enumerate() {
        println!(
            "{index:>3}  {:5}  {:>9}  {}",
            item.kind.as_str(),
            age_text(item.created_at),
            truncate(&item.prompt, GALLERY_PROMPT_WIDTH),
        );
    }
}

fn print_item(session: &StudioSession, index: usize) {
    let items = session.media_items();
    let Some(item) = items.get(index) else {
        println!("No feed item {index}; see /gallery");
        return;
    };
    println!("id:      {}", item.id);
    println!("kind:    {}", item.kind.as_str());
    println!("created: {}", item.created_at.to_rfc3339());
    println!("prompt:  {}", item.prompt);
    if let Some(source) = &item.source_image {
        println!("source:  {}", truncate(source, 80));
    }
    if item.kind == MediaKind::Video {
        println!("url:     {}", item.url);
    } else {
        println!("url:     {}", truncate(&item.url, 80));
    }
}

fn print_status(session: &StudioSession) {
    let records = session.snapshot();
    if records.is_empty() {
        println!("No generation records yet.");
        return;
    }
    for record in records {
        let state = if record.is_loading() {
            "loading"
        } else {
            "complete"
        };
        println!(
            "{}  {state:8}  {:5}  {}",
            short(record.id()),
            record.kind().as_str(),
            truncate(record.prompt(), GALLERY_PROMPT_WIDTH),
        );
    }
}

/// Write completed media to disk: image bytes become artifact files, video
/// rows keep their bare URIs (the retrieval key never lands in the summary).
fn write_artifacts(out: &Path, record: &GenerationRecord) -> Result<Vec<Map<String, Value>>> {
    let mut rows = Vec::new();
    match record {
        GenerationRecord::Loading(_) => {}
        GenerationRecord::Image(generation) => {
            let stamp = timestamp_millis();
            for (index, image) in generation.images.iter().enumerate() {
                let Some(encoded) = image_payload(image) else {
                    continue;
                };
                let bytes = BASE64
                    .decode(encoded.as_bytes())
                    .context("image payload base64 decode failed")?;
                let path = out.join(format!("artifact-{stamp}-{index:02}.png"));
                fs::write(&path, bytes)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                let mut row = Map::new();
                row.insert("id".to_string(), json!(format!("{}-img-{index}", generation.id)));
                row.insert("path".to_string(), json!(path.display().to_string()));
                rows.push(row);
            }
        }
        GenerationRecord::Video(generation) => {
            for (index, url) in generation.videos.iter().enumerate() {
                let mut row = Map::new();
                row.insert("id".to_string(), json!(format!("{}-vid-{index}", generation.id)));
                row.insert("uri".to_string(), json!(strip_key_param(url)));
                rows.push(row);
            }
        }
    }
    Ok(rows)
}

fn image_payload(image: &GeneratedImage) -> Option<String> {
    if let Some(bytes) = &image.raw_bytes {
        return Some(bytes.clone());
    }
    image
        .url
        .split_once(";base64,")
        .map(|(_, encoded)| encoded.to_string())
}

/// Seeded feed shown before the first live generation, mirroring the sample
/// gallery the original studio opened with.
fn sample_generations() -> Vec<GenerationRecord> {
    let pixel = |minutes: i64, prompt: &str| ImageGeneration {
        id: Uuid::new_v4(),
        prompt: prompt.to_string(),
        created_at: Utc::now() - ChronoDuration::minutes(minutes),
        images: vec![
            GeneratedImage {
                url: format!("data:image/png;base64,{SAMPLE_PIXEL_B64}"),
                raw_bytes: Some(SAMPLE_PIXEL_B64.to_string()),
                is_sample: true,
            },
            GeneratedImage {
                url: format!("data:image/png;base64,{SAMPLE_PIXEL_B64}"),
                raw_bytes: Some(SAMPLE_PIXEL_B64.to_string()),
                is_sample: true,
            },
        ],
    };

    vec![
        GenerationRecord::Video(VideoGeneration {
            id: Uuid::new_v4(),
            prompt: "A starship arriving at an orbital coffee kiosk, Mars drifting past"
                .to_string(),
            created_at: Utc::now() - ChronoDuration::minutes(2),
            videos: vec![
                "samples/orbital-coffee-1.mp4".to_string(),
                "samples/orbital-coffee-2.mp4".to_string(),
            ],
            source_image: None,
        }),
        GenerationRecord::Image(pixel(
            15,
            "A fashion magazine cover for NEO AUSTIN, hand-drawn watercolor anime style",
        )),
        GenerationRecord::Image(pixel(
            20,
            "A rain-slick cyberpunk balcony at night, neon bokeh, ink-and-wash comic style",
        )),
    ]
}

fn short(id: Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn age_text(created_at: DateTime<Utc>) -> String {
    let elapsed = Utc::now() - created_at;
    if elapsed < ChronoDuration::minutes(1) {
        "just now".to_string()
    } else if elapsed < ChronoDuration::hours(1) {
        format!("{}m ago", elapsed.num_minutes())
    } else {
        format!("{}h ago", elapsed.num_hours())
    }
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

fn json_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
