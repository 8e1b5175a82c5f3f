use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }

    fn item_tag(&self) -> &'static str {
        match self {
            Self::Image => "img",
            Self::Video => "vid",
        }
    }
}

/// One image returned by the provider. `url` is a self-contained data URL
/// for display; `raw_bytes` keeps the provider's base64 payload so the image
/// can seed an image-to-video request without refetching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_bytes: Option<String>,
    #[serde(default)]
    pub is_sample: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadingGeneration {
    pub id: Uuid,
    pub prompt: String,
    pub kind: MediaKind,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageGeneration {
    pub id: Uuid,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    pub images: Vec<GeneratedImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoGeneration {
    pub id: Uuid,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    pub videos: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
}

/// One user-initiated request and its resulting media, or its in-progress
/// placeholder. A record's id never changes; a `Loading` record is replaced
/// in place by its terminal variant on success and removed on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum GenerationRecord {
    Loading(LoadingGeneration),
    Image(ImageGeneration),
    Video(VideoGeneration),
}

impl GenerationRecord {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Loading(inner) => inner.id,
            Self::Image(inner) => inner.id,
            Self::Video(inner) => inner.id,
        }
    }

    pub fn prompt(&self) -> &str {
        match self {
            Self::Loading(inner) => &inner.prompt,
            Self::Image(inner) => &inner.prompt,
            Self::Video(inner) => &inner.prompt,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Loading(inner) => inner.created_at,
            Self::Image(inner) => inner.created_at,
            Self::Video(inner) => inner.created_at,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading(_))
    }

    /// Number of media items this record contributes to the projected feed.
    pub fn media_len(&self) -> usize {
        match self {
            Self::Loading(_) => 0,
            Self::Image(inner) => inner.images.len(),
            Self::Video(inner) => inner.videos.len(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Loading(inner) => inner.kind,
            Self::Image(_) => MediaKind::Image,
            Self::Video(_) => MediaKind::Video,
        }
    }
}

/// A single image or video result, the unit rendered in the fullscreen
/// viewer. Derived from the store; never mutated directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub kind: MediaKind,
    pub url: String,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
}

/// Composite viewer id: record id, media kind tag, index within the record.
pub fn media_item_id(record_id: Uuid, kind: MediaKind, index: usize) -> String {
    format!("{record_id}-{}-{index}", kind.item_tag())
}
