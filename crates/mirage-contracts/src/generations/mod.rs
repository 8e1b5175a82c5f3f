mod records;
mod store;

pub use records::{
    media_item_id, GeneratedImage, GenerationRecord, ImageGeneration, LoadingGeneration,
    MediaItem, MediaKind, VideoGeneration,
};
pub use store::{GenerationStore, StoreMutation};
