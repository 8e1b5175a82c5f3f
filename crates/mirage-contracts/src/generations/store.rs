use std::collections::VecDeque;

use uuid::Uuid;

use crate::errors::GenerationError;

use super::records::{media_item_id, GenerationRecord, MediaItem};

/// Result of a store mutation keyed by record id. `MissingId` is a no-op the
/// caller is expected to report as an inconsistency; the store itself stays
/// free of I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMutation {
    Applied,
    MissingId,
}

/// Ordered collection of generation records for one studio session.
///
/// Records are newest-first by construction: every insertion goes to the
/// head. Seeded sample records are appended behind existing records so a
/// fresh session opens with a populated feed.
#[derive(Debug, Clone, Default)]
pub struct GenerationStore {
    records: VecDeque<GenerationRecord>,
}

impl GenerationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GenerationRecord> {
        self.records.iter()
    }

    pub fn get(&self, id: Uuid) -> Option<&GenerationRecord> {
        self.records.iter().find(|record| record.id() == id)
    }

    /// Prepend a record so the newest request is always first.
    pub fn insert(&mut self, record: GenerationRecord) {
        self.records.push_front(record);
    }

    /// Append seed records behind everything already present.
    pub fn seed(&mut self, records: impl IntoIterator<Item = GenerationRecord>) {
        self.records.extend(records);
    }

    /// Replace the record with `id` in place, preserving its position.
    pub fn transition(&mut self, id: Uuid, terminal: GenerationRecord) -> StoreMutation {
        match self.records.iter_mut().find(|record| record.id() == id) {
            Some(slot) => {
                *slot = terminal;
                StoreMutation::Applied
            }
            None => StoreMutation::MissingId,
        }
    }

    /// Delete the record with `id` entirely.
    pub fn remove(&mut self, id: Uuid) -> StoreMutation {
        match self.records.iter().position(|record| record.id() == id) {
            Some(index) => {
                self.records.remove(index);
                StoreMutation::Applied
            }
            None => StoreMutation::MissingId,
        }
    }

    /// Flatten all non-loading records into the viewer feed: descending by
    /// creation time, ties kept in store order. Pure; recomputed per call.
    pub fn project_media_items(&self) -> Vec<MediaItem> {
        let mut items = Vec::new();
        for record in &self.records {
            match record {
                GenerationRecord::Loading(_) => {}
                GenerationRecord::Image(generation) => {
                    for (index, image) in generation.images.iter().enumerate() {
                        items.push(MediaItem {
                            id: media_item_id(generation.id, record.kind(), index),
                            kind: record.kind(),
                            url: image.url.clone(),
                            prompt: generation.prompt.clone(),
                            created_at: generation.created_at,
                            source_image: None,
                        });
                    }
                }
                GenerationRecord::Video(generation) => {
                    for (index, url) in generation.videos.iter().enumerate() {
                        items.push(MediaItem {
                            id: media_item_id(generation.id, record.kind(), index),
                            kind: record.kind(),
                            url: url.clone(),
                            prompt: generation.prompt.clone(),
                            created_at: generation.created_at,
                            source_image: generation.source_image.clone(),
                        });
                    }
                }
            }
        }
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items
    }

    /// Map a (record, index-within-record) pair to its position in the
    /// projected feed, for opening the fullscreen viewer at the right item.
    pub fn locate(&self, record_id: Uuid, item_index: usize) -> Result<usize, GenerationError> {
        let record = self
            .get(record_id)
            .ok_or_else(|| GenerationError::NotFound(format!("no record {record_id}")))?;
        if record.is_loading() {
            return Err(GenerationError::NotFound(format!(
                "record {record_id} is still loading"
            )));
        }
        let target = media_item_id(record_id, record.kind(), item_index);
        self.project_media_items()
            .iter()
            .position(|item| item.id == target)
            .ok_or(GenerationError::NotFound(format!(
                "no media item {target}"
            )))
    }
}
