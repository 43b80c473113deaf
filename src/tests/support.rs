//! In-memory stand-ins for the reference service and the embedding model.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::SyncConfig;
use crate::notes::{BackendCsv, NoteStore};
use crate::reference::{NoteReferential, ReferenceError, ReferenceSource};
use crate::semantic::{Embedder, Embeddings, EmbeddingError, IndexSynchronizer};

pub const DIMENSIONS: usize = 8;

/// Sentences containing this marker fail to embed.
pub const EMBED_FAILURE: &str = "FAILEMBED";

#[derive(Default)]
pub struct FakeReference {
    notes: Mutex<Vec<NoteReferential>>,
    pub page_calls: AtomicUsize,
    pub uri_calls: AtomicUsize,
    /// Pages starting at this offset fail
    fail_from: Mutex<Option<usize>>,
    /// Serve the first page whatever the offset
    ignore_offset: AtomicBool,
}

impl FakeReference {
    pub fn new(notes: &[(&str, &str)]) -> Arc<Self> {
        let reference = Self::default();
        for (uri, value) in notes {
            reference.set(uri, value);
        }
        Arc::new(reference)
    }

    pub fn set(&self, uri: &str, value: &str) {
        let mut notes = self.notes.lock().unwrap();
        let referential = NoteReferential {
            uri: uri.to_string(),
            value: value.to_string(),
        };
        match notes.iter_mut().find(|note| note.uri == uri) {
            Some(existing) => *existing = referential,
            None => notes.push(referential),
        }
    }

    pub fn fail_pages_from(&self, offset: usize) {
        *self.fail_from.lock().unwrap() = Some(offset);
    }

    pub fn ignore_offset(&self) {
        self.ignore_offset.store(true, Ordering::SeqCst);
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn uri_calls(&self) -> usize {
        self.uri_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReferenceSource for FakeReference {
    async fn fetch_note_by_uri(&self, uri: &str) -> Result<NoteReferential, ReferenceError> {
        self.uri_calls.fetch_add(1, Ordering::SeqCst);
        self.notes
            .lock()
            .unwrap()
            .iter()
            .find(|note| note.uri == uri)
            .cloned()
            .ok_or_else(|| ReferenceError::NotFound(uri.to_string()))
    }

    async fn fetch_notes(&self, count: usize, offset: usize) -> Result<Vec<NoteReferential>, ReferenceError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);

        if matches!(*self.fail_from.lock().unwrap(), Some(from) if offset >= from) {
            return Err(ReferenceError::Transient {
                reason: "status 503".to_string(),
                attempts: 1,
            });
        }

        let offset = if self.ignore_offset.load(Ordering::SeqCst) {
            0
        } else {
            offset
        };

        Ok(self
            .notes
            .lock()
            .unwrap()
            .iter()
            .skip(offset)
            .take(count)
            .cloned()
            .collect())
    }
}

/// Deterministic embedder: byte values folded into a small vector.
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn vector(sentence: &str) -> Vec<f32> {
        let mut vector = vec![0.0; DIMENSIONS];
        for (idx, byte) in sentence.bytes().enumerate() {
            vector[idx % DIMENSIONS] += byte as f32 / 255.0;
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    async fn embed(&self, sentences: &[String]) -> Result<Embeddings, EmbeddingError> {
        if sentences.iter().any(|sentence| sentence.contains(EMBED_FAILURE)) {
            return Err(EmbeddingError::EmbeddingFailed("model unavailable".to_string()));
        }

        let rows = sentences.iter().map(|sentence| Self::vector(sentence)).collect();
        Ok(Embeddings::from_rows(DIMENSIONS, rows)?)
    }
}

pub struct Harness {
    pub synchronizer: Arc<IndexSynchronizer>,
    pub store: Arc<BackendCsv>,
    pub reference: Arc<FakeReference>,
}

pub fn store(dir: &Path) -> Arc<BackendCsv> {
    Arc::new(BackendCsv::load(dir.join("notes.csv"), dir.join("embeddings"), DIMENSIONS).unwrap())
}

pub fn harness(dir: &Path, reference: Arc<FakeReference>) -> Harness {
    let store = store(dir);
    let config = SyncConfig {
        page_size: 2,
        flush_every: 2,
    };

    let synchronizer = Arc::new(IndexSynchronizer::new(
        store.clone() as Arc<dyn NoteStore>,
        reference.clone() as Arc<dyn ReferenceSource>,
        Arc::new(HashEmbedder),
        &config,
    ));

    Harness {
        synchronizer,
        store,
        reference,
    }
}
