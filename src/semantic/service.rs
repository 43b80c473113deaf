//! Keeps the in-memory note index in sync with the note store and the
//! reference service.
//!
//! One `tokio::sync::Mutex` guards the index and its row mapping. A full
//! reload holds it for its whole duration, network calls included, so
//! searches and incremental updates wait for the rebuild to finish.

use serde::Serialize;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::notes::{Note, NoteStore};
use crate::reference::{ReferenceError, ReferenceSource};
use crate::semantic::embeddings::{Embedder, EmbeddingError};
use crate::semantic::index::{IndexError, NoteIndex};
use crate::semantic::matrix::Embeddings;
use crate::semantic::sanitize::{sanitize, sanitize_query, SanitizationError};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("note {0} not found")]
    NoteNotFound(String),

    #[error("Sanitization error: {0}")]
    Sanitization(#[from] SanitizationError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Reference service error: {0}")]
    Reference(#[from] ReferenceError),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("index is not loaded")]
    NotLoaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexPhase {
    Unloaded,
    Loading,
    Ready,
    Reloading,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub state: IndexPhase,
    /// `None` while the index is locked by a rebuild or update
    pub rows: Option<usize>,
    pub notes: usize,
}

struct IndexState {
    /// `None` until the first successful load
    index: Option<NoteIndex>,
}

pub struct IndexSynchronizer {
    store: Arc<dyn NoteStore>,
    reference: Arc<dyn ReferenceSource>,
    embedder: Arc<dyn Embedder>,
    page_size: usize,
    flush_every: usize,
    state: Mutex<IndexState>,
    phase: RwLock<IndexPhase>,
}

impl IndexSynchronizer {
    pub fn new(
        store: Arc<dyn NoteStore>,
        reference: Arc<dyn ReferenceSource>,
        embedder: Arc<dyn Embedder>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            reference,
            embedder,
            page_size: config.page_size.max(1),
            flush_every: config.flush_every.max(1),
            state: Mutex::new(IndexState { index: None }),
            phase: RwLock::new(IndexPhase::Unloaded),
        }
    }

    pub fn phase(&self) -> IndexPhase {
        *self.phase.read().unwrap_or_else(|err| err.into_inner())
    }

    fn set_phase(&self, phase: IndexPhase) {
        *self.phase.write().unwrap_or_else(|err| err.into_inner()) = phase;
    }

    pub fn status(&self) -> Result<IndexStatus, SyncError> {
        let rows = self
            .state
            .try_lock()
            .ok()
            .and_then(|state| state.index.as_ref().map(NoteIndex::len));

        Ok(IndexStatus {
            state: self.phase(),
            rows,
            notes: self.store.all()?.len(),
        })
    }

    /// Load the index if it never was, or rebuild everything when `force`
    /// is set.
    pub async fn ensure_loaded(&self, force: bool) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        self.load_locked(&mut state, force).await
    }

    async fn load_locked(&self, state: &mut IndexState, force: bool) -> Result<(), SyncError> {
        if !force && state.index.is_some() {
            return Ok(());
        }

        let result = self.rebuild_locked(state, force).await;
        match &result {
            Ok(()) => self.set_phase(IndexPhase::Ready),
            Err(err) => {
                log::error!("loading the note index failed: {err}");
                self.set_phase(if state.index.is_some() {
                    IndexPhase::Ready
                } else {
                    IndexPhase::Unloaded
                });
            }
        }
        result
    }

    async fn rebuild_locked(&self, state: &mut IndexState, mut force: bool) -> Result<(), SyncError> {
        loop {
            self.set_phase(if state.index.is_some() {
                IndexPhase::Reloading
            } else {
                IndexPhase::Loading
            });

            if force {
                let added = self.repopulate().await?;
                log::info!("repopulated note store with {added} notes from reference service");
            }

            let notes = self.store.all()?;

            // first run bootstrap: escalates at most once, `force` never resets
            if notes.is_empty() && !force {
                log::info!("note store is empty, repopulating from reference service");
                force = true;
                continue;
            }

            let index = self.build_index(&notes).await?;
            log::info!(
                "note index ready: {} rows for {} notes",
                index.len(),
                notes.len()
            );
            state.index = Some(index);

            return Ok(());
        }
    }

    /// Replace the store content with every note of the reference service.
    ///
    /// A failed page stops the walk, and so does a page starting with the
    /// same uri as the previous one. Notes that fail to sanitize or embed
    /// are skipped.
    async fn repopulate(&self) -> Result<usize, SyncError> {
        self.store.delete_all()?;

        let mut offset = 0;
        let mut added = 0;
        let mut previous_first: Option<String> = None;

        loop {
            let page = match self.reference.fetch_notes(self.page_size, offset).await {
                Ok(page) => page,
                Err(err) => {
                    log::error!("fetching notes at offset {offset} failed, stopping repopulation: {err}");
                    break;
                }
            };

            let first = page.first().map(|note| note.uri.clone());
            if first.is_some() && first == previous_first {
                log::warn!("reference service repeated the page at offset {offset}, stopping repopulation");
                break;
            }
            previous_first = first;

            let fetched = page.len();
            for referential in page {
                let embeddings = match self.embed_text(&referential.value).await {
                    Ok(embeddings) => embeddings,
                    Err(err) => {
                        log::warn!("skipping note {}: {err}", referential.uri);
                        continue;
                    }
                };

                let note = self.find_or_create(&referential.uri)?;
                self.store.set_embeddings(note.id, &embeddings)?;

                added += 1;
                if added % self.flush_every == 0 {
                    self.store.flush()?;
                }
            }

            offset += fetched;
            if fetched < self.page_size {
                break;
            }
        }

        self.store.flush()?;
        Ok(added)
    }

    /// Fresh index over `notes`, computing missing embeddings on the way.
    async fn build_index(&self, notes: &[Note]) -> Result<NoteIndex, SyncError> {
        let mut index = NoteIndex::new(self.embedder.dimensions());
        let mut computed = 0;

        for note in notes {
            let embeddings = match self.store.embeddings(note.id)? {
                Some(embeddings) => embeddings,
                None => match self.compute_note(&note.uri).await {
                    Ok(embeddings) => {
                        self.store.set_embeddings(note.id, &embeddings)?;
                        computed += 1;
                        if computed % self.flush_every == 0 {
                            self.store.flush()?;
                        }
                        embeddings
                    }
                    Err(err) => {
                        log::warn!("leaving note {} out of the index: {err}", note.uri);
                        continue;
                    }
                },
            };

            index.add_note(note.id, &embeddings)?;
        }

        self.store.flush()?;
        index.check_consistency()?;

        Ok(index)
    }

    /// Fetch the authoritative text of `uri` and embed it.
    async fn compute_note(&self, uri: &str) -> Result<Embeddings, SyncError> {
        let referential = self.reference.fetch_note_by_uri(uri).await?;
        self.embed_text(&referential.value).await
    }

    /// One embedding row per sanitized sentence of `text`.
    pub async fn embed_text(&self, text: &str) -> Result<Embeddings, SyncError> {
        let sentences = sanitize(text)?;
        Ok(self.embedder.embed(&sentences).await?)
    }

    fn find_or_create(&self, uri: &str) -> Result<Note, SyncError> {
        Ok(match self.store.find_by_uri(uri)? {
            Some(note) => note,
            None => self.store.create(uri)?,
        })
    }

    /// Drop the index after an invariant violation so the next call rebuilds it.
    fn fail_consistency(&self, state: &mut IndexState, err: IndexError) -> SyncError {
        if matches!(err, IndexError::Inconsistent { .. }) {
            log::error!("note index is inconsistent, dropping it: {err}");
            state.index = None;
            self.set_phase(IndexPhase::Unloaded);
        }
        SyncError::Index(err)
    }

    /// Notes closest to `query`, nearest first.
    ///
    /// An empty query lists the store instead. A note matching with several
    /// sentences appears once per sentence.
    pub async fn search(&self, query: &str, offset: usize, count: usize) -> Result<Vec<Note>, SyncError> {
        if query.trim().is_empty() {
            return Ok(self.store.list(offset, count)?);
        }

        let Some(text) = sanitize_query(query)? else {
            return Ok(vec![]);
        };

        let embedded = self.embedder.embed(&[text]).await?;
        let vector = embedded.row(0).ok_or_else(|| {
            EmbeddingError::EmbeddingFailed("embedder returned no row for the query".to_string())
        })?;

        let ids: Vec<_> = {
            let mut state = self.state.lock().await;
            self.load_locked(&mut state, false).await?;

            let result = state
                .index
                .as_ref()
                .ok_or(SyncError::NotLoaded)?
                .search(vector, offset.saturating_add(count));
            let hits = match result {
                Ok(hits) => hits,
                Err(err) => return Err(self.fail_consistency(&mut state, err)),
            };

            hits.into_iter().skip(offset).map(|hit| hit.note_id).collect()
        };

        Ok(self.store.find_by_ids(&ids)?)
    }

    /// Re-embed one note from the reference service and replace its rows.
    pub async fn upsert_note(&self, uri: &str) -> Result<Note, SyncError> {
        let referential = self.reference.fetch_note_by_uri(uri).await?;
        let embeddings = self.embed_text(&referential.value).await?;

        let note = self.find_or_create(uri)?;
        self.store.set_embeddings(note.id, &embeddings)?;
        self.store.flush()?;

        let mut state = self.state.lock().await;
        self.load_locked(&mut state, false).await?;

        let index = state.index.as_mut().ok_or(SyncError::NotLoaded)?;
        let removed = index.remove_note(note.id);
        index.add_note(note.id, &embeddings)?;

        if let Err(err) = index.check_consistency() {
            return Err(self.fail_consistency(&mut state, err));
        }

        log::info!(
            "upserted note {uri}: replaced {removed} rows with {}",
            embeddings.rows()
        );

        Ok(note)
    }

    /// Remove a note from the index and the store.
    pub async fn delete_note(&self, uri: &str) -> Result<Note, SyncError> {
        let mut state = self.state.lock().await;
        self.load_locked(&mut state, false).await?;

        let note = self
            .store
            .find_by_uri(uri)?
            .ok_or_else(|| SyncError::NoteNotFound(uri.to_string()))?;

        let index = state.index.as_mut().ok_or(SyncError::NotLoaded)?;
        let removed = index.remove_note(note.id);

        if let Err(err) = index.check_consistency() {
            return Err(self.fail_consistency(&mut state, err));
        }

        self.store.delete(note.id)?;
        self.store.flush()?;

        log::info!("deleted note {uri} ({removed} rows)");

        Ok(note)
    }

    /// Embeddings of a stored note, computed from its current authoritative text.
    pub async fn note_embeddings(&self, uri: &str) -> Result<Embeddings, SyncError> {
        if self.store.find_by_uri(uri)?.is_none() {
            return Err(SyncError::NoteNotFound(uri.to_string()));
        }
        self.compute_note(uri).await
    }

    pub fn find_note(&self, uri: &str) -> Result<Note, SyncError> {
        self.store
            .find_by_uri(uri)?
            .ok_or_else(|| SyncError::NoteNotFound(uri.to_string()))
    }

    /// Rows currently indexed for `uri`, if the index is loaded.
    #[cfg(test)]
    pub async fn indexed_rows(&self, uri: &str) -> Option<usize> {
        let note = self.store.find_by_uri(uri).ok().flatten()?;
        let state = self.state.lock().await;
        state.index.as_ref().map(|index| index.rows_of(note.id).len())
    }

    #[cfg(test)]
    pub async fn index_len(&self) -> Option<usize> {
        let state = self.state.lock().await;
        state.index.as_ref().map(NoteIndex::len)
    }

    #[cfg(test)]
    pub async fn truncate_mapping(&self) {
        let mut state = self.state.lock().await;
        if let Some(index) = state.index.as_mut() {
            index.truncate_mapping();
        }
    }

    #[cfg(test)]
    pub async fn mapping(&self) -> Option<Vec<crate::notes::NoteId>> {
        let state = self.state.lock().await;
        state.index.as_ref().map(|index| index.mapping().to_vec())
    }
}
