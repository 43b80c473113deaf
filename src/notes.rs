use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Instant,
};

use crate::semantic::Embeddings;
use crate::storage::{BackendLocal, StorageManager};

pub type NoteId = u64;

/// Local copy of a note: its id and uri. Embeddings live next to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub uri: String,
}

/// Persistence for notes and their sentence embeddings.
///
/// Mutations are visible to reads immediately but only reach disk on
/// [`NoteStore::flush`], which lets bulk rebuilds batch their commits.
pub trait NoteStore: Send + Sync {
    /// Page through notes in id order.
    fn list(&self, offset: usize, count: usize) -> anyhow::Result<Vec<Note>>;
    fn all(&self) -> anyhow::Result<Vec<Note>>;
    fn find_by_uri(&self, uri: &str) -> anyhow::Result<Option<Note>>;
    /// Resolve ids in the given order. Unknown ids are skipped, duplicates kept.
    fn find_by_ids(&self, ids: &[NoteId]) -> anyhow::Result<Vec<Note>>;
    fn create(&self, uri: &str) -> anyhow::Result<Note>;
    fn embeddings(&self, id: NoteId) -> anyhow::Result<Option<Embeddings>>;
    fn set_embeddings(&self, id: NoteId, embeddings: &Embeddings) -> anyhow::Result<()>;
    fn delete(&self, id: NoteId) -> anyhow::Result<()>;
    fn delete_all(&self) -> anyhow::Result<()>;
    fn flush(&self) -> anyhow::Result<()>;
}

const CSV_HEADERS: [&str; 2] = ["id", "uri"];

const BLOB_EXTENSION: &str = "f32";

#[derive(Debug, Default)]
struct CsvState {
    notes: Vec<Note>,
    next_id: NoteId,
    /// Staged blob writes (`Some`) and deletions (`None`)
    pending: HashMap<NoteId, Option<Embeddings>>,
    wipe_blobs: bool,
    dirty: bool,
}

/// Notes in a CSV file, embeddings as one blob file per note.
#[derive(Debug, Clone)]
pub struct BackendCsv {
    state: Arc<RwLock<CsvState>>,
    blobs: BackendLocal,
    path: PathBuf,
    dimensions: usize,
}

fn blob_ident(id: NoteId) -> String {
    format!("{id}.{BLOB_EXTENSION}")
}

impl BackendCsv {
    pub fn load(path: impl AsRef<Path>, blobs_dir: impl AsRef<Path>, dimensions: usize) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Err(err) = std::fs::metadata(&path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("Creating new note store at {}", path.display());
                    let mut csv_wrt = csv::Writer::from_path(&path)?;
                    csv_wrt.write_record(CSV_HEADERS)?;
                    csv_wrt.flush()?;
                }
                _ => Err(err)?,
            }
        }

        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_path(&path)?;

        let mut notes = vec![];
        for record in csv_reader.records() {
            let record = record?;
            let id = record
                .get(0)
                .ok_or(anyhow!("couldnt get record id"))?
                .parse::<NoteId>()?;
            let uri = record
                .get(1)
                .ok_or(anyhow!("couldnt get record uri"))?
                .to_string();

            notes.push(Note { id, uri });
        }
        notes.sort_by_key(|note| note.id);

        log::debug!(
            "took {}ms to read {} notes",
            now.elapsed().as_micros() as f64 / 1000.0,
            notes.len()
        );

        let next_id = notes.last().map(|note| note.id + 1).unwrap_or(0);

        Ok(BackendCsv {
            state: Arc::new(RwLock::new(CsvState {
                notes,
                next_id,
                ..Default::default()
            })),
            blobs: BackendLocal::new(blobs_dir)?,
            path,
            dimensions,
        })
    }

    fn read_state(&self) -> anyhow::Result<std::sync::RwLockReadGuard<'_, CsvState>> {
        self.state
            .read()
            .map_err(|err| anyhow!("note store lock poisoned: {err}"))
    }

    fn write_state(&self) -> anyhow::Result<std::sync::RwLockWriteGuard<'_, CsvState>> {
        self.state
            .write()
            .map_err(|err| anyhow!("note store lock poisoned: {err}"))
    }

    fn write_csv(&self, notes: &[Note]) -> anyhow::Result<()> {
        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push("-tmp");

        let mut csv_wrt = csv::Writer::from_path(&temp_path)?;
        csv_wrt.write_record(CSV_HEADERS)?;
        for note in notes {
            csv_wrt.write_record([note.id.to_string().as_str(), note.uri.as_str()])?;
        }
        csv_wrt.flush()?;
        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }
}

impl NoteStore for BackendCsv {
    fn list(&self, offset: usize, count: usize) -> anyhow::Result<Vec<Note>> {
        let state = self.read_state()?;
        Ok(state.notes.iter().skip(offset).take(count).cloned().collect())
    }

    fn all(&self) -> anyhow::Result<Vec<Note>> {
        Ok(self.read_state()?.notes.clone())
    }

    fn find_by_uri(&self, uri: &str) -> anyhow::Result<Option<Note>> {
        let state = self.read_state()?;
        Ok(state.notes.iter().find(|note| note.uri == uri).cloned())
    }

    fn find_by_ids(&self, ids: &[NoteId]) -> anyhow::Result<Vec<Note>> {
        let state = self.read_state()?;
        let by_id: HashMap<NoteId, &Note> = state.notes.iter().map(|note| (note.id, note)).collect();

        Ok(ids
            .iter()
            .filter_map(|id| by_id.get(id).map(|note| (*note).clone()))
            .collect())
    }

    fn create(&self, uri: &str) -> anyhow::Result<Note> {
        let mut state = self.write_state()?;

        if state.notes.iter().any(|note| note.uri == uri) {
            return Err(anyhow!("note with uri {uri} already exists"));
        }

        let note = Note {
            id: state.next_id,
            uri: uri.to_string(),
        };
        state.next_id += 1;
        state.notes.push(note.clone());
        state.dirty = true;

        Ok(note)
    }

    fn embeddings(&self, id: NoteId) -> anyhow::Result<Option<Embeddings>> {
        let state = self.read_state()?;

        if let Some(staged) = state.pending.get(&id) {
            return Ok(staged.clone());
        }
        if state.wipe_blobs {
            return Ok(None);
        }
        drop(state);

        let ident = blob_ident(id);
        if !self.blobs.exists(&ident) {
            return Ok(None);
        }

        let bytes = self.blobs.read(&ident)?;
        Ok(Some(Embeddings::from_bytes(&bytes, self.dimensions)?))
    }

    fn set_embeddings(&self, id: NoteId, embeddings: &Embeddings) -> anyhow::Result<()> {
        if embeddings.dimensions() != self.dimensions {
            return Err(anyhow!(
                "embeddings have {} columns, store expects {}",
                embeddings.dimensions(),
                self.dimensions
            ));
        }

        let mut state = self.write_state()?;
        if !state.notes.iter().any(|note| note.id == id) {
            return Err(anyhow!("note with id {id} not found"));
        }

        state.pending.insert(id, Some(embeddings.clone()));
        state.dirty = true;
        Ok(())
    }

    fn delete(&self, id: NoteId) -> anyhow::Result<()> {
        let mut state = self.write_state()?;

        if let Some(idx) = state.notes.iter().position(|note| note.id == id) {
            state.notes.remove(idx);
            state.pending.insert(id, None);
            state.dirty = true;
        }

        Ok(())
    }

    fn delete_all(&self) -> anyhow::Result<()> {
        let mut state = self.write_state()?;

        state.notes.clear();
        state.pending.clear();
        state.wipe_blobs = true;
        state.dirty = true;

        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()> {
        let mut state = self.write_state()?;
        if !state.dirty {
            return Ok(());
        }

        if state.wipe_blobs {
            for ident in self.blobs.list() {
                if ident.ends_with(BLOB_EXTENSION) {
                    self.blobs.delete(&ident)?;
                }
            }
            state.wipe_blobs = false;
        }

        // entries leave the staging area only once they are on disk
        let staged: Vec<NoteId> = state.pending.keys().copied().collect();
        for id in staged {
            match state.pending.get(&id) {
                Some(Some(embeddings)) => self.blobs.write(&blob_ident(id), &embeddings.to_bytes())?,
                Some(None) => self.blobs.delete(&blob_ident(id))?,
                None => continue,
            }
            state.pending.remove(&id);
        }

        self.write_csv(&state.notes)?;
        state.dirty = false;

        Ok(())
    }
}
