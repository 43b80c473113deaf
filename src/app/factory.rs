use crate::{
    config::Config,
    notes::{BackendCsv, NoteStore},
    reference::{ReferenceClient, ReferenceSource},
    semantic::{build_embedder, Embedder, IndexSynchronizer},
};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Builds the long-lived components once, at startup.
pub struct AppFactory;

impl AppFactory {
    /// Note store, reference client, embedder and the synchronizer tying them together.
    pub fn create_synchronizer(config: &Config) -> Result<Arc<IndexSynchronizer>> {
        let embedder = Self::create_embedder(config)?;
        let store = Self::create_store(config)?;
        let reference = Self::create_reference(config)?;

        Ok(Arc::new(IndexSynchronizer::new(
            store,
            reference,
            embedder,
            &config.sync,
        )))
    }

    pub fn create_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
        log::info!(
            "Using {:?} embedding strategy ({} dimensions)",
            config.embedding.strategy,
            config.embedding.dimension
        );
        build_embedder(&config.embedding, config.models_dir())
            .context("Failed to initialize embedder")
    }

    pub fn create_store(config: &Config) -> Result<Arc<dyn NoteStore>> {
        let store = BackendCsv::load(
            config.notes_path(),
            config.embeddings_dir(),
            config.embedding.dimension,
        )
        .context("Failed to open note store")?;

        Ok(Arc::new(store))
    }

    pub fn create_reference(config: &Config) -> Result<Arc<dyn ReferenceSource>> {
        log::info!("Using reference service: {}", config.reference.url);
        let client = ReferenceClient::new(&config.reference)
            .context("Failed to create reference service client")?;

        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_store_in_base_path() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::for_tests(tmp.path().to_str().unwrap());

        let store = AppFactory::create_store(&config).unwrap();
        store.create("a").unwrap();
        store.flush().unwrap();

        assert!(tmp.path().join("notes.csv").exists());
        assert!(tmp.path().join("embeddings").is_dir());
    }

    #[test]
    fn test_create_reference_rejects_bad_url() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(tmp.path().to_str().unwrap());
        config.reference.url = "::nope::".to_string();

        assert!(AppFactory::create_reference(&config).is_err());
    }
}
