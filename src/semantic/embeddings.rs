//! Sentence embedding strategies.
//!
//! - `LocalEmbedder`: in-process fastembed model, lazily downloaded to a cache dir
//! - `RemoteEmbedder`: delegates to another instance's `POST /embeddings`
//!
//! The strategy is picked once at startup from config and shared behind
//! `Arc<dyn Embedder>`.

use async_trait::async_trait;
use fastembed::{InitOptions, TextEmbedding};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{EmbeddingConfig, EmbeddingStrategy};
use crate::semantic::matrix::{Embeddings, MatrixError};

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Model produces {got}-dim vectors, configured dimension is {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Embedding service error: {0}")]
    Remote(#[from] reqwest::Error),

    #[error("Malformed embeddings: {0}")]
    Matrix(#[from] MatrixError),
}

/// Turns sentences into one embedding row each.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Width of every produced row.
    fn dimensions(&self) -> usize;

    async fn embed(&self, sentences: &[String]) -> Result<Embeddings, EmbeddingError>;
}

/// Build the configured strategy.
pub fn build_embedder(
    config: &EmbeddingConfig,
    models_dir: PathBuf,
) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    match config.strategy {
        EmbeddingStrategy::Local => {
            let model = LocalEmbedder::new(&config.model, models_dir, config.dimension)?;
            log::info!("local embedder ready: {} ({} dimensions)", model.name(), model.dimensions());
            Ok(Arc::new(model))
        }
        EmbeddingStrategy::Remote => {
            let url = config.remote_url.clone().unwrap_or_default();
            let remote = RemoteEmbedder::new(
                &url,
                config.dimension,
                Duration::from_secs(config.timeout_secs),
            )?;
            Ok(Arc::new(remote))
        }
    }
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct LocalEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
    model_name: String,
    dimensions: usize,
}

impl LocalEmbedder {
    /// Load (downloading on first use) the named model into `cache_dir`.
    ///
    /// Fails if the model does not produce `expected_dimensions`-wide vectors.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        expected_dimensions: usize,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;

        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        log::info!(
            "Loading embedding model '{}' from {}",
            model_name,
            cache_dir.display()
        );

        let options = InitOptions::new(model_enum)
            .with_cache_dir(cache_dir)
            .with_show_download_progress(true);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = Self::probe_dimensions(&mut model)?;
        if dimensions != expected_dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: expected_dimensions,
                got: dimensions,
            });
        }

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    pub fn name(&self) -> &str {
        &self.model_name
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-base-en-v1.5-q" | "bgebaseenv15q" => {
                Ok(fastembed::EmbeddingModel::BGEBaseENV15Q)
            }
            "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "paraphrase-multilingual-mpnet-base-v2" | "paraphrasemlmpnetbasev2" => {
                Ok(fastembed::EmbeddingModel::ParaphraseMLMpnetBaseV2)
            }
            "multilingual-e5-base" | "multilinguale5base" => {
                Ok(fastembed::EmbeddingModel::MultilingualE5Base)
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5(-q), bge-large-en-v1.5, paraphrase-multilingual-mpnet-base-v2, multilingual-e5-base",
                name
            ))),
        }
    }

    /// Probe the model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, sentences: &[String]) -> Result<Embeddings, EmbeddingError> {
        if sentences.is_empty() {
            return Ok(Embeddings::empty(self.dimensions));
        }

        let model = self.model.clone();
        let texts = sentences.to_vec();

        // inference is CPU bound, keep it off the async workers
        let rows = tokio::task::spawn_blocking(move || {
            let mut model = model.lock().map_err(|e| {
                EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
            })?;

            model
                .embed(texts, None)
                .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
        })
        .await
        .map_err(|e| EmbeddingError::EmbeddingFailed(format!("embedding task failed: {}", e)))??;

        Ok(Embeddings::from_rows(self.dimensions, rows)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextReference {
    pub id: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextWithEmbeddings {
    pub id: u64,
    pub embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingComputationRequest {
    pub texts: Vec<TextReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingComputationResponse {
    pub texts: Vec<TextWithEmbeddings>,
}

/// Delegates embedding to a remote `POST /embeddings` endpoint.
pub struct RemoteEmbedder {
    endpoint: String,
    dimensions: usize,
    http: reqwest::Client,
}

impl RemoteEmbedder {
    pub fn new(base_url: &str, dimensions: usize, timeout: Duration) -> Result<Self, EmbeddingError> {
        let base_url = base_url.strip_suffix('/').unwrap_or(base_url);
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            endpoint: format!("{base_url}/embeddings"),
            dimensions,
            http,
        })
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Each sentence is sent as its own text so the delegate returns
    /// exactly one row per sentence.
    async fn embed(&self, sentences: &[String]) -> Result<Embeddings, EmbeddingError> {
        if sentences.is_empty() {
            return Ok(Embeddings::empty(self.dimensions));
        }

        let request = EmbeddingComputationRequest {
            texts: sentences
                .iter()
                .enumerate()
                .map(|(idx, text)| TextReference {
                    id: idx as u64,
                    text: text.clone(),
                })
                .collect(),
        };

        log::debug!("POST {} ({} sentences)", self.endpoint, sentences.len());
        let mut response: EmbeddingComputationResponse = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response.texts.sort_by_key(|text| text.id);

        let rows: Vec<Vec<f32>> = response
            .texts
            .into_iter()
            .flat_map(|text| text.embeddings)
            .collect();

        if rows.len() != sentences.len() {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "embedding service returned {} rows for {} sentences",
                rows.len(),
                sentences.len()
            )));
        }

        Ok(Embeddings::from_rows(self.dimensions, rows)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires model download"]
    fn test_model_creation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model = LocalEmbedder::new("all-MiniLM-L6-v2", temp_dir.path().to_path_buf(), 384);
        assert!(model.is_ok());

        let model = model.unwrap();
        assert_eq!(model.name(), "all-MiniLM-L6-v2");
        assert_eq!(model.dimensions(), 384);
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_wrong_dimension_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = LocalEmbedder::new("all-MiniLM-L6-v2", temp_dir.path().to_path_buf(), 768);
        assert!(matches!(
            result,
            Err(EmbeddingError::DimensionMismatch { expected: 768, got: 384 })
        ));
    }

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = LocalEmbedder::new("nonexistent-model", temp_dir.path().to_path_buf(), 384);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_request_wire_format() {
        let request = EmbeddingComputationRequest {
            texts: vec![TextReference {
                id: 3,
                text: "hello".to_string(),
            }],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({"texts": [{"id": 3, "text": "hello"}]})
        );
    }
}
