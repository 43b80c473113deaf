use crate::{
    app::AppError,
    config::Config,
    notes::Note,
    notifications::{self, Envelope},
    semantic::{
        embeddings::{EmbeddingComputationRequest, EmbeddingComputationResponse, TextWithEmbeddings},
        IndexStatus, IndexSynchronizer,
    },
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

const DEFAULT_PAGE_COUNT: usize = 20;

#[derive(Clone)]
pub struct SharedState {
    synchronizer: Arc<IndexSynchronizer>,
}

pub fn router(synchronizer: Arc<IndexSynchronizer>) -> Router {
    let shared_state = Arc::new(SharedState { synchronizer });

    Router::new()
        .route("/notes", get(search_notes))
        .route("/notes:reload-index", get(reload_index))
        .route("/notes:index-status", get(index_status))
        .route("/notes/notifications", post(handle_notification))
        .route("/notes/{uri}", get(get_note))
        .route("/notes/{uri}/embeddings", get(get_note_embeddings))
        .route("/embeddings", post(compute_embeddings))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("shutting down");
}

/// Serve the HTTP api until Ctrl+C or SIGTERM.
///
/// With `preload`, the index is loaded in the background right away instead
/// of on the first search.
pub async fn serve(config: &Config, synchronizer: Arc<IndexSynchronizer>, preload: bool) -> anyhow::Result<()> {
    if preload {
        let synchronizer = synchronizer.clone();
        tokio::spawn(async move {
            if let Err(err) = synchronizer.ensure_loaded(false).await {
                log::error!("preloading the note index failed: {err}");
            }
        });
    }

    let app = router(synchronizer);

    let listener = tokio::net::TcpListener::bind(config.listen.as_str()).await?;
    log::info!("listening on {}", config.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[derive(Debug)]
pub struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::Sanitization(_) | AppError::Notification(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Reference(_) => {
                log::error!("{self:?}");
                StatusCode::BAD_GATEWAY
            }
            AppError::Embedding(_) => {
                log::error!("{self:?}");
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Other(_) => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    DEFAULT_PAGE_COUNT
}

async fn search_notes(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<Note>>, HttpError> {
    let notes = state
        .synchronizer
        .search(&params.q, params.offset, params.count)
        .await?;

    Ok(Json(notes))
}

async fn get_note(
    State(state): State<Arc<SharedState>>,
    Path(uri): Path<String>,
) -> Result<Json<Note>, HttpError> {
    Ok(Json(state.synchronizer.find_note(&uri)?))
}

async fn get_note_embeddings(
    State(state): State<Arc<SharedState>>,
    Path(uri): Path<String>,
) -> Result<Json<Vec<Vec<f32>>>, HttpError> {
    let embeddings = state.synchronizer.note_embeddings(&uri).await?;
    Ok(Json(embeddings.to_nested()))
}

async fn reload_index(State(state): State<Arc<SharedState>>) -> impl IntoResponse {
    let synchronizer = state.synchronizer.clone();
    tokio::spawn(async move {
        if let Err(err) = synchronizer.ensure_loaded(true).await {
            log::error!("reloading the note index failed: {err}");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({"message": "index reload started"})),
    )
}

async fn index_status(State(state): State<Arc<SharedState>>) -> Result<Json<IndexStatus>, HttpError> {
    Ok(Json(state.synchronizer.status()?))
}

async fn compute_embeddings(
    State(state): State<Arc<SharedState>>,
    Json(request): Json<EmbeddingComputationRequest>,
) -> Result<Json<EmbeddingComputationResponse>, HttpError> {
    let mut texts = Vec::with_capacity(request.texts.len());

    for text in request.texts {
        let embeddings = state.synchronizer.embed_text(&text.text).await?;
        texts.push(TextWithEmbeddings {
            id: text.id,
            embeddings: embeddings.to_nested(),
        });
    }

    Ok(Json(EmbeddingComputationResponse { texts }))
}

async fn handle_notification(
    State(state): State<Arc<SharedState>>,
    Json(envelope): Json<Envelope>,
) -> Result<StatusCode, HttpError> {
    let notification = envelope.decode()?;
    log::debug!("received {notification:?}");

    let synchronizer = state.synchronizer.clone();
    tokio::spawn(async move {
        notifications::handle(&synchronizer, notification).await;
    });

    Ok(StatusCode::ACCEPTED)
}
