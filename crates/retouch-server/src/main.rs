//! Retouch Project Record Server
//!
//! Hosts the remote project records that editing sessions load from and
//! flush to.
//!
//! ## API
//!
//! Every request names its caller in the `x-user-id` header.
//!
//! ```text
//! POST  /projects       { "title", "width", "height", "originalImageUrl" }
//! GET   /projects/{id}
//! PATCH /projects/{id}  partial update, only provided fields are written
//! ```

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use dashmap::DashMap;
use retouch_core::storage::{ProjectRecord, ProjectUpdate, StoreError, USER_HEADER, now_millis};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Default listen address.
const DEFAULT_ADDR: &str = "0.0.0.0:3030";

/// Request body for creating a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProject {
    pub title: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub original_image_url: Option<String>,
}

/// Error body.
#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Errors returned by handlers.
#[derive(Debug)]
enum ApiError {
    Store(StoreError),
    BadRequest(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::AccessDenied(_)) => StatusCode::FORBIDDEN,
            ApiError::Store(StoreError::Serialization(_)) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match self {
            ApiError::Store(e) => e.to_string(),
            ApiError::BadRequest(message) => message,
        };
        if status.is_server_error() {
            warn!("Request failed: {}", error);
        }
        (status, Json(ErrorBody { error })).into_response()
    }
}

/// Shared application state
struct AppState {
    /// Project records by id
    projects: DashMap<String, ProjectRecord>,
}

impl AppState {
    fn new() -> Self {
        Self {
            projects: DashMap::new(),
        }
    }

    fn get(&self, id: &str, user_id: &str) -> Result<ProjectRecord, StoreError> {
        let record = self
            .projects
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.check_owner(user_id)?;
        Ok(record.clone())
    }

    fn update(&self, id: &str, user_id: &str, update: &ProjectUpdate) -> Result<ProjectRecord, StoreError> {
        let mut record = self
            .projects
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.check_owner(user_id)?;
        record.apply(update, now_millis());
        Ok(record.clone())
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "retouch_server=info,tower_http=info".into()),
        )
        .init();

    let state = Arc::new(AppState::new());
    let app = router(state);

    let addr = listen_addr(std::env::var("RETOUCH_ADDR").ok().as_deref());
    info!("Retouch project server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/projects", post(create_project))
        .route("/projects/{id}", get(get_project).patch(update_project))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Parse the configured address, falling back to the default.
fn listen_addr(configured: Option<&str>) -> SocketAddr {
    let fallback = || SocketAddr::from(([0, 0, 0, 0], 3030));
    match configured {
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            warn!("Invalid RETOUCH_ADDR {:?} ({}), using {}", raw, e, DEFAULT_ADDR);
            fallback()
        }),
        None => DEFAULT_ADDR.parse().unwrap_or_else(|_| fallback()),
    }
}

fn caller(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {} header", USER_HEADER)))
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

async fn create_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateProject>,
) -> Result<(StatusCode, Json<ProjectRecord>), ApiError> {
    let user_id = caller(&headers)?;
    if body.width == 0 || body.height == 0 {
        return Err(ApiError::BadRequest("width and height must be positive".to_string()));
    }
    let record = ProjectRecord::new(body.title, user_id, body.width, body.height, body.original_image_url);
    info!("Created project {} for {}", record.id, record.user_id);
    state.projects.insert(record.id.clone(), record.clone());
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ProjectRecord>, ApiError> {
    let user_id = caller(&headers)?;
    Ok(Json(state.get(&id, &user_id)?))
}

async fn update_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(update): Json<ProjectUpdate>,
) -> Result<Json<ProjectRecord>, ApiError> {
    let user_id = caller(&headers)?;
    let record = state.update(&id, &user_id, &update)?;
    info!("Updated project {}", id);
    Ok(Json(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use retouch_core::storage::MemoryAssets;
    use retouch_core::{EditorSession, Geometry, HttpProjectStore, Operation, ProjectStore, SessionConfig, SessionError};

    fn headers(user: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_str(user).unwrap());
        headers
    }

    async fn create(state: &Arc<AppState>, user: &str) -> ProjectRecord {
        let body = CreateProject {
            title: "Beach".to_string(),
            width: 800,
            height: 600,
            original_image_url: Some("mem://beach.png".to_string()),
        };
        let (status, Json(record)) = create_project(State(state.clone()), headers(user), Json(body))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        record
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let state = Arc::new(AppState::new());
        let created = create(&state, "user-1").await;

        let Json(fetched) = get_project(State(state.clone()), headers("user-1"), Path(created.id.clone()))
            .await
            .unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.current_image_url.as_deref(), Some("mem://beach.png"));
    }

    #[tokio::test]
    async fn test_partial_update() {
        let state = Arc::new(AppState::new());
        let created = create(&state, "user-1").await;

        let update = ProjectUpdate {
            width: Some(400),
            active_transformations: Some("crop".to_string()),
            ..Default::default()
        };
        let Json(updated) = update_project(
            State(state.clone()),
            headers("user-1"),
            Path(created.id.clone()),
            Json(update),
        )
        .await
        .unwrap();
        assert_eq!(updated.width, 400);
        assert_eq!(updated.height, 600);
        assert_eq!(updated.active_transformations.as_deref(), Some("crop"));
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let state = Arc::new(AppState::new());
        let created = create(&state, "user-1").await;

        let missing = get_project(State(state.clone()), headers("user-1"), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let denied = get_project(State(state.clone()), headers("user-2"), Path(created.id.clone()))
            .await
            .unwrap_err();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let anonymous = get_project(State(state.clone()), HeaderMap::new(), Path(created.id))
            .await
            .unwrap_err();
        assert_eq!(anonymous.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_geometry() {
        let state = Arc::new(AppState::new());
        let body = CreateProject {
            title: "Empty".to_string(),
            width: 0,
            height: 10,
            original_image_url: None,
        };
        let err = create_project(State(state.clone()), headers("user-1"), Json(body))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(state.projects.is_empty());
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbaImage::from_pixel(width, height, image::Rgba([40, 90, 160, 255]));
        let mut bytes = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    async fn serve(state: Arc<AppState>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_editor_session_over_http() {
        let state = Arc::new(AppState::new());
        let record = ProjectRecord::new("Photo", "user-1", 20, 10, Some("mem://photo.png".to_string()));
        let id = record.id.clone();
        state.projects.insert(id.clone(), record);
        let base_url = serve(state.clone()).await;

        let assets = MemoryAssets::new();
        assets.insert("mem://photo.png", png(20, 10));
        let store = Arc::new(HttpProjectStore::new(base_url.as_str(), "user-1").unwrap());

        let mut session = EditorSession::open(&id, store.clone(), &assets, SessionConfig::default())
            .await
            .unwrap();
        session.apply(Operation::Resize { width: 10, height: 5 }).unwrap();
        session.flush().await.unwrap();

        let stored = state.projects.get(&id).unwrap().clone();
        assert_eq!((stored.width, stored.height), (10, 5));
        assert_eq!(stored.active_transformations.as_deref(), Some("resize"));
        assert!(stored.canvas_state.is_some());

        let reopened = EditorSession::open(&id, store, &assets, SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(reopened.geometry(), Geometry::new(10, 5));
        assert_eq!(reopened.operations().len(), 1);
    }

    #[tokio::test]
    async fn test_http_store_errors() {
        let state = Arc::new(AppState::new());
        let record = ProjectRecord::new("Photo", "user-1", 4, 4, Some("mem://photo.png".to_string()));
        let id = record.id.clone();
        state.projects.insert(id.clone(), record);
        let base_url = serve(state).await;
        let assets = MemoryAssets::new();

        let stranger = Arc::new(HttpProjectStore::new(base_url.as_str(), "user-2").unwrap());
        let denied = EditorSession::open(&id, stranger.clone(), &assets, SessionConfig::default()).await;
        assert!(matches!(denied, Err(SessionError::AccessDenied(_))));

        let missing = EditorSession::open("nope", stranger.clone(), &assets, SessionConfig::default()).await;
        assert!(matches!(missing, Err(SessionError::NotFound(_))));

        let update = ProjectUpdate {
            width: Some(2),
            ..Default::default()
        };
        assert_eq!(
            stranger.update_project(&id, &update).await,
            Err(StoreError::AccessDenied(id.clone()))
        );
    }

    #[test]
    fn test_listen_addr() {
        assert_eq!(listen_addr(None), "0.0.0.0:3030".parse().unwrap());
        assert_eq!(listen_addr(Some("127.0.0.1:8080")), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(listen_addr(Some("not an address")), "0.0.0.0:3030".parse().unwrap());
    }

    #[test]
    fn test_router_builds() {
        let _ = router(Arc::new(AppState::new()));
    }
}
