//! HTTP ingress: CSV upload and health report.

use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::health::HealthCheck;
use crate::pipeline::{PublishError, Publisher, Route};
use crate::stages::FileReadyEvent;

/// Uploads are streamed to disk; this only caps a single request
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub publisher: Publisher,
    pub file_route: Route,
    pub upload_dir: PathBuf,
    pub health: HealthCheck,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/upload", post(upload))
        .route("/healthcheck", get(healthcheck))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub file_id: Uuid,
    pub file_name: String,
    pub status: &'static str,
}

#[derive(Debug)]
pub enum IngressError {
    BadRequest(String),
    Io(std::io::Error),
    Publish(PublishError),
}

impl fmt::Display for IngressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngressError::BadRequest(msg) => write!(f, "{}", msg),
            IngressError::Io(e) => write!(f, "Failed to store upload: {}", e),
            IngressError::Publish(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for IngressError {}

impl From<std::io::Error> for IngressError {
    fn from(err: std::io::Error) -> Self {
        IngressError::Io(err)
    }
}

impl From<PublishError> for IngressError {
    fn from(err: PublishError) -> Self {
        IngressError::Publish(err)
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            IngressError::BadRequest(_) => StatusCode::BAD_REQUEST,
            IngressError::Io(_) | IngressError::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Upload failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Final path component only, so a client cannot write outside the upload directory
fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = Path::new(raw.trim()).file_name()?.to_string_lossy().into_owned();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), IngressError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| IngressError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field
            .file_name()
            .and_then(sanitize_file_name)
            .ok_or_else(|| IngressError::BadRequest("Missing file name".to_string()))?;
        if !file_name.to_ascii_lowercase().ends_with(".csv") {
            tracing::warn!(file_name = %file_name, "Rejected upload with invalid format");
            return Err(IngressError::BadRequest("Only CSV files are allowed.".to_string()));
        }

        let file_id = Uuid::new_v4();
        tokio::fs::create_dir_all(&state.upload_dir).await?;
        let path = state.upload_dir.join(format!("{}_{}", file_id, file_name));

        let event = FileReadyEvent {
            file_id,
            file_path: path.to_string_lossy().into_owned(),
            file_name: file_name.clone(),
        };
        if let Err(e) = store_and_announce(&state, &mut field, &path, &event).await {
            // Nothing downstream will ever read a file that was not announced
            if let Err(remove_error) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %remove_error, "Failed to remove partial upload");
            }
            return Err(e);
        }

        tracing::info!(file_id = %file_id, file_name = %file_name, path = %path.display(), "File accepted");
        return Ok((
            StatusCode::ACCEPTED,
            Json(UploadResponse {
                file_id,
                file_name,
                status: "accepted",
            }),
        ));
    }

    Err(IngressError::BadRequest("Missing multipart field 'file'".to_string()))
}

async fn store_and_announce(
    state: &AppState,
    field: &mut Field<'_>,
    path: &Path,
    event: &FileReadyEvent,
) -> Result<(), IngressError> {
    let mut file = tokio::fs::File::create(path).await?;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| IngressError::BadRequest(e.to_string()))?
    {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    state.publisher.publish(&state.file_route, event).await?;
    Ok(())
}

async fn healthcheck(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.health.check().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::persistence::MemoryStore;
    use crate::stages::StageKind;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "debtflowboundary";

    fn multipart_request(field: &str, file_name: &str, contents: &str) -> Request<Body> {
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n\
             Content-Type: text/csv\r\n\r\n{contents}\r\n--{b}--\r\n",
            b = BOUNDARY,
        );
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header("content-type", format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(Body::from(body))
            .unwrap()
    }

    async fn app(broker: &MemoryBroker, upload_dir: &Path) -> Router {
        let channel = broker.open_channel().await.unwrap();
        let topology = StageKind::FileSplit.topology(1000);
        topology.declare(channel.as_ref()).await.unwrap();

        router(AppState {
            publisher: Publisher::new(channel),
            file_route: topology.route(),
            upload_dir: upload_dir.to_path_buf(),
            health: HealthCheck::new(
                Arc::new(MemoryStore::new()),
                Arc::new(broker.clone()),
                Duration::from_millis(500),
            ),
        })
    }

    #[tokio::test]
    async fn test_csv_upload_is_saved_and_announced() {
        let broker = MemoryBroker::new();
        let dir = tempfile::tempdir().unwrap();
        let app = app(&broker, dir.path()).await;

        let response = app
            .oneshot(multipart_request("file", "debts.csv", "name\nAna\n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let published = broker.drain("file_processing_queue").await;
        assert_eq!(published.len(), 1);
        let event: FileReadyEvent = published[0].decode().unwrap();
        assert_eq!(event.file_name, "debts.csv");
        assert!(event.file_path.ends_with(&format!("{}_debts.csv", event.file_id)));
        assert_eq!(std::fs::read_to_string(&event.file_path).unwrap(), "name\nAna\n");
    }

    #[tokio::test]
    async fn test_non_csv_upload_is_rejected() {
        let broker = MemoryBroker::new();
        let dir = tempfile::tempdir().unwrap();
        let app = app(&broker, dir.path()).await;

        let response = app
            .oneshot(multipart_request("file", "debts.xlsx", "binary"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(broker.drain("file_processing_queue").await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_announcement_leaves_no_file_behind() {
        let broker = MemoryBroker::new();
        let dir = tempfile::tempdir().unwrap();
        let app = app(&broker, dir.path()).await;
        broker.set_available(false);

        let response = app
            .oneshot(multipart_request("file", "debts.csv", "name\nAna\n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_healthcheck_reports_unavailable_broker() {
        let broker = MemoryBroker::new();
        let dir = tempfile::tempdir().unwrap();
        let app = app(&broker, dir.path()).await;
        broker.set_available(false);

        let response = app
            .oneshot(Request::builder().uri("/healthcheck").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["details"]["broker"], false);
    }

    #[test]
    fn test_file_name_is_reduced_to_last_component() {
        assert_eq!(sanitize_file_name("../../etc/x.csv").as_deref(), Some("x.csv"));
        assert_eq!(sanitize_file_name(".."), None);
    }
}
