//! Project store backed by the Retouch project server.

use super::{BoxFuture, ProjectRecord, ProjectStore, ProjectUpdate, StoreError, StoreResult};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// Header naming the caller on every request.
pub const USER_HEADER: &str = "x-user-id";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Reads and patches `/projects/{id}` on a project server as `user_id`.
///
/// Requests run on reqwest, so the returned futures must be polled inside a
/// Tokio runtime.
#[derive(Debug, Clone)]
pub struct HttpProjectStore {
    client: Client,
    base_url: String,
    user_id: String,
}

impl HttpProjectStore {
    pub fn new(base_url: impl Into<String>, user_id: impl Into<String>) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn project_url(&self, id: &str) -> String {
        format!("{}/projects/{}", self.base_url, id)
    }
}

fn status_error(id: &str, status: StatusCode, message: String) -> StoreError {
    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(id.to_string()),
        StatusCode::FORBIDDEN => StoreError::AccessDenied(id.to_string()),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => StoreError::Serialization(message),
        _ => StoreError::Other(format!("status {}: {}", status, message)),
    }
}

async fn check_status(id: &str, response: Response) -> StoreResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    Err(status_error(id, status, message))
}

impl ProjectStore for HttpProjectStore {
    fn get_project(&self, id: &str) -> BoxFuture<'_, StoreResult<ProjectRecord>> {
        let id = id.to_string();
        Box::pin(async move {
            let response = self
                .client
                .get(self.project_url(&id))
                .header(USER_HEADER, &self.user_id)
                .send()
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
            let response = check_status(&id, response).await?;
            response
                .json::<ProjectRecord>()
                .await
                .map_err(|e| StoreError::Serialization(e.to_string()))
        })
    }

    fn update_project(&self, id: &str, update: &ProjectUpdate) -> BoxFuture<'_, StoreResult<()>> {
        let id = id.to_string();
        let update = update.clone();
        Box::pin(async move {
            let response = self
                .client
                .patch(self.project_url(&id))
                .header(USER_HEADER, &self.user_id)
                .json(&update)
                .send()
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
            check_status(&id, response).await?;
            log::debug!("Patched project {} at {}", id, self.base_url);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_url_trims_trailing_slash() {
        let store = HttpProjectStore::new("http://localhost:3030/", "user-1").unwrap();
        assert_eq!(store.base_url(), "http://localhost:3030");
        assert_eq!(store.project_url("abc"), "http://localhost:3030/projects/abc");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_error("p1", StatusCode::NOT_FOUND, "gone".into()),
            StoreError::NotFound("p1".into())
        );
        assert_eq!(
            status_error("p1", StatusCode::FORBIDDEN, "no".into()),
            StoreError::AccessDenied("p1".into())
        );
        assert!(matches!(
            status_error("p1", StatusCode::BAD_REQUEST, "bad".into()),
            StoreError::Serialization(m) if m == "bad"
        ));
        assert!(matches!(
            status_error("p1", StatusCode::BAD_GATEWAY, "down".into()),
            StoreError::Other(_)
        ));
    }
}
