//! REST client for the BrewTracker backend.

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::{ChangeSet, Cursor, RemoteApi, RemoteError};
use crate::models::{Entity, EntityType, Patch};

#[derive(Serialize)]
struct UpdateRequest<'a> {
    patch: &'a Patch,
    expected_version: u64,
}

/// Body of a 409 response.
#[derive(Deserialize)]
struct MismatchBody {
    #[serde(default)]
    current: Option<Entity>,
}

/// Talks JSON over HTTP with a bearer API key.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    server_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(server_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Builds an HTTP URL for a given path.
    fn build_url(&self, path: &str) -> String {
        let base_url = if !self.server_url.starts_with("http://")
            && !self.server_url.starts_with("https://")
        {
            format!("http://{}", self.server_url)
        } else {
            self.server_url.clone()
        };

        format!("{}{}", base_url.trim_end_matches('/'), path)
    }

    fn collection_url(&self, entity_type: EntityType) -> String {
        self.build_url(&format!("/api/{}", entity_type))
    }

    fn record_url(&self, entity_type: EntityType, id: &str) -> String {
        self.build_url(&format!("/api/{}/{}", entity_type, urlencoding::encode(id)))
    }

    fn changes_url(&self, cursor: Option<&Cursor>) -> String {
        match cursor {
            Some(cursor) => self.build_url(&format!(
                "/api/sync/changes?cursor={}",
                urlencoding::encode(cursor.as_str())
            )),
            None => self.build_url("/api/sync/changes"),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, RemoteError> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response).await
    }
}

fn map_transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else if e.is_connect() {
        RemoteError::Offline
    } else {
        RemoteError::Network(e.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::CONFLICT => {
            let body: MismatchBody = response
                .json()
                .await
                .unwrap_or(MismatchBody { current: None });
            Err(RemoteError::VersionMismatch {
                current: body.current.map(Box::new),
            })
        }
        StatusCode::NOT_FOUND => Err(RemoteError::NotFound),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RemoteError::Unauthorized),
        _ => {
            let message = response.text().await.unwrap_or_default();
            Err(RemoteError::Http {
                status: status.as_u16(),
                message,
            })
        }
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    response
        .json()
        .await
        .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn create(&self, entity: &Entity) -> Result<Entity, RemoteError> {
        let url = self.collection_url(entity.entity_type());
        tracing::debug!(%url, "POST");
        let response = self.send(self.client.post(&url).json(entity)).await?;
        read_json(response).await
    }

    async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        patch: &Patch,
        expected_version: u64,
    ) -> Result<Entity, RemoteError> {
        let url = self.record_url(entity_type, id);
        tracing::debug!(%url, expected_version, "PATCH");
        let body = UpdateRequest {
            patch,
            expected_version,
        };
        let response = self.send(self.client.patch(&url).json(&body)).await?;
        read_json(response).await
    }

    async fn delete(
        &self,
        entity_type: EntityType,
        id: &str,
        expected_version: Option<u64>,
    ) -> Result<(), RemoteError> {
        let mut url = self.record_url(entity_type, id);
        if let Some(version) = expected_version {
            url = format!("{}?expected_version={}", url, version);
        }
        tracing::debug!(%url, "DELETE");
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }

    async fn fetch(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>, RemoteError> {
        let url = self.record_url(entity_type, id);
        match self.send(self.client.get(&url)).await {
            Ok(response) => read_json(response).await.map(Some),
            Err(RemoteError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn changes_since(&self, cursor: Option<&Cursor>) -> Result<ChangeSet, RemoteError> {
        let url = self.changes_url(cursor);
        tracing::debug!(%url, "GET changes");
        let response = self.send(self.client.get(&url)).await?;
        read_json(response).await
    }
}
