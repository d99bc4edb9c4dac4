//! HTTP remote store client.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use tandem_common::{EntityType, Error, Record, Result};

use super::HttpRemoteConfig;
use crate::credentials::CredentialProvider;
use crate::remote::{BatchOutcome, RemoteChange, RemoteStore};

/// Body of `POST /sync/batch`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest<'a> {
    entity_type: &'a EntityType,
    items: &'a [Record],
}

/// Response of `GET /sync/changes`.
#[derive(Debug, Deserialize)]
struct ChangesResponse {
    changes: Vec<RemoteChange>,
}

/// Response of `GET /data/{type}/count`.
#[derive(Debug, Deserialize)]
struct CountResponse {
    count: usize,
}

/// Remote store backed by the sync server's REST API.
pub struct HttpRemoteStore {
    http: Client,
    base: Url,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpRemoteStore {
    /// Create a new client.
    ///
    /// # Errors
    /// - `base_url` does not parse
    /// - The HTTP client cannot be constructed
    pub fn new(config: HttpRemoteConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        // Url::join drops the last path segment unless the base ends with '/'.
        let mut base_url = config.base_url;
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let base = Url::parse(&base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL '{}': {}", base_url, e)))?;

        let http = Client::builder()
            .user_agent("tandem/0.1")
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            credentials,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::InvalidInput(format!("Invalid request path '{}': {}", path, e)))
    }

    /// Get authorization header.
    async fn auth_header(&self) -> Result<String> {
        match self.credentials.access_token().await {
            Some(token) if !token.is_empty() => Ok(format!("Bearer {}", token)),
            _ => Err(Error::Authentication("No access token available".to_string())),
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let auth = self.auth_header().await?;
        request
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| transport_error(what, e))
    }

    /// Map a response to a value or a typed error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            // Read the body first so a transport failure is not reported as
            // a malformed payload.
            let body = response
                .bytes()
                .await
                .map_err(|e| transport_error("read response", e))?;
            serde_json::from_slice(&body)
                .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))
        } else {
            Err(status_error(status, response).await)
        }
    }

    /// Map a response whose body is ignored.
    async fn expect_success(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, response).await)
        }
    }
}

fn transport_error(what: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{}: {}", what, err))
    } else {
        Error::Network(format!("Failed to {}: {}", what, err))
    }
}

async fn status_error(status: StatusCode, response: reqwest::Response) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::NotFound("Resource not found".to_string()),
        StatusCode::CONFLICT => Error::AlreadyExists("Resource already exists".to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Authentication("Invalid or expired token".to_string())
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            let body = response.text().await.unwrap_or_default();
            Error::InvalidInput(format!("Server rejected request: {} - {}", status, body))
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            Error::Network(format!("API error: {} - {}", status, body))
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn health(&self) -> Result<()> {
        let url = self.url("sync/health")?;
        let response = self.send(self.http.get(url), "probe health").await?;
        self.expect_success(response).await
    }

    async fn get(&self, entity_type: &EntityType, id: Uuid) -> Result<Option<Record>> {
        let url = self.url(&format!("data/{}/{}", entity_type, id))?;
        let response = self.send(self.http.get(url), "get record").await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.handle_response(response).await.map(Some)
    }

    async fn get_all(&self, entity_type: &EntityType) -> Result<Vec<Record>> {
        let url = self.url(&format!("data/{}", entity_type))?;
        let response = self.send(self.http.get(url), "list records").await?;
        self.handle_response(response).await
    }

    async fn create(&self, record: &Record) -> Result<Record> {
        let url = self.url(&format!("data/{}", record.entity_type()))?;
        let response = self
            .send(self.http.post(url).json(record), "create record")
            .await?;
        self.handle_response(response).await
    }

    async fn update(&self, record: &Record) -> Result<Record> {
        let url = self.url(&format!("data/{}/{}", record.entity_type(), record.id()))?;
        let response = self
            .send(self.http.put(url).json(record), "update record")
            .await?;
        self.handle_response(response).await
    }

    async fn delete(&self, entity_type: &EntityType, id: Uuid) -> Result<()> {
        let url = self.url(&format!("data/{}/{}", entity_type, id))?;
        let response = self.send(self.http.delete(url), "delete record").await?;
        self.expect_success(response).await
    }

    async fn count(&self, entity_type: &EntityType) -> Result<usize> {
        let url = self.url(&format!("data/{}/count", entity_type))?;
        let response = self.send(self.http.get(url), "count records").await?;
        let body: CountResponse = self.handle_response(response).await?;
        Ok(body.count)
    }

    async fn batch_upload(&self, entity_type: &EntityType, items: &[Record]) -> Result<BatchOutcome> {
        let url = self.url("sync/batch")?;
        debug!("Uploading batch of {} {} records", items.len(), entity_type);
        let body = BatchRequest { entity_type, items };
        let response = self
            .send(self.http.post(url).json(&body), "upload batch")
            .await?;
        self.handle_response(response).await
    }

    async fn changes_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteChange>> {
        let url = self.url("sync/changes")?;
        let mut request = self.http.get(url);
        if let Some(since) = since {
            let since = since.to_rfc3339_opts(SecondsFormat::Micros, true);
            request = request.query(&[("since", since)]);
        }
        let response = self.send(request, "pull changes").await?;
        let body: ChangesResponse = self.handle_response(response).await?;
        Ok(body.changes)
    }
}
