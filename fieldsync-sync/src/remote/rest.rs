//! HTTP implementation of the remote boundary, speaking PostgREST conventions.

use super::{Filter, RemoteResult, RemoteService};
use crate::error::{RemoteError, SyncError, SyncResult};
use async_trait::async_trait;
use fieldsync_types::RemoteId;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// SQLSTATE of a unique constraint violation.
const UNIQUE_VIOLATION: &str = "23505";

/// Connection settings for the remote REST service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Service root, e.g. `https://project.example.com`.
    pub base_url: String,
    /// Sent as `apikey` and as bearer token.
    pub api_key: String,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            api_key: String::new(),
            timeout_secs: 30,
        }
    }
}

/// Error body returned by the service.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// Remote service over HTTP.
pub struct RestRemote {
    config: RemoteConfig,
    client: Client,
}

impl RestRemote {
    pub fn new(config: RemoteConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn table_url(&self, collection: &str) -> String {
        format!("{}/rest/v1/{}", self.config.base_url.trim_end_matches('/'), collection)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> RemoteResult<Response> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| RemoteError::Transient(format!("{what} failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body, what))
    }

    async fn rows(response: Response, what: &str) -> RemoteResult<Vec<Value>> {
        let body: Value = response
            .json()
            .await
            .map_err(|e| RemoteError::Transient(format!("failed to parse {what} response: {e}")))?;
        Ok(match body {
            Value::Array(rows) => rows,
            Value::Null => Vec::new(),
            row => vec![row],
        })
    }
}

/// Maps an error response to the remote error taxonomy.
fn classify(status: StatusCode, body: &str, what: &str) -> RemoteError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let code = parsed.as_ref().and_then(|b| b.code.as_deref());
    let message = parsed
        .as_ref()
        .and_then(|b| b.message.clone())
        .unwrap_or_else(|| body.to_string());
    let detail = format!("{what}: HTTP {}: {message}", status.as_u16());

    if status == StatusCode::CONFLICT || code == Some(UNIQUE_VIOLATION) {
        RemoteError::Conflict(detail)
    } else if status == StatusCode::NOT_FOUND {
        RemoteError::NotFound(detail)
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        RemoteError::Transient(detail)
    } else {
        RemoteError::Validation(detail)
    }
}

#[async_trait]
impl RemoteService for RestRemote {
    async fn select(&self, collection: &str, filter: &Filter) -> RemoteResult<Vec<Value>> {
        let mut query = vec![("select".to_string(), "*".to_string())];
        query.extend(filter.to_query_pairs());
        debug!("GET {} {:?}", collection, query);

        let request = self.client.get(self.table_url(collection)).query(&query);
        let response = self.send(request, "select").await?;
        Self::rows(response, "select").await
    }

    async fn insert(&self, collection: &str, row: Value) -> RemoteResult<Value> {
        debug!("POST {}", collection);
        let request = self
            .client
            .post(self.table_url(collection))
            .header("Prefer", "return=representation")
            .json(&row);
        let response = self.send(request, "insert").await?;
        Self::rows(response, "insert")
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::Transient("insert returned no row".to_string()))
    }

    async fn update(&self, collection: &str, id: RemoteId, patch: Value) -> RemoteResult<Value> {
        debug!("PATCH {} {}", collection, id);
        let request = self
            .client
            .patch(self.table_url(collection))
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(&patch);
        let response = self.send(request, "update").await?;
        Self::rows(response, "update")
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::NotFound(format!("{collection}/{id}")))
    }

    async fn delete(&self, collection: &str, id: RemoteId) -> RemoteResult<()> {
        debug!("DELETE {} {}", collection, id);
        let request = self
            .client
            .delete(self.table_url(collection))
            .query(&[("id", format!("eq.{id}"))]);
        self.send(request, "delete").await?;
        Ok(())
    }
}
