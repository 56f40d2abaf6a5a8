//! HTTP index client
//!
//! Talks to a Solr-style JSON update/select API rooted at the endpoint URL.

use async_trait::async_trait;
use reqwest::{Client, Method};
use search_sync_core::prelude::*;
use search_sync_core::{IndexConfig, DELETED_FIELD, DELETED_SEQUENCE_FIELD, ID_FIELD};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// HTTP index client configuration
#[derive(Debug, Clone)]
pub struct HttpIndexConfig {
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl HttpIndexConfig {
    pub fn new(endpoint: impl Into<String>, config: &IndexConfig) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
        }
    }
}

/// Index client for one endpoint
pub struct HttpIndexClient {
    client: Client,
    config: HttpIndexConfig,
}

impl HttpIndexClient {
    pub fn new(config: HttpIndexConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::index_with_source("Failed to create client", e))?;

        Ok(Self { client, config })
    }

    fn build_request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.endpoint, path);
        self.client
            .request(method, &url)
            .header("Content-Type", "application/json")
    }

    async fn update(&self, body: Value) -> Result<()> {
        let resp = self
            .build_request(Method::POST, "/update?wt=json")
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::index_with_source("Update request failed", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::index(format!(
                "Update returned {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// Range query selecting tombstones stamped before `cutoff`
fn tombstone_query(cutoff: Sequence) -> String {
    format!(
        "{}:true AND {}:[* TO {}}}",
        DELETED_FIELD,
        DELETED_SEQUENCE_FIELD,
        cutoff.as_i64()
    )
}

fn parse_ids(body: &Value) -> Result<Vec<String>> {
    let docs = body
        .pointer("/response/docs")
        .and_then(Value::as_array)
        .ok_or_else(|| SyncError::index("select response has no response.docs"))?;

    Ok(docs
        .iter()
        .filter_map(|doc| doc.get(ID_FIELD))
        .map(|id| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect())
}

#[async_trait]
impl IndexClient for HttpIndexClient {
    async fn add(&self, documents: &[IndexedDocument]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let body = Value::Array(documents.iter().map(IndexedDocument::to_json).collect());
        self.update(body).await?;
        debug!(
            endpoint = %self.config.endpoint,
            count = documents.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Added documents"
        );
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<()> {
        trace!(endpoint = %self.config.endpoint, id, "Deleting document");
        self.update(json!({ "delete": { "id": id } })).await
    }

    async fn commit(&self) -> Result<()> {
        self.update(json!({ "commit": {} })).await
    }

    async fn tombstones_before(&self, cutoff: Sequence, limit: usize) -> Result<Vec<String>> {
        let rows = limit.to_string();
        let resp = self
            .build_request(Method::GET, "/select")
            .query(&[
                ("q", tombstone_query(cutoff).as_str()),
                ("fl", ID_FIELD),
                ("rows", rows.as_str()),
                ("wt", "json"),
            ])
            .send()
            .await
            .map_err(|e| SyncError::index_with_source("Select request failed", e))?;

        if !resp.status().is_success() {
            return Err(SyncError::index(format!(
                "Select returned {}",
                resp.status()
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| SyncError::index_with_source("Failed to parse response", e))?;
        parse_ids(&body)
    }

    async fn ping(&self) -> Result<()> {
        let resp = self
            .build_request(Method::GET, "/admin/ping?wt=json")
            .send()
            .await
            .map_err(|e| SyncError::index_with_source("Ping failed", e))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SyncError::index(format!("Ping returned {}", resp.status())))
        }
    }
}

/// Opens [`HttpIndexClient`]s with shared timeouts
#[derive(Debug, Clone, Default)]
pub struct HttpIndexConnector {
    config: IndexConfig,
}

impl HttpIndexConnector {
    pub fn new(config: IndexConfig) -> Self {
        Self { config }
    }
}

impl IndexConnector for HttpIndexConnector {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn IndexClient>> {
        let client = HttpIndexClient::new(HttpIndexConfig::new(endpoint, &self.config))?;
        Ok(Arc::new(client))
    }
}
