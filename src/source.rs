//! Where service trees come from.
//!
//! The backing store is an external collaborator. A [`TreeSource`] returns one
//! service record in nested-include shape; the cache builds the tree from it.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{Client, Url};
use serde_json::Value;
use std::path::PathBuf;
use tracing::debug;

/// Async trait implemented by each backing store adapter.
#[async_trait::async_trait]
pub trait TreeSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_service(&self, service_id: &str) -> Result<Value>;
}

/// Reads `GET {base_url}/services/{id}/tree` from a REST backend.
#[derive(Clone)]
pub struct RestTreeSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestTreeSource {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// The id goes in as a single percent-encoded path segment.
    fn url(&self, service_id: &str) -> Result<Url> {
        if matches!(service_id, "" | "." | "..") {
            bail!("Invalid service id: {:?}", service_id);
        }
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid store URL: {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("Store URL cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(["services", service_id, "tree"]);
        Ok(url)
    }
}

#[async_trait::async_trait]
impl TreeSource for RestTreeSource {
    fn name(&self) -> &str {
        "rest"
    }

    async fn fetch_service(&self, service_id: &str) -> Result<Value> {
        let url = self.url(service_id)?;
        debug!("Fetching service tree from {}", url);

        let mut request = self.client.get(url.clone()).header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Fetching service {} failed: {} - {}",
                service_id,
                status,
                text
            ));
        }

        Ok(resp.json().await?)
    }
}

/// Reads `{dir}/{id}.json`, for local runs without a backend.
#[derive(Debug, Clone)]
pub struct DirTreeSource {
    dir: PathBuf,
}

impl DirTreeSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait::async_trait]
impl TreeSource for DirTreeSource {
    fn name(&self) -> &str {
        "dir"
    }

    async fn fetch_service(&self, service_id: &str) -> Result<Value> {
        if service_id.is_empty() || service_id.contains(['/', '\\', '.']) {
            anyhow::bail!("Invalid service id: {:?}", service_id);
        }

        let path = self.dir.join(format!("{}.json", service_id));
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read service file: {:?}", path))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse service file: {:?}", path))
    }
}
