//! Optional upload of finished outputs
//!
//! `put` returns the reference stored in the job record's
//! `output_reference`: a filesystem path for [`LocalObjectStore`], a URL for
//! [`HttpObjectStore`].

use crate::codec::ensure_parent;
use crate::error::{JobError, Result};
use crate::retry::retry_with_exponential_backoff;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub trait ObjectStore: Send + Sync {
    fn put<'a>(&'a self, local_path: &'a Path, remote_key: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// Copies outputs into a directory, e.g. a mounted bucket
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ObjectStore for LocalObjectStore {
    fn put<'a>(&'a self, local_path: &'a Path, remote_key: &'a str) -> BoxFuture<'a, Result<String>> {
        async move {
            let target = self.root.join(remote_key);
            ensure_parent(&target)?;
            let bytes = tokio::fs::copy(local_path, &target).await?;
            info!(key = %remote_key, bytes = bytes, target = %target.display(), "Output stored");
            Ok(target.to_string_lossy().to_string())
        }
        .boxed()
    }
}

/// PUTs outputs under a base URL, retrying transient failures
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    max_attempts: u32,
    base_delay_ms: u64,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| JobError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_attempts: 5,
            base_delay_ms: 200,
        })
    }

    pub fn with_retry(mut self, max_attempts: u32, base_delay_ms: u64) -> Self {
        self.max_attempts = max_attempts;
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn url_for(&self, remote_key: &str) -> String {
        format!("{}/{}", self.base_url, remote_key.trim_start_matches('/'))
    }
}

impl ObjectStore for HttpObjectStore {
    fn put<'a>(&'a self, local_path: &'a Path, remote_key: &'a str) -> BoxFuture<'a, Result<String>> {
        async move {
            let body = tokio::fs::read(local_path).await?;
            let url = self.url_for(remote_key);
            let size = body.len();

            retry_with_exponential_backoff(
                || {
                    let request = self.client.put(&url).body(body.clone());
                    let url = url.as_str();
                    async move {
                        let response = request.send().await?;
                        let status = response.status();
                        // the same request will be refused again
                        if status.is_client_error() {
                            return Err(JobError::UploadRejected(format!("{} returned {}", url, status)));
                        }
                        response.error_for_status()?;
                        Ok(())
                    }
                },
                self.max_attempts,
                self.base_delay_ms,
            )
            .await?;

            info!(url = %url, bytes = size, "Output uploaded");
            Ok(url)
        }
        .boxed()
    }
}
