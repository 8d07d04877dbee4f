//! Remote invocation of single-page workers.

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::schema::{ExtractRequest, ExtractResponse};

/// Header carrying the idempotency key of an invocation.
pub const INVOCATION_ID_HEADER: &str = "x-invocation-id";

/// Runs one page job somewhere else and returns its response payload.
#[async_trait::async_trait]
pub trait PageInvoker: Send + Sync {
    async fn invoke(&self, request: ExtractRequest) -> Result<ExtractResponse>;
}

/// Invokes page workers over HTTP (by default, this same service).
#[derive(Clone)]
pub struct HttpInvoker {
    client: Client,
    worker_url: String,
}

impl HttpInvoker {
    pub fn new(client: Client, worker_url: impl Into<String>) -> Self {
        Self {
            client,
            worker_url: worker_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl PageInvoker for HttpInvoker {
    async fn invoke(&self, request: ExtractRequest) -> Result<ExtractResponse> {
        let page = request.page;
        let mut req = self.client.post(&self.worker_url).json(&request);
        if let Some(id) = &request.invocation_trigger_id {
            req = req.header(INVOCATION_ID_HEADER, id);
        }

        debug!("Invoking page worker {} for page {:?}", self.worker_url, page);
        let response = req
            .send()
            .await
            .with_context(|| format!("Failed to invoke page worker for page {:?}", page))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            anyhow::bail!("Page worker for page {:?} was already invoked", page);
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Page worker error ({}): {}", status, error_text);
        }

        response
            .json()
            .await
            .context("Failed to parse page worker response")
    }
}
