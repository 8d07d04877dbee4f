//! `http(s)://` storage against an object gateway or presigned URLs.
//!
//! Metadata travels as `x-meta-<key>` headers on PUT and comes back on HEAD.
//! Values are percent-encoded so any UTF-8 survives the header round trip.

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{Metadata, Storage};

const META_HEADER_PREFIX: &str = "x-meta-";

#[derive(Clone)]
pub struct HttpStorage {
    client: Client,
}

impl HttpStorage {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Storage for HttpStorage {
    async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(uri)
            .send()
            .await
            .with_context(|| format!("GET {} failed", uri))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("GET {} returned {}: {}", uri, status, text);
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn write(&self, uri: &str, data: Vec<u8>, metadata: Metadata) -> Result<()> {
        let mut req = self.client.put(uri).body(data);
        for (key, value) in &metadata {
            req = req.header(
                format!("{}{}", META_HEADER_PREFIX, key),
                urlencoding::encode(value).into_owned(),
            );
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("PUT {} failed", uri))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("PUT {} returned {}: {}", uri, status, text);
        }
        debug!("HttpStorage: wrote {}", uri);
        Ok(())
    }

    async fn exists(&self, uri: &str) -> Result<bool> {
        let resp = self
            .client
            .head(uri)
            .send()
            .await
            .with_context(|| format!("HEAD {} failed", uri))?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(false),
            s => anyhow::bail!("HEAD {} returned {}", uri, s),
        }
    }

    async fn metadata(&self, uri: &str) -> Result<Metadata> {
        let resp = self
            .client
            .head(uri)
            .send()
            .await
            .with_context(|| format!("HEAD {} failed", uri))?
            .error_for_status()
            .with_context(|| format!("HEAD {} returned error", uri))?;

        Ok(resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                let key = name.as_str().strip_prefix(META_HEADER_PREFIX)?;
                let value = urlencoding::decode(value.to_str().ok()?).ok()?;
                Some((key.to_string(), value.into_owned()))
            })
            .collect())
    }

    async fn delete(&self, uris: &[String]) -> Result<()> {
        for uri in uris {
            let resp = self
                .client
                .delete(uri)
                .send()
                .await
                .with_context(|| format!("DELETE {} failed", uri))?;
            if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
                anyhow::bail!("DELETE {} returned {}", uri, resp.status());
            }
        }
        Ok(())
    }

    async fn list(&self, uri: &str) -> Result<Vec<String>> {
        // Gateways answer a GET on a prefix ending in `/` with a JSON array of names.
        let listing = format!("{}/", uri.trim_end_matches('/'));
        let names: Vec<String> = self
            .client
            .get(&listing)
            .send()
            .await
            .with_context(|| format!("GET {} failed", listing))?
            .error_for_status()
            .with_context(|| format!("Listing {} returned error", listing))?
            .json()
            .await
            .context("Failed to parse listing")?;
        Ok(names
            .into_iter()
            .map(|name| format!("{}{}", listing, name.trim_start_matches('/')))
            .collect())
    }
}
