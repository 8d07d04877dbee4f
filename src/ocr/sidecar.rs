//! OCR sidecar provider (tesseract-style HTTP service).

use super::{OcrInput, OcrPage, OcrProvider};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use tracing::{debug, info};

/// Sidecar response (private deserialization type).
#[derive(Debug, Deserialize)]
struct SidecarResponse {
    text: String,
    #[serde(default)]
    searchable_pdf_base64: Option<String>,
}

pub struct SidecarProvider {
    url: String,
    client: reqwest::Client,
}

impl SidecarProvider {
    pub fn new(url: String, client: reqwest::Client) -> Self {
        Self { url, client }
    }
}

#[async_trait::async_trait]
impl OcrProvider for SidecarProvider {
    fn name(&self) -> &str {
        "sidecar"
    }

    async fn process(&self, input: &OcrInput) -> anyhow::Result<OcrPage> {
        use reqwest::multipart::{Form, Part};

        let part = Part::bytes(input.data.clone())
            .file_name(input.filename.clone())
            .mime_str(input.mime())?;

        let form = Form::new()
            .part("file", part)
            .text("searchable", input.create_searchable.to_string());

        info!(
            "SidecarProvider: OCR {} ({} bytes, searchable={})",
            input.filename,
            input.data.len(),
            input.create_searchable
        );

        let response = self
            .client
            .post(format!("{}/ocr", self.url.trim_end_matches('/')))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("OCR sidecar error ({}): {}", status, error_text);
        }

        let sidecar: SidecarResponse = response.json().await?;
        let searchable_pdf = match sidecar.searchable_pdf_base64 {
            Some(encoded) if input.create_searchable => Some(BASE64.decode(encoded.trim())?),
            _ => None,
        };
        debug!(
            "SidecarProvider: {} chars, searchable={}",
            sidecar.text.len(),
            searchable_pdf.is_some()
        );

        Ok(OcrPage {
            text: sidecar.text.trim().to_string(),
            searchable_pdf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    fn input(create_searchable: bool) -> OcrInput {
        OcrInput {
            filename: "page_0001.pdf".to_string(),
            data: b"%PDF-1.5".to_vec(),
            create_searchable,
        }
    }

    async fn sidecar_answering(body: serde_json::Value) -> SidecarProvider {
        let app = Router::new().route("/ocr", post(move || async move { Json(body) }));
        let base = test_server::spawn(app).await;
        SidecarProvider::new(base, reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_decodes_searchable_page() {
        let provider = sidecar_answering(json!({
            "text": "  Page one  \n",
            "searchable_pdf_base64": BASE64.encode(b"%PDF-searchable"),
        }))
        .await;

        let page = provider.process(&input(true)).await.unwrap();
        assert_eq!(page.text, "Page one");
        assert_eq!(page.searchable_pdf.as_deref(), Some(&b"%PDF-searchable"[..]));
    }

    #[tokio::test]
    async fn test_searchable_dropped_when_not_requested() {
        let provider = sidecar_answering(json!({
            "text": "Page one",
            "searchable_pdf_base64": BASE64.encode(b"%PDF-searchable"),
        }))
        .await;

        let page = provider.process(&input(false)).await.unwrap();
        assert!(page.searchable_pdf.is_none());
    }

    #[tokio::test]
    async fn test_bad_base64_is_error() {
        let provider = sidecar_answering(json!({
            "text": "Page one",
            "searchable_pdf_base64": "%%% not base64 %%%",
        }))
        .await;
        assert!(provider.process(&input(true)).await.is_err());
    }

    #[tokio::test]
    async fn test_error_status_is_error() {
        let app = Router::new().route(
            "/ocr",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "engine warming up") }),
        );
        let provider = SidecarProvider::new(test_server::spawn(app).await, reqwest::Client::new());

        let err = provider.process(&input(true)).await.unwrap_err();
        assert!(err.to_string().contains("engine warming up"));
    }
}
