//! Mistral OCR provider. Text only: it never produces a searchable page.
//!
//! Each page goes inline as a data URL, so no file upload round trip is
//! needed for a single-page PDF.

use super::{OcrInput, OcrPage, OcrProvider};
use crate::config::Settings;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub struct MistralOcrProvider {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl MistralOcrProvider {
    pub fn from_settings(settings: &Settings, client: reqwest::Client) -> anyhow::Result<Self> {
        let api_key = settings
            .mistral_api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("MISTRAL_API_KEY not set"))?;
        Ok(Self {
            api_key,
            base_url: settings.mistral_base_url.trim_end_matches('/').to_string(),
            model: settings.mistral_model.clone(),
            client,
        })
    }
}

#[derive(Debug, Serialize)]
struct PageRequest<'a> {
    model: &'a str,
    document: PageDocument,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PageDocument {
    ImageUrl { image_url: String },
    DocumentUrl { document_url: String },
}

impl PageDocument {
    fn for_input(input: &OcrInput) -> Self {
        let url = format!("data:{};base64,{}", input.mime(), BASE64.encode(&input.data));
        if input.mime().starts_with("image/") {
            Self::ImageUrl { image_url: url }
        } else {
            Self::DocumentUrl { document_url: url }
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageResponse {
    pages: Vec<ResponsePage>,
}

#[derive(Debug, Deserialize)]
struct ResponsePage {
    markdown: String,
}

#[async_trait::async_trait]
impl OcrProvider for MistralOcrProvider {
    fn name(&self) -> &str {
        "mistral_ocr"
    }

    async fn process(&self, input: &OcrInput) -> anyhow::Result<OcrPage> {
        if input.create_searchable {
            debug!("mistral_ocr cannot produce a searchable page for {}", input.filename);
        }

        let body = PageRequest {
            model: &self.model,
            document: PageDocument::for_input(input),
        };
        let response = self
            .client
            .post(format!("{}/v1/ocr", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Mistral OCR error ({}): {}", status, error_text);
        }

        let parsed: PageResponse = response.json().await?;
        if parsed.pages.len() > 1 {
            warn!(
                "mistral_ocr returned {} pages for single page {}",
                parsed.pages.len(),
                input.filename
            );
        }
        let text = parsed
            .pages
            .iter()
            .map(|p| p.markdown.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(OcrPage {
            text,
            searchable_pdf: None,
        })
    }
}
