//! Page OCR providers.
//!
//! Every provider turns exactly one page (a single-page PDF or one image) into
//! text and, when asked and able, a searchable single-page PDF.

pub mod mistral;
pub mod sidecar;

use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Settings;
use crate::storage;

/// One page handed to a provider.
#[derive(Debug, Clone)]
pub struct OcrInput {
    pub filename: String,
    pub data: Vec<u8>,
    pub create_searchable: bool,
}

impl OcrInput {
    pub fn mime(&self) -> &'static str {
        mime_for(&storage::extension(&self.filename))
    }
}

/// Provider output for one page.
#[derive(Debug, Clone, Default)]
pub struct OcrPage {
    pub text: String,
    pub searchable_pdf: Option<Vec<u8>>,
}

#[async_trait::async_trait]
pub trait OcrProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn process(&self, input: &OcrInput) -> Result<OcrPage>;
}

/// Known provider identifiers used for registry lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OcrProviderKind {
    Sidecar,
    MistralOcr,
}

impl OcrProviderKind {
    /// Parse a config string into a provider kind.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sidecar" => Some(Self::Sidecar),
            "mistral_ocr" => Some(Self::MistralOcr),
            _ => None,
        }
    }
}

/// Build the configured provider.
pub fn build_provider(settings: &Settings, client: reqwest::Client) -> Result<Arc<dyn OcrProvider>> {
    let kind = OcrProviderKind::from_str(&settings.ocr_provider)
        .ok_or_else(|| anyhow::anyhow!("Unknown OCR_PROVIDER: {}", settings.ocr_provider))?;

    Ok(match kind {
        OcrProviderKind::Sidecar => Arc::new(sidecar::SidecarProvider::new(
            settings.ocr_sidecar_url.clone(),
            client,
        )),
        OcrProviderKind::MistralOcr => {
            Arc::new(mistral::MistralOcrProvider::from_settings(settings, client)?)
        }
    })
}

pub fn mime_for(ext: &str) -> &'static str {
    match ext {
        ".pdf" => "application/pdf",
        ".png" => "image/png",
        ".tif" | ".tiff" => "image/tiff",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".gif" => "image/gif",
        ".bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

/// Image extensions handled by a single OCR call.
pub const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".tif", ".tiff", ".gif", ".bmp"];

/// OCR engines read PNG and TIFF reliably; re-encode anything else as PNG.
pub fn normalize_image(filename: &str, data: Vec<u8>) -> Result<(String, Vec<u8>)> {
    let ext = storage::extension(filename);
    if matches!(ext.as_str(), ".png" | ".tif" | ".tiff") {
        return Ok((filename.to_string(), data));
    }

    let img = image::load_from_memory(&data)
        .with_context(|| format!("Failed to decode image {}", filename))?;
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageOutputFormat::Png)
        .context("Failed to re-encode image as PNG")?;

    let stem = filename
        .get(..filename.len().saturating_sub(ext.len()))
        .unwrap_or(filename);
    Ok((format!("{}.png", stem), out.into_inner()))
}
