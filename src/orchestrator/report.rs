//! Writing of final outputs and callback delivery.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::merge::MergeOutcome;
use crate::error::TextractorError;
use crate::schema::{ExtractRequest, ExtractResponse, TextractorResults, CALLBACK_STEP};
use crate::storage::{Metadata, Storage, EXCEPTION_KEY};

/// What an extraction produced, before anything is written.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub method: String,
    pub text: String,
    pub searchable_pdf: Option<Vec<u8>>,
    /// Set on single-page worker results.
    pub page: Option<u32>,
    pub num_pages: Option<u32>,
    pub missing_text_pages: Vec<u32>,
    pub empty_content_pages: Vec<u32>,
    pub missing_searchable_pages: Vec<u32>,
}

impl Extraction {
    pub fn text(method: impl Into<String>, text: String) -> Self {
        Self {
            method: method.into(),
            text,
            ..Default::default()
        }
    }

    pub fn merged(num_pages: u32, outcome: MergeOutcome, searchable_pdf: Option<Vec<u8>>) -> Self {
        Self {
            method: "pdf_to_text_with_ocr".to_string(),
            text: outcome.text,
            searchable_pdf,
            page: None,
            num_pages: Some(num_pages),
            missing_text_pages: outcome.missing_text_pages,
            empty_content_pages: outcome.empty_content_pages,
            missing_searchable_pages: outcome.missing_searchable_pages,
        }
    }

    /// Metadata attached to the text object.
    pub fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("content-type".to_string(), "text/plain; charset=utf-8".to_string());
        metadata.insert("method".to_string(), self.method.clone());
        if let Some(page) = self.page {
            metadata.insert("page".to_string(), page.to_string());
        }
        if let Some(num_pages) = self.num_pages {
            metadata.insert("num_pages".to_string(), num_pages.to_string());
        }
        for (key, pages) in [
            ("missing_text_pages", &self.missing_text_pages),
            ("empty_content_pages", &self.empty_content_pages),
            ("missing_searchable_pages", &self.missing_searchable_pages),
        ] {
            if !pages.is_empty() {
                metadata.insert(key.to_string(), join_pages(pages));
            }
        }
        metadata
    }
}

fn join_pages(pages: &[u32]) -> String {
    pages
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub struct Reporter {
    storage: Arc<dyn Storage>,
}

impl Reporter {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Write the outputs of a successful extraction.
    ///
    /// The searchable output goes first: once the text object exists, any
    /// searchable output for it is complete.
    pub async fn persist(
        &self,
        request: &ExtractRequest,
        extraction: Extraction,
    ) -> Result<TextractorResults, TextractorError> {
        let mut searchable_output_uri = None;
        if let Some(pdf) = extraction.searchable_pdf.clone() {
            let uri = request.searchable_output_uri();
            let mut metadata = Metadata::new();
            metadata.insert("content-type".to_string(), "application/pdf".to_string());
            self.storage
                .write(&uri, pdf, metadata)
                .await
                .map_err(|e| TextractorError::upload(&uri, e))?;
            debug!("Wrote searchable output <{}>", uri);
            searchable_output_uri = Some(uri);
        }

        let text_uri = request.text_uri();
        let size = extraction.text.chars().count();
        self.storage
            .write(
                &text_uri,
                extraction.text.clone().into_bytes(),
                extraction.metadata(),
            )
            .await
            .map_err(|e| TextractorError::upload(&text_uri, e))?;
        info!("Wrote {} characters to <{}>", size, text_uri);

        Ok(TextractorResults {
            success: true,
            method: extraction.method,
            size: Some(size),
            reason: None,
            page: extraction.page,
            num_pages: extraction.num_pages,
            missing_text_pages: extraction.missing_text_pages,
            empty_content_pages: extraction.empty_content_pages,
            missing_searchable_pages: extraction.missing_searchable_pages,
            searchable_output_uri,
        })
    }

    /// Leave an empty, exception-tagged text object so pollers stop waiting.
    pub async fn record_failure(
        &self,
        request: &ExtractRequest,
        method: &str,
        error: &TextractorError,
    ) -> TextractorResults {
        let text_uri = request.text_uri();
        let mut metadata = Metadata::new();
        metadata.insert("method".to_string(), method.to_string());
        metadata.insert(EXCEPTION_KEY.to_string(), error.to_string());
        if let Some(page) = request.page {
            metadata.insert("page".to_string(), page.to_string());
        }
        if let Err(e) = self.storage.write(&text_uri, Vec::new(), metadata).await {
            warn!("Failed to write failure marker <{}>: {}", text_uri, e);
        }

        let mut results = TextractorResults::failure(method, error.to_string());
        results.page = request.page;
        results
    }

    /// Deliver the final payload to every callback registered for this step.
    /// Failures are logged and never change the outcome.
    pub async fn fire_callbacks(&self, response: &ExtractResponse) {
        let callbacks = response
            .request
            .callbacks
            .iter()
            .filter(|cb| cb.step == CALLBACK_STEP);

        for callback in callbacks {
            let delivered = match serde_json::to_vec_pretty(response) {
                Ok(body) => {
                    let mut metadata = Metadata::new();
                    metadata.insert("content-type".to_string(), "application/json".to_string());
                    self.storage
                        .write(&callback.uri, body, metadata)
                        .await
                        .map_err(|e| format!("{:#}", e))
                }
                Err(e) => Err(e.to_string()),
            };

            match delivered {
                Ok(()) => info!("Fired callback <{}>", callback.uri),
                Err(reason) => warn!(
                    "{}",
                    TextractorError::CallbackFailure {
                        uri: callback.uri.clone(),
                        reason,
                    }
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Callback;
    use crate::storage::{MemoryStorage, StorageRouter};

    fn request() -> ExtractRequest {
        ExtractRequest::new("mem://d/doc.pdf").resolve()
    }

    #[test]
    fn test_metadata_lists_only_non_empty_sets() {
        let extraction = Extraction::merged(
            4,
            MergeOutcome {
                text: "x".to_string(),
                missing_text_pages: vec![2, 4],
                empty_content_pages: vec![],
                missing_searchable_pages: vec![4],
            },
            None,
        );
        let metadata = extraction.metadata();
        assert_eq!(metadata["method"], "pdf_to_text_with_ocr");
        assert_eq!(metadata["num_pages"], "4");
        assert_eq!(metadata["missing_text_pages"], "2,4");
        assert_eq!(metadata["missing_searchable_pages"], "4");
        assert!(!metadata.contains_key("empty_content_pages"));
    }

    #[tokio::test]
    async fn test_persist_writes_text_and_searchable() {
        let storage = Arc::new(MemoryStorage::new());
        let reporter = Reporter::new(storage.clone());
        let mut extraction = Extraction::text("image_to_text", "héllo".to_string());
        extraction.searchable_pdf = Some(b"%PDF".to_vec());

        let results = reporter.persist(&request(), extraction).await.unwrap();
        assert!(results.success);
        assert_eq!(results.size, Some(5));
        assert_eq!(
            results.searchable_output_uri.as_deref(),
            Some("mem://d/doc.pdf.searchable.pdf")
        );
        assert_eq!(storage.read("mem://d/doc.pdf.txt").await.unwrap(), "héllo".as_bytes());
        assert_eq!(
            storage.read("mem://d/doc.pdf.searchable.pdf").await.unwrap(),
            b"%PDF"
        );
    }

    #[tokio::test]
    async fn test_record_failure_tags_empty_text() {
        let storage = Arc::new(MemoryStorage::new());
        let reporter = Reporter::new(storage.clone());
        let error = TextractorError::extraction("bad page");

        let results = reporter.record_failure(&request(), "pdf_to_text", &error).await;
        assert!(!results.success);
        assert_eq!(results.reason.as_deref(), Some("extraction failed: bad page"));

        let metadata = storage.metadata("mem://d/doc.pdf.txt").await.unwrap();
        assert_eq!(metadata[EXCEPTION_KEY], "extraction failed: bad page");
        assert!(storage.read("mem://d/doc.pdf.txt").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_callbacks_only_for_this_step_and_failures_swallowed() {
        let storage = Arc::new(MemoryStorage::new());
        let router = StorageRouter::new().with_memory(storage.clone());
        let reporter = Reporter::new(Arc::new(router));
        let mut req = request();
        req.callbacks = vec![
            Callback {
                step: CALLBACK_STEP.to_string(),
                uri: "mem://cb/done.json".to_string(),
            },
            Callback {
                step: "indexer".to_string(),
                uri: "mem://cb/other.json".to_string(),
            },
            Callback {
                step: CALLBACK_STEP.to_string(),
                uri: "gopher://cb/broken.json".to_string(),
            },
        ];
        let response = ExtractResponse::new(req, &TextractorResults::failure("x", "y"));

        reporter.fire_callbacks(&response).await;

        let body = storage.read("mem://cb/done.json").await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["document_uri"], "mem://d/doc.pdf");
        assert_eq!(value["results"]["textractor"]["reason"], "y");
        assert!(!storage.exists("mem://cb/other.json").await.unwrap());
        assert_eq!(storage.keys(), vec!["mem://cb/done.json".to_string()]);
    }
}
