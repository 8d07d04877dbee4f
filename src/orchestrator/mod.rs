//! The textraction state machine.
//!
//! One invocation runs: guard, download, format dispatch, then either a
//! direct extraction, a single OCR call, or the page-parallel OCR fan-out
//! (dispatch, collect, merge), and finally report. Single-page workers are
//! invocations of this same machine with `page` set.

pub mod collect;
pub mod deadline;
pub mod dispatch;
pub mod guard;
pub mod merge;
pub mod report;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::TextractorError;
use crate::extractor::{extract_direct, DocumentKind};
use crate::invoke::PageInvoker;
use crate::ocr::{normalize_image, OcrInput, OcrPage, OcrProvider};
use crate::pdf;
use crate::schema::{ExtractRequest, ExtractResponse};
use crate::storage::{self, Storage};

use collect::{Collector, JobResult};
use deadline::{Deadline, Reserves};
use dispatch::{dispatch, plan_jobs, PageJob};
use guard::IdempotencyGuard;
use merge::{merge_searchable, merge_text, SearchableMerger};
use report::{Extraction, Reporter};

pub struct Textractor {
    storage: Arc<dyn Storage>,
    ocr: Arc<dyn OcrProvider>,
    invoker: Arc<dyn PageInvoker>,
    merger: Arc<dyn SearchableMerger>,
    settings: Settings,
    guard: IdempotencyGuard,
    collector: Collector,
    reporter: Reporter,
    reserves: Reserves,
}

impl Textractor {
    pub fn new(
        storage: Arc<dyn Storage>,
        ocr: Arc<dyn OcrProvider>,
        invoker: Arc<dyn PageInvoker>,
        merger: Arc<dyn SearchableMerger>,
        settings: Settings,
    ) -> Self {
        Self {
            guard: IdempotencyGuard::new(storage.clone()),
            collector: Collector::new(
                storage.clone(),
                settings.collection_mode,
                settings.poll_interval,
            ),
            reporter: Reporter::new(storage.clone()),
            reserves: Reserves::from_settings(&settings),
            storage,
            ocr,
            invoker,
            merger,
            settings,
        }
    }

    /// Run one invocation. `None` means a duplicate delivery was suppressed.
    ///
    /// Failures never escape: they are reported in `results.textractor`
    /// and an empty, exception-tagged text object is left behind.
    pub async fn handle(&self, request: ExtractRequest, trigger_id: &str) -> Option<ExtractResponse> {
        let deadline = Deadline::after(self.settings.invocation_timeout);
        let request = request.resolve();

        let marker = IdempotencyGuard::marker_uri(&request.temp_uri_prefix(), trigger_id);
        if !self.guard.admit(&marker).await {
            info!(
                "Skipping duplicate invocation {} for <{}>",
                trigger_id, request.document_uri
            );
            return None;
        }

        match request.page {
            Some(page) => info!(
                "Textracting page {} of <{}> (invocation {})",
                page, request.document_uri, trigger_id
            ),
            None => info!(
                "Textracting <{}> (invocation {})",
                request.document_uri, trigger_id
            ),
        }
        let started = std::time::Instant::now();
        let method = planned_method(&request);

        let outcome = match self.extract(&request, deadline).await {
            Ok(extraction) => self.reporter.persist(&request, extraction).await,
            Err(e) => Err(e),
        };
        let results = match outcome {
            Ok(results) => results,
            Err(e) => {
                error!("Failed to textract <{}>: {}", request.document_uri, e);
                self.reporter.record_failure(&request, method, &e).await
            }
        };

        info!(
            "Finished <{}> in {:.2}s (success: {}, method: {})",
            request.document_uri,
            started.elapsed().as_secs_f64(),
            results.success,
            results.method
        );

        let mut echoed = request;
        echoed.searchable_output_uri = results.searchable_output_uri.clone();
        let response = ExtractResponse::new(echoed, &results);
        self.reporter.fire_callbacks(&response).await;
        Some(response)
    }

    async fn extract(
        &self,
        request: &ExtractRequest,
        deadline: Deadline,
    ) -> Result<Extraction, TextractorError> {
        let uri = &request.document_uri;
        let ext = storage::extension(uri);
        let kind = DocumentKind::from_extension(&ext).ok_or_else(|| {
            TextractorError::UnsupportedFormat {
                uri: uri.clone(),
                ext: ext.clone(),
            }
        })?;

        let data = self
            .storage
            .read(uri)
            .await
            .map_err(|e| TextractorError::download(uri, format!("{:#}", e)))?;
        debug!("Downloaded <{}> ({} bytes)", uri, data.len());

        if let Some(page) = request.page {
            return self.ocr_single_page(request, kind, &ext, data, page).await;
        }

        match kind {
            DocumentKind::Image => self.ocr_image(request, &ext, data).await,
            DocumentKind::Pdf => self.extract_pdf(request, data, deadline).await,
            _ => {
                let text = extract_direct(kind, &data)
                    .map_err(|e| TextractorError::extraction(format!("{:#}", e)))?;
                Ok(Extraction::text(kind.method(), text))
            }
        }
    }

    /// Worker path: OCR exactly one page of the document.
    async fn ocr_single_page(
        &self,
        request: &ExtractRequest,
        kind: DocumentKind,
        ext: &str,
        data: Vec<u8>,
        page: u32,
    ) -> Result<Extraction, TextractorError> {
        let (filename, data) = match kind {
            DocumentKind::Pdf => {
                let single = tokio::task::spawn_blocking(move || pdf::extract_page(&data, page))
                    .await
                    .map_err(|e| TextractorError::extraction(format!("Page slicing task failed: {}", e)))?
                    .map_err(|e| TextractorError::extraction(format!("{:#}", e)))?;
                (format!("page_{:04}.pdf", page), single)
            }
            DocumentKind::Image if page == 1 => {
                normalize_image(&format!("page_{:04}{}", page, ext), data)
                    .map_err(|e| TextractorError::extraction(format!("{:#}", e)))?
            }
            _ => {
                return Err(TextractorError::extraction(format!(
                    "page {} cannot be OCRed from a {} document",
                    page, ext
                )))
            }
        };

        let create_searchable = request.create_searchable_output();
        let result = self
            .run_ocr(OcrInput {
                filename,
                data,
                create_searchable,
            })
            .await?;

        let mut extraction = Extraction::text("image_to_text", result.text);
        extraction.page = Some(page);
        extraction.searchable_pdf = result.searchable_pdf.filter(|_| create_searchable);
        Ok(extraction)
    }

    async fn ocr_image(
        &self,
        request: &ExtractRequest,
        ext: &str,
        data: Vec<u8>,
    ) -> Result<Extraction, TextractorError> {
        if request.disable_ocr() {
            return Err(TextractorError::extraction(format!(
                "OCR is disabled and <{}> is an image",
                request.document_uri
            )));
        }

        let (filename, data) = normalize_image(&format!("image{}", ext), data)
            .map_err(|e| TextractorError::extraction(format!("{:#}", e)))?;
        let create_searchable = request.create_searchable_output();
        let result = self
            .run_ocr(OcrInput {
                filename,
                data,
                create_searchable,
            })
            .await?;

        let mut extraction = Extraction::text("image_to_text", result.text);
        extraction.searchable_pdf = result.searchable_pdf.filter(|_| create_searchable);
        Ok(extraction)
    }

    async fn extract_pdf(
        &self,
        request: &ExtractRequest,
        data: Vec<u8>,
        deadline: Deadline,
    ) -> Result<Extraction, TextractorError> {
        let uri = &request.document_uri;
        let min_chars = self.settings.min_text_layer_chars;

        match pdf::text_layer(&data) {
            Ok(text) if request.disable_ocr() || text.chars().count() >= min_chars => {
                Ok(Extraction::text(DocumentKind::Pdf.method(), text))
            }
            Ok(text) => {
                info!(
                    "Text layer of <{}> has {} characters (minimum {}), falling back to OCR",
                    uri,
                    text.chars().count(),
                    min_chars
                );
                self.ocr_pdf(request, &data, deadline).await
            }
            Err(e) if request.disable_ocr() => {
                Err(TextractorError::extraction(format!("{:#}", e)))
            }
            Err(e) => {
                warn!("Failed to read text layer of <{}>, falling back to OCR: {:#}", uri, e);
                self.ocr_pdf(request, &data, deadline).await
            }
        }
    }

    /// Page-parallel OCR: fan out one job per page, collect what arrives in
    /// time, merge in page order.
    async fn ocr_pdf(
        &self,
        request: &ExtractRequest,
        data: &[u8],
        deadline: Deadline,
    ) -> Result<Extraction, TextractorError> {
        let uri = &request.document_uri;
        let page_count = pdf::page_count(data)
            .map_err(|e| TextractorError::extraction(format!("{:#}", e)))?;
        let create_searchable = request.create_searchable_output();

        let invocation_id = Uuid::new_v4().simple().to_string();
        let jobs = plan_jobs(
            uri,
            &request.temp_uri_prefix(),
            &invocation_id,
            page_count,
            create_searchable,
        );

        let results = match self
            .reserves
            .page_wait(deadline.remaining(), create_searchable)
        {
            Some(budget) => {
                info!(
                    "Dispatching {} page jobs for <{}> (wait budget {:.1}s)",
                    page_count,
                    uri,
                    budget.as_secs_f64()
                );
                let dispatched = dispatch(
                    self.invoker.clone(),
                    jobs.clone(),
                    self.settings.max_in_flight_pages,
                );
                self.collector.collect(dispatched, budget).await
            }
            None => {
                warn!(
                    "No time left to wait for page results of <{}>, skipping page OCR",
                    uri
                );
                BTreeMap::new()
            }
        };

        let mut outcome = merge_text(&results, page_count);
        if !outcome.missing_text_pages.is_empty() {
            warn!(
                "Missing text for pages {:?} of <{}>",
                outcome.missing_text_pages, uri
            );
        }
        if !outcome.empty_content_pages.is_empty() {
            info!(
                "No content on pages {:?} of <{}>",
                outcome.empty_content_pages, uri
            );
        }

        let mut searchable_pdf = None;
        if create_searchable {
            let merged = merge_searchable(
                self.storage.as_ref(),
                self.merger.as_ref(),
                data,
                &results,
                page_count,
                self.reserves.merge(deadline.remaining()),
            )
            .await;
            outcome.missing_searchable_pages = merged.missing_searchable_pages;
            searchable_pdf = merged.output;
        }

        if self.settings.cleanup_intermediates {
            self.cleanup(&jobs, &results).await;
        }

        Ok(Extraction::merged(page_count, outcome, searchable_pdf))
    }

    async fn run_ocr(&self, input: OcrInput) -> Result<OcrPage, TextractorError> {
        let started = std::time::Instant::now();
        let page = self.ocr.process(&input).await.map_err(|e| {
            TextractorError::extraction(format!("{} OCR of {} failed: {:#}", self.ocr.name(), input.filename, e))
        })?;
        debug!(
            "{} OCR of {} took {:.2}s ({} characters)",
            self.ocr.name(),
            input.filename,
            started.elapsed().as_secs_f64(),
            page.text.chars().count()
        );
        Ok(page)
    }

    /// Delete the page outputs that were observed. Best effort.
    async fn cleanup(&self, jobs: &[PageJob], results: &BTreeMap<u32, JobResult>) {
        let uris: Vec<String> = jobs
            .iter()
            .filter(|job| results.contains_key(&job.page))
            .flat_map(|job| std::iter::once(job.text_uri.clone()).chain(job.searchable_uri.clone()))
            .collect();
        if uris.is_empty() {
            return;
        }
        match self.storage.delete(&uris).await {
            Ok(()) => debug!("Deleted {} page intermediates", uris.len()),
            Err(e) => warn!("Failed to delete page intermediates: {:#}", e),
        }
    }
}

/// Method tag reported if the invocation fails before it picks one.
fn planned_method(request: &ExtractRequest) -> &'static str {
    if request.page.is_some() {
        return "image_to_text";
    }
    DocumentKind::from_extension(&storage::extension(&request.document_uri))
        .map(|kind| kind.method())
        .unwrap_or("unsupported")
}
