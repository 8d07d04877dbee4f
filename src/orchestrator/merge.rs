//! Page-ordered assembly of the combined text and searchable outputs.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::collect::JobResult;
use crate::error::TextractorError;
use crate::pdf;
use crate::storage::Storage;

/// Combined text plus the page classification it was built from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub text: String,
    pub missing_text_pages: Vec<u32>,
    pub empty_content_pages: Vec<u32>,
    pub missing_searchable_pages: Vec<u32>,
}

/// Join page texts in ascending page order, whatever order they arrived in.
///
/// Each page 1..=`page_count` lands in exactly one of: present, empty or
/// missing. Pages without a result are missing.
pub fn merge_text(results: &BTreeMap<u32, JobResult>, page_count: u32) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    let mut texts = Vec::new();

    for page in 1..=page_count {
        match results.get(&page) {
            Some(JobResult::Success { text, .. }) => texts.push(text.trim()),
            Some(JobResult::EmptyContent { .. }) => outcome.empty_content_pages.push(page),
            Some(JobResult::Absent) | None => outcome.missing_text_pages.push(page),
        }
    }

    outcome.text = texts.join("\n\n").trim().to_string();
    outcome
}

/// Concatenates single-page PDFs into one document.
#[async_trait::async_trait]
pub trait SearchableMerger: Send + Sync {
    async fn merge(&self, pages: Vec<Vec<u8>>) -> Result<Vec<u8>>;
}

/// Merges with a Ghostscript subprocess. The child is killed if the merge
/// future is dropped, so an outer timeout stops it too.
pub struct GhostscriptMerger {
    bin: String,
}

impl GhostscriptMerger {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn write_inputs(dir: &Path, pages: Vec<Vec<u8>>) -> Result<Vec<std::path::PathBuf>> {
        let mut paths = Vec::with_capacity(pages.len());
        for (idx, data) in pages.into_iter().enumerate() {
            let path = dir.join(format!("page_{:04}.pdf", idx + 1));
            tokio::fs::write(&path, data)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            paths.push(path);
        }
        Ok(paths)
    }
}

#[async_trait::async_trait]
impl SearchableMerger for GhostscriptMerger {
    async fn merge(&self, pages: Vec<Vec<u8>>) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir().context("Failed to create merge scratch directory")?;
        let inputs = Self::write_inputs(dir.path(), pages).await?;
        let output_path = dir.path().join("merged.pdf");

        let mut cmd = Command::new(&self.bin);
        cmd.arg("-sDEVICE=pdfwrite")
            .arg("-dBATCH")
            .arg("-dNOPAUSE")
            .arg("-q")
            .arg("-dPDFSETTINGS=/ebook")
            .arg(format!("-sOutputFile={}", output_path.display()))
            .args(&inputs)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {} on {} pages", self.bin, inputs.len());
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.bin))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.bin,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        tokio::fs::read(&output_path)
            .await
            .context("Failed to read merged PDF")
    }
}

/// Combined searchable output and the pages that fell back to the source.
#[derive(Debug, Default)]
pub struct SearchableMerge {
    pub output: Option<Vec<u8>>,
    pub missing_searchable_pages: Vec<u32>,
}

/// Build the combined searchable PDF within `budget`.
///
/// Pages without a readable searchable result are taken unmodified from
/// `source`. A merge that fails or overruns its budget yields no output; the
/// text result is unaffected.
pub async fn merge_searchable(
    storage: &dyn Storage,
    merger: &dyn SearchableMerger,
    source: &[u8],
    results: &BTreeMap<u32, JobResult>,
    page_count: u32,
    budget: Option<Duration>,
) -> SearchableMerge {
    let planned_fallback: Vec<u32> = (1..=page_count)
        .filter(|page| {
            results
                .get(page)
                .and_then(JobResult::searchable_uri)
                .is_none()
        })
        .collect();

    let Some(budget) = budget else {
        warn!(
            "{}; skipping searchable output",
            TextractorError::MergeTimeout { secs: 0.0 }
        );
        return SearchableMerge {
            output: None,
            missing_searchable_pages: planned_fallback,
        };
    };

    let deadline = Instant::now() + budget;
    let merging = async {
        let assembled =
            assemble_pages(storage, source, results, page_count, deadline.into_std()).await?;
        let merged = merger.merge(assembled.pages).await?;
        Ok::<_, anyhow::Error>((merged, assembled.fallback_pages))
    };

    let overrun = || {
        warn!(
            "{}",
            TextractorError::MergeTimeout {
                secs: budget.as_secs_f64()
            }
        );
    };

    match timeout_at(deadline, merging).await {
        Ok(Ok(_)) if Instant::now() > deadline => {
            overrun();
            SearchableMerge {
                output: None,
                missing_searchable_pages: planned_fallback,
            }
        }
        Ok(Ok((merged, fallback_pages))) => {
            info!(
                "Merged searchable output ({} pages, {} fallback, {} bytes)",
                page_count,
                fallback_pages.len(),
                merged.len()
            );
            SearchableMerge {
                output: Some(merged),
                missing_searchable_pages: fallback_pages,
            }
        }
        Ok(Err(e)) => {
            warn!("Failed to merge searchable output: {:#}", e);
            SearchableMerge {
                output: None,
                missing_searchable_pages: planned_fallback,
            }
        }
        Err(_) => {
            overrun();
            SearchableMerge {
                output: None,
                missing_searchable_pages: planned_fallback,
            }
        }
    }
}

/// Merge inputs in page order, plus the pages that came from the source.
struct AssembledPages {
    pages: Vec<Vec<u8>>,
    fallback_pages: Vec<u32>,
}

async fn assemble_pages(
    storage: &dyn Storage,
    source: &[u8],
    results: &BTreeMap<u32, JobResult>,
    page_count: u32,
    stop_at: std::time::Instant,
) -> Result<AssembledPages> {
    let mut slots = Vec::with_capacity(page_count as usize);
    let mut fallback_pages = Vec::new();
    for page in 1..=page_count {
        let searchable = match results.get(&page).and_then(JobResult::searchable_uri) {
            Some(uri) => match storage.read(uri).await {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!("Failed to read searchable page <{}>, using source page: {}", uri, e);
                    None
                }
            },
            None => None,
        };
        if searchable.is_none() {
            fallback_pages.push(page);
        }
        slots.push(searchable);
    }

    let sliced = if fallback_pages.is_empty() {
        Vec::new()
    } else {
        // Parsing and slicing are CPU bound; keep them off the runtime threads.
        let source = source.to_vec();
        let wanted = fallback_pages.clone();
        tokio::task::spawn_blocking(move || slice_pages(&source, &wanted, stop_at))
            .await
            .context("Page slicing task failed")??
    };
    let mut sliced = sliced.into_iter();

    let pages = slots
        .into_iter()
        .map(|slot| match slot {
            Some(data) => Ok(data),
            None => sliced
                .next()
                .ok_or_else(|| anyhow::anyhow!("Source page slicing came up short")),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(AssembledPages {
        pages,
        fallback_pages,
    })
}

/// Cut `pages` out of `source`, parsing it once. Gives up at `stop_at`.
fn slice_pages(source: &[u8], pages: &[u32], stop_at: std::time::Instant) -> Result<Vec<Vec<u8>>> {
    let parsed = pdf::PageSource::parse(source)?;
    pages
        .iter()
        .map(|&page| {
            if std::time::Instant::now() >= stop_at {
                anyhow::bail!("Out of time before slicing source page {}", page);
            }
            parsed.extract(page)
        })
        .collect()
}
