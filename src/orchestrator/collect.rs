//! Collection of page results under a wait budget.
//!
//! Push mode awaits the dispatched invocations themselves. Poll mode leaves
//! them running and watches each page's text address instead. Either way,
//! whatever arrived before the budget ran out is kept; the rest is absent.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::dispatch::{Dispatched, PageJob};
use crate::config::CollectionMode;
use crate::error::TextractorError;
use crate::schema::ExtractResponse;
use crate::storage::{self, Storage, EXCEPTION_KEY};

/// Observed outcome of one page job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success {
        text: String,
        searchable_uri: Option<String>,
    },
    /// Worker finished but the page has no text.
    EmptyContent { searchable_uri: Option<String> },
    /// Failed, timed out, or never observed.
    Absent,
}

impl JobResult {
    pub fn searchable_uri(&self) -> Option<&str> {
        match self {
            Self::Success { searchable_uri, .. } | Self::EmptyContent { searchable_uri } => {
                searchable_uri.as_deref()
            }
            Self::Absent => None,
        }
    }
}

pub struct Collector {
    storage: Arc<dyn Storage>,
    mode: CollectionMode,
    poll_interval: Duration,
}

impl Collector {
    pub fn new(storage: Arc<dyn Storage>, mode: CollectionMode, poll_interval: Duration) -> Self {
        Self {
            storage,
            mode,
            poll_interval,
        }
    }

    /// Results keyed by page. Never waits longer than `budget`.
    pub async fn collect(&self, dispatched: Dispatched, budget: Duration) -> BTreeMap<u32, JobResult> {
        let deadline = Instant::now() + budget;
        let pages: Vec<u32> = dispatched.jobs.iter().map(|job| job.page).collect();
        let total = pages.len();
        let mut results = BTreeMap::new();

        let finished = match self.mode {
            CollectionMode::Push => self.collect_push(dispatched, deadline, &mut results).await,
            CollectionMode::Poll => self.collect_poll(dispatched, deadline, &mut results).await,
        };

        if !finished {
            let pending: Vec<u32> = pages
                .into_iter()
                .filter(|page| !results.contains_key(page))
                .collect();
            warn!(
                "{} after {:.1}s",
                TextractorError::CollectionTimeout { pages: pending },
                budget.as_secs_f64()
            );
        }
        info!(
            "Collected {} of {} page results",
            results.values().filter(|r| **r != JobResult::Absent).count(),
            total
        );
        results
    }

    /// `false` when the deadline cut collection short.
    async fn collect_push(
        &self,
        dispatched: Dispatched,
        deadline: Instant,
        results: &mut BTreeMap<u32, JobResult>,
    ) -> bool {
        let Dispatched { jobs, mut tasks, .. } = dispatched;
        let jobs: HashMap<u32, PageJob> = jobs.into_iter().map(|job| (job.page, job)).collect();

        let waited = timeout_at(deadline, async {
            while let Some(joined) = tasks.join_next().await {
                let (page, response) = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("Page job task failed: {}", e);
                        continue;
                    }
                };
                let result = match (response, jobs.get(&page)) {
                    (Ok(response), Some(job)) => self.read_pushed(job, &response).await,
                    (Ok(_), None) => JobResult::Absent,
                    (Err(e), _) => {
                        warn!(
                            "{}",
                            TextractorError::DispatchFailure {
                                page,
                                reason: format!("{:#}", e),
                            }
                        );
                        JobResult::Absent
                    }
                };
                results.insert(page, result);
            }
        })
        .await;

        if waited.is_err() {
            tasks.abort_all();
            return false;
        }
        true
    }

    async fn collect_poll(
        &self,
        dispatched: Dispatched,
        deadline: Instant,
        results: &mut BTreeMap<u32, JobResult>,
    ) -> bool {
        let mut dispatched = dispatched;
        // Invocations keep running on their own; only storage is observed.
        dispatched.tasks.detach_all();
        let mut outstanding = std::mem::take(&mut dispatched.jobs);

        let waited = timeout_at(deadline, async {
            loop {
                let mut still_pending = Vec::new();
                for job in outstanding.drain(..) {
                    match self.storage.exists(&job.text_uri).await {
                        Ok(true) => {
                            let searchable = self.searchable_if_present(&job).await;
                            let result = self.read_output(job.page, &job.text_uri, searchable).await;
                            results.insert(job.page, result);
                        }
                        Ok(false) => still_pending.push(job),
                        Err(e) => {
                            debug!("Failed to poll <{}>: {}", job.text_uri, e);
                            still_pending.push(job);
                        }
                    }
                }
                outstanding = still_pending;
                if outstanding.is_empty() {
                    break;
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        })
        .await;

        dispatched.stop_queued();
        waited.is_ok()
    }

    async fn read_pushed(&self, job: &PageJob, response: &ExtractResponse) -> JobResult {
        let Some(results) = response.textractor() else {
            warn!("Page {} returned no textractor results", job.page);
            return JobResult::Absent;
        };
        if !results.success {
            warn!(
                "Page {} failed: {}",
                job.page,
                results.reason.as_deref().unwrap_or("unknown reason")
            );
            return JobResult::Absent;
        }
        let text_uri = response
            .request
            .text_uri
            .clone()
            .unwrap_or_else(|| job.text_uri.clone());
        self.read_output(job.page, &text_uri, results.searchable_output_uri)
            .await
    }

    async fn searchable_if_present(&self, job: &PageJob) -> Option<String> {
        let uri = job.searchable_uri.as_ref()?;
        match self.storage.exists(uri).await {
            Ok(true) => Some(uri.clone()),
            _ => None,
        }
    }

    /// Classify a page from its text object. Exception-tagged objects are absent.
    async fn read_output(&self, page: u32, text_uri: &str, searchable_uri: Option<String>) -> JobResult {
        match self.storage.metadata(text_uri).await {
            Ok(metadata) if metadata.contains_key(EXCEPTION_KEY) => {
                warn!(
                    "Page {} output <{}> is tagged with an exception: {}",
                    page, text_uri, metadata[EXCEPTION_KEY]
                );
                return JobResult::Absent;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read metadata of <{}>: {}", text_uri, e);
                return JobResult::Absent;
            }
        }

        match storage::read_text(self.storage.as_ref(), text_uri).await {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    JobResult::EmptyContent { searchable_uri }
                } else {
                    JobResult::Success {
                        text: text.to_string(),
                        searchable_uri,
                    }
                }
            }
            Err(e) => {
                warn!("Failed to read page {} output <{}>: {}", page, text_uri, e);
                JobResult::Absent
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::PageInvoker;
    use crate::orchestrator::dispatch::{dispatch, plan_jobs};
    use crate::schema::{ExtractRequest, TextractorResults};
    use crate::storage::{MemoryStorage, Metadata};

    /// Writes `texts[page - 1]` after `delays[page - 1]` ms, like a worker would.
    struct DelayedWorker {
        storage: Arc<MemoryStorage>,
        texts: Vec<&'static str>,
        delays: Vec<u64>,
    }

    #[async_trait::async_trait]
    impl PageInvoker for DelayedWorker {
        async fn invoke(&self, request: ExtractRequest) -> anyhow::Result<ExtractResponse> {
            let idx = (request.page.unwrap() - 1) as usize;
            tokio::time::sleep(Duration::from_millis(self.delays[idx])).await;
            let text_uri = request.text_uri.clone().unwrap();
            let mut metadata = Metadata::new();
            if self.texts[idx].starts_with('!') {
                metadata.insert(EXCEPTION_KEY.to_string(), "ocr exploded".to_string());
            }
            let text = self.texts[idx].trim_start_matches('!');
            self.storage
                .write(&text_uri, text.as_bytes().to_vec(), metadata)
                .await?;
            let results = TextractorResults {
                success: true,
                method: "image_to_text".to_string(),
                ..Default::default()
            };
            Ok(ExtractResponse::new(request, &results))
        }
    }

    async fn run(
        mode: CollectionMode,
        texts: Vec<&'static str>,
        delays: Vec<u64>,
        budget: Duration,
    ) -> BTreeMap<u32, JobResult> {
        let storage = Arc::new(MemoryStorage::new());
        let pages = texts.len() as u32;
        let worker = Arc::new(DelayedWorker {
            storage: storage.clone(),
            texts,
            delays,
        });
        let jobs = plan_jobs("mem://d/doc.pdf", "mem://d/tmp", "inv", pages, false);
        let dispatched = dispatch(worker, jobs, 16);
        Collector::new(storage, mode, Duration::from_millis(20))
            .collect(dispatched, budget)
            .await
    }

    fn success(text: &str) -> JobResult {
        JobResult::Success {
            text: text.to_string(),
            searchable_uri: None,
        }
    }

    #[tokio::test]
    async fn test_push_keeps_results_obtained_before_timeout() {
        let results = run(
            CollectionMode::Push,
            vec!["Hello", "slow", "World"],
            vec![10, 5_000, 30],
            Duration::from_millis(300),
        )
        .await;
        assert_eq!(results.get(&1), Some(&success("Hello")));
        assert_eq!(results.get(&2), None);
        assert_eq!(results.get(&3), Some(&success("World")));
    }

    #[tokio::test]
    async fn test_push_classifies_empty_and_exception_pages() {
        let results = run(
            CollectionMode::Push,
            vec!["  \n ", "!partial", "text"],
            vec![0, 0, 0],
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(
            results.get(&1),
            Some(&JobResult::EmptyContent {
                searchable_uri: None
            })
        );
        assert_eq!(results.get(&2), Some(&JobResult::Absent));
        assert_eq!(results.get(&3), Some(&success("text")));
    }

    #[tokio::test]
    async fn test_poll_observes_outputs_in_storage() {
        let results = run(
            CollectionMode::Poll,
            vec!["one", "two", "never"],
            vec![50, 10, 5_000],
            Duration::from_millis(400),
        )
        .await;
        assert_eq!(results.get(&1), Some(&success("one")));
        assert_eq!(results.get(&2), Some(&success("two")));
        assert_eq!(results.get(&3), None);
    }

    #[tokio::test]
    async fn test_collection_never_outlives_budget() {
        let started = Instant::now();
        run(
            CollectionMode::Push,
            vec!["a"],
            vec![10_000],
            Duration::from_millis(100),
        )
        .await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
