//! Fan-out of page jobs to single-page workers.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::invoke::PageInvoker;
use crate::schema::{ExtractRequest, ExtractResponse};
use crate::storage;

/// Work unit for one page of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageJob {
    /// Also the worker's idempotency key.
    pub id: String,
    pub page: u32,
    pub document_uri: String,
    pub text_uri: String,
    pub searchable_uri: Option<String>,
    pub temp_uri_prefix: String,
}

impl PageJob {
    /// Worker payload for this job. Callbacks stay with the orchestrator.
    pub fn request(&self) -> ExtractRequest {
        let mut request = ExtractRequest::new(self.document_uri.clone());
        request.page = Some(self.page);
        request.text_uri = Some(self.text_uri.clone());
        request.temp_uri_prefix = Some(self.temp_uri_prefix.clone());
        request.create_searchable_output = Some(self.searchable_uri.is_some());
        request.searchable_output_uri = self.searchable_uri.clone();
        request.invocation_trigger_id = Some(self.id.clone());
        request
    }
}

/// One job per page, with output addresses unique to this invocation.
pub fn plan_jobs(
    document_uri: &str,
    temp_uri_prefix: &str,
    invocation_id: &str,
    page_count: u32,
    create_searchable: bool,
) -> Vec<PageJob> {
    (1..=page_count)
        .map(|page| {
            let id = format!("{}_{:04}", invocation_id, page);
            PageJob {
                text_uri: storage::join(temp_uri_prefix, &format!("{}.txt", id)),
                searchable_uri: create_searchable
                    .then(|| storage::join(temp_uri_prefix, &format!("{}.pdf", id))),
                id,
                page,
                document_uri: document_uri.to_string(),
                temp_uri_prefix: temp_uri_prefix.to_string(),
            }
        })
        .collect()
}

/// Jobs in flight. Triggering is decoupled from observation: the collector
/// decides whether to await these tasks or watch storage instead.
pub struct Dispatched {
    pub jobs: Vec<PageJob>,
    pub tasks: JoinSet<(u32, Result<ExtractResponse>)>,
    limiter: Arc<Semaphore>,
}

impl Dispatched {
    /// Jobs still queued for a permit give up without invoking their worker.
    pub fn stop_queued(&self) {
        self.limiter.close();
    }
}

/// Start every job, at most `max_in_flight` invocations at a time. Returns
/// without waiting for any of them.
pub fn dispatch(invoker: Arc<dyn PageInvoker>, jobs: Vec<PageJob>, max_in_flight: usize) -> Dispatched {
    let limiter = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let mut tasks = JoinSet::new();
    for job in &jobs {
        let invoker = invoker.clone();
        let limiter = limiter.clone();
        let page = job.page;
        let request = job.request();
        debug!("Dispatching page job {} for page {}", job.id, page);
        tasks.spawn(async move {
            let Ok(_permit) = limiter.acquire_owned().await else {
                return (page, Err(anyhow::anyhow!("Page {} was never started", page)));
            };
            (page, invoker.invoke(request).await)
        });
    }
    Dispatched {
        jobs,
        tasks,
        limiter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TextractorResults;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingInvoker {
        seen: Mutex<Vec<ExtractRequest>>,
    }

    #[async_trait::async_trait]
    impl PageInvoker for RecordingInvoker {
        async fn invoke(&self, request: ExtractRequest) -> Result<ExtractResponse> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(ExtractResponse::new(request, &TextractorResults::default()))
        }
    }

    #[test]
    fn test_plan_jobs_addresses() {
        let jobs = plan_jobs("mem://d/doc.pdf", "mem://d/doc.pdf-temp/", "abc", 3, true);
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].id, "abc_0001");
        assert_eq!(jobs[2].page, 3);
        assert_eq!(jobs[1].text_uri, "mem://d/doc.pdf-temp/abc_0002.txt");
        assert_eq!(
            jobs[1].searchable_uri.as_deref(),
            Some("mem://d/doc.pdf-temp/abc_0002.pdf")
        );

        let jobs = plan_jobs("mem://d/doc.pdf", "mem://t", "abc", 1, false);
        assert_eq!(jobs[0].searchable_uri, None);
    }

    #[test]
    fn test_job_request_targets_one_page() {
        let job = &plan_jobs("mem://d/doc.pdf", "mem://t", "xyz", 2, true)[1];
        let request = job.request();
        assert_eq!(request.page, Some(2));
        assert_eq!(request.invocation_trigger_id.as_deref(), Some("xyz_0002"));
        assert_eq!(request.text_uri.as_deref(), Some("mem://t/xyz_0002.txt"));
        assert_eq!(request.create_searchable_output, Some(true));
        assert!(request.callbacks.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_invokes_every_page() {
        let invoker = Arc::new(RecordingInvoker {
            seen: Mutex::new(Vec::new()),
        });
        let jobs = plan_jobs("mem://d/doc.pdf", "mem://t", "id", 4, false);
        let mut dispatched = dispatch(invoker.clone(), jobs, 8);

        let mut pages = Vec::new();
        while let Some(joined) = dispatched.tasks.join_next().await {
            let (page, response) = joined.unwrap();
            assert!(response.is_ok());
            pages.push(page);
        }
        pages.sort();
        assert_eq!(pages, vec![1, 2, 3, 4]);
        assert_eq!(invoker.seen.lock().unwrap().len(), 4);
    }

    /// Tracks how many invocations overlap.
    struct GaugedInvoker {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PageInvoker for GaugedInvoker {
        async fn invoke(&self, request: ExtractRequest) -> Result<ExtractResponse> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(ExtractResponse::new(request, &TextractorResults::default()))
        }
    }

    #[tokio::test]
    async fn test_dispatch_caps_invocations_in_flight() {
        let invoker = Arc::new(GaugedInvoker {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let jobs = plan_jobs("mem://d/doc.pdf", "mem://t", "id", 12, false);
        let mut dispatched = dispatch(invoker.clone(), jobs, 3);

        let mut finished = 0;
        while let Some(joined) = dispatched.tasks.join_next().await {
            assert!(joined.unwrap().1.is_ok());
            finished += 1;
        }
        assert_eq!(finished, 12);
        assert!(invoker.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_stopped_queue_never_invokes() {
        let invoker = Arc::new(GaugedInvoker {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let jobs = plan_jobs("mem://d/doc.pdf", "mem://t", "id", 4, false);
        let mut dispatched = dispatch(invoker.clone(), jobs, 1);
        dispatched.stop_queued();

        let mut failed = 0;
        while let Some(joined) = dispatched.tasks.join_next().await {
            if joined.unwrap().1.is_err() {
                failed += 1;
            }
        }
        // At most the job already holding the permit gets through.
        assert!(failed >= 3);
    }
}
