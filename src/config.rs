//! Process-level settings.
//!
//! Everything is read from the environment (after `.env` is loaded by `main`).
//! Unset variables fall back to defaults; set-but-malformed ones are errors.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How the orchestrator observes page job results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionMode {
    /// Await each dispatched invocation's response.
    Push,
    /// Poll each page's output address until it materializes.
    Poll,
}

impl FromStr for CollectionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(Self::Push),
            "poll" => Ok(Self::Poll),
            other => anyhow::bail!("unknown collection mode: {}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub worker_url: String,
    /// Hard wall-clock budget of one invocation.
    pub invocation_timeout: Duration,
    /// Reserved for merging per-page searchable outputs.
    pub merge_searchable_duration: Duration,
    /// Reserved for writing results and answering the caller.
    pub return_results_duration: Duration,
    /// The async wait tends to overshoot; keep this much slack.
    pub output_wait_buffer: Duration,
    pub collection_mode: CollectionMode,
    pub poll_interval: Duration,
    /// Cap on page worker invocations running at once.
    pub max_in_flight_pages: usize,
    pub min_text_layer_chars: usize,
    pub ghostscript_bin: String,
    pub ocr_provider: String,
    pub ocr_sidecar_url: String,
    pub mistral_api_key: Option<String>,
    pub mistral_base_url: String,
    pub mistral_model: String,
    /// `file://` and bare-path URIs are confined to this directory. Unset
    /// disables local storage.
    pub local_storage_root: Option<PathBuf>,
    pub cleanup_intermediates: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            worker_url: "http://127.0.0.1:3000/extract".to_string(),
            invocation_timeout: Duration::from_secs(900),
            merge_searchable_duration: Duration::from_secs(90),
            return_results_duration: Duration::from_secs(3),
            output_wait_buffer: Duration::from_secs(5),
            collection_mode: CollectionMode::Push,
            poll_interval: Duration::from_millis(1000),
            max_in_flight_pages: 64,
            min_text_layer_chars: 512,
            ghostscript_bin: "gs".to_string(),
            ocr_provider: "sidecar".to_string(),
            ocr_sidecar_url: "http://localhost:3001".to_string(),
            mistral_api_key: None,
            mistral_base_url: "https://api.mistral.ai".to_string(),
            mistral_model: "mistral-ocr-latest".to_string(),
            local_storage_root: None,
            cleanup_intermediates: true,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let secs = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                Some(v) => {
                    let secs: f64 = v
                        .trim()
                        .parse()
                        .with_context(|| format!("{} must be a number of seconds, got {:?}", key, v))?;
                    if !secs.is_finite() || secs < 0.0 {
                        anyhow::bail!("{} must be a non-negative number, got {}", key, secs);
                    }
                    Ok(Duration::from_secs_f64(secs))
                }
                None => Ok(default),
            }
        };

        let poll_interval = match lookup("POLL_INTERVAL_MS") {
            Some(v) => Duration::from_millis(
                v.trim()
                    .parse()
                    .with_context(|| format!("POLL_INTERVAL_MS must be an integer, got {:?}", v))?,
            ),
            None => defaults.poll_interval,
        };

        let min_text_layer_chars = match lookup("MIN_TEXT_LAYER_CHARS") {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("MIN_TEXT_LAYER_CHARS must be an integer, got {:?}", v))?,
            None => defaults.min_text_layer_chars,
        };

        let max_in_flight_pages = match lookup("MAX_IN_FLIGHT_PAGES") {
            Some(v) => match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => anyhow::bail!("MAX_IN_FLIGHT_PAGES must be a positive integer, got {:?}", v),
            },
            None => defaults.max_in_flight_pages,
        };

        let collection_mode = match lookup("COLLECTION_MODE") {
            Some(v) => v.parse().context("Invalid COLLECTION_MODE")?,
            None => defaults.collection_mode,
        };

        let cleanup_intermediates = match lookup("CLEANUP_INTERMEDIATES") {
            Some(v) => parse_bool(&v)
                .with_context(|| format!("CLEANUP_INTERMEDIATES must be a boolean, got {:?}", v))?,
            None => defaults.cleanup_intermediates,
        };

        let bind_addr = lookup("BIND_ADDR").unwrap_or(defaults.bind_addr);
        let worker_url = lookup("WORKER_URL").unwrap_or_else(|| default_worker_url(&bind_addr));

        Ok(Self {
            worker_url,
            bind_addr,
            invocation_timeout: secs("INVOCATION_TIMEOUT_SECS", defaults.invocation_timeout)?,
            merge_searchable_duration: secs(
                "MERGE_SEARCHABLE_OUTPUT_DURATION",
                defaults.merge_searchable_duration,
            )?,
            return_results_duration: secs("RETURN_RESULTS_DURATION", defaults.return_results_duration)?,
            output_wait_buffer: secs("OUTPUT_WAIT_BUFFER_TIME", defaults.output_wait_buffer)?,
            collection_mode,
            poll_interval,
            max_in_flight_pages,
            min_text_layer_chars,
            ghostscript_bin: lookup("GHOSTSCRIPT_BIN").unwrap_or(defaults.ghostscript_bin),
            ocr_provider: lookup("OCR_PROVIDER").unwrap_or(defaults.ocr_provider),
            ocr_sidecar_url: lookup("OCR_SIDECAR_URL").unwrap_or(defaults.ocr_sidecar_url),
            mistral_api_key: lookup("MISTRAL_API_KEY").filter(|k| !k.trim().is_empty()),
            mistral_base_url: lookup("MISTRAL_BASE_URL").unwrap_or(defaults.mistral_base_url),
            mistral_model: lookup("MISTRAL_OCR_MODEL").unwrap_or(defaults.mistral_model),
            local_storage_root: lookup("LOCAL_STORAGE_ROOT")
                .filter(|root| !root.trim().is_empty())
                .map(PathBuf::from),
            cleanup_intermediates,
        })
    }
}

/// Page workers default to this same service on loopback.
fn default_worker_url(bind_addr: &str) -> String {
    let port = bind_addr.rsplit(':').next().unwrap_or("3000");
    format!("http://127.0.0.1:{}/extract", port)
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("not a boolean: {}", other),
    }
}
