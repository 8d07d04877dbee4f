//! Request and response payloads of the `/extract` endpoint.
//!
//! The response echoes the request (including fields this service does not
//! understand) and adds `results.textractor`, so callers can chain steps.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Step name whose callbacks this service fires.
pub const CALLBACK_STEP: &str = "textractor";

/// Callback descriptor: written to `uri` with the final payload when `step` matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callback {
    pub step: String,
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub document_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_uri_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub searchable_output_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_searchable_output: Option<bool>,
    /// Present when this invocation is a single-page worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub callbacks: Vec<Callback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_trigger_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_ocr: Option<bool>,
    /// Unknown fields, echoed back untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExtractRequest {
    pub fn new(document_uri: impl Into<String>) -> Self {
        Self {
            document_uri: document_uri.into(),
            temp_uri_prefix: None,
            text_uri: None,
            searchable_output_uri: None,
            create_searchable_output: None,
            page: None,
            callbacks: Vec::new(),
            invocation_trigger_id: None,
            disable_ocr: None,
            extra: Map::new(),
        }
    }

    /// Fill in the defaulted addresses so they are echoed explicitly.
    pub fn resolve(mut self) -> Self {
        let doc = self.document_uri.clone();
        self.temp_uri_prefix.get_or_insert_with(|| format!("{}-temp", doc));
        self.text_uri.get_or_insert_with(|| format!("{}.txt", doc));
        self.searchable_output_uri
            .get_or_insert_with(|| format!("{}.searchable.pdf", doc));
        self
    }

    pub fn temp_uri_prefix(&self) -> String {
        self.temp_uri_prefix
            .clone()
            .unwrap_or_else(|| format!("{}-temp", self.document_uri))
    }

    pub fn text_uri(&self) -> String {
        self.text_uri
            .clone()
            .unwrap_or_else(|| format!("{}.txt", self.document_uri))
    }

    pub fn searchable_output_uri(&self) -> String {
        self.searchable_output_uri
            .clone()
            .unwrap_or_else(|| format!("{}.searchable.pdf", self.document_uri))
    }

    pub fn create_searchable_output(&self) -> bool {
        self.create_searchable_output.unwrap_or(true)
    }

    pub fn disable_ocr(&self) -> bool {
        self.disable_ocr.unwrap_or(false)
    }
}

/// Outcome block placed under `results.textractor`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextractorResults {
    pub success: bool,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_pages: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_text_pages: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub empty_content_pages: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_searchable_pages: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub searchable_output_uri: Option<String>,
}

impl TextractorResults {
    pub fn failure(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            method: method.into(),
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Final payload: the echoed request plus `results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractResponse {
    #[serde(flatten)]
    pub request: ExtractRequest,
    #[serde(default)]
    pub results: Map<String, Value>,
}

impl ExtractResponse {
    /// Attach `results.textractor`, keeping results from earlier steps.
    pub fn new(mut request: ExtractRequest, textractor: &TextractorResults) -> Self {
        let mut results = match request.extra.remove("results") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        results.insert(
            CALLBACK_STEP.to_string(),
            serde_json::to_value(textractor).unwrap_or(Value::Null),
        );
        Self { request, results }
    }

    /// Parsed `results.textractor`, if present and well-formed.
    pub fn textractor(&self) -> Option<TextractorResults> {
        self.results
            .get(CALLBACK_STEP)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
