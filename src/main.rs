//! Textractor - page-parallel text extraction server.

mod config;
mod error;
mod extractor;
mod invoke;
mod ocr;
mod orchestrator;
mod pdf;
mod schema;
mod storage;
#[cfg(test)]
mod test_server;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use config::Settings;
use invoke::{HttpInvoker, INVOCATION_ID_HEADER};
use orchestrator::merge::GhostscriptMerger;
use orchestrator::Textractor;
use schema::ExtractRequest;
use std::sync::Arc;
use storage::{HttpStorage, LocalStorage, MemoryStorage, StorageRouter};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    textractor: Arc<Textractor>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "textractor=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    info!(
        "Settings: timeout {:?}, collection {:?}, worker {}, OCR provider {}",
        settings.invocation_timeout,
        settings.collection_mode,
        settings.worker_url,
        settings.ocr_provider
    );

    // One client for storage, page workers and OCR
    let client = reqwest::Client::new();

    let mut storage = StorageRouter::new()
        .with_memory(Arc::new(MemoryStorage::new()))
        .with_http(Arc::new(HttpStorage::new(client.clone())));
    match &settings.local_storage_root {
        Some(root) => {
            info!("Local storage confined to {}", root.display());
            storage = storage.with_local(Arc::new(LocalStorage::new(root.clone())));
        }
        None => info!("LOCAL_STORAGE_ROOT not set, file:// URIs are disabled"),
    }

    let ocr = ocr::build_provider(&settings, client.clone())?;
    info!("OCR provider initialized: {}", ocr.name());

    let invoker = HttpInvoker::new(client, settings.worker_url.clone());
    let merger = GhostscriptMerger::new(settings.ghostscript_bin.clone());
    let bind_addr = settings.bind_addr.clone();

    let state = AppState {
        textractor: Arc::new(Textractor::new(
            Arc::new(storage),
            ocr,
            Arc::new(invoker),
            Arc::new(merger),
            settings,
        )),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/extract", post(extract))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Run one textraction. Duplicate deliveries get `204 No Content`.
async fn extract(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ExtractRequest>,
) -> Response {
    let trigger_id = trigger_id(&request, &headers);
    match state.textractor.handle(request, &trigger_id).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Idempotency key: body field, then header, then a fresh id.
fn trigger_id(request: &ExtractRequest, headers: &HeaderMap) -> String {
    request
        .invocation_trigger_id
        .clone()
        .or_else(|| {
            headers
                .get(INVOCATION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().to_string();
            debug!("No invocation trigger id supplied, using {}", id);
            id
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_trigger_id_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(INVOCATION_ID_HEADER, HeaderValue::from_static("from-header"));

        let mut request = ExtractRequest::new("mem://a.pdf");
        request.invocation_trigger_id = Some("from-body".to_string());
        assert_eq!(trigger_id(&request, &headers), "from-body");

        request.invocation_trigger_id = None;
        assert_eq!(trigger_id(&request, &headers), "from-header");

        let generated = trigger_id(&request, &HeaderMap::new());
        assert_eq!(generated.len(), 36);
        assert_ne!(generated, trigger_id(&request, &HeaderMap::new()));
    }
}
