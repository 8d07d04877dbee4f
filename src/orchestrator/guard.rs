//! Suppression of redelivered invocations.
//!
//! The trigger platform may deliver the same logical request more than once.
//! A zero-byte marker keyed by the trigger id records that an invocation has
//! already started. Check-then-set is not atomic: two racing deliveries may
//! both proceed, which downstream steps tolerate since they overwrite the
//! same addresses. Storage errors while checking fail open.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::storage::{self, Metadata, Storage};

pub struct IdempotencyGuard {
    storage: Arc<dyn Storage>,
}

impl IdempotencyGuard {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Marker address for a trigger id under the invocation's temp prefix.
    ///
    /// The id is percent-encoded, so distinct ids never share a marker.
    pub fn marker_uri(temp_uri_prefix: &str, trigger_id: &str) -> String {
        storage::join(
            &storage::join(temp_uri_prefix, "invocation_trigger_ids"),
            &urlencoding::encode(trigger_id),
        )
    }

    /// `true` when this invocation should run; `false` for a duplicate.
    pub async fn admit(&self, marker_uri: &str) -> bool {
        match self.storage.exists(marker_uri).await {
            Ok(true) => {
                debug!("Marker <{}> exists; duplicate invocation", marker_uri);
                return false;
            }
            Ok(false) => {}
            Err(e) => warn!(
                "Failed to check idempotency marker <{}>, proceeding: {}",
                marker_uri, e
            ),
        }

        if let Err(e) = self
            .storage
            .write(marker_uri, Vec::new(), Metadata::new())
            .await
        {
            warn!("Failed to write idempotency marker <{}>: {}", marker_uri, e);
        }
        true
    }
}
