use crate::models::api_log::ApiLogEntry;
use crate::store::postgres::PgStore;

/// Async request log writer. Fires off a Tokio task to insert the entry
/// into PG without blocking the response path.
pub fn log_async(store: PgStore, entry: ApiLogEntry) {
    tokio::spawn(async move {
        if let Err(e) = store.insert_api_log(&entry).await {
            tracing::error!(log_id = %entry.id, path = %entry.path, "failed to write api log: {}", e);
        } else {
            tracing::debug!(log_id = %entry.id, status = entry.status, "api log recorded");
        }
    });
}
