//! Read-only record lookup for a materialized view.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use state_store::StateStore;

use crate::error::ApiError;

/// One queryable view: which store it lives in and how it is addressed.
#[derive(Clone)]
pub struct RecordQuery {
    /// View name, used in logs and metrics.
    pub view: &'static str,
    /// Error text returned when the key has no record.
    pub not_found: String,
    /// Query-string parameter carrying the key.
    pub id_param: String,
    pub store: Arc<dyn StateStore>,
    /// Upper bound on a single store read.
    pub timeout: Duration,
}

impl RecordQuery {
    pub fn new(
        view: &'static str,
        not_found: impl Into<String>,
        id_param: impl Into<String>,
        store: Arc<dyn StateStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            view,
            not_found: not_found.into(),
            id_param: id_param.into(),
            store,
            timeout,
        }
    }

    async fn fetch(&self, params: &HashMap<String, String>) -> Result<Response, ApiError> {
        let key = params
            .get(&self.id_param)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "No query parameter {} was found in the request. It is required.",
                    self.id_param
                ))
            })?;

        tracing::debug!(view = self.view, key, "record requested");

        let record = tokio::time::timeout(self.timeout, self.store.get(key))
            .await
            .map_err(|_| {
                ApiError::StoreUnavailable(format!(
                    "State store '{}' did not answer within {} ms",
                    self.store.name(),
                    self.timeout.as_millis()
                ))
            })??
            .ok_or_else(|| ApiError::NotFound(self.not_found.clone()))?;

        Ok((
            [(header::ETAG, record.version.etag())],
            Json(record.value),
        )
            .into_response())
    }
}

/// GET /?<idParam>=<key>: the stored value for a key.
pub async fn get(
    State(query): State<Arc<RecordQuery>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let result = query.fetch(&params).await;
    let status = match &result {
        Ok(response) => response.status(),
        Err(error) => error.status(),
    };
    metrics::counter!(
        "query_requests_total",
        "view" => query.view,
        "status" => status.as_u16().to_string()
    )
    .increment(1);
    result
}
