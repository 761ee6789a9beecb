//! REST endpoints.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::ApiState;
use super::error::{ApiError, ApiResult};
use crate::storage::{email_id_from_key, key_for_email_id};
use crate::store::{EmailStatus, ParsedEmailRecord};

/// Default page size for list endpoints.
const DEFAULT_LIMIT: usize = 50;
/// Largest page a client may ask for.
const MAX_LIMIT: usize = 500;
/// Largest accepted object upload.
const MAX_OBJECT_BYTES: usize = 10 * 1024 * 1024;

/// Build the API router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/emails", get(list_emails))
        .route("/api/emails/{id}", get(get_email))
        .route("/api/emails/{id}/matches", get(get_matches))
        .route("/api/suppliers", get(list_suppliers))
        .route("/api/suppliers/{id}", get(get_supplier))
        .route("/api/ops/queues", get(queue_stats))
        .route("/api/ops/queues/{name}/redrive", post(redrive_queue))
        .route("/api/ops/alarms", get(list_alarms))
        .route("/api/ops/failures", get(list_failures))
        .route(
            "/objects/{*key}",
            put(put_object).layer(DefaultBodyLimit::max(MAX_OBJECT_BYTES)),
        )
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "email-pipeline"
    }))
}

// ── Emails ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ListEmailsQuery {
    status: Option<String>,
    limit: Option<String>,
}

async fn list_emails(
    State(state): State<ApiState>,
    Query(query): Query<ListEmailsQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<EmailStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let limit = parse_limit(query.limit.as_deref())?;

    let emails = state.store.list_parsed_emails(status, limit).await?;
    Ok(Json(json!({
        "count": emails.len(),
        "emails": emails,
    })))
}

async fn get_email(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let record = find_email(&state, &id).await?;
    Ok(Json(record))
}

async fn get_matches(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let record = find_email(&state, &id).await?;
    let matches = match record.status {
        EmailStatus::Parsed => {
            return Err(ApiError::ProcessingIncomplete(format!(
                "email {id} has not finished matching"
            )));
        }
        EmailStatus::Failed => Vec::new(),
        EmailStatus::Matched => state.store.list_matches(&id).await?,
    };
    Ok(Json(json!({
        "emailId": id,
        "status": record.status,
        "matchCount": matches.len(),
        "matches": matches,
    })))
}

/// Look up a parsed record, telling an email still in the pipeline apart
/// from one that never landed.
async fn find_email(state: &ApiState, id: &str) -> ApiResult<ParsedEmailRecord> {
    if let Some(record) = state.store.get_parsed_email(id).await? {
        return Ok(record);
    }
    let key = key_for_email_id(id, &state.ingest_prefix);
    let derivable = email_id_from_key(&key, &state.ingest_prefix).as_deref() == Some(id);
    // An id that cannot form a valid key cannot have landed either.
    if derivable && state.objects.exists(&key).await.unwrap_or(false) {
        return Err(ApiError::ProcessingIncomplete(format!("email {id} has not been parsed yet")));
    }
    Err(ApiError::NotFound(format!("email {id} not found")))
}

// ── Suppliers ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListSuppliersQuery {
    active_only: Option<String>,
}

async fn list_suppliers(
    State(state): State<ApiState>,
    Query(query): Query<ListSuppliersQuery>,
) -> ApiResult<impl IntoResponse> {
    let active_only = match query.active_only.as_deref() {
        None | Some("") => false,
        Some(raw) => raw
            .parse::<bool>()
            .map_err(|_| ApiError::BadRequest(format!("activeOnly must be true or false, got '{raw}'")))?,
    };
    let suppliers = state.store.list_suppliers(active_only).await?;
    Ok(Json(json!({
        "count": suppliers.len(),
        "suppliers": suppliers,
    })))
}

async fn get_supplier(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let supplier = state
        .store
        .get_supplier(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("supplier {id} not found")))?;
    Ok(Json(supplier))
}

// ── Operations ──────────────────────────────────────────────────────────

async fn queue_stats(State(state): State<ApiState>) -> impl IntoResponse {
    let queues = join_all(state.queues.iter().map(|q| q.stats())).await;
    Json(json!({ "queues": queues }))
}

/// Move a work queue's dead-lettered messages back onto it.
async fn redrive_queue(State(state): State<ApiState>, Path(name): Path<String>) -> ApiResult<impl IntoResponse> {
    let queue = state
        .queues
        .iter()
        .find(|q| q.name() == name)
        .ok_or_else(|| ApiError::NotFound(format!("queue {name} not found")))?;
    let dead_letter_queue = queue
        .dead_letter_queue()
        .map(|q| q.name().to_string())
        .ok_or_else(|| ApiError::BadRequest(format!("queue {name} has no dead-letter queue")))?;
    let redriven = queue.redrive().await?;
    info!(queue = %name, redriven, "Dead-letter queue redriven");
    Ok(Json(json!({
        "queue": name,
        "deadLetterQueue": dead_letter_queue,
        "redriven": redriven,
    })))
}

async fn list_alarms(State(state): State<ApiState>) -> impl IntoResponse {
    let alarms = state.alarms.list().await;
    Json(json!({
        "count": alarms.len(),
        "alarms": alarms,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    limit: Option<String>,
}

async fn list_failures(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = parse_limit(query.limit.as_deref())?;
    let failures = state.diagnostics.recent(limit).await;
    Ok(Json(json!({
        "count": failures.len(),
        "failures": failures,
    })))
}

// ── Ingress ─────────────────────────────────────────────────────────────

async fn put_object(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("object body is empty".into()));
    }
    let created = state.objects.put(&key, &body).await?;
    info!(key = %created.key, size = created.size, "Object uploaded");
    Ok((StatusCode::CREATED, Json(created)))
}

fn parse_limit(raw: Option<&str>) -> ApiResult<usize> {
    match raw.filter(|s| !s.is_empty()) {
        None => Ok(DEFAULT_LIMIT),
        Some(raw) => raw
            .parse::<usize>()
            .map(|n| n.clamp(1, MAX_LIMIT))
            .map_err(|_| ApiError::BadRequest(format!("limit must be a positive integer, got '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_clamps() {
        assert_eq!(parse_limit(None).unwrap(), DEFAULT_LIMIT);
        assert_eq!(parse_limit(Some("0")).unwrap(), 1);
        assert_eq!(parse_limit(Some("9999")).unwrap(), MAX_LIMIT);
        assert!(parse_limit(Some("-3")).is_err());
    }
}
