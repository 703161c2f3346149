//! Route handlers.
//!
//! JSON bodies are taken as raw bytes and decoded here, so a malformed body
//! is a plain-text 400 like every other validation failure.

use std::fmt::Write as _;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::error::AppError;
use super::AppState;
use crate::error::ValidationError;
use crate::model::{Metric, MetricPayload};
use crate::validation;

type HandlerResult<T> = Result<T, AppError>;

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, ValidationError> {
    serde_json::from_slice(body).map_err(|e| ValidationError::malformed(e.to_string()))
}

/// `POST /update/{type}/{name}/{value}`
pub(crate) async fn update_path(
    State(state): State<AppState>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> HandlerResult<&'static str> {
    let payload = validation::payload_from_path(&kind, &name, &value)?;
    state.engine.update_one(payload).await?;
    Ok("Metric updated successfully")
}

/// `POST /update/`
pub(crate) async fn update_json(State(state): State<AppState>, body: Bytes) -> HandlerResult<Json<Metric>> {
    let payload: MetricPayload = decode(&body)?;
    Ok(Json(state.engine.update_one(payload).await?))
}

/// `POST /updates/`
pub(crate) async fn updates_json(State(state): State<AppState>, body: Bytes) -> HandlerResult<Json<Vec<Metric>>> {
    let payloads: Vec<MetricPayload> = decode(&body)?;
    Ok(Json(state.engine.update(payloads).await?))
}

/// `GET /value/{type}/{name}`
pub(crate) async fn value_path(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> HandlerResult<String> {
    let kind = validation::parse_kind(&kind)?;
    let metric = state.engine.get(kind, &name).await?;
    Ok(metric.render_value())
}

/// `POST /value/` with a `{"id", "type"}` body
pub(crate) async fn value_json(State(state): State<AppState>, body: Bytes) -> HandlerResult<Json<Metric>> {
    let query: MetricPayload = decode(&body)?;
    let kind = validation::parse_kind(&query.kind)?;
    validation::validate_name(&query.id)?;
    Ok(Json(state.engine.get(kind, &query.id).await?))
}

/// `GET /`
pub(crate) async fn list_html(State(state): State<AppState>) -> HandlerResult<Html<String>> {
    let metrics = state.engine.list().await?;
    Ok(Html(render_table(&metrics)))
}

/// `GET /ping`
pub(crate) async fn ping(State(state): State<AppState>) -> Response {
    match state.engine.ping().await {
        Ok(()) => (StatusCode::OK, "Storage connection successful").into_response(),
        Err(e) => {
            warn!(target: "relay::server", category = e.category(), error = %e, "Storage ping failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Storage connection error").into_response()
        }
    }
}

fn render_table(metrics: &[Metric]) -> String {
    let mut html = String::from(
        "<html><head><title>Metrics</title></head><body>\
         <h1>Metrics List</h1><table border='1'><tr><th>ID</th><th>Type</th><th>Value</th></tr>",
    );
    for metric in metrics {
        // Names are alphanumeric, nothing to escape
        let _ = write!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            metric.name(),
            metric.kind(),
            metric.render_value()
        );
    }
    html.push_str("</table></body></html>");
    html
}
