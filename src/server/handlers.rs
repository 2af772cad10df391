//! Route handlers.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use super::AppState;
use super::error::ApiError;
use crate::analysis::{AnalysisDefinition, ParameterValues};
use crate::constants::{APP_TITLE, UPLOAD_FIELD, VERSION};
use crate::service::AnalysisOutcome;
use crate::upload;

pub async fn index(State(state): State<AppState>) -> Json<Value> {
    let analyses: Vec<Value> = state
        .config
        .analyses
        .iter()
        .map(|a| {
            json!({
                "name": a.name,
                "description": a.description,
                "outputs": a.outputs,
                "parameters": a.params,
                "endpoints": {
                    "analyze": format!("POST /api/analyses/{}", a.name),
                    "download": format!("POST /api/analyses/{}/download", a.name),
                    "legacy": [
                        format!("POST /api/{}", a.name),
                        format!("POST /api/{}/download", a.name),
                    ],
                },
            })
        })
        .collect();

    Json(json!({
        "service": APP_TITLE,
        "version": VERSION,
        "endpoints": {
            "health": "GET /health",
            "stats": "GET /api/stats",
            "analyze": "POST /api/analyses/:name",
            "download": "POST /api/analyses/:name/download",
            "legacy_analyze": "POST /api/:name",
            "legacy_download": "POST /api/:name/download",
        },
        "analyses": analyses,
    }))
}

pub async fn health() -> Json<Value> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    Json(json!({
        "status": "healthy",
        "timestamp": timestamp,
    }))
}

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    let cache = state.service.cache();
    let cache_stats = cache.stats();
    let pool = state.service.pool().map(|pool| {
        json!({
            "workers": pool.worker_count(),
            "active": pool.active_workers(),
            "queued": pool.queued(),
            "queue_capacity": pool.queue_capacity(),
        })
    });

    Json(json!({
        "success": true,
        "data": {
            "cache": {
                "enabled": cache.is_enabled(),
                "entries": cache_stats.entries,
                "total_hits": cache_stats.total_hits,
            },
            "admission": {
                "capacity": state.admission.capacity(),
                "available_slots": state.admission.available_slots(),
                "tracked_clients": state.admission.limiter().tracked_clients(),
            },
            "pool": pool,
        },
    }))
}

pub async fn run_analysis(
    State(state): State<AppState>,
    Path(name): Path<String>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let (analysis, outcome) = execute(&state, &name, multipart).await?;

    let outputs: BTreeMap<&str, String> = outcome
        .outputs
        .iter()
        .map(|(name, bytes)| (name.as_str(), String::from_utf8_lossy(bytes).into_owned()))
        .collect();

    Ok(Json(json!({
        "success": true,
        "data": {
            "analysis": analysis.name,
            "fingerprint": outcome.fingerprint.to_hex(),
            "outputs": outputs,
        },
        "cached": outcome.cached,
    })))
}

pub async fn download_analysis(
    State(state): State<AppState>,
    Path(name): Path<String>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let (analysis, outcome) = execute(&state, &name, multipart).await?;
    let primary = analysis.primary_output();
    let bytes = outcome.outputs.get(primary).cloned().unwrap_or_default();

    let disposition = format!("attachment; filename=\"{}_{}\"", analysis.name, primary);
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// Shared request flow: resolve the analysis, store the upload, run or
/// serve from cache. The stored upload is removed when this returns.
async fn execute<'a>(
    state: &'a AppState,
    name: &str,
    multipart: Multipart,
) -> Result<(&'a AnalysisDefinition, AnalysisOutcome), ApiError> {
    let analysis = state
        .config
        .analysis(name)
        .ok_or_else(|| ApiError::NotFound(format!("unknown analysis: {name}")))?;

    let form = read_form(multipart, analysis).await?;
    let artifact = upload::save_upload(
        &state.config.tool.upload_dir,
        &analysis.name,
        &form.filename,
        &form.bytes,
    )
    .await?;
    let outcome = state
        .service
        .analyze(&artifact, analysis, &form.params)
        .await?;
    Ok((analysis, outcome))
}

/// The parts of an analysis request body the gateway uses.
struct AnalysisForm {
    filename: String,
    bytes: axum::body::Bytes,
    params: ParameterValues,
}

/// Pull the structure file and the analysis's declared parameters out of
/// the multipart body. Other fields are skipped.
async fn read_form(
    mut multipart: Multipart,
    analysis: &AnalysisDefinition,
) -> Result<AnalysisForm, ApiError> {
    let mut file = None;
    let mut params = ParameterValues::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if name == UPLOAD_FIELD {
            if file.is_some() {
                continue;
            }
            let filename = field.file_name().unwrap_or_default().to_string();
            let bytes = field.bytes().await.map_err(multipart_error)?;
            file = Some((filename, bytes));
        } else if analysis.parameter(&name).is_some() {
            let value = field.text().await.map_err(multipart_error)?;
            params.insert(name, value);
        }
    }

    let (filename, bytes) =
        file.ok_or_else(|| ApiError::BadRequest(format!("{UPLOAD_FIELD} is required")))?;
    Ok(AnalysisForm {
        filename,
        bytes,
        params,
    })
}

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(e.body_text())
    } else {
        ApiError::BadRequest(format!("invalid multipart body: {}", e.body_text()))
    }
}
