//! HTTP surface: a thin projection of registry, cache, and install state.
//!
//! Every JSON response uses the `{success, data?, description?}` envelope.
//! Errors map to 400 (invalid input), 404 (unknown serial/id), or 500
//! (backend), carrying a human-readable description.

use std::sync::Arc;

use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uprov_adb::DeviceTransport;

use crate::context::Context;
use crate::install;

pub fn router(ctx: Arc<Context>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/devices", get(list_devices))
        .route("/devices/:serial/info", get(device_info))
        .route("/devices/:serial/pkgs", post(create_install))
        .route("/devices/:serial/pkgs/:id", get(install_status))
        .route(
            "/install/:id",
            post(legacy_create_install)
                .get(legacy_install_status)
                .delete(legacy_cancel),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SuccessResponse<T: Serialize> {
    success: bool,
    data: T,
}

fn success<T: Serialize>(data: T) -> Json<SuccessResponse<T>> {
    Json(SuccessResponse {
        success: true,
        data,
    })
}

pub struct ApiError {
    status: StatusCode,
    description: String,
}

impl ApiError {
    fn bad_request(description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            description: description.into(),
        }
    }

    fn not_found(description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            description: description.into(),
        }
    }

    fn internal(description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            description: description.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "description": self.description,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// GET /
// ---------------------------------------------------------------------------

/// Dashboard page, served from the working directory.
async fn index(State(ctx): State<Arc<Context>>) -> Response {
    let path = ctx.config.workdir.join("index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => Html(body).into_response(),
        Err(_) => ApiError::not_found("index.html not found").into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /devices
// ---------------------------------------------------------------------------

async fn list_devices(State(ctx): State<Arc<Context>>) -> impl IntoResponse {
    success(ctx.registry.all())
}

// ---------------------------------------------------------------------------
// GET /devices/{serial}/info
// ---------------------------------------------------------------------------

async fn device_info(
    State(ctx): State<Arc<Context>>,
    Path(serial): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = ctx
        .registry
        .get(&serial)
        .ok_or_else(|| ApiError::not_found(format!("serial {serial} not found")))?;
    Ok(success(record))
}

// ---------------------------------------------------------------------------
// POST /devices/{serial}/pkgs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InstallForm {
    #[serde(default)]
    url: String,
    #[serde(default, rename = "noInstall")]
    no_install: String,
}

impl InstallForm {
    fn no_install(&self) -> bool {
        self.no_install.eq_ignore_ascii_case("true")
    }
}

#[derive(Serialize)]
struct InstallCreated {
    id: String,
    serial: String,
    product: String,
    model: String,
}

async fn create_install(
    State(ctx): State<Arc<Context>>,
    Path(serial): Path<String>,
    Form(form): Form<InstallForm>,
) -> ApiResult<impl IntoResponse> {
    if form.url.is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }

    let device_record = ctx
        .registry
        .get(&serial)
        .ok_or_else(|| ApiError::internal(format!("device {serial} is not reachable")))?;

    let device: Arc<dyn DeviceTransport> = Arc::new(ctx.adb.device(&serial));
    let record = ctx
        .installs
        .begin(device, &form.url, form.no_install())
        .await
        .map_err(|err| ApiError::bad_request(format!("http download: {err}")))?;

    Ok(success(InstallCreated {
        id: record.id().to_string(),
        serial: device_record.serial,
        product: device_record.product,
        model: device_record.model,
    }))
}

// ---------------------------------------------------------------------------
// GET /devices/{serial}/pkgs/{id}
// ---------------------------------------------------------------------------

async fn install_status(
    State(ctx): State<Arc<Context>>,
    Path((_serial, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let record = ctx
        .installs
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("install {id} not found")))?;

    let device = ctx.adb.device(record.serial());
    let info = install::projected_info(&record, Some(&device)).await;
    Ok(success(info))
}

// ---------------------------------------------------------------------------
// Legacy installer dashboard
// ---------------------------------------------------------------------------

/// POST /install/{serial}: same pipeline, no registry requirement.
async fn legacy_create_install(
    State(ctx): State<Arc<Context>>,
    Path(serial): Path<String>,
    Form(form): Form<InstallForm>,
) -> ApiResult<impl IntoResponse> {
    if form.url.is_empty() {
        return Err(ApiError::bad_request("form value \"url\" is required"));
    }

    let device: Arc<dyn DeviceTransport> = Arc::new(ctx.adb.device(&serial));
    let record = ctx
        .installs
        .begin(device, &form.url, form.no_install())
        .await
        .map_err(|err| ApiError::internal(format!("http download: {err}")))?;

    Ok(success(serde_json::json!({ "id": record.id() })))
}

async fn legacy_install_status(
    State(ctx): State<Arc<Context>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = ctx
        .installs
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("install {id} not found")))?;

    let device = ctx.adb.device(record.serial());
    let info = install::projected_info(&record, Some(&device)).await;
    Ok(success(info))
}

/// Download cancellation is out of scope, uniformly.
async fn legacy_cancel() -> ApiError {
    ApiError::bad_request("install cancellation is not supported")
}
