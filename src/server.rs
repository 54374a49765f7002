// HTTP API for the live overlay: scene export, status, layer toggles,
// viewport and pointer events, plus the feed validation proxy.

use std::str::FromStr;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::dev::Server;
use actix_web::http::StatusCode;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::engine::OverlayHandle;
use crate::error::{EngineError, ValidationError};
use crate::models::{EntityKind, LngLat, ReportFormat, ValidationReport};
use crate::render::{EventKind, FeatureHandle, LayerEvent};
use crate::source::ValidationClient;

const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub overlay: OverlayHandle,
    pub validation: Arc<ValidationClient>,
    /// Bumped after every passing validation; static geometry follows it.
    pub generation: Arc<watch::Sender<u64>>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now().timestamp(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message.into()),
            timestamp: Utc::now().timestamp(),
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(ApiResponse::<()>::error(message))
}

fn engine_unavailable(err: EngineError) -> HttpResponse {
    warn!(error = %err, "server.engine_unavailable");
    error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    pub visible: bool,
}

#[derive(Debug, Deserialize)]
pub struct ViewportRequest {
    pub center: LngLat,
    pub zoom: f64,
}

/// Either a raw pointer event on a feature handle, or an already resolved
/// layer event.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EventRequest {
    Pointer { handle: u64, event: EventKind },
    Layer(LayerEvent),
}

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub format: Option<ReportFormat>,
}

// ============================================================================
// Overlay Routes
// ============================================================================

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "GTFS Live Overlay",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().timestamp(),
    }))
}

async fn get_scene(state: web::Data<AppState>) -> HttpResponse {
    match state.overlay.scene().await {
        Ok(Some(scene)) => HttpResponse::Ok().json(ApiResponse::success(scene)),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "rendering surface does not export a scene"),
        Err(err) => engine_unavailable(err),
    }
}

async fn get_status(state: web::Data<AppState>) -> HttpResponse {
    match state.overlay.status().await {
        Ok(status) => HttpResponse::Ok().json(ApiResponse::success(status)),
        Err(err) => engine_unavailable(err),
    }
}

async fn set_visibility(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<VisibilityRequest>,
) -> HttpResponse {
    let kind = match EntityKind::from_str(&path.into_inner()) {
        Ok(kind) => kind,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    let visible = body.visible;
    match state.overlay.set_visibility(kind, visible).await {
        Ok(report) => HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
            "kind": kind,
            "visible": visible,
            "report": report,
        }))),
        Err(err) => engine_unavailable(err),
    }
}

async fn set_viewport(state: web::Data<AppState>, body: web::Json<ViewportRequest>) -> HttpResponse {
    let ViewportRequest { center, zoom } = body.into_inner();
    if !center.is_finite() || !zoom.is_finite() {
        return error_response(StatusCode::BAD_REQUEST, "viewport must be finite");
    }
    match state.overlay.set_viewport(center, zoom).await {
        Ok(report) => HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
            "zoom": zoom,
            "reclustered": report.is_some(),
            "report": report,
        }))),
        Err(err) => engine_unavailable(err),
    }
}

async fn post_event(state: web::Data<AppState>, body: web::Json<EventRequest>) -> HttpResponse {
    let result = match body.into_inner() {
        EventRequest::Pointer { handle, event } => state.overlay.pointer(FeatureHandle(handle), event).await,
        EventRequest::Layer(event) => state.overlay.event(event).await,
    };
    match result {
        Ok(Some(outcome)) => HttpResponse::Ok().json(ApiResponse::success(outcome)),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no current entity for event"),
        Err(err) => engine_unavailable(err),
    }
}

async fn close_popup(state: web::Data<AppState>) -> HttpResponse {
    match state.overlay.close_popup().await {
        Ok(closed) => HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({ "closed": closed }))),
        Err(err) => engine_unavailable(err),
    }
}

// ============================================================================
// Feed Validation Routes
// ============================================================================

fn validation_status(err: &ValidationError) -> StatusCode {
    match err {
        ValidationError::NotZip(_) => StatusCode::BAD_REQUEST,
        ValidationError::Server { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        ValidationError::Network(_) | ValidationError::Parse(_) => StatusCode::BAD_GATEWAY,
        ValidationError::Read { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Bumps the validation generation when the feed passed, so routes and stops
/// are refetched. A failing report leaves the generation alone; the backend
/// has no feed to serve geometry from.
fn record_validation(generation: &watch::Sender<u64>, report: &ValidationReport) -> u64 {
    if report.is_valid {
        generation.send_modify(|g| *g += 1);
    }
    *generation.borrow()
}

/// Accepts the raw archive body and forwards it to the validation service.
async fn validate_feed(
    state: web::Data<AppState>,
    query: web::Query<ValidateQuery>,
    body: web::Bytes,
) -> HttpResponse {
    let Some(file_name) = query.into_inner().filename else {
        return error_response(StatusCode::BAD_REQUEST, "`filename` query parameter is required");
    };

    let client = state.validation.clone();
    let upload = body.to_vec();
    let result = tokio::task::spawn_blocking(move || client.validate_bytes(&file_name, upload)).await;

    match result {
        Ok(Ok(report)) => {
            let generation = record_validation(&state.generation, &report);
            info!(generation, is_valid = report.is_valid, "server.feed_validated");
            HttpResponse::Ok().json(ApiResponse::success(report))
        }
        Ok(Err(err)) => {
            warn!(error = %err, "server.validation_failed");
            error_response(validation_status(&err), err.to_string())
        }
        Err(err) => {
            warn!(error = %err, "server.validation_task_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "validation task failed")
        }
    }
}

async fn get_report(state: web::Data<AppState>, query: web::Query<ReportQuery>) -> HttpResponse {
    let format = query.format.unwrap_or(ReportFormat::Json);
    let client = state.validation.clone();
    match tokio::task::spawn_blocking(move || client.export_report(format)).await {
        Ok(Ok(bytes)) => {
            let mut response = HttpResponse::Ok();
            response.content_type(format.content_type());
            if format == ReportFormat::Csv {
                response.insert_header((
                    "Content-Disposition",
                    "attachment; filename=validation_report.csv",
                ));
            }
            response.body(bytes)
        }
        Ok(Err(err)) => error_response(validation_status(&err), err.to_string()),
        Err(err) => {
            warn!(error = %err, "server.report_task_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "report task failed")
        }
    }
}

// ============================================================================
// Server Setup
// ============================================================================

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .service(
            web::scope("/api/overlay")
                .route("/scene", web::get().to(get_scene))
                .route("/status", web::get().to(get_status))
                .route("/layers/{kind}/visibility", web::post().to(set_visibility))
                .route("/viewport", web::post().to(set_viewport))
                .route("/events", web::post().to(post_event))
                .route("/popup/close", web::post().to(close_popup)),
        )
        .service(
            web::scope("/api/feed")
                .route("/validate", web::post().to(validate_feed))
                .route("/report", web::get().to(get_report)),
        );
}

pub fn build_server(state: AppState, bind_address: &str) -> std::io::Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .app_data(web::PayloadConfig::new(MAX_UPLOAD_BYTES))
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(routes)
    })
    .bind(bind_address)?
    .disable_signals()
    .run();
    Ok(server)
}
