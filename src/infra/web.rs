use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use log::{error, info};
use serde::Deserialize;
use serde_json::json;

use crate::domain::{
    error::QuayError,
    model::{Application, NewApp, Repo, StatusDocument},
    port::AppField,
    DeployService,
};

type ApiError = (StatusCode, Json<serde_json::Value>);

pub fn router(service: Arc<DeployService>) -> Router {
    Router::new()
        .route("/apps", post(register_app))
        .route("/apps", get(find_app))
        .route("/apps/:app_id", get(get_app))
        .route("/apps/:app_id", delete(delete_app))
        .route("/apps/:app_id/builds", post(start_build))
        .route("/apps/:app_id/builds/:build_id/events", get(build_events))
        .route("/apps/:app_id/run", post(start_run))
        .route("/apps/:app_id/stop", post(stop_app))
        .route("/apps/:app_id/status", get(get_status))
        .route("/apps/:app_id/logs", get(get_logs))
        .with_state(service)
}

fn error_response(e: QuayError) -> ApiError {
    let status = match &e {
        QuayError::NotFound(_) => StatusCode::NOT_FOUND,
        QuayError::DuplicateName(_) => StatusCode::CONFLICT,
        QuayError::NotBuilt | QuayError::NotRunning => StatusCode::CONFLICT,
        QuayError::Validation(_)
        | QuayError::InvalidName(_)
        | QuayError::DescriptionTooLong => StatusCode::UNPROCESSABLE_ENTITY,
        QuayError::Clone(_) | QuayError::Build(_) => StatusCode::BAD_GATEWAY,
        QuayError::Runtime(_) | QuayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {e}");
    }
    (status, Json(json!({ "message": e.to_string() })))
}

fn load_app(service: &DeployService, app_id: &str) -> Result<Application, ApiError> {
    match service.apps.get(app_id) {
        Ok(Some(app)) => Ok(app),
        Ok(None) => Err(error_response(QuayError::NotFound(app_id.to_string()))),
        Err(e) => Err(error_response(e)),
    }
}

#[derive(Deserialize)]
struct RegisterRequest {
    name: String,
    user_id: String,
    #[serde(default)]
    description: String,
    git_url: String,
    #[serde(default)]
    private: bool,
}

async fn register_app(
    State(service): State<Arc<DeployService>>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<Application>, ApiError> {
    service
        .register_app(NewApp {
            user_id: payload.user_id,
            name: payload.name,
            description: payload.description,
            repo: Repo {
                git_url: payload.git_url,
                private: payload.private,
            },
        })
        .map(Json)
        .map_err(error_response)
}

#[derive(Deserialize)]
struct FindQuery {
    name: Option<String>,
    user_id: Option<String>,
}

async fn find_app(
    State(service): State<Arc<DeployService>>,
    Query(query): Query<FindQuery>,
) -> Result<Json<Application>, ApiError> {
    let lookup = match (&query.name, &query.user_id) {
        (Some(name), _) => service.apps.get_by(AppField::Name, name),
        (None, Some(user_id)) => service.apps.get_by(AppField::UserId, user_id),
        (None, None) => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "message": "name or user_id query parameter required" })),
            ))
        }
    };
    match lookup {
        Ok(Some(app)) => Ok(Json(app)),
        Ok(None) => Err(error_response(QuayError::NotFound("query".to_string()))),
        Err(e) => Err(error_response(e)),
    }
}

async fn get_app(
    State(service): State<Arc<DeployService>>,
    Path(app_id): Path<String>,
) -> Result<Json<Application>, ApiError> {
    load_app(&service, &app_id).map(Json)
}

async fn delete_app(
    State(service): State<Arc<DeployService>>,
    Path(app_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let app = load_app(&service, &app_id)?;
    match service.apps.soft_delete(&app.app_id) {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(error_response(e)),
    }
}

async fn start_build(
    State(service): State<Arc<DeployService>>,
    Path(app_id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let app = load_app(&service, &app_id)?;
    let build_id = service.start_build(app);
    Ok((StatusCode::ACCEPTED, Json(json!({ "build_id": build_id }))))
}

async fn start_run(
    State(service): State<Arc<DeployService>>,
    Path(app_id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let app = load_app(&service, &app_id)?;
    match service.start_run(app).await {
        Ok(run_id) => Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": run_id })))),
        Err(e) => Err(error_response(e)),
    }
}

async fn stop_app(
    State(service): State<Arc<DeployService>>,
    Path(app_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let app = load_app(&service, &app_id)?;
    match service.stop_app(&app).await {
        Ok(()) => Ok(Json(json!({ "message": format!("{} stopped", app.name) }))),
        Err(e) => Err(error_response(e)),
    }
}

#[derive(Deserialize)]
struct StatusQuery {
    #[serde(default)]
    logs: bool,
    #[serde(default)]
    history: bool,
}

async fn get_status(
    State(service): State<Arc<DeployService>>,
    Path(app_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusDocument>, ApiError> {
    let app = load_app(&service, &app_id)?;
    service
        .status_document(&app, query.logs, query.history)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Deserialize)]
struct LogsQuery {
    n: Option<usize>,
}

const DEFAULT_LOG_LINES: usize = 100;

async fn get_logs(
    State(service): State<Arc<DeployService>>,
    Path(app_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let app = load_app(&service, &app_id)?;
    let n = query.n.unwrap_or(DEFAULT_LOG_LINES);
    service
        .app_logs(&app, n)
        .await
        .map(|lines| Json(json!({ "lines": lines })))
        .map_err(error_response)
}

/// Lightweight long-poll-style progress channel: every inbound message is
/// answered with the current numeric status code for the build.
async fn build_events(
    State(service): State<Arc<DeployService>>,
    Path((app_id, build_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_build_events(socket, service, app_id, build_id))
}

async fn handle_build_events(
    mut socket: WebSocket,
    service: Arc<DeployService>,
    app_id: String,
    build_id: String,
) {
    info!("Accepting build status stream for {app_id}/{build_id}");
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(_) | Message::Binary(_) => {
                let code = service.build_status_code(&app_id, &build_id);
                let reply = json!({ "value": code }).to_string();
                if socket.send(Message::Text(reply)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    info!("Closing build status stream for {app_id}/{build_id}");
}
