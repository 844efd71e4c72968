/// Control-plane HTTP surface: plain axum handlers over `State`, `Path`, and
/// `Json`, a thin `Router` builder, and nothing scheduling-specific baked
/// into the transport layer.
use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use taskgrid_core::error::{Identity, SchedulerError};
use taskgrid_core::instance::InstanceSnapshot;
use taskgrid_core::model::{Mode, SchedulerConfig};
use taskgrid_core::registry::SchedulerRegistry;
use taskgrid_core::worker::LogBinding;

use crate::log_binding::tail_lines;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SchedulerRegistry>,
    pub configs: Arc<HashMap<Identity, SchedulerConfig>>,
    pub log_binding: Arc<dyn LogBinding>,
}

#[derive(Serialize)]
struct StartResponse {
    pid: u32,
}

#[derive(Deserialize)]
struct TailQuery {
    n: Option<usize>,
}

fn parse_mode(raw: &str) -> Result<Mode, (StatusCode, String)> {
    match raw {
        "single" => Ok(Mode::Single),
        "multi" => Ok(Mode::Multi),
        other => Err((StatusCode::UNPROCESSABLE_ENTITY, format!("unknown mode {other:?}"))),
    }
}

async fn start_handler(
    State(state): State<AppState>,
    Path((mode, config_index)): Path<(String, u32)>,
) -> Result<Json<StartResponse>, (StatusCode, String)> {
    let mode = parse_mode(&mode)?;
    let identity = Identity { mode, config_index };
    let config = state
        .configs
        .get(&identity)
        .cloned()
        .ok_or((StatusCode::UNPROCESSABLE_ENTITY, format!("no configuration registered for {identity}")))?;

    match state.registry.start(identity, config).await {
        Ok(pid) => Ok(Json(StartResponse { pid })),
        Err(SchedulerError::RegistryBusy(id)) => Err((StatusCode::CONFLICT, format!("{id} is already running"))),
        Err(e) => Err((StatusCode::UNPROCESSABLE_ENTITY, e.to_string())),
    }
}

async fn stop_handler(
    State(state): State<AppState>,
    Path((mode, config_index)): Path<(String, u32)>,
) -> Result<StatusCode, (StatusCode, String)> {
    let mode = parse_mode(&mode)?;
    match state.registry.stop(Identity { mode, config_index }).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(SchedulerError::NotFound(id)) => Err((StatusCode::NOT_FOUND, format!("no scheduler found for {id}"))),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn stop_by_pid_handler(State(state): State<AppState>, Path(pid): Path<u32>) -> Result<StatusCode, (StatusCode, String)> {
    match state.registry.stop_by_pid(pid).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(SchedulerError::NoSuchPid(p)) => Err((StatusCode::NOT_FOUND, format!("no scheduler running at pid {p}"))),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn list_handler(State(state): State<AppState>) -> Json<Vec<InstanceSnapshot>> {
    Json(state.registry.list())
}

async fn get_handler(
    State(state): State<AppState>,
    Path((mode, config_index)): Path<(String, u32)>,
) -> Result<Json<InstanceSnapshot>, (StatusCode, String)> {
    let mode = parse_mode(&mode)?;
    state
        .registry
        .get(Identity { mode, config_index })
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "no such scheduler".to_string()))
}

async fn log_path_handler(
    State(state): State<AppState>,
    Path((mode, config_index, queue_id, process_index)): Path<(String, u32, u32, u32)>,
) -> Result<Json<String>, StatusCode> {
    let mode = parse_mode(&mode).map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;
    let path = state
        .log_binding
        .resolve(mode, config_index, queue_id, process_index)
        .await
        .filter(|p| p.exists())
        .ok_or(StatusCode::NO_CONTENT)?;
    Ok(Json(path.display().to_string()))
}

async fn tail_handler(
    State(state): State<AppState>,
    Path((mode, config_index, queue_id, process_index)): Path<(String, u32, u32, u32)>,
    Query(query): Query<TailQuery>,
) -> Result<String, StatusCode> {
    let mode = parse_mode(&mode).map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;
    let path = state
        .log_binding
        .resolve(mode, config_index, queue_id, process_index)
        .await
        .ok_or(StatusCode::NO_CONTENT)?;
    tail_lines(&path, query.n.unwrap_or(100)).await.map_err(|_| StatusCode::NOT_FOUND)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/schedulers/:mode/:config_index/start", post(start_handler))
        .route("/schedulers/:mode/:config_index/stop", post(stop_handler))
        .route("/schedulers/by-pid/:pid/stop", post(stop_by_pid_handler))
        .route("/schedulers", get(list_handler))
        .route("/schedulers/:mode/:config_index", get(get_handler))
        .route("/logs/:mode/:config_index/:queue_id/:process_index", get(log_path_handler))
        .route("/logs/:mode/:config_index/:queue_id/:process_index/tail", get(tail_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn empty_state() -> AppState {
        AppState {
            registry: Arc::new(SchedulerRegistry::new(
                Arc::new(taskgrid_core::probe::MockGpuProbe::new(vec![])),
                Arc::new(taskgrid_core::worker::NullLogBinding),
                "tester".to_string(),
            )),
            configs: Arc::new(HashMap::new()),
            log_binding: Arc::new(taskgrid_core::worker::NullLogBinding),
        }
    }

    #[tokio::test]
    async fn list_on_empty_registry_returns_empty_json_array() {
        let app = build_router(empty_state());
        let response = app
            .oneshot(Request::builder().uri("/schedulers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn start_without_a_registered_config_is_unprocessable() {
        let app = build_router(empty_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/schedulers/single/0/start")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn stop_of_unknown_identity_is_not_found() {
        let app = build_router(empty_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/schedulers/single/0/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_with_unknown_mode_segment_is_unprocessable() {
        let app = build_router(empty_state());
        let response = app
            .oneshot(Request::builder().uri("/schedulers/quantum/0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
