use crate::engine::{Engine, ResolvedCommand};
use crate::error::SupervisorError;
use crate::logs::LogRecord;
use crate::metrics::StreamMetrics;
use crate::state::{ControlOutcome, RunState, SharedState, StreamStatus};
use crate::store::{StreamDefinition, StreamDraft};
use crate::web::error::ApiError;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub category: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
}

/// 流定义与当前运行状态
#[derive(Debug, Serialize)]
pub struct StreamView {
    #[serde(flatten)]
    pub definition: StreamDefinition,
    pub status: StreamStatus,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub id: String,
    pub state: RunState,
    pub message: String,
}

/// 列表与事件推送共用
pub async fn stream_views(
    state: &SharedState,
    category: Option<&str>,
) -> Result<Vec<StreamView>, ApiError> {
    let streams = state.store.list().await?;
    Ok(streams
        .into_iter()
        .filter(|s| category.map_or(true, |c| s.category == c))
        .map(|definition| StreamView {
            status: state.supervisor.snapshot(&definition.id),
            definition,
        })
        .collect())
}

async fn find(state: &SharedState, id: &str) -> Result<StreamDefinition, ApiError> {
    state
        .store
        .get(id)
        .await?
        .ok_or_else(|| SupervisorError::NotFound(id.to_string()).into())
}

/// 获取流列表 API, 可按分类过滤
pub async fn list_streams(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let category = query.category.as_deref().filter(|c| !c.is_empty());
    let streams = stream_views(&state, category).await?;
    Ok(Json(serde_json::json!({ "streams": streams })))
}

pub async fn create_stream(
    State(state): State<SharedState>,
    Json(draft): Json<StreamDraft>,
) -> Result<(StatusCode, Json<StreamView>), ApiError> {
    let draft = draft.validated()?;
    let definition = state.store.create(draft).await?;
    tracing::info!("Stream [{}] created: {}", definition.id, definition.name);
    let status = state.supervisor.snapshot(&definition.id);
    Ok((StatusCode::CREATED, Json(StreamView { definition, status })))
}

pub async fn get_stream(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<StreamView>, ApiError> {
    let definition = find(&state, &id).await?;
    let status = state.supervisor.snapshot(&id);
    Ok(Json(StreamView { definition, status }))
}

/// 运行中的流修改后需重启才生效
pub async fn update_stream(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(draft): Json<StreamDraft>,
) -> Result<Json<StreamView>, ApiError> {
    let draft = draft.validated()?;
    let definition = state
        .store
        .update(&id, draft)
        .await?
        .ok_or_else(|| SupervisorError::NotFound(id.clone()))?;
    let status = state.supervisor.snapshot(&id);
    Ok(Json(StreamView { definition, status }))
}

/// 未在等待时间内完成的操作返回 202 和当前状态, 完成情况通过 `/status` 或 `/events` 获得
fn control_response(id: String, outcome: ControlOutcome, done: &str) -> Response {
    match outcome {
        ControlOutcome::Done(run_state) => Json(ControlResponse {
            message: format!("Stream [{}] {}", id, done),
            id,
            state: run_state,
        })
        .into_response(),
        ControlOutcome::InProgress(run_state) => (
            StatusCode::ACCEPTED,
            Json(ControlResponse {
                message: format!("Stream [{}] is {}, still in progress", id, run_state.as_str()),
                id,
                state: run_state,
            }),
        )
            .into_response(),
    }
}

pub async fn delete_stream(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let outcome = state.supervisor.delete(&id).await?;
    Ok(match outcome {
        ControlOutcome::Done(_) => StatusCode::NO_CONTENT.into_response(),
        pending => control_response(id, pending, "deleted"),
    })
}

/// 手动启动流 API
pub async fn handle_start(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    let run_state = state.supervisor.start(&id).await?;
    Ok(Json(ControlResponse {
        message: format!("Stream [{}] started", id),
        id,
        state: run_state,
    }))
}

/// 手动停止流 API
pub async fn handle_stop(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let outcome = state.supervisor.stop(&id).await?;
    Ok(control_response(id, outcome, "stopped"))
}

pub async fn handle_restart(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let outcome = state.supervisor.restart(&id).await?;
    Ok(control_response(id, outcome, "restarted"))
}

pub async fn stream_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<StreamStatus>, ApiError> {
    Ok(Json(state.supervisor.status(&id).await?))
}

pub async fn stream_metrics(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<StreamMetrics>, ApiError> {
    Ok(Json(state.sampler.sample(&id).await?))
}

pub async fn stream_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    find(&state, &id).await?;
    let limit = query
        .limit
        .unwrap_or(state.config.logs.default_limit)
        .min(state.config.logs.max_limit);
    Ok(Json(state.supervisor.logs().tail(&id, limit).await?))
}

pub async fn clear_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    find(&state, &id).await?;
    state.supervisor.logs().clear(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 预览解析后的转码命令
pub async fn stream_command(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ResolvedCommand>, ApiError> {
    let definition = find(&state, &id).await?;
    Ok(Json(Engine::command_line(
        &state.config.transcoder,
        &definition,
    )))
}

#[cfg(all(test, unix))]
mod tests {
    use crate::logs::LogLevel;
    use crate::state::SharedState;
    use crate::web::{router, test_state};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    async fn server(dir: &TempDir) -> (TestServer, SharedState) {
        let state = test_state(dir.path(), |_| {}).await;
        (TestServer::new(router(state.clone())).unwrap(), state)
    }

    async fn create(server: &TestServer, input: &str) -> String {
        let response = server
            .post("/streams")
            .json(&json!({
                "name": "Camera 1",
                "input": input,
                "output": "rtmp://live/app",
                "key": "abc",
                "category": "cams"
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::CREATED);
        let body: Value = response.json();
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn crud_round() {
        let dir = TempDir::new().unwrap();
        let (server, _) = server(&dir).await;
        let id = create(&server, "exec sleep 30").await;

        let body: Value = server.get("/streams?category=cams").await.json();
        assert_eq!(body["streams"].as_array().unwrap().len(), 1);
        assert_eq!(body["streams"][0]["status"]["state"], "stopped");
        let body: Value = server.get("/streams?category=other").await.json();
        assert!(body["streams"].as_array().unwrap().is_empty());

        let response = server
            .put(&format!("/streams/{}", id))
            .json(&json!({ "name": "Camera 2", "input": "exec sleep 30", "output": "rtmp://live/app" }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = server.get(&format!("/streams/{}", id)).await.json();
        assert_eq!(body["name"], "Camera 2");
        assert_eq!(body["id"], id.as_str());

        let command: Value = server.get(&format!("/streams/{}/command", id)).await.json();
        assert_eq!(command["program"], "sh");
        assert_eq!(command["args"][2], "rtmp://live/app");

        let response = server.delete(&format!("/streams/{}", id)).await;
        assert_eq!(response.status_code(), StatusCode::NO_CONTENT);
        let response = server.get(&format!("/streams/{}", id)).await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
        let body: Value = response.json();
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn create_rejects_missing_fields() {
        let dir = TempDir::new().unwrap();
        let (server, _) = server(&dir).await;
        let response = server.post("/streams").json(&json!({ "name": "x" })).await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error"], "validation");
    }

    #[tokio::test]
    async fn control_lifecycle_over_http() {
        let dir = TempDir::new().unwrap();
        let (server, _) = server(&dir).await;
        let id = create(&server, "exec sleep 30").await;

        let body: Value = server.post(&format!("/streams/{}/start", id)).await.json();
        assert_eq!(body["state"], "running");

        let response = server.post(&format!("/streams/{}/start", id)).await;
        assert_eq!(response.status_code(), StatusCode::CONFLICT);
        let body: Value = response.json();
        assert_eq!(body["error"], "already_running");

        let metrics: Value = server.get(&format!("/streams/{}/metrics", id)).await.json();
        assert_eq!(metrics["state"], "running");
        assert!(metrics["pid"].is_u64());
        // 探针被禁用时进程指标不可用
        assert_eq!(metrics["cpu_percent"], "unavailable");
        assert_eq!(metrics["fps"], "unavailable");

        let body: Value = server.post(&format!("/streams/{}/restart", id)).await.json();
        assert_eq!(body["state"], "running");

        let body: Value = server.post(&format!("/streams/{}/stop", id)).await.json();
        assert_eq!(body["state"], "stopped");

        let response = server.post(&format!("/streams/{}/stop", id)).await;
        assert_eq!(response.status_code(), StatusCode::CONFLICT);
        let body: Value = response.json();
        assert_eq!(body["error"], "not_running");

        let status: Value = server.get(&format!("/streams/{}/status", id)).await.json();
        assert_eq!(status["state"], "stopped");
    }

    #[tokio::test]
    async fn slow_stop_returns_accepted() {
        let dir = TempDir::new().unwrap();
        let state = test_state(dir.path(), |c| c.server.request_wait_ms = 100).await;
        let server = TestServer::new(router(state.clone())).unwrap();
        let id = create(&server, "trap '' TERM; while true; do sleep 1; done").await;
        let response = server.post(&format!("/streams/{}/start", id)).await;
        assert_eq!(response.status_code(), StatusCode::OK);

        let response = server.post(&format!("/streams/{}/stop", id)).await;
        assert_eq!(response.status_code(), StatusCode::ACCEPTED);
        let body: Value = response.json();
        assert_eq!(body["state"], "stopping");

        let mut stopped = false;
        for _ in 0..100 {
            let status: Value = server.get(&format!("/streams/{}/status", id)).await.json();
            if status["state"] == "stopped" {
                stopped = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(stopped);
    }

    #[tokio::test]
    async fn logs_are_limited_and_clearable() {
        let dir = TempDir::new().unwrap();
        let (server, state) = server(&dir).await;
        let id = create(&server, "exec sleep 30").await;
        for i in 0..5 {
            state
                .supervisor
                .logs()
                .append(&id, LogLevel::Info, format!("entry {}", i))
                .await;
        }

        let records: Value = server
            .get(&format!("/streams/{}/logs", id))
            .add_query_param("limit", 2)
            .await
            .json();
        let records = records.as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["message"], "entry 4");
        assert_eq!(records[0]["level"], "info");

        let response = server.delete(&format!("/streams/{}/logs", id)).await;
        assert_eq!(response.status_code(), StatusCode::NO_CONTENT);
        let records: Value = server.get(&format!("/streams/{}/logs", id)).await.json();
        assert!(records.as_array().unwrap().is_empty());

        let response = server.get("/streams/unknown/logs").await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn system_status_degrades_to_unavailable() {
        let dir = TempDir::new().unwrap();
        let (server, _) = server(&dir).await;
        let body: Value = server.get("/sys/status").await.json();
        assert_eq!(body["memory_total_kb"], "unavailable");
        assert_eq!(body["uptime_secs"], "unavailable");
    }
}
