pub mod admin;
pub mod error;
pub mod events;
pub mod streams;

use crate::state::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

/// 注册 HTTP 路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(admin::index_handler)) // 首页
        .route("/sys/status", get(admin::sys_status)) // 系统状态
        .route(
            "/streams",
            get(streams::list_streams).post(streams::create_stream),
        )
        .route(
            "/streams/:id",
            get(streams::get_stream)
                .put(streams::update_stream)
                .delete(streams::delete_stream),
        )
        .route("/streams/:id/start", post(streams::handle_start))
        .route("/streams/:id/stop", post(streams::handle_stop))
        .route("/streams/:id/restart", post(streams::handle_restart))
        .route("/streams/:id/status", get(streams::stream_status))
        .route("/streams/:id/metrics", get(streams::stream_metrics))
        .route(
            "/streams/:id/logs",
            get(streams::stream_logs).delete(streams::clear_logs),
        )
        .route("/streams/:id/command", get(streams::stream_command))
        .route("/events", get(events::events)) // 状态推送
        .with_state(state)
}

#[cfg(test)]
pub(crate) async fn test_state(
    dir: &std::path::Path,
    edit: impl FnOnce(&mut crate::config::AppConfig),
) -> SharedState {
    use crate::config::{test_config, ProbeKind};
    use crate::logs::LogSink;
    use crate::metrics::{probe_for, MetricsSampler};
    use crate::state::AppState;
    use crate::store::{JobStore, JsonFileStore};
    use crate::supervisor::Supervisor;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    let mut config = test_config(dir);
    config.metrics.probe = ProbeKind::None;
    edit(&mut config);
    let config = Arc::new(config);
    let store: Arc<dyn JobStore> =
        Arc::new(JsonFileStore::open(config.streams_file()).await.unwrap());
    let logs = Arc::new(LogSink::new(config.logs_dir(), 0));
    let probe = probe_for(config.metrics.probe);
    let supervisor = Arc::new(Supervisor::new(
        config.clone(),
        store.clone(),
        logs,
        probe.clone(),
    ));
    Arc::new(AppState {
        config,
        store,
        supervisor: supervisor.clone(),
        sampler: MetricsSampler::new(supervisor, probe),
        shutdown: CancellationToken::new(),
    })
}
