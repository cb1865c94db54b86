use crate::metrics::SystemStats;
use crate::state::SharedState;
use axum::{extract::State, Json};

/// 提供内嵌的管理后台页面
pub async fn index_handler() -> axum::response::Html<&'static str> {
    axum::response::Html(include_str!("../../static/index.html"))
}

/// 获取系统状态 API
/// CPU / 内存 / 负载 / 磁盘 / 运行时长, 探测失败的项为 "unavailable"
pub async fn sys_status(State(state): State<SharedState>) -> Json<SystemStats> {
    Json(state.sampler.system_stats())
}

#[cfg(test)]
mod tests {
    use crate::web::{router, test_state};
    use axum_test::TestServer;
    use tempfile::TempDir;

    #[tokio::test]
    async fn dashboard_escapes_stream_fields() {
        let dir = TempDir::new().unwrap();
        let server = TestServer::new(router(test_state(dir.path(), |_| {}).await)).unwrap();
        let page = server.get("/").await.text();
        assert!(page.contains("${esc(s.name)}"));
        assert!(page.contains("${esc(s.category)}"));
        assert!(!page.contains(">${s.name}<"));
        assert!(!page.contains("${s.category || ''}"));
    }
}
