use crate::state::SharedState;
use crate::web::streams::stream_views;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// 按 `server.event_interval_ms` 推送全部流的状态快照
pub async fn events(
    State(state): State<SharedState>,
) -> Sse<ReceiverStream<Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(4);
    let period = Duration::from_millis(state.config.server.event_interval_ms);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let streams = match stream_views(&state, None).await {
                Ok(streams) => streams,
                Err(e) => {
                    warn!("Event snapshot failed: {:?}", e);
                    continue;
                }
            };
            let event = match Event::default()
                .event("streams")
                .json_data(serde_json::json!({ "streams": streams }))
            {
                Ok(event) => event,
                Err(e) => {
                    warn!("Event encoding failed: {}", e);
                    continue;
                }
            };
            // 客户端断开后结束推送
            if tx.send(Ok(event)).await.is_err() {
                debug!("Event subscriber disconnected");
                break;
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use crate::store::draft;
    use crate::web::{router, test_state};
    use axum_test::TestServer;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn pushes_stream_snapshots_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let state = test_state(dir.path(), |_| {}).await;
        let id = state.store.create(draft("cam", "exec sleep 30")).await.unwrap().id;
        let server = TestServer::new(router(state.clone())).unwrap();

        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            shutdown.cancel();
        });

        // 服务关闭后事件流结束, 响应体才能读完
        let response = tokio::time::timeout(Duration::from_secs(5), server.get("/events"))
            .await
            .expect("event stream did not end on shutdown");
        let body = response.text();
        assert!(body.contains("event: streams"));

        let first = body
            .lines()
            .find_map(|line| line.strip_prefix("data:"))
            .unwrap();
        let snapshot: Value = serde_json::from_str(first.trim()).unwrap();
        assert_eq!(snapshot["streams"][0]["id"], id.as_str());
        assert_eq!(snapshot["streams"][0]["status"]["state"], "stopped");
    }
}
