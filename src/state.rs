use crate::config::AppConfig;
use crate::metrics::MetricsSampler;
use crate::progress::ProgressBuffer;
use crate::store::JobStore;
use crate::supervisor::Supervisor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

/// 转码进程的生命周期阶段
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Stopped => "stopped",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
            RunState::Failed => "failed",
        }
    }
}

/// 运行中的转码进程, 仅由 Supervisor 持有
pub struct ProcessHandle {
    pub child: Child,
    pub pid: u32,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    /// 取消时输出读取任务退出
    pub cancel: CancellationToken,
    pub progress: ProgressBuffer,
}

/// 故障恢复状态
#[derive(Debug, Default)]
pub struct StreamRecoveryState {
    /// 连续崩溃次数
    pub crash_count: u32,
    /// 下次允许尝试重启的最早时间点
    pub next_retry_at: Option<Instant>,
    /// 达到最大重试次数后放弃, 直到人工启动
    pub given_up: bool,
}

/// 单个流的受保护数据, 只在短临界区内持锁
pub struct SlotInner {
    pub state: RunState,
    pub handle: Option<ProcessHandle>,
    pub recovery: StreamRecoveryState,
    pub last_error: Option<String>,
}

/// 每个流一个槽位: control 串行化 start/stop/restart, inner 保存当前状态
pub struct StreamSlot {
    /// 后台完成的控制操作会一直持有该锁
    pub control: Arc<tokio::sync::Mutex<()>>,
    pub inner: parking_lot::Mutex<SlotInner>,
}

impl StreamSlot {
    pub fn new() -> Self {
        Self {
            control: Arc::new(tokio::sync::Mutex::new(())),
            inner: parking_lot::Mutex::new(SlotInner {
                state: RunState::Stopped,
                handle: None,
                recovery: StreamRecoveryState::default(),
                last_error: None,
            }),
        }
    }
}

impl Default for StreamSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// 控制操作的结果: 在请求等待时间内完成, 或仍在后台进行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Done(RunState),
    /// 携带当前状态, 完成情况通过状态查询或事件流获得
    InProgress(RunState),
}

/// 对外展示的运行状态
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub state: RunState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
    pub crash_count: u32,
    pub retry_in_seconds: Option<u64>,
    pub last_error: Option<String>,
}

/// 采样所需的只读视图
pub struct ProcessView {
    pub state: RunState,
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    pub progress: Option<ProgressBuffer>,
}

/// 全局应用上下文
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn JobStore>,
    pub supervisor: Arc<Supervisor>,
    pub sampler: MetricsSampler,
    /// 服务退出时取消, 结束事件推送
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<AppState>;
