use crate::config::AppConfig;
use crate::engine::{Engine, StopOutcome};
use crate::error::{Result, SupervisorError};
use crate::logs::{LogLevel, LogSink};
use crate::metrics::PlatformProbe;
use crate::pidfile::{PidLedger, ProcessTable};
use crate::state::{
    ControlOutcome, ProcessView, RunState, SlotInner, StreamRecoveryState, StreamSlot,
    StreamStatus,
};
use crate::store::{JobStore, StreamDefinition};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 启动来源: 人工操作会清零崩溃计数, 自动恢复失败会进入退避
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    Operator,
    Recovery,
}

/// 进程监管者, 每个流至多持有一个存活的转码进程
pub struct Supervisor {
    config: Arc<AppConfig>,
    store: Arc<dyn JobStore>,
    logs: Arc<LogSink>,
    pids: PidLedger,
    probe: Arc<dyn PlatformProbe>,
    slots: Mutex<HashMap<String, Arc<StreamSlot>>>,
}

impl Supervisor {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn JobStore>,
        logs: Arc<LogSink>,
        probe: Arc<dyn PlatformProbe>,
    ) -> Self {
        let pids = PidLedger::new(config.run_dir());
        Self {
            config,
            store,
            logs,
            pids,
            probe,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn logs(&self) -> &Arc<LogSink> {
        &self.logs
    }

    fn slot(&self, id: &str) -> Arc<StreamSlot> {
        self.slots.lock().entry(id.to_string()).or_default().clone()
    }

    async fn definition(&self, id: &str) -> Result<StreamDefinition> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    /// 同一流同时只允许一个控制操作
    async fn acquire(&self, slot: &StreamSlot, id: &str) -> Result<OwnedMutexGuard<()>> {
        tokio::time::timeout(
            self.config.server.control_timeout(),
            slot.control.clone().lock_owned(),
        )
        .await
        .map_err(|_| SupervisorError::Busy(id.to_string()))
    }

    /// 在后台执行控制操作, 请求最多等待 `request_wait_ms`
    ///
    /// 操作持有 control 锁直到结束; 超时后返回当前状态, 结果记录在状态与日志中
    async fn finish_within<F>(&self, id: &str, slot: &StreamSlot, op: F) -> Result<ControlOutcome>
    where
        F: Future<Output = Result<RunState>> + Send + 'static,
    {
        let mut task = tokio::spawn(op);
        match tokio::time::timeout(self.config.server.request_wait(), &mut task).await {
            Ok(Ok(result)) => result.map(ControlOutcome::Done),
            Ok(Err(e)) => {
                error!("Stream [{}] control task aborted: {}", id, e);
                Ok(ControlOutcome::Done(slot.inner.lock().state))
            }
            Err(_) => {
                info!("Stream [{}] control operation continues in background", id);
                Ok(ControlOutcome::InProgress(slot.inner.lock().state))
            }
        }
    }

    /// 启动流
    ///
    /// # 错误处理
    /// - 流不存在时返回 NotFound
    /// - 进程存活时返回 AlreadyRunning
    /// - 进程无法创建或在启动窗口内退出时返回 LaunchFailure
    pub async fn start(&self, id: &str) -> Result<RunState> {
        self.definition(id).await?;
        let slot = self.slot(id);
        let _guard = self.acquire(&slot, id).await?;
        // 等锁期间定义可能已被修改或删除
        let def = self.definition(id).await?;

        self.launch_locked(&slot, &def, Cause::Operator).await?;
        self.store.set_active(id, true).await?;
        Ok(RunState::Running)
    }

    /// 停止流; 对已停止的流返回 NotRunning 且没有副作用
    pub async fn stop(self: &Arc<Self>, id: &str) -> Result<ControlOutcome> {
        self.definition(id).await?;
        let slot = self.slot(id);
        let guard = self.acquire(&slot, id).await?;

        let this = self.clone();
        let (task_slot, task_id) = (slot.clone(), id.to_string());
        self.finish_within(id, &slot, async move {
            let _guard = guard;
            this.stop_op(&task_slot, &task_id).await
        })
        .await
    }

    async fn stop_op(&self, slot: &StreamSlot, id: &str) -> Result<RunState> {
        match self.stop_locked(slot, id).await {
            Ok(()) => {}
            Err(SupervisorError::NotRunning(_)) => {
                // 失败并等待重试的流: 取消自动重启
                let cancelled = {
                    let mut inner = slot.inner.lock();
                    if inner.state == RunState::Failed {
                        inner.state = RunState::Stopped;
                        inner.recovery = StreamRecoveryState::default();
                        true
                    } else {
                        false
                    }
                };
                if !cancelled {
                    return Err(SupervisorError::NotRunning(id.to_string()));
                }
                self.logs
                    .append(id, LogLevel::Info, "Auto-restart cancelled by operator")
                    .await;
            }
            Err(e) => return Err(e),
        }

        self.store.set_active(id, false).await?;
        Ok(RunState::Stopped)
    }

    /// 先确认旧进程退出, 再启动新进程
    pub async fn restart(self: &Arc<Self>, id: &str) -> Result<ControlOutcome> {
        self.definition(id).await?;
        let slot = self.slot(id);
        let guard = self.acquire(&slot, id).await?;

        let this = self.clone();
        let (task_slot, task_id) = (slot.clone(), id.to_string());
        self.finish_within(id, &slot, async move {
            let _guard = guard;
            this.restart_op(&task_slot, &task_id).await
        })
        .await
    }

    async fn restart_op(&self, slot: &StreamSlot, id: &str) -> Result<RunState> {
        let def = self.definition(id).await?;
        match self.stop_locked(slot, id).await {
            Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.logs
            .append(id, LogLevel::Info, "Restarting transcoder")
            .await;

        self.launch_locked(slot, &def, Cause::Operator).await?;
        self.store.set_active(id, true).await?;
        Ok(RunState::Running)
    }

    /// 删除流: 先停止进程, 再清理日志和记录
    pub async fn delete(self: &Arc<Self>, id: &str) -> Result<ControlOutcome> {
        self.definition(id).await?;
        let slot = self.slot(id);
        let guard = self.acquire(&slot, id).await?;

        let this = self.clone();
        let (task_slot, task_id) = (slot.clone(), id.to_string());
        self.finish_within(id, &slot, async move {
            let _guard = guard;
            this.delete_op(&task_slot, &task_id).await
        })
        .await
    }

    async fn delete_op(&self, slot: &StreamSlot, id: &str) -> Result<RunState> {
        match self.stop_locked(slot, id).await {
            Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }

        if !self.store.delete(id).await? {
            return Err(SupervisorError::NotFound(id.to_string()));
        }
        if let Err(e) = self.logs.remove(id).await {
            warn!("Stream [{}] failed to remove log file: {}", id, e);
        }
        if let Err(e) = self.pids.clear(id).await {
            warn!("Stream [{}] failed to clear pid file: {}", id, e);
        }
        self.slots.lock().remove(id);

        info!("Stream [{}] deleted.", id);
        Ok(RunState::Stopped)
    }

    pub async fn status(&self, id: &str) -> Result<StreamStatus> {
        self.definition(id).await?;
        Ok(self.snapshot(id))
    }

    /// 不检查流是否存在, 没有槽位时视为已停止
    pub fn snapshot(&self, id: &str) -> StreamStatus {
        let slot = self.slots.lock().get(id).cloned();
        let Some(slot) = slot else {
            return StreamStatus {
                state: RunState::Stopped,
                pid: None,
                started_at: None,
                uptime_seconds: 0,
                crash_count: 0,
                retry_in_seconds: None,
                last_error: None,
            };
        };

        let inner = slot.inner.lock();
        let now = Instant::now();
        let handle = inner.handle.as_ref();
        StreamStatus {
            state: inner.state,
            pid: handle.map(|h| h.pid),
            started_at: handle.map(|h| h.started_wall),
            uptime_seconds: handle
                .map(|h| now.duration_since(h.started_at).as_secs())
                .unwrap_or(0),
            crash_count: inner.recovery.crash_count,
            retry_in_seconds: inner
                .recovery
                .next_retry_at
                .map(|t| t.saturating_duration_since(now).as_secs()),
            last_error: inner.last_error.clone(),
        }
    }

    pub async fn process_view(&self, id: &str) -> Result<ProcessView> {
        self.definition(id).await?;
        let slot = self.slots.lock().get(id).cloned();
        let view = match slot {
            Some(slot) => {
                let inner = slot.inner.lock();
                let handle = inner.handle.as_ref();
                ProcessView {
                    state: inner.state,
                    pid: handle.map(|h| h.pid),
                    started_at: handle.map(|h| h.started_at),
                    progress: handle.map(|h| h.progress.clone()),
                }
            }
            None => ProcessView {
                state: RunState::Stopped,
                pid: None,
                started_at: None,
                progress: None,
            },
        };
        Ok(view)
    }

    /// 需持有 control 锁
    async fn launch_locked(
        &self,
        slot: &StreamSlot,
        def: &StreamDefinition,
        cause: Cause,
    ) -> Result<()> {
        {
            let mut inner = slot.inner.lock();
            if let Some(handle) = inner.handle.as_mut() {
                match handle.child.try_wait() {
                    Ok(None) => return Err(SupervisorError::AlreadyRunning(def.id.clone())),
                    Ok(Some(status)) => {
                        info!("Stream [{}] previous process already exited: {}", def.id, status);
                        inner.handle = None;
                    }
                    Err(e) => {
                        warn!("Stream [{}] liveness check failed: {}", def.id, e);
                        return Err(SupervisorError::AlreadyRunning(def.id.clone()));
                    }
                }
            }
            if cause == Cause::Operator {
                inner.recovery = StreamRecoveryState::default();
            }
            inner.state = RunState::Starting;
        }

        // 可用内存过低时拒绝启动
        let min_free = self.config.transcoder.min_free_memory_kb;
        if min_free > 0 {
            if let Some(avail) = self.probe.system_stats().memory_available_kb {
                if avail < min_free {
                    let err = SupervisorError::launch(
                        &def.id,
                        format!("insufficient system memory ({} KB available)", avail),
                    );
                    self.record_failure(slot, &def.id, &err, cause).await;
                    return Err(err);
                }
            }
        }

        let mut handle = match Engine::launch(
            &self.config.transcoder,
            def,
            self.logs.clone(),
            self.config.metrics.progress_lines,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                self.record_failure(slot, &def.id, &err, cause).await;
                return Err(err);
            }
        };

        // 在启动窗口内退出视为启动失败
        tokio::time::sleep(self.config.transcoder.startup_probe()).await;
        if let Ok(Some(status)) = handle.child.try_wait() {
            let err = SupervisorError::launch(
                &def.id,
                format!("transcoder exited during startup ({})", status),
            );
            self.record_failure(slot, &def.id, &err, cause).await;
            return Err(err);
        }

        let pid = handle.pid;
        if let Err(e) = self.pids.record(&def.id, pid).await {
            warn!("Stream [{}] failed to record pid {}: {}", def.id, pid, e);
        }
        {
            let mut inner = slot.inner.lock();
            inner.state = RunState::Running;
            inner.last_error = None;
            inner.handle = Some(handle);
        }

        info!("Stream [{}] running with pid {}", def.id, pid);
        self.logs
            .append(
                &def.id,
                LogLevel::Success,
                format!("Transcoder started (pid {})", pid),
            )
            .await;
        Ok(())
    }

    async fn record_failure(
        &self,
        slot: &StreamSlot,
        id: &str,
        err: &SupervisorError,
        cause: Cause,
    ) {
        let retry = {
            let mut inner = slot.inner.lock();
            inner.state = RunState::Failed;
            inner.last_error = Some(err.to_string());
            match cause {
                Cause::Recovery => Some(self.schedule_retry(&mut inner)),
                Cause::Operator => None,
            }
        };
        self.logs.append(id, LogLevel::Error, err.to_string()).await;
        if let Some(retry) = retry {
            self.log_retry(id, retry).await;
        }
    }

    /// 计算回退时间 (指数退避); 超过最大重试次数时返回 None 并放弃
    fn schedule_retry(&self, inner: &mut SlotInner) -> Option<(u32, Duration)> {
        let policy = &self.config.retry;
        if policy.exhausted(inner.recovery.crash_count) {
            inner.recovery.given_up = true;
            inner.recovery.next_retry_at = None;
            return None;
        }
        let backoff = policy.backoff(inner.recovery.crash_count);
        inner.recovery.crash_count += 1;
        inner.recovery.next_retry_at = Some(Instant::now() + backoff);
        Some((inner.recovery.crash_count, backoff))
    }

    async fn log_retry(&self, id: &str, retry: Option<(u32, Duration)>) {
        let max = self.config.retry.max_attempts;
        match retry {
            Some((attempt, backoff)) => {
                warn!(
                    "Stream [{}] crashed. Retry {}/{}. Backing off for {}s.",
                    id,
                    attempt,
                    max,
                    backoff.as_secs()
                );
                self.logs
                    .append(
                        id,
                        LogLevel::Warning,
                        format!(
                            "Retry {}/{} scheduled in {}s",
                            attempt,
                            max,
                            backoff.as_secs()
                        ),
                    )
                    .await;
            }
            None => {
                error!(
                    "Stream [{}] reached max retry attempts ({}). Giving up.",
                    id, max
                );
                self.logs
                    .append(
                        id,
                        LogLevel::Error,
                        format!("Giving up after {} restart attempts", max),
                    )
                    .await;
            }
        }
    }

    /// 需持有 control 锁; 确认进程退出后才返回
    async fn stop_locked(&self, slot: &StreamSlot, id: &str) -> Result<()> {
        let handle = {
            let mut inner = slot.inner.lock();
            match inner.handle.take() {
                Some(handle) => {
                    inner.state = RunState::Stopping;
                    handle
                }
                None => return Err(SupervisorError::NotRunning(id.to_string())),
            }
        };
        let pid = handle.pid;

        match Engine::terminate(id, handle, &self.config.transcoder).await {
            Ok(outcome) => {
                if let Err(e) = self.pids.clear(id).await {
                    warn!("Stream [{}] failed to clear pid file: {}", id, e);
                }
                {
                    let mut inner = slot.inner.lock();
                    inner.state = RunState::Stopped;
                    inner.last_error = None;
                    inner.recovery.next_retry_at = None;
                }
                let (level, message) = match outcome {
                    StopOutcome::AlreadyExited(status) => (
                        LogLevel::Warning,
                        format!("Transcoder pid {} had already exited ({})", pid, status),
                    ),
                    StopOutcome::Graceful(status) => (
                        LogLevel::Info,
                        format!("Transcoder pid {} stopped ({})", pid, status),
                    ),
                    StopOutcome::Forced => (
                        LogLevel::Warning,
                        format!(
                            "Transcoder pid {} ignored termination for {}ms and was killed",
                            pid, self.config.transcoder.stop_timeout_ms
                        ),
                    ),
                };
                info!("Stream [{}] stopped.", id);
                self.logs.append(id, level, message).await;
                Ok(())
            }
            Err(err) => {
                {
                    let mut inner = slot.inner.lock();
                    inner.state = RunState::Failed;
                    inner.last_error = Some(err.to_string());
                }
                self.logs.append(id, LogLevel::Error, err.to_string()).await;
                Err(err)
            }
        }
    }

    /// 后台监控: 定期检查进程存活, 对崩溃的活跃流做退避重启
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_millis(
            self.config.server.supervisor_interval_ms,
        ));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick().await;
        }
    }

    pub async fn tick(&self) {
        let slots: Vec<(String, Arc<StreamSlot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        // --- 阶段 1: 检查进程状态 ---
        for (id, slot) in &slots {
            // 正在执行控制操作的流跳过
            let Ok(_guard) = slot.control.try_lock() else {
                continue;
            };
            self.check_slot(id, slot).await;
        }

        // --- 阶段 2: 重启到期的活跃流 ---
        let streams = match self.store.list().await {
            Ok(streams) => streams,
            Err(e) => {
                error!("Supervisor failed to list streams: {}", e);
                return;
            }
        };
        let now = Instant::now();
        for def in streams.iter().filter(|d| d.active) {
            // 只处理已有槽位的流, 避免为刚删除的流重建槽位
            let Some(slot) = self.slots.lock().get(&def.id).cloned() else {
                continue;
            };
            let Ok(_guard) = slot.control.try_lock() else {
                continue;
            };
            let attempt = {
                let inner = slot.inner.lock();
                let due = inner.handle.is_none()
                    && inner.state == RunState::Failed
                    && !inner.recovery.given_up
                    && inner.recovery.next_retry_at.is_some_and(|t| now >= t);
                due.then_some(inner.recovery.crash_count)
            };
            let Some(attempt) = attempt else {
                continue;
            };

            info!("Supervisor: Attempting to restart stream [{}]", def.id);
            self.logs
                .append(
                    &def.id,
                    LogLevel::Warning,
                    format!("Auto-restart attempt {}", attempt),
                )
                .await;
            if let Err(e) = self.launch_locked(&slot, def, Cause::Recovery).await {
                error!("Restart failed [{}]: {}", def.id, e);
            }
        }
    }

    async fn check_slot(&self, id: &str, slot: &StreamSlot) {
        let stable_after = Duration::from_secs(self.config.retry.stable_after_sec);
        let mut stabilised = false;

        let crashed = {
            let mut inner = slot.inner.lock();
            let exited = match inner.handle.as_mut().map(|h| h.child.try_wait()) {
                Some(Ok(Some(status))) => Some(status),
                Some(Ok(None)) => {
                    let running_for = inner
                        .handle
                        .as_ref()
                        .map(|h| h.started_at.elapsed())
                        .unwrap_or_default();
                    if inner.recovery.crash_count > 0 && running_for >= stable_after {
                        inner.recovery = StreamRecoveryState::default();
                        stabilised = true;
                    }
                    None
                }
                Some(Err(e)) => {
                    error!("Process monitor error [{}]: {}", id, e);
                    None
                }
                None => None,
            };

            exited.map(|status| {
                inner.handle = None;
                inner.state = RunState::Failed;
                inner.last_error = Some(format!("transcoder exited unexpectedly ({})", status));
                (status, self.schedule_retry(&mut inner))
            })
        };

        if stabilised {
            info!("Stream [{}] stable, crash counter reset", id);
        }
        let Some((status, retry)) = crashed else {
            return;
        };

        warn!("Stream [{}] exited unexpectedly with: {}", id, status);
        if let Err(e) = self.pids.clear(id).await {
            warn!("Stream [{}] failed to clear pid file: {}", id, e);
        }
        self.logs
            .append(
                id,
                LogLevel::Error,
                format!("Transcoder exited unexpectedly ({})", status),
            )
            .await;
        self.log_retry(id, retry).await;
    }

    /// 启动对账: 检查上次运行记录的每个 PID, 终止遗留的转码进程, 再启动标记为 active 的流
    pub async fn reconcile(&self) -> Result<()> {
        let entries = match self.pids.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read pid ledger: {}", e);
                Vec::new()
            }
        };

        // 遗留进程无法终止的流不重新启动, 避免同一输出有两个推流进程
        let mut blocked = HashSet::new();
        for (id, pid) in entries {
            if ProcessTable::is_alive(pid) {
                if self.owns_process(pid) {
                    warn!(
                        "Stream [{}] found orphaned transcoder pid {} from a previous run, terminating",
                        id, pid
                    );
                    match self.terminate_orphan(pid).await {
                        Some(forced) => {
                            self.logs
                                .append(
                                    &id,
                                    LogLevel::Warning,
                                    format!(
                                        "Terminated orphaned transcoder pid {} from a previous run{}",
                                        pid,
                                        if forced { " (forced)" } else { "" }
                                    ),
                                )
                                .await;
                        }
                        None => {
                            error!("Stream [{}] orphaned pid {} survived termination", id, pid);
                            self.logs
                                .append(
                                    &id,
                                    LogLevel::Error,
                                    format!(
                                        "Orphaned transcoder pid {} could not be terminated, not resuming",
                                        pid
                                    ),
                                )
                                .await;
                            blocked.insert(id);
                            continue;
                        }
                    }
                } else {
                    info!(
                        "Stream [{}] pid {} now belongs to another program, leaving it",
                        id, pid
                    );
                }
            }
            if let Err(e) = self.pids.clear(&id).await {
                warn!("Stream [{}] failed to clear pid file: {}", id, e);
            }
        }

        for def in self.store.list().await?.into_iter().filter(|d| d.active) {
            if blocked.contains(&def.id) {
                continue;
            }
            info!("Stream [{}] was active before shutdown, starting", def.id);
            let slot = self.slot(&def.id);
            let _guard = slot.control.lock().await;
            if let Err(e) = self.launch_locked(&slot, &def, Cause::Recovery).await {
                warn!("Stream [{}] could not be resumed: {}", def.id, e);
            }
        }
        Ok(())
    }

    /// PID 可能已被复用, 只认可与配置的转码器同名的可执行文件
    fn owns_process(&self, pid: u32) -> bool {
        let Some(exe) = ProcessTable::executable(pid) else {
            return false;
        };
        let expected = Path::new(&self.config.transcoder.binary).file_name();
        expected.is_some() && exe.file_name() == expected
    }

    /// 确认退出后返回是否使用了强制终止; 强制终止后仍存活时返回 None
    async fn terminate_orphan(&self, pid: u32) -> Option<bool> {
        ProcessTable::signal(pid, false);
        if Self::wait_exit(pid, self.config.transcoder.stop_timeout()).await {
            return Some(false);
        }
        ProcessTable::signal(pid, true);
        Self::wait_exit(pid, self.config.transcoder.kill_timeout())
            .await
            .then_some(true)
    }

    async fn wait_exit(pid: u32, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !ProcessTable::is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// 服务退出时停止所有进程, 保留 active 标记以便下次启动时恢复
    pub async fn shutdown(&self) {
        let slots: Vec<(String, Arc<StreamSlot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        for (id, slot) in slots {
            let Ok(_guard) = self.acquire(&slot, &id).await else {
                warn!("Stream [{}] busy during shutdown, skipping", id);
                continue;
            };
            match self.stop_locked(&slot, &id).await {
                Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
                Err(e) => error!("Stream [{}] failed to stop during shutdown: {}", id, e),
            }
        }
    }
}
