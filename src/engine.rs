use crate::config::TranscoderConfig;
use crate::error::{Result, SupervisorError};
use crate::logs::{LogLevel, LogSink};
use crate::pidfile::ProcessTable;
use crate::progress::{is_progress_line, ProgressBuffer};
use crate::state::ProcessHandle;
use crate::store::StreamDefinition;
use chrono::Utc;
use serde::Serialize;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Engine;

/// 解析模板后的完整命令行
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// 停止结果
#[derive(Debug)]
pub enum StopOutcome {
    /// 收到停止请求前进程已退出
    AlreadyExited(ExitStatus),
    /// 在优雅退出窗口内退出
    Graceful(ExitStatus),
    /// 超时后被强制终止
    Forced,
}

#[derive(Clone, Copy)]
enum OutputSource {
    Stdout,
    Stderr,
}

impl Engine {
    /// 用流定义替换参数模板中的占位符
    pub fn command_line(cfg: &TranscoderConfig, def: &StreamDefinition) -> ResolvedCommand {
        let output = def.output_uri();
        let bitrate = if def.bitrate.is_empty() {
            &cfg.default_bitrate
        } else {
            &def.bitrate
        };
        let resolution = if def.resolution.is_empty() {
            &cfg.default_resolution
        } else {
            &def.resolution
        };

        let args = cfg
            .args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &def.input)
                    .replace("{output}", &output)
                    .replace("{bitrate}", bitrate)
                    .replace("{resolution}", resolution)
                    .replace("{id}", &def.id)
                    .replace("{name}", &def.name)
            })
            .collect();

        ResolvedCommand {
            program: cfg.binary.clone(),
            args,
        }
    }

    /// 启动转码进程
    ///
    /// # 副作用
    /// - 启动子进程, stdout/stderr 由后台任务读取
    /// - 进度行写入环形缓冲, 其它输出写入流日志
    ///
    /// # 错误处理
    /// - 系统无法创建进程时返回 LaunchFailure
    pub fn launch(
        cfg: &TranscoderConfig,
        def: &StreamDefinition,
        logs: Arc<LogSink>,
        progress_lines: usize,
    ) -> Result<ProcessHandle> {
        let resolved = Self::command_line(cfg, def);

        let mut cmd = Command::new(&resolved.program);
        cmd.args(&resolved.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Stream [{}] failed to spawn {}: {}", def.id, resolved.program, e);
            SupervisorError::launch(&def.id, e)
        })?;

        let pid = child.id().ok_or_else(|| {
            SupervisorError::launch(&def.id, "process exited before it was assigned a pid")
        })?;

        info!("Stream [{}] transcoder spawned with pid {}", def.id, pid);

        let cancel = CancellationToken::new();
        let progress = ProgressBuffer::new(progress_lines);
        Self::attach_output(&def.id, &mut child, &logs, &progress, &cancel);

        Ok(ProcessHandle {
            child,
            pid,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            cancel,
            progress,
        })
    }

    fn attach_output(
        id: &str,
        child: &mut Child,
        logs: &Arc<LogSink>,
        progress: &ProgressBuffer,
        cancel: &CancellationToken,
    ) {
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(
                id.to_string(),
                stdout,
                OutputSource::Stdout,
                logs.clone(),
                progress.clone(),
                cancel.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(
                id.to_string(),
                stderr,
                OutputSource::Stderr,
                logs.clone(),
                progress.clone(),
                cancel.clone(),
            ));
        }
    }

    /// 先发送终止信号, 超时后强制终止; 确认退出后才返回
    ///
    /// # 错误处理
    /// - 强制终止后仍未回收时返回 TerminationTimeout
    pub async fn terminate(
        id: &str,
        handle: ProcessHandle,
        cfg: &TranscoderConfig,
    ) -> Result<StopOutcome> {
        let ProcessHandle {
            mut child,
            pid,
            cancel,
            ..
        } = handle;
        // 输出读取任务随进程一起结束
        let _cancel_on_return = cancel.drop_guard();

        if let Ok(Some(status)) = child.try_wait() {
            return Ok(StopOutcome::AlreadyExited(status));
        }

        request_termination(&mut child, pid);

        match timeout(cfg.stop_timeout(), child.wait()).await {
            Ok(Ok(status)) => return Ok(StopOutcome::Graceful(status)),
            Ok(Err(e)) => warn!("Stream [{}] wait on pid {} failed: {}", id, pid, e),
            Err(_) => warn!(
                "Stream [{}] pid {} still alive after {:?}, forcing termination",
                id,
                pid,
                cfg.stop_timeout()
            ),
        }

        if let Err(e) = child.start_kill() {
            warn!("Stream [{}] force kill of pid {} failed: {}", id, pid, e);
        }
        match timeout(cfg.kill_timeout(), child.wait()).await {
            Ok(Ok(_)) => Ok(StopOutcome::Forced),
            _ => {
                error!("Stream [{}] pid {} survived forced termination", id, pid);
                Err(SupervisorError::TerminationTimeout {
                    id: id.to_string(),
                    pid,
                })
            }
        }
    }
}

fn request_termination(child: &mut Child, pid: u32) {
    if !ProcessTable::signal(pid, false) {
        let _ = child.start_kill();
    }
}

/// 单行输出的最大字节数, 超出部分按新行处理
const MAX_LINE_BYTES: usize = 4096;

/// 按 `\n` 或 `\r` 切分原始输出; 非 UTF-8 字节按替换字符解码
#[derive(Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' || byte == b'\r' {
                self.flush_into(&mut lines);
                continue;
            }
            self.pending.push(byte);
            if self.pending.len() >= MAX_LINE_BYTES {
                self.flush_into(&mut lines);
            }
        }
        lines
    }

    fn finish(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        self.flush_into(&mut lines);
        lines
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if !line.is_empty() {
            lines.push(line);
        }
    }
}

async fn pump_output<R>(
    id: String,
    mut reader: R,
    source: OutputSource,
    logs: Arc<LogSink>,
    progress: ProgressBuffer,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::default();
    let mut buf = [0u8; 8192];
    // 持续读到 EOF, 否则转码器写入时会收到 SIGPIPE
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        let eof = matches!(read, Ok(0));
        let lines = match read {
            Ok(0) => splitter.finish(),
            Ok(n) => splitter.feed(&buf[..n]),
            Err(e) => {
                debug!("Stream [{}] output reader stopped: {}", id, e);
                break;
            }
        };
        for line in lines {
            if is_progress_line(&line) {
                progress.push(&line);
                continue;
            }
            let level = match source {
                OutputSource::Stdout => LogLevel::Info,
                OutputSource::Stderr => LogLevel::classify(&line),
            };
            logs.append(&id, level, line).await;
        }
        if eof {
            break;
        }
    }
}
