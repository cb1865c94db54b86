use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
    /// 故障重试策略
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub logs: LogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,

    /// 数据目录: streams.json, logs/, run/
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_supervisor_interval")]
    pub supervisor_interval_ms: u64,

    /// 单个流控制锁的最长等待时间
    #[serde(default = "default_control_timeout")]
    pub control_timeout_ms: u64,

    /// stop / restart / delete 在请求内等待完成的最长时间, 超时后转入后台
    #[serde(default = "default_request_wait")]
    pub request_wait_ms: u64,

    /// `/events` 推送间隔, 也是前端轮询的建议间隔
    #[serde(default = "default_event_interval")]
    pub event_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranscoderConfig {
    #[serde(default = "default_binary")]
    pub binary: String,

    /// 参数模板, 支持 {input} {output} {bitrate} {resolution} {id} {name}
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    #[serde(default = "default_bitrate")]
    pub default_bitrate: String,
    #[serde(default = "default_resolution")]
    pub default_resolution: String,

    /// SIGTERM 之后等待退出的时间
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    /// 强制终止之后等待回收的时间
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_ms: u64,
    /// 启动确认窗口
    #[serde(default = "default_startup_probe")]
    pub startup_probe_ms: u64,
    /// 可用内存低于该值 (KB) 时拒绝启动
    #[serde(default = "default_min_free_memory")]
    pub min_free_memory_kb: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数 (0 表示无限重试)
    pub max_attempts: u32,
    /// 初始退避时间 (秒)
    pub initial_backoff_sec: u64,
    /// 最大退避时间 (秒)
    pub max_backoff_sec: u64,
    /// 稳定运行多久后清零崩溃计数 (秒)
    #[serde(default = "default_stable_after")]
    pub stable_after_sec: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_limit")]
    pub default_limit: usize,
    #[serde(default = "default_log_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_log_max_bytes")]
    pub max_file_bytes: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Sysinfo,
    None,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_probe")]
    pub probe: ProbeKind,
    /// 每个进程保留的最近进度行数
    #[serde(default = "default_progress_lines")]
    pub progress_lines: usize,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: default_args(),
            default_bitrate: default_bitrate(),
            default_resolution: default_resolution(),
            stop_timeout_ms: default_stop_timeout(),
            kill_timeout_ms: default_kill_timeout(),
            startup_probe_ms: default_startup_probe(),
            min_free_memory_kb: default_min_free_memory(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_sec: 2,
            max_backoff_sec: 60,
            stable_after_sec: default_stable_after(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_limit: default_log_limit(),
            max_limit: default_log_max_limit(),
            max_file_bytes: default_log_max_bytes(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            probe: default_probe(),
            progress_lines: default_progress_lines(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_supervisor_interval() -> u64 {
    1000
}

fn default_control_timeout() -> u64 {
    2000
}

fn default_request_wait() -> u64 {
    2000
}

fn default_event_interval() -> u64 {
    2000
}

fn default_binary() -> String {
    "ffmpeg".to_string()
}

fn default_args() -> Vec<String> {
    [
        "-hide_banner",
        "-nostats",
        "-loglevel",
        "warning",
        "-progress",
        "pipe:1",
        "-i",
        "{input}",
        "-c:v",
        "libx264",
        "-preset",
        "veryfast",
        "-b:v",
        "{bitrate}",
        "-s",
        "{resolution}",
        "-c:a",
        "aac",
        "-f",
        "flv",
        "{output}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_bitrate() -> String {
    "2500k".to_string()
}

fn default_resolution() -> String {
    "1280x720".to_string()
}

fn default_stop_timeout() -> u64 {
    5000
}

fn default_kill_timeout() -> u64 {
    2000
}

fn default_startup_probe() -> u64 {
    300
}

fn default_min_free_memory() -> u64 {
    5120
}

fn default_stable_after() -> u64 {
    60
}

fn default_log_limit() -> usize {
    100
}

fn default_log_max_limit() -> usize {
    1000
}

fn default_log_max_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_probe() -> ProbeKind {
    ProbeKind::Sysinfo
}

fn default_progress_lines() -> usize {
    64
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transcoder.binary.trim().is_empty() {
            anyhow::bail!("transcoder.binary must not be empty");
        }
        for placeholder in ["{input}", "{output}"] {
            if !self.transcoder.args.iter().any(|a| a.contains(placeholder)) {
                anyhow::bail!("transcoder.args must reference {}", placeholder);
            }
        }
        if self.server.supervisor_interval_ms == 0 || self.server.event_interval_ms == 0 {
            anyhow::bail!("server intervals must be greater than zero");
        }
        if self.metrics.progress_lines == 0 {
            anyhow::bail!("metrics.progress_lines must be greater than zero");
        }
        Ok(())
    }

    pub fn streams_file(&self) -> PathBuf {
        self.server.data_dir.join("streams.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.server.data_dir.join("logs")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.server.data_dir.join("run")
    }
}

impl ServerConfig {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn request_wait(&self) -> Duration {
        Duration::from_millis(self.request_wait_ms)
    }
}

impl TranscoderConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn startup_probe(&self) -> Duration {
        Duration::from_millis(self.startup_probe_ms)
    }
}

impl RetryPolicy {
    /// 指数退避: min(max_backoff, initial * 2^crash_count)
    pub fn backoff(&self, crash_count: u32) -> Duration {
        let factor = 2u64.checked_pow(crash_count).unwrap_or(u64::MAX);
        let secs = std::cmp::min(
            self.max_backoff_sec,
            self.initial_backoff_sec.saturating_mul(factor),
        );
        Duration::from_secs(secs)
    }

    pub fn exhausted(&self, crash_count: u32) -> bool {
        self.max_attempts > 0 && crash_count >= self.max_attempts
    }
}

#[cfg(test)]
pub(crate) fn test_config(data_dir: &Path) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            data_dir: data_dir.to_path_buf(),
            supervisor_interval_ms: 50,
            control_timeout_ms: 5000,
            request_wait_ms: 5000,
            event_interval_ms: 100,
        },
        transcoder: TranscoderConfig {
            binary: "sh".to_string(),
            args: vec!["-c".to_string(), "{input}".to_string(), "{output}".to_string()],
            stop_timeout_ms: 1000,
            kill_timeout_ms: 1000,
            startup_probe_ms: 50,
            min_free_memory_kb: 0,
            ..TranscoderConfig::default()
        },
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_sec: 0,
            max_backoff_sec: 0,
            stable_after_sec: 60,
        },
        logs: LogConfig::default(),
        metrics: MetricsConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml_with_defaults() {
        let config: AppConfig = serde_yaml::from_str("server:\n  listen: 0.0.0.0:8080\n").unwrap();
        config.validate().unwrap();
        assert_eq!(config.transcoder.binary, "ffmpeg");
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.metrics.probe, ProbeKind::Sysinfo);
        assert_eq!(config.streams_file(), PathBuf::from("./data/streams.json"));
    }

    #[test]
    fn rejects_template_without_output() {
        let yaml = "server:\n  listen: 0.0.0.0:8080\ntranscoder:\n  args: [\"-i\", \"{input}\"]\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(16));
        assert_eq!(policy.backoff(10), Duration::from_secs(60));
        assert_eq!(policy.backoff(200), Duration::from_secs(60));
        assert!(policy.exhausted(10));
        assert!(!RetryPolicy { max_attempts: 0, ..policy }.exhausted(1000));
    }
}
