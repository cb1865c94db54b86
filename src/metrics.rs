use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

use crate::config::ProbeKind;
use crate::error::Result;
use crate::progress::{parse_progress, EncoderProgress};
use crate::state::RunState;
use crate::supervisor::Supervisor;

/// 缺失的指标统一输出为 "unavailable"
pub fn unavailable<S, T>(value: &Option<T>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize,
{
    match value {
        Some(v) => v.serialize(serializer),
        None => serializer.serialize_str("unavailable"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemStats {
    #[serde(serialize_with = "unavailable")]
    pub cpu_percent: Option<f32>,
    #[serde(serialize_with = "unavailable")]
    pub memory_total_kb: Option<u64>,
    #[serde(serialize_with = "unavailable")]
    pub memory_available_kb: Option<u64>,
    #[serde(serialize_with = "unavailable")]
    pub load_average: Option<[f64; 3]>,
    #[serde(serialize_with = "unavailable")]
    pub disk_total_kb: Option<u64>,
    #[serde(serialize_with = "unavailable")]
    pub disk_free_kb: Option<u64>,
    #[serde(serialize_with = "unavailable")]
    pub uptime_secs: Option<u64>,
}

/// 操作系统探针, 所有失败都退化为 None
pub trait PlatformProbe: Send + Sync {
    /// 进程不存在时返回 None
    fn process_usage(&self, pid: u32) -> Option<ProcessUsage>;
    fn system_stats(&self) -> SystemStats;
}

pub fn probe_for(kind: ProbeKind) -> Arc<dyn PlatformProbe> {
    match kind {
        ProbeKind::Sysinfo => Arc::new(SysinfoProbe::new()),
        ProbeKind::None => Arc::new(NullProbe),
    }
}

/// 进程表 / CPU / 运行时长来自 sysinfo, 内存 / 负载 / 磁盘来自 sys-info
pub struct SysinfoProbe {
    sys: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformProbe for SysinfoProbe {
    fn process_usage(&self, pid: u32) -> Option<ProcessUsage> {
        let pid = Pid::from_u32(pid);
        let mut sys = self.sys.lock();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid).map(|p| ProcessUsage {
            cpu_percent: p.cpu_usage(),
            memory_bytes: p.memory(),
        })
    }

    fn system_stats(&self) -> SystemStats {
        let cpu_percent = {
            let mut sys = self.sys.lock();
            sys.refresh_cpu_all();
            Some(sys.global_cpu_usage())
        };

        let (memory_total_kb, memory_available_kb) = match sys_info::mem_info() {
            Ok(mem) => (Some(mem.total), Some(mem.avail)),
            Err(e) => {
                debug!("mem_info unavailable: {}", e);
                (None, None)
            }
        };
        let load_average = sys_info::loadavg()
            .map(|l| [l.one, l.five, l.fifteen])
            .map_err(|e| debug!("loadavg unavailable: {}", e))
            .ok();
        let (disk_total_kb, disk_free_kb) = match sys_info::disk_info() {
            Ok(disk) => (Some(disk.total), Some(disk.free)),
            Err(e) => {
                debug!("disk_info unavailable: {}", e);
                (None, None)
            }
        };
        let uptime = System::uptime();

        SystemStats {
            cpu_percent,
            memory_total_kb,
            memory_available_kb,
            load_average,
            disk_total_kb,
            disk_free_kb,
            uptime_secs: (uptime > 0).then_some(uptime),
        }
    }
}

/// 不支持或禁用系统探测时使用
pub struct NullProbe;

impl PlatformProbe for NullProbe {
    fn process_usage(&self, _pid: u32) -> Option<ProcessUsage> {
        None
    }

    fn system_stats(&self) -> SystemStats {
        SystemStats::default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamMetrics {
    pub id: String,
    pub state: RunState,
    #[serde(serialize_with = "unavailable")]
    pub pid: Option<u32>,
    #[serde(serialize_with = "unavailable")]
    pub cpu_percent: Option<f32>,
    #[serde(serialize_with = "unavailable")]
    pub memory_bytes: Option<u64>,
    #[serde(serialize_with = "unavailable")]
    pub runtime_secs: Option<u64>,
    #[serde(flatten)]
    pub progress: EncoderProgress,
}

/// 只读采样, 可与控制操作并发
#[derive(Clone)]
pub struct MetricsSampler {
    supervisor: Arc<Supervisor>,
    probe: Arc<dyn PlatformProbe>,
}

impl MetricsSampler {
    pub fn new(supervisor: Arc<Supervisor>, probe: Arc<dyn PlatformProbe>) -> Self {
        Self { supervisor, probe }
    }

    pub async fn sample(&self, id: &str) -> Result<StreamMetrics> {
        let view = self.supervisor.process_view(id).await?;

        let usage = view.pid.and_then(|pid| self.probe.process_usage(pid));
        let progress = view
            .progress
            .map(|buffer| parse_progress(&buffer.snapshot()))
            .unwrap_or_default();

        Ok(StreamMetrics {
            id: id.to_string(),
            state: view.state,
            pid: view.pid,
            cpu_percent: usage.map(|u| u.cpu_percent),
            memory_bytes: usage.map(|u| u.memory_bytes),
            runtime_secs: view.started_at.map(|t| t.elapsed().as_secs()),
            progress,
        })
    }

    pub fn system_stats(&self) -> SystemStats {
        self.probe.system_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_probe_reports_unavailable() {
        let stats = NullProbe.system_stats();
        let json = serde_json::to_value(&stats).unwrap();
        for key in [
            "cpu_percent",
            "memory_total_kb",
            "memory_available_kb",
            "load_average",
            "disk_total_kb",
            "disk_free_kb",
            "uptime_secs",
        ] {
            assert_eq!(json[key], "unavailable", "{}", key);
        }
        assert!(NullProbe.process_usage(1).is_none());
    }

    #[test]
    fn sysinfo_probe_sees_current_process() {
        let probe = SysinfoProbe::new();
        let usage = probe.process_usage(std::process::id()).unwrap();
        assert!(usage.memory_bytes > 0);
        assert!(probe.process_usage(u32::MAX - 1).is_none());
    }
}
