use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System, UpdateKind};
use tokio::fs;
use tracing::warn;

/// 按 PID 查询操作系统进程表, 与指标探针的配置无关
pub struct ProcessTable;

impl ProcessTable {
    fn lookup<T>(pid: u32, f: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
        let pid = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
        );
        sys.process(pid).map(f)
    }

    /// 僵尸进程视为已退出
    pub fn is_alive(pid: u32) -> bool {
        Self::lookup(pid, |p| p.status() != ProcessStatus::Zombie).unwrap_or(false)
    }

    pub fn executable(pid: u32) -> Option<PathBuf> {
        Self::lookup(pid, |p| p.exe().map(Path::to_path_buf)).flatten()
    }

    /// force 为 false 时发送 SIGTERM, 平台不支持时退化为强制终止
    pub fn signal(pid: u32, force: bool) -> bool {
        Self::lookup(pid, |p| {
            if force {
                p.kill()
            } else {
                p.kill_with(Signal::Term).unwrap_or_else(|| p.kill())
            }
        })
        .unwrap_or(false)
    }
}

/// 记录已启动转码进程的 PID, 供重启后的对账使用
pub struct PidLedger {
    dir: PathBuf,
}

impl PidLedger {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.pid", id))
    }

    pub async fn record(&self, id: &str, pid: u32) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        fs::write(self.path(id), pid.to_string()).await
    }

    pub async fn clear(&self, id: &str) -> std::io::Result<()> {
        match fs::remove_file(self.path(id)).await {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// 所有记录 (stream id, pid), 无法解析的条目会被跳过
    pub async fn entries(&self) -> std::io::Result<Vec<(String, u32)>> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let content = fs::read_to_string(&path).await?;
            match content.trim().parse::<u32>() {
                Ok(pid) => entries.push((id, pid)),
                Err(_) => {
                    warn!("Ignoring malformed pid file {:?}", path);
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn record_list_clear() {
        let dir = TempDir::new().unwrap();
        let ledger = PidLedger::new(dir.path().join("run"));
        assert!(ledger.entries().await.unwrap().is_empty());

        ledger.record("b", 20).await.unwrap();
        ledger.record("a", 10).await.unwrap();
        std::fs::write(dir.path().join("run/bad.pid"), "nope").unwrap();
        assert_eq!(
            ledger.entries().await.unwrap(),
            vec![("a".to_string(), 10), ("b".to_string(), 20)]
        );
        assert!(!dir.path().join("run/bad.pid").exists());

        ledger.clear("a").await.unwrap();
        ledger.clear("a").await.unwrap();
        assert_eq!(ledger.entries().await.unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn process_table_tracks_liveness() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(ProcessTable::is_alive(pid));
        assert!(ProcessTable::executable(pid).is_some());

        assert!(ProcessTable::signal(pid, false));
        child.wait().unwrap();
        assert!(!ProcessTable::is_alive(pid));
        assert!(!ProcessTable::signal(pid, true));
    }
}
