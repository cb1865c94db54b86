use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl LogLevel {
    /// 根据转码器输出内容推断级别
    pub fn classify(line: &str) -> Self {
        let lower = line.to_ascii_lowercase();
        if lower.contains("error") || lower.contains("fatal") || lower.contains("failed") {
            LogLevel::Error
        } else if lower.contains("warning") {
            LogLevel::Warning
        } else {
            LogLevel::Info
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// 每个流一个 JSON Lines 文件, 只追加
pub struct LogSink {
    dir: PathBuf,
    max_file_bytes: u64,
    write_lock: Mutex<()>,
}

impl LogSink {
    pub fn new<P: AsRef<Path>>(dir: P, max_file_bytes: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            max_file_bytes,
            write_lock: Mutex::new(()),
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.log", id))
    }

    pub async fn append(&self, id: &str, level: LogLevel, message: impl Into<String>) {
        let record = LogRecord {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };
        if let Err(e) = self.write(id, &record).await {
            // 日志写入失败不影响进程管理
            warn!("Stream [{}] log append failed: {}", id, e);
        }
    }

    async fn write(&self, id: &str, record: &LogRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.dir).await?;
        let path = self.path(id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        let len = file.metadata().await?.len();
        drop(file);

        if self.max_file_bytes > 0 && len > self.max_file_bytes {
            self.compact(&path).await?;
        }
        Ok(())
    }

    /// 只保留较新的一半记录
    async fn compact(&self, path: &Path) -> std::io::Result<()> {
        let content = fs::read_to_string(path).await?;
        let lines: Vec<&str> = content.lines().collect();
        let keep = &lines[lines.len() / 2..];
        let mut body = keep.join("\n");
        body.push('\n');
        let tmp = path.with_extension("log.tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, path).await
    }

    /// 返回最近的至多 `limit` 条记录, 最新的在前
    pub async fn tail(&self, id: &str, limit: usize) -> std::io::Result<Vec<LogRecord>> {
        let content = match fs::read_to_string(self.path(id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<LogRecord>(line).ok())
            .take(limit)
            .collect())
    }

    pub async fn clear(&self, id: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().await;
        match fs::write(self.path(id), b"").await {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    pub async fn remove(&self, id: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.path(id)).await {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn tail_returns_newest_first_and_respects_limit() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::new(dir.path(), 0);
        for i in 0..5 {
            sink.append("s1", LogLevel::Info, format!("line {}", i)).await;
        }
        sink.append("s2", LogLevel::Error, "other stream").await;

        let records = sink.tail("s1", 3).await.unwrap();
        let messages: Vec<_> = records.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["line 4", "line 3", "line 2"]);
        assert_eq!(sink.tail("s1", 100).await.unwrap().len(), 5);
        assert!(sink.tail("missing", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::new(dir.path(), 0);
        sink.append("s1", LogLevel::Success, "started").await;
        let path = dir.path().join("s1.log");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("garbage\n");
        std::fs::write(&path, raw).unwrap();

        let records = sink.tail("s1", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, LogLevel::Success);
    }

    #[tokio::test]
    async fn clear_and_remove() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::new(dir.path(), 0);
        sink.append("s1", LogLevel::Warning, "w").await;
        sink.clear("s1").await.unwrap();
        assert!(sink.tail("s1", 10).await.unwrap().is_empty());
        sink.remove("s1").await.unwrap();
        assert!(!dir.path().join("s1.log").exists());
        sink.remove("s1").await.unwrap();
        sink.clear("never").await.unwrap();
    }

    #[tokio::test]
    async fn oversized_file_is_compacted() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::new(dir.path(), 2048);
        for i in 0..200 {
            sink.append("s1", LogLevel::Info, format!("message number {}", i)).await;
        }
        let size = std::fs::metadata(dir.path().join("s1.log")).unwrap().len();
        assert!(size <= 2048 + 128);
        let newest = sink.tail("s1", 1).await.unwrap();
        assert_eq!(newest[0].message, "message number 199");
    }

    #[test]
    fn classifies_transcoder_output() {
        assert_eq!(LogLevel::classify("Connection refused: Error"), LogLevel::Error);
        assert_eq!(LogLevel::classify("[flv] Warning: timestamps"), LogLevel::Warning);
        assert_eq!(LogLevel::classify("Input #0, rtmp"), LogLevel::Info);
    }
}
