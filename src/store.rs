use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::SupervisorError;

static BITRATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[kKmM]?$").unwrap());
static RESOLUTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+x\d+$").unwrap());

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("malformed stream list {path}: {source}")]
    Json {
        source: serde_json::Error,
        path: PathBuf,
    },
}

/// 转码任务定义, id 创建后不可变
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamDefinition {
    pub id: String,
    pub name: String,
    pub input: String,
    pub output: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub bitrate: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub category: String,
    /// 期望运行状态, 启动时置位, 停止时清除
    #[serde(default)]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 创建 / 更新请求体
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StreamDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub bitrate: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub category: String,
}

impl StreamDraft {
    /// 去除首尾空白并校验必填字段
    pub fn validated(self) -> Result<Self, SupervisorError> {
        let draft = StreamDraft {
            name: self.name.trim().to_string(),
            input: self.input.trim().to_string(),
            output: self.output.trim().to_string(),
            key: self.key.trim().to_string(),
            bitrate: self.bitrate.trim().to_string(),
            resolution: self.resolution.trim().to_string(),
            category: self.category.trim().to_string(),
        };

        let mut missing = Vec::new();
        if draft.name.is_empty() {
            missing.push("name");
        }
        if draft.input.is_empty() {
            missing.push("input");
        }
        if draft.output.is_empty() {
            missing.push("output");
        }
        if !missing.is_empty() {
            return Err(SupervisorError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
        if !draft.bitrate.is_empty() && !BITRATE_RE.is_match(&draft.bitrate) {
            return Err(SupervisorError::Validation(format!(
                "bitrate '{}' must look like 2500k",
                draft.bitrate
            )));
        }
        if !draft.resolution.is_empty() && !RESOLUTION_RE.is_match(&draft.resolution) {
            return Err(SupervisorError::Validation(format!(
                "resolution '{}' must look like 1280x720",
                draft.resolution
            )));
        }
        Ok(draft)
    }
}

impl StreamDefinition {
    fn from_draft(draft: StreamDraft) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: draft.name,
            input: draft.input,
            output: draft.output,
            key: draft.key,
            bitrate: draft.bitrate,
            resolution: draft.resolution,
            category: draft.category,
            active: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn apply(&mut self, draft: StreamDraft) {
        self.name = draft.name;
        self.input = draft.input;
        self.output = draft.output;
        self.key = draft.key;
        self.bitrate = draft.bitrate;
        self.resolution = draft.resolution;
        self.category = draft.category;
        self.updated_at = Utc::now();
    }

    /// 输出地址与推流密钥拼接
    pub fn output_uri(&self) -> String {
        if self.key.is_empty() {
            self.output.clone()
        } else if self.output.ends_with('/') {
            format!("{}{}", self.output, self.key)
        } else {
            format!("{}/{}", self.output, self.key)
        }
    }
}

/// 任务定义存储接口
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn list(&self) -> Result<Vec<StreamDefinition>, StoreError>;
    async fn get(&self, id: &str) -> Result<Option<StreamDefinition>, StoreError>;
    async fn create(&self, draft: StreamDraft) -> Result<StreamDefinition, StoreError>;
    /// 未找到时返回 None
    async fn update(
        &self,
        id: &str,
        draft: StreamDraft,
    ) -> Result<Option<StreamDefinition>, StoreError>;
    async fn set_active(&self, id: &str, active: bool) -> Result<bool, StoreError>;
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;
}

/// 以 JSON 数组持久化到单个文件
pub struct JsonFileStore {
    path: PathBuf,
    streams: Mutex<Vec<StreamDefinition>>,
}

impl JsonFileStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let streams = match fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
                source,
                path: path.clone(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(StoreError::Io { source, path }),
        };
        debug!("Loaded {} stream definitions from {:?}", streams.len(), path);
        Ok(Self {
            path,
            streams: Mutex::new(streams),
        })
    }

    async fn persist(&self, streams: &[StreamDefinition]) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            source,
            path: self.path.clone(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let body = serde_json::to_vec_pretty(streams).map_err(|source| StoreError::Json {
            source,
            path: self.path.clone(),
        })?;
        // 先写临时文件再重命名, 避免半写文件
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).await.map_err(io_err)?;
        fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for JsonFileStore {
    async fn list(&self) -> Result<Vec<StreamDefinition>, StoreError> {
        let mut streams = self.streams.lock().await.clone();
        streams.sort_by_key(|s| s.created_at);
        Ok(streams)
    }

    async fn get(&self, id: &str) -> Result<Option<StreamDefinition>, StoreError> {
        let streams = self.streams.lock().await;
        Ok(streams.iter().find(|s| s.id == id).cloned())
    }

    async fn create(&self, draft: StreamDraft) -> Result<StreamDefinition, StoreError> {
        let mut streams = self.streams.lock().await;
        let def = StreamDefinition::from_draft(draft);
        streams.push(def.clone());
        if let Err(e) = self.persist(&streams).await {
            streams.pop();
            return Err(e);
        }
        Ok(def)
    }

    async fn update(
        &self,
        id: &str,
        draft: StreamDraft,
    ) -> Result<Option<StreamDefinition>, StoreError> {
        let mut streams = self.streams.lock().await;
        let Some(pos) = streams.iter().position(|s| s.id == id) else {
            return Ok(None);
        };
        let previous = streams[pos].clone();
        streams[pos].apply(draft);
        let updated = streams[pos].clone();
        if let Err(e) = self.persist(&streams).await {
            streams[pos] = previous;
            return Err(e);
        }
        Ok(Some(updated))
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<bool, StoreError> {
        let mut streams = self.streams.lock().await;
        let Some(pos) = streams.iter().position(|s| s.id == id) else {
            return Ok(false);
        };
        if streams[pos].active == active {
            return Ok(true);
        }
        streams[pos].active = active;
        if let Err(e) = self.persist(&streams).await {
            streams[pos].active = !active;
            return Err(e);
        }
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut streams = self.streams.lock().await;
        let Some(pos) = streams.iter().position(|s| s.id == id) else {
            return Ok(false);
        };
        let removed = streams.remove(pos);
        if let Err(e) = self.persist(&streams).await {
            streams.insert(pos, removed);
            return Err(e);
        }
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) fn draft(name: &str, input: &str) -> StreamDraft {
    StreamDraft {
        name: name.to_string(),
        input: input.to_string(),
        output: "vtx".to_string(),
        ..StreamDraft::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn create_update_delete_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("streams.json");
        let store = JsonFileStore::open(&path).await.unwrap();

        let created = store.create(draft("news", "rtmp://src/live")).await.unwrap();
        let mut edit = draft("news hd", "rtmp://src/live");
        edit.bitrate = "4000k".into();
        let updated = store.update(&created.id, edit).await.unwrap().unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.bitrate, "4000k");
        assert!(store.set_active(&created.id, true).await.unwrap());

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let stored = reopened.get(&created.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "news hd");
        assert!(stored.active);

        assert!(reopened.delete(&created.id).await.unwrap());
        assert!(!reopened.delete(&created.id).await.unwrap());
        assert!(JsonFileStore::open(&path).await.unwrap().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_unknown_id_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("s.json")).await.unwrap();
        assert!(store.update("missing", draft("a", "b")).await.unwrap().is_none());
        assert!(!store.set_active("missing", true).await.unwrap());
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("s.json")).await.unwrap();
        let a = store.create(draft("a", "x")).await.unwrap();
        let b = store.create(draft("a", "x")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path).await,
            Err(StoreError::Json { .. })
        ));
    }

    #[test]
    fn validation_reports_missing_fields() {
        let err = StreamDraft {
            name: "  ".into(),
            ..StreamDraft::default()
        }
        .validated()
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid stream definition: missing required fields: name, input, output"
        );

        let mut bad = draft("a", "b");
        bad.resolution = "720p".into();
        assert!(bad.validated().is_err());

        let mut ok = draft(" a ", "b");
        ok.bitrate = "3M".into();
        assert_eq!(ok.validated().unwrap().name, "a");
    }

    #[test]
    fn output_uri_joins_key() {
        let mut def = StreamDefinition::from_draft(draft("a", "b"));
        def.output = "rtmp://live.example/app".into();
        assert_eq!(def.output_uri(), "rtmp://live.example/app");
        def.key = "secret".into();
        assert_eq!(def.output_uri(), "rtmp://live.example/app/secret");
        def.output = "rtmp://live.example/app/".into();
        assert_eq!(def.output_uri(), "rtmp://live.example/app/secret");
    }
}
