//! 结果存储：每次批次尝试一条不可变 JSON 记录
//!
//! 存储结构：
//! ```text
//! <root>/
//!   successful/<session>_<process>_batch_000_attempt_1_<时间戳>.json
//!   failed/...
//!   combined/...
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::{BatchRecord, RecordStatus};

/// 合并报告所在分区
pub const COMBINED_PARTITION: &str = "combined";

/// 按键存取的 blob 存储
///
/// 键的格式为 `<分区>/<文件名>`。写入只允许新建，已存在的键返回 `KeyCollision`。
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_new(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// 列出分区内全部键，按字典序排列
    async fn list(&self, partition: &str) -> Result<Vec<String>, StoreError>;

    /// 删除一个键，键不存在时返回 `false`
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// 早于 `max_age` 的时间点；`max_age` 超出可表示范围时返回 None（没有东西会过期）
pub fn retention_cutoff(now: DateTime<Utc>, max_age: Duration) -> Option<DateTime<Utc>> {
    let age = chrono::Duration::from_std(max_age).ok()?;
    now.checked_sub_signed(age)
}

/// 文件系统存储
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 创建根目录和固定分区
    pub async fn ensure_layout(&self) -> Result<(), StoreError> {
        for partition in [
            RecordStatus::Successful.partition(),
            RecordStatus::Failed.partition(),
            COMBINED_PARTITION,
        ] {
            fs::create_dir_all(self.root.join(partition))
                .await
                .map_err(|e| StoreError::io(partition, e))?;
        }
        Ok(())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .fold(self.root.clone(), |path, part| path.join(part))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put_new(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(key, e))?;
        }

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::KeyCollision {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(StoreError::io(key, e)),
        };

        file.write_all(&bytes)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        file.flush().await.map_err(|e| StoreError::io(key, e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    async fn list(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.path_for(partition);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(partition, e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(partition, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") {
                keys.push(format!("{}/{}", partition, name));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }
}

/// 内存存储（测试用）
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_new(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let mut blobs = self.lock();
        if blobs.contains_key(key) {
            return Err(StoreError::KeyCollision {
                key: key.to_string(),
            });
        }
        blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn list(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{}/", partition);
        Ok(self
            .lock()
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock().remove(key).is_some())
    }
}

/// 各分区记录数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub successful_records: usize,
    pub failed_records: usize,
    pub combined_reports: usize,
}

impl StorageStats {
    pub fn total_records(&self) -> usize {
        self.successful_records + self.failed_records
    }
}

/// 批次记录的读写
pub struct ResultStore {
    blobs: Arc<dyn BlobStore>,
}

impl ResultStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// 写入一条批次记录，返回存储键
    pub async fn persist(&self, record: &BatchRecord) -> Result<String, StoreError> {
        let key = record.storage_key();
        self.put_json(&key, record).await?;
        debug!(
            "[批次 {}] 记录已保存: {} (第 {} 次尝试)",
            record.batch_index + 1,
            key,
            record.attempt
        );
        Ok(key)
    }

    pub async fn put_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.blobs.put_new(key, bytes).await
    }

    /// 读取分区内全部可解析的 JSON，按键排序；无法读取或解析的条目跳过
    pub async fn read_partition<T: DeserializeOwned + Send>(
        &self,
        partition: &str,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let mut items = Vec::new();
        for key in self.blobs.list(partition).await? {
            let bytes = match self.blobs.get(&key).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!("⚠️ 无法读取 {}: {}", key, e);
                    continue;
                }
            };
            match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => items.push((key, value)),
                Err(e) => warn!("⚠️ 跳过无法解析的记录 {}: {}", key, e),
            }
        }
        Ok(items)
    }

    /// 读取某个会话/任务的全部批次记录（按记录内容中的字段过滤），按键排序
    pub async fn records_for(
        &self,
        session_id: &str,
        process_id: &str,
    ) -> Result<Vec<(String, BatchRecord)>, StoreError> {
        let mut records = Vec::new();
        for status in [RecordStatus::Successful, RecordStatus::Failed] {
            let partition: Vec<(String, BatchRecord)> = self.read_partition(status.partition()).await?;
            records.extend(
                partition
                    .into_iter()
                    .filter(|(_, r)| r.session_id == session_id && r.process_id == process_id),
            );
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    /// 分区内全部键
    pub async fn keys(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        self.blobs.list(partition).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.blobs.delete(key).await
    }

    /// 删除尝试时间早于 `max_age` 的批次记录，返回删除数量
    pub async fn cleanup_older_than(&self, max_age: Duration) -> Result<usize, StoreError> {
        match retention_cutoff(Utc::now(), max_age) {
            Some(cutoff) => self.cleanup_before(cutoff).await,
            None => Ok(0),
        }
    }

    /// 删除尝试时间早于 `cutoff` 的批次记录；无法解析的条目保留
    pub async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for status in [RecordStatus::Successful, RecordStatus::Failed] {
            let records: Vec<(String, BatchRecord)> = self.read_partition(status.partition()).await?;
            for (key, record) in records {
                if record.attempt_timestamp < cutoff && self.blobs.delete(&key).await? {
                    deleted += 1;
                }
            }
        }
        info!("🧹 已清理 {} 条过期批次记录", deleted);
        Ok(deleted)
    }

    pub async fn storage_stats(&self) -> Result<StorageStats, StoreError> {
        Ok(StorageStats {
            successful_records: self.blobs.list(RecordStatus::Successful.partition()).await?.len(),
            failed_records: self.blobs.list(RecordStatus::Failed.partition()).await?.len(),
            combined_reports: self.blobs.list(COMBINED_PARTITION).await?.len(),
        })
    }
}
