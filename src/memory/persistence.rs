//! 记忆持久化
//!
//! MemoryStore 抽象按用户加载 / 保存 MemorySnapshot。JsonFileStore 每用户一个目录：
//! `active.json`（有界活跃历史 + 下一个序号）与 `archive.json`（归档记录），
//! 写入走临时文件 + rename，避免半写文件。InMemoryStore 用于测试与无盘运行。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::MemoryError;
use crate::memory::conversation::{ArchiveEntry, ConversationEntry, MemorySnapshot};

/// 按用户的快照存取
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 不存在时返回 None
    async fn load(&self, user_id: &str) -> Result<Option<MemorySnapshot>, MemoryError>;

    async fn save(&self, snapshot: &MemorySnapshot) -> Result<(), MemoryError>;
}

/// `active.json` 的内容
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ActiveFile {
    pub user_id: String,
    pub next_seq: u64,
    pub entries: Vec<ConversationEntry>,
}

/// `archive.json` 的内容
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ArchiveFile {
    pub archives: Vec<ArchiveEntry>,
}

/// 把 user_id 编码为文件名：字母、数字、`_`、`-` 原样保留，其余字节写成 `%XX`。
/// 编码是单射，不同的 id 不会落到同一个文件；空 id 编码为 `%`
pub fn encode_user_id(user_id: &str) -> String {
    if user_id.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(user_id.len());
    for c in user_id.chars() {
        if c.is_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{:02X}", b));
            }
        }
    }
    out
}

/// 存储中记录的 user_id 必须与请求的一致
pub fn check_owner(requested: &str, stored: &str) -> Result<(), MemoryError> {
    if requested == stored {
        Ok(())
    } else {
        tracing::warn!(requested = %requested, stored = %stored, "stored data belongs to another user");
        Err(MemoryError::OwnerMismatch {
            requested: requested.to_string(),
            stored: stored.to_string(),
        })
    }
}

/// 原子写 JSON：同目录临时文件写入后 rename 覆盖
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), MemoryError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "data".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, &data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// 读取 JSON；文件不存在时返回 None
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, MemoryError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// JSON 文件存储：`<root>/<user>/active.json` + `<root>/<user>/archive.json`
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn user_dir(&self, user_id: &str) -> PathBuf {
        self.root.join(encode_user_id(user_id))
    }

    pub fn active_path(&self, user_id: &str) -> PathBuf {
        self.user_dir(user_id).join("active.json")
    }

    pub fn archive_path(&self, user_id: &str) -> PathBuf {
        self.user_dir(user_id).join("archive.json")
    }
}

#[async_trait]
impl MemoryStore for JsonFileStore {
    async fn load(&self, user_id: &str) -> Result<Option<MemorySnapshot>, MemoryError> {
        let active: Option<ActiveFile> = read_json(&self.active_path(user_id)).await?;
        let archive: Option<ArchiveFile> = read_json(&self.archive_path(user_id)).await?;
        if active.is_none() && archive.is_none() {
            return Ok(None);
        }
        if let Some(active) = &active {
            check_owner(user_id, &active.user_id)?;
        }
        let active = active.unwrap_or_else(|| ActiveFile {
            user_id: user_id.to_string(),
            next_seq: 0,
            entries: Vec::new(),
        });
        Ok(Some(MemorySnapshot {
            user_id: user_id.to_string(),
            next_seq: active.next_seq,
            active: active.entries,
            archives: archive.unwrap_or_default().archives,
        }))
    }

    async fn save(&self, snapshot: &MemorySnapshot) -> Result<(), MemoryError> {
        // 先写归档再写活跃历史：中途失败时最多出现重复记录，不会丢失
        let archive = ArchiveFile {
            archives: snapshot.archives.clone(),
        };
        write_json_atomic(&self.archive_path(&snapshot.user_id), &archive).await?;
        let active = ActiveFile {
            user_id: snapshot.user_id.clone(),
            next_seq: snapshot.next_seq,
            entries: snapshot.active.clone(),
        };
        write_json_atomic(&self.active_path(&snapshot.user_id), &active).await?;
        tracing::debug!(
            user_id = %snapshot.user_id,
            active = snapshot.active.len(),
            archives = snapshot.archives.len(),
            "memory snapshot saved"
        );
        Ok(())
    }
}

/// 内存存储
#[derive(Debug, Default)]
pub struct InMemoryStore {
    snapshots: RwLock<HashMap<String, MemorySnapshot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn load(&self, user_id: &str) -> Result<Option<MemorySnapshot>, MemoryError> {
        Ok(self.snapshots.read().await.get(user_id).cloned())
    }

    async fn save(&self, snapshot: &MemorySnapshot) -> Result<(), MemoryError> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.user_id.clone(), snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::conversation::{ConversationMemory, MemoryLimits};

    fn sample_snapshot() -> MemorySnapshot {
        let mut memory = ConversationMemory::new("alice/../bob", MemoryLimits::new(3, 1));
        for i in 0..5 {
            memory.append(ConversationEntry::new(
                "alice/../bob",
                format!("hello {}", i),
                "hi",
                Some("Tool echo returned: hi".into()),
            ));
        }
        memory.snapshot()
    }

    #[tokio::test]
    async fn test_json_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load("alice/../bob").await.unwrap().is_none());

        let snapshot = sample_snapshot();
        store.save(&snapshot).await.unwrap();
        assert!(store.active_path("alice/../bob").starts_with(dir.path()));
        assert!(dir.path().join("alice%2F%2E%2E%2Fbob/active.json").exists());
        assert!(dir.path().join("alice%2F%2E%2E%2Fbob/archive.json").exists());

        let loaded = store.load("alice/../bob").await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_no_tmp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.save(&sample_snapshot()).await.unwrap();
        store.save(&sample_snapshot()).await.unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path().join("alice%2F%2E%2E%2Fbob"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 2, "unexpected files: {:?}", names);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let path = store.active_path("carol");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(store.load("carol").await, Err(MemoryError::Format(_))));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStore::new();
        let snapshot = sample_snapshot();
        store.save(&snapshot).await.unwrap();
        assert_eq!(store.load(&snapshot.user_id).await.unwrap(), Some(snapshot));
        assert!(store.load("nobody").await.unwrap().is_none());
    }

    #[test]
    fn test_encode_user_id_is_injective() {
        assert_eq!(encode_user_id("alice"), "alice");
        assert_eq!(encode_user_id("a b/c"), "a%20b%2Fc");
        assert_eq!(encode_user_id("小明"), "小明");
        assert_eq!(encode_user_id(""), "%");
        assert_ne!(encode_user_id("alice/x"), encode_user_id("alice_x"));
        assert_ne!(encode_user_id("a%2F"), encode_user_id("a/"));
        assert_ne!(encode_user_id(".."), "..");
    }

    #[tokio::test]
    async fn test_similar_user_ids_do_not_share_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let mut memory = ConversationMemory::new("alice/x", MemoryLimits::default());
        memory.append(ConversationEntry::new("alice/x", "alice secret diary", "noted", None));
        store.save(&memory.snapshot()).await.unwrap();

        assert!(store.load("alice_x").await.unwrap().is_none());
        let loaded = store.load("alice/x").await.unwrap().unwrap();
        assert_eq!(loaded.active.len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_active_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let mut memory = ConversationMemory::new("eve", MemoryLimits::default());
        memory.append(ConversationEntry::new("eve", "hello", "hi", None));
        store.save(&memory.snapshot()).await.unwrap();

        let bob_path = store.active_path("bob");
        std::fs::create_dir_all(bob_path.parent().unwrap()).unwrap();
        std::fs::copy(store.active_path("eve"), &bob_path).unwrap();
        assert!(matches!(
            store.load("bob").await,
            Err(MemoryError::OwnerMismatch { .. })
        ));
    }
}
