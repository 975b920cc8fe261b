//! 按用户隔离的对话记忆
//!
//! 每个用户一个 `Arc<Mutex<ConversationMemory>>`，首次访问时从 MemoryStore 加载；
//! 不同用户互不争用，同一用户的 append + 归档 + 落盘经该用户的锁串行。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::core::MemoryError;
use crate::memory::conversation::{ArchiveEntry, ConversationEntry, ConversationMemory, MemoryLimits};
use crate::memory::persistence::MemoryStore;
use crate::memory::summarizer::Summarizer;

pub type SharedMemory = Arc<Mutex<ConversationMemory>>;

pub struct MemoryRegistry {
    limits: MemoryLimits,
    summarizer: Arc<dyn Summarizer>,
    store: Arc<dyn MemoryStore>,
    /// user_id -> 对话记忆
    memories: RwLock<HashMap<String, SharedMemory>>,
}

impl MemoryRegistry {
    pub fn new(
        limits: MemoryLimits,
        summarizer: Arc<dyn Summarizer>,
        store: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            limits: limits.normalized(),
            summarizer,
            store,
            memories: RwLock::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> MemoryLimits {
        self.limits
    }

    /// 获取或加载用户的对话记忆。磁盘加载不持有注册表锁，并发加载同一用户时先插入者生效
    pub async fn get_or_load(&self, user_id: &str) -> Result<SharedMemory, MemoryError> {
        if let Some(memory) = self.memories.read().await.get(user_id) {
            return Ok(Arc::clone(memory));
        }

        let memory = match self.store.load(user_id).await? {
            Some(snapshot) => {
                tracing::info!(
                    user_id = %user_id,
                    active = snapshot.active.len(),
                    archives = snapshot.archives.len(),
                    "conversation memory loaded"
                );
                ConversationMemory::from_snapshot(snapshot, self.limits, Arc::clone(&self.summarizer))
            }
            None => ConversationMemory::with_summarizer(
                user_id,
                self.limits,
                Arc::clone(&self.summarizer),
            ),
        };

        let mut memories = self.memories.write().await;
        let shared = memories
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(memory)));
        Ok(Arc::clone(shared))
    }

    /// 记录一次完成的交换：追加、按需归档并落盘。落盘失败只记日志，内存中的记录保留
    pub async fn record(&self, entry: ConversationEntry) -> Result<Option<ArchiveEntry>, MemoryError> {
        let memory = self.get_or_load(&entry.user_id).await?;
        let mut memory = memory.lock().await;
        let archived = memory.append(entry);
        let snapshot = memory.snapshot();
        if let Err(e) = self.store.save(&snapshot).await {
            tracing::warn!(user_id = %snapshot.user_id, error = %e, "failed to persist conversation memory");
        }
        Ok(archived)
    }

    /// 渲染用户的上下文文本
    pub async fn context(&self, user_id: &str, max_recent: usize) -> Result<String, MemoryError> {
        let memory = self.get_or_load(user_id).await?;
        let memory = memory.lock().await;
        Ok(memory.get_context(max_recent))
    }

    /// 与 query 相关、且不在上下文归档摘要中的较早归档，渲染为摘要行
    pub async fn recall(&self, user_id: &str, query: &str, k: usize) -> Result<Vec<String>, MemoryError> {
        let memory = self.get_or_load(user_id).await?;
        let memory = memory.lock().await;
        Ok(memory
            .recall_archives(query, k)
            .into_iter()
            .map(|a| {
                format!(
                    "[{} ~ {}] {}",
                    a.period_start.format("%Y-%m-%d"),
                    a.period_end.format("%Y-%m-%d"),
                    a.summary_text
                )
            })
            .collect())
    }

    /// 替换某条归档摘要并落盘
    pub async fn update_summary(
        &self,
        user_id: &str,
        archive_id: &str,
        text: &str,
    ) -> Result<(), MemoryError> {
        let memory = self.get_or_load(user_id).await?;
        let mut memory = memory.lock().await;
        memory.update_summary(archive_id, text)?;
        self.store.save(&memory.snapshot()).await
    }

    /// 落盘全部已加载用户
    pub async fn flush_all(&self) -> Result<(), MemoryError> {
        let memories: Vec<SharedMemory> = self.memories.read().await.values().cloned().collect();
        for memory in memories {
            let snapshot = memory.lock().await.snapshot();
            self.store.save(&snapshot).await?;
        }
        Ok(())
    }

    pub async fn list_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.memories.read().await.keys().cloned().collect();
        users.sort();
        users
    }
}
