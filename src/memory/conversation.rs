//! 对话记忆：有界活跃历史 + 归档
//!
//! 每次 append 后同步检查阈值：活跃条目超过 max_active 时，把最旧的 len - keep_recent 条
//! 压缩为一条 ArchiveEntry（摘要由 Summarizer 生成）。活跃历史与归档按 seq 组成
//! 无缺口、无重复、严格递增的时间线；归档超过 max_archives 时丢弃最旧的。

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::MemoryError;
use crate::memory::summarizer::{KeywordSummarizer, Summarizer};
use crate::memory::tokenizer::{overlap_score, tokenize_to_set};

/// 一次完整交换（用户消息 + 最终回复）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConversationEntry {
    pub id: String,
    /// 由 ConversationMemory 分配的递增序号
    #[serde(default)]
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub user_message: String,
    pub ai_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results_summary: Option<String>,
}

impl ConversationEntry {
    pub fn new(
        user_id: impl Into<String>,
        user_message: impl Into<String>,
        ai_response: impl Into<String>,
        tool_results_summary: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            timestamp: Utc::now(),
            user_id: user_id.into(),
            user_message: user_message.into(),
            ai_response: ai_response.into(),
            tool_results_summary,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// 一批被归档对话的摘要记录（只追加；仅 summary_text 可被替换）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ArchiveEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub first_seq: u64,
    pub last_seq: u64,
    pub original_entry_count: usize,
    pub summary_text: String,
    pub key_topics: BTreeSet<String>,
    pub per_user_message_counts: BTreeMap<String, usize>,
}

/// 记忆阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    pub max_active: usize,
    pub keep_recent: usize,
    pub max_archives: usize,
    /// get_context 中附带的最近归档条数
    pub archive_digest_count: usize,
}

impl MemoryLimits {
    pub fn new(max_active: usize, keep_recent: usize) -> Self {
        Self {
            max_active,
            keep_recent,
            ..Self::default()
        }
        .normalized()
    }

    pub fn with_max_archives(mut self, max_archives: usize) -> Self {
        self.max_archives = max_archives;
        self.normalized()
    }

    /// max_active ≥ 1，keep_recent ≤ max_active，max_archives ≥ 1
    pub fn normalized(mut self) -> Self {
        self.max_active = self.max_active.max(1);
        self.keep_recent = self.keep_recent.min(self.max_active);
        self.max_archives = self.max_archives.max(1);
        self
    }
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            max_active: 50,
            keep_recent: 20,
            max_archives: 1000,
            archive_digest_count: 3,
        }
    }
}

/// 持久化快照（活跃历史 + 下一个序号 + 归档）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct MemorySnapshot {
    pub user_id: String,
    pub next_seq: u64,
    pub active: Vec<ConversationEntry>,
    pub archives: Vec<ArchiveEntry>,
}

/// 单个用户的对话记忆
pub struct ConversationMemory {
    user_id: String,
    limits: MemoryLimits,
    active: Vec<ConversationEntry>,
    archives: Vec<ArchiveEntry>,
    next_seq: u64,
    summarizer: Arc<dyn Summarizer>,
}

impl std::fmt::Debug for ConversationMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationMemory")
            .field("user_id", &self.user_id)
            .field("limits", &self.limits)
            .field("active", &self.active.len())
            .field("archives", &self.archives.len())
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

impl ConversationMemory {
    pub fn new(user_id: impl Into<String>, limits: MemoryLimits) -> Self {
        Self::with_summarizer(user_id, limits, Arc::new(KeywordSummarizer::default()))
    }

    pub fn with_summarizer(
        user_id: impl Into<String>,
        limits: MemoryLimits,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            limits: limits.normalized(),
            active: Vec::new(),
            archives: Vec::new(),
            next_seq: 0,
            summarizer,
        }
    }

    /// 从快照恢复；若阈值变小则立即归档多出的条目
    pub fn from_snapshot(
        snapshot: MemorySnapshot,
        limits: MemoryLimits,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let max_seen = snapshot
            .active
            .iter()
            .map(|e| e.seq + 1)
            .chain(snapshot.archives.iter().map(|a| a.last_seq + 1))
            .max()
            .unwrap_or(0);
        let mut memory = Self {
            user_id: snapshot.user_id,
            limits: limits.normalized(),
            active: snapshot.active,
            archives: snapshot.archives,
            next_seq: snapshot.next_seq.max(max_seen),
            summarizer,
        };
        memory.archive_if_needed();
        memory.trim_archives();
        memory
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            user_id: self.user_id.clone(),
            next_seq: self.next_seq,
            active: self.active.clone(),
            archives: self.archives.clone(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn limits(&self) -> MemoryLimits {
        self.limits
    }

    pub fn active(&self) -> &[ConversationEntry] {
        &self.active
    }

    pub fn archives(&self) -> &[ArchiveEntry] {
        &self.archives
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.active
            .last()
            .map(|e| e.timestamp)
            .or_else(|| self.archives.last().map(|a| a.period_end))
    }

    /// 追加一条交换并同步归档；返回本次产生的归档（若有）
    pub fn append(&mut self, mut entry: ConversationEntry) -> Option<ArchiveEntry> {
        if let Some(latest) = self.latest_timestamp() {
            if entry.timestamp < latest {
                entry.timestamp = latest;
            }
        }
        entry.seq = self.next_seq;
        self.next_seq += 1;
        tracing::debug!(user_id = %self.user_id, seq = entry.seq, "conversation entry appended");
        self.active.push(entry);
        self.archive_if_needed()
    }

    /// 活跃条目超过 max_active 时归档最旧的 len - keep_recent 条；未超过时无操作
    pub fn archive_if_needed(&mut self) -> Option<ArchiveEntry> {
        if self.active.len() <= self.limits.max_active {
            return None;
        }
        let move_count = self.active.len() - self.limits.keep_recent;
        let moved: Vec<ConversationEntry> = self.active.drain(..move_count).collect();
        let (first, last) = match (moved.first(), moved.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return None,
        };

        let digest = self.summarizer.summarize(&moved);
        let mut per_user_message_counts = BTreeMap::new();
        for entry in &moved {
            *per_user_message_counts
                .entry(entry.user_id.clone())
                .or_insert(0) += 1;
        }
        let archive = ArchiveEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            period_start: first.timestamp,
            period_end: last.timestamp,
            first_seq: first.seq,
            last_seq: last.seq,
            original_entry_count: moved.len(),
            summary_text: digest.summary_text,
            key_topics: digest.key_topics,
            per_user_message_counts,
        };
        tracing::info!(
            user_id = %self.user_id,
            archive_id = %archive.id,
            archived = archive.original_entry_count,
            remaining = self.active.len(),
            "conversation history archived"
        );
        self.archives.push(archive.clone());
        self.trim_archives();
        Some(archive)
    }

    fn trim_archives(&mut self) {
        if self.archives.len() > self.limits.max_archives {
            let excess = self.archives.len() - self.limits.max_archives;
            self.archives.drain(..excess);
            tracing::info!(user_id = %self.user_id, dropped = excess, "oldest archives dropped");
        }
    }

    /// 替换某条归档的摘要文本
    pub fn update_summary(&mut self, archive_id: &str, text: impl Into<String>) -> Result<(), MemoryError> {
        let archive = self
            .archives
            .iter_mut()
            .find(|a| a.id == archive_id)
            .ok_or_else(|| MemoryError::ArchiveNotFound(archive_id.to_string()))?;
        archive.summary_text = text.into();
        Ok(())
    }

    /// 最近 n 条活跃条目（时间正序）
    pub fn recent(&self, n: usize) -> &[ConversationEntry] {
        let start = self.active.len().saturating_sub(n);
        &self.active[start..]
    }

    /// 最近 n 条归档的摘要文本
    pub fn archive_digest(&self, n: usize) -> String {
        let start = self.archives.len().saturating_sub(n);
        let mut out = String::new();
        for archive in &self.archives[start..] {
            let _ = writeln!(
                out,
                "- [{} ~ {}] {}",
                archive.period_start.format("%Y-%m-%d"),
                archive.period_end.format("%Y-%m-%d"),
                archive.summary_text
            );
        }
        out
    }

    /// 渲染供 prompt 使用的上下文：归档摘要 + 最近 max_recent 条对话
    pub fn get_context(&self, max_recent: usize) -> String {
        let mut out = String::new();
        let digest = self.archive_digest(self.limits.archive_digest_count);
        if !digest.is_empty() {
            out.push_str("Earlier conversations (summarized):\n");
            out.push_str(&digest);
            out.push('\n');
        }
        let recent = self.recent(max_recent);
        if !recent.is_empty() {
            out.push_str("Recent conversation:\n");
            for entry in recent {
                let _ = writeln!(out, "User: {}", entry.user_message);
                let _ = writeln!(out, "Assistant: {}", entry.ai_response);
            }
        }
        out
    }

    /// 按关键词重叠检索归档，返回得分最高的 k 条
    pub fn search_archives(&self, query: &str, k: usize) -> Vec<&ArchiveEntry> {
        let query_tokens = tokenize_to_set(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(usize, &ArchiveEntry)> = self
            .archives
            .iter()
            .filter_map(|archive| {
                let mut tokens = tokenize_to_set(&archive.summary_text);
                tokens.extend(archive.key_topics.iter().cloned());
                let score = overlap_score(&query_tokens, &tokens);
                (score > 0).then_some((score, archive))
            })
            .collect();
        // 同分时较新的优先
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.last_seq.cmp(&a.1.last_seq)));
        scored.into_iter().take(k).map(|(_, a)| a).collect()
    }

    /// 与 query 相关、但不在 get_context 归档摘要（最近 archive_digest_count 条）中的归档
    pub fn recall_archives(&self, query: &str, k: usize) -> Vec<&ArchiveEntry> {
        let digest_start = self
            .archives
            .len()
            .saturating_sub(self.limits.archive_digest_count);
        let in_digest: HashSet<&str> = self.archives[digest_start..]
            .iter()
            .map(|a| a.id.as_str())
            .collect();
        self.search_archives(query, self.archives.len())
            .into_iter()
            .filter(|a| !in_digest.contains(a.id.as_str()))
            .take(k)
            .collect()
    }
}
