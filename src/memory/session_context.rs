//! 会话上下文：每次请求临时组装（最近对话 + 归档摘要 + 与本条消息相关的较早归档 + 用户档案），从不落盘

use crate::core::MemoryError;
use crate::memory::registry::MemoryRegistry;
use crate::tools::profile::{ProfileStore, UserProfile};

/// 按用户消息召回的较早归档条数
const RECALL_LIMIT: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub user_id: String,
    /// ConversationMemory::get_context 的渲染结果
    pub history: String,
    /// 与当前消息相关、未在 history 摘要中出现的归档
    pub recalled: Vec<String>,
    pub profile: Option<UserProfile>,
}

impl SessionContext {
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// 从记忆与档案组装；档案读取失败只记日志
    pub async fn assemble(
        memory: &MemoryRegistry,
        profiles: Option<&ProfileStore>,
        user_id: &str,
        message: &str,
        max_recent: usize,
    ) -> Result<Self, MemoryError> {
        let history = memory.context(user_id, max_recent).await?;
        let recalled = memory.recall(user_id, message, RECALL_LIMIT).await?;
        let profile = match profiles {
            Some(store) => match store.load(user_id).await {
                Ok(profile) if !profile.is_empty() => Some(profile),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "failed to load user profile");
                    None
                }
            },
            None => None,
        };
        Ok(Self {
            user_id: user_id.to_string(),
            history,
            recalled,
            profile,
        })
    }

    /// 渲染为 prompt 中的一段文本
    pub fn render(&self) -> String {
        let mut out = format!("Current user id: \"{}\"\n", self.user_id);
        if let Some(profile) = &self.profile {
            out.push_str("What you know about the user:\n");
            if let Some(feeling) = &profile.feeling {
                out.push_str(&format!("- current feeling: {}\n", feeling));
            }
            for (field, value) in &profile.fields {
                out.push_str(&format!("- {}: {}\n", field, value));
            }
        }
        if !self.recalled.is_empty() {
            out.push_str("\nRelated earlier conversations:\n");
            for line in &self.recalled {
                out.push_str(&format!("- {}\n", line));
            }
        }
        if !self.history.is_empty() {
            out.push('\n');
            out.push_str(&self.history);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::memory::{ConversationEntry, InMemoryStore, KeywordSummarizer, MemoryLimits};

    #[tokio::test]
    async fn test_assemble_and_render() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = ProfileStore::new(dir.path());
        profiles
            .update("alice", |p| p.feeling = Some("calm".into()))
            .await
            .unwrap();
        let memory = MemoryRegistry::new(
            MemoryLimits::default(),
            Arc::new(KeywordSummarizer::default()),
            Arc::new(InMemoryStore::new()),
        );
        memory
            .record(ConversationEntry::new("alice", "I started yoga", "That sounds great", None))
            .await
            .unwrap();

        let ctx = SessionContext::assemble(&memory, Some(&profiles), "alice", "yoga", 5)
            .await
            .unwrap();
        let text = ctx.render();
        assert!(text.contains("Current user id: \"alice\""));
        assert!(text.contains("current feeling: calm"));
        assert!(text.contains("User: I started yoga"));

        let bare = SessionContext::assemble(&memory, None, "bob", "hi", 5).await.unwrap();
        assert!(bare.profile.is_none());
        assert!(bare.history.is_empty());
    }

    #[tokio::test]
    async fn test_related_archive_rendered() {
        let memory = MemoryRegistry::new(
            MemoryLimits {
                archive_digest_count: 0,
                ..MemoryLimits::new(1, 0)
            },
            Arc::new(KeywordSummarizer::default()),
            Arc::new(InMemoryStore::new()),
        );
        memory
            .record(ConversationEntry::new("alice", "my cat Mochi is sick", "I hope Mochi recovers", None))
            .await
            .unwrap();
        memory
            .record(ConversationEntry::new("alice", "took Mochi to the vet", "good call", None))
            .await
            .unwrap();

        let ctx = SessionContext::assemble(&memory, None, "alice", "Mochi is better now", 5)
            .await
            .unwrap();
        assert_eq!(ctx.recalled.len(), 1);
        assert!(ctx.render().contains("Related earlier conversations:"));

        let unrelated = SessionContext::assemble(&memory, None, "alice", "weather", 5)
            .await
            .unwrap();
        assert!(unrelated.recalled.is_empty());
    }
}
