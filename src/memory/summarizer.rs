//! 归档摘要
//!
//! Summarizer 负责把一批被归档的对话压缩为摘要文本与主题集合；默认实现 KeywordSummarizer
//! 基于分词词频提取主题，不调用模型。

use std::collections::BTreeSet;

use crate::memory::conversation::ConversationEntry;
use crate::memory::tokenizer::top_keywords;

/// 一批对话的摘要结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArchiveDigest {
    pub summary_text: String,
    pub key_topics: BTreeSet<String>,
}

/// 可插拔的摘要策略
pub trait Summarizer: Send + Sync {
    fn summarize(&self, entries: &[ConversationEntry]) -> ArchiveDigest;
}

/// 关键词摘要：取用户消息与回复中的高频词作为主题
#[derive(Debug, Clone)]
pub struct KeywordSummarizer {
    max_topics: usize,
}

impl KeywordSummarizer {
    pub fn new(max_topics: usize) -> Self {
        Self {
            max_topics: max_topics.max(1),
        }
    }
}

impl Default for KeywordSummarizer {
    fn default() -> Self {
        Self::new(5)
    }
}

impl Summarizer for KeywordSummarizer {
    fn summarize(&self, entries: &[ConversationEntry]) -> ArchiveDigest {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return ArchiveDigest::default();
        };

        let topics = top_keywords(
            entries
                .iter()
                .flat_map(|e| [e.user_message.as_str(), e.ai_response.as_str()]),
            self.max_topics,
        );

        let mut users: Vec<&str> = entries.iter().map(|e| e.user_id.as_str()).collect();
        users.sort_unstable();
        users.dedup();

        let mut summary_text = format!(
            "{} exchanges with {} between {} and {}",
            entries.len(),
            users.join(", "),
            first.timestamp.format("%Y-%m-%d %H:%M"),
            last.timestamp.format("%Y-%m-%d %H:%M"),
        );
        if !topics.is_empty() {
            summary_text.push_str(&format!("; topics: {}", topics.join(", ")));
        }
        let tool_uses = entries
            .iter()
            .filter(|e| e.tool_results_summary.is_some())
            .count();
        if tool_uses > 0 {
            summary_text.push_str(&format!("; {} used tools", tool_uses));
        }

        ArchiveDigest {
            summary_text,
            key_topics: topics.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(user: &str, msg: &str, reply: &str) -> ConversationEntry {
        ConversationEntry::new(user, msg, reply, None)
    }

    #[test]
    fn test_summarize_collects_topics() {
        let entries = vec![
            entry("alice", "My garden tomatoes are growing", "Lovely garden!"),
            entry("alice", "The tomatoes need water", "Water the garden in the morning."),
        ];
        let digest = KeywordSummarizer::new(2).summarize(&entries);
        assert!(digest.key_topics.contains("garden"));
        assert!(digest.key_topics.contains("tomatoes"));
        assert!(digest.summary_text.starts_with("2 exchanges with alice"));
        assert!(digest.summary_text.contains(&Utc::now().format("%Y-%m-%d").to_string()));
    }

    #[test]
    fn test_summarize_empty() {
        assert_eq!(
            KeywordSummarizer::default().summarize(&[]),
            ArchiveDigest::default()
        );
    }
}
