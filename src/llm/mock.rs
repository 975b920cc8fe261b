//! Mock LLM 客户端（用于测试与离线演示，无需 API）
//!
//! 按脚本依次返回预设回复或错误；脚本耗尽后回显最后一条 User 消息。
//! 流式模式下按空白切分为若干分块，可设置分块间隔以模拟打字效果或测试取消。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::llm::{ChunkStream, LlmClient, LlmError, Message, Role};

/// 单次调用的预设行为
#[derive(Debug, Clone)]
pub enum MockReply {
    /// 完整文本（流式时按词切分）
    Text(String),
    /// 流式分块，可在中途插入错误
    Stream(Vec<Result<String, LlmError>>),
    /// 调用直接失败
    Fail(LlmError),
    /// 永不返回（用于超时测试）
    Hang,
}

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<MockReply>>,
    chunk_delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以脚本创建：每次调用（complete 或 complete_stream）按顺序消费一条
    pub fn scripted(replies: impl IntoIterator<Item = MockReply>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// 已被调用的次数
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self, messages: &[Message]) -> MockReply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        scripted.unwrap_or_else(|| {
            let last_user = messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
                .unwrap_or("(no input)");
            MockReply::Text(format!("Echo from Mock: {}", last_user))
        })
    }
}

/// 按空白切分文本，保留分隔符，使分块拼接后与原文一致
fn split_words(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if c.is_whitespace() {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        match self.next_reply(messages) {
            MockReply::Text(text) => Ok(text),
            MockReply::Stream(parts) => parts.into_iter().collect(),
            MockReply::Fail(e) => Err(e),
            MockReply::Hang => futures_util::future::pending().await,
        }
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<ChunkStream, LlmError> {
        let parts: Vec<Result<String, LlmError>> = match self.next_reply(messages) {
            MockReply::Text(text) => split_words(&text).into_iter().map(Ok).collect(),
            MockReply::Stream(parts) => parts,
            MockReply::Fail(e) => return Err(e),
            MockReply::Hang => return Ok(Box::pin(stream::pending::<Result<String, LlmError>>())),
        };
        match self.chunk_delay {
            Some(delay) => Ok(Box::pin(stream::iter(parts).then(move |part| async move {
                tokio::time::sleep(delay).await;
                part
            }))),
            None => Ok(Box::pin(stream::iter(parts))),
        }
    }
}
