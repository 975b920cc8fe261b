//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、
//! Gemini 兼容端点、自建代理等。后端的配额/限流错误映射为 LlmError::QuotaExceeded，供模型池轮换。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::llm::traits::is_quota_signal;
use crate::llm::{ChunkStream, LlmClient, LlmError, Message, Role};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
struct TokenUsage {
    prompt_tokens: Arc<AtomicU64>,
    completion_tokens: Arc<AtomicU64>,
    total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    fn new() -> Self {
        Self::default()
    }

    fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    /// 累计 token 使用统计
    usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::new(),
        }
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let built = match m.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                built.map_err(|e| LlmError::MalformedResponse(format!("request build: {e}")))
            })
            .collect()
    }
}

/// 将 async_openai 错误映射为 LlmError：配额/限流 -> QuotaExceeded，其余为后端故障
fn map_openai_error(model: &str, err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::ApiError(api) => {
            let code = api.code.clone().unwrap_or_default();
            let kind = api.r#type.clone().unwrap_or_default();
            if is_quota_signal(&code) || is_quota_signal(&kind) || is_quota_signal(&api.message) {
                LlmError::QuotaExceeded {
                    model: model.to_string(),
                }
            } else {
                LlmError::Api(api.message)
            }
        }
        other => {
            let text = other.to_string();
            if is_quota_signal(&text) {
                LlmError::QuotaExceeded {
                    model: model.to_string(),
                }
            } else {
                LlmError::Network(text)
            }
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(messages)?)
            .build()
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| map_openai_error(&self.model, e))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::MalformedResponse("response has no content".to_string()))
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<ChunkStream, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(messages)?)
            .build()
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| map_openai_error(&self.model, e))?;

        let model = self.model.clone();
        let chunks = stream.filter_map(move |item| {
            let model = model.clone();
            async move {
                match item {
                    Ok(resp) => {
                        let text: String = resp
                            .choices
                            .iter()
                            .filter_map(|c| c.delta.content.clone())
                            .collect();
                        if text.is_empty() {
                            None
                        } else {
                            Some(Ok(text))
                        }
                    }
                    Err(e) => Some(Err(map_openai_error(&model, e))),
                }
            }
        });
        Ok(Box::pin(chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_conversion_keeps_order() {
        let client = OpenAiClient::new(None, "gpt-4o-mini", Some("sk-test"));
        let converted = client
            .to_openai_messages(&[
                Message::system("sys"),
                Message::user("hi"),
                Message::assistant("hello"),
            ])
            .unwrap();
        assert_eq!(converted.len(), 3);
        assert!(matches!(converted[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(converted[1], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(converted[2], ChatCompletionRequestMessage::Assistant(_)));
    }
}
