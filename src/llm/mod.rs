//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）以及模型池

pub mod deepseek;
pub mod message;
pub mod mock;
pub mod openai;
pub mod pool;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use message::{Message, Role};
pub use mock::{MockLlmClient, MockReply};
pub use openai::OpenAiClient;
pub use pool::{ActiveModel, ModelCandidate, ModelPool, ModelRequirements, ModelStatus};
pub use traits::{ChunkStream, LlmClient, LlmError};
