//! 推理层：两阶段（思考 -> 回复）交换编排、阶段状态机、流式事件与提示词

pub mod events;
pub mod orchestrator;
pub mod phase;
pub mod prompt;

pub use events::StreamEvent;
pub use orchestrator::{
    CallTimeouts, ExchangeOutcome, ExchangeRequest, ExchangeStream, ReasoningOrchestrator,
};
pub use phase::{Phase, PhaseTrace};
pub use prompt::PromptBuilder;
