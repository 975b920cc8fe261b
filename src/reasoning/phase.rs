//! 推理阶段：THINKING → EXTRACTING → EXECUTING → RESPONDING → DONE，ERROR 为吸收态

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Thinking,
    Extracting,
    Executing,
    Responding,
    Done,
    Error,
}

impl Phase {
    /// 合法转移：顺序前进（无工具调用时 EXTRACTING 可直接到 RESPONDING），任意非终态可进入 ERROR
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Done, _) | (Error, _) => false,
            (_, Error) => true,
            (Thinking, Extracting)
            | (Extracting, Executing)
            | (Extracting, Responding)
            | (Executing, Responding)
            | (Responding, Done) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Thinking => "THINKING",
            Phase::Extracting => "EXTRACTING",
            Phase::Executing => "EXECUTING",
            Phase::Responding => "RESPONDING",
            Phase::Done => "DONE",
            Phase::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// 本次交换经过的阶段序列
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhaseTrace {
    phases: Vec<Phase>,
}

impl PhaseTrace {
    pub fn new() -> Self {
        Self {
            phases: vec![Phase::Thinking],
        }
    }

    pub fn current(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Thinking)
    }

    /// 记录转移；非法转移只记日志并忽略
    pub fn advance(&mut self, next: Phase) {
        let current = self.current();
        if current.can_transition_to(next) {
            tracing::debug!(from = %current, to = %next, "phase transition");
            self.phases.push(next);
        } else {
            tracing::warn!(from = %current, to = %next, "illegal phase transition ignored");
        }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(Phase::Thinking.can_transition_to(Phase::Extracting));
        assert!(Phase::Extracting.can_transition_to(Phase::Responding));
        assert!(Phase::Responding.can_transition_to(Phase::Error));
        assert!(!Phase::Done.can_transition_to(Phase::Error));
        assert!(!Phase::Error.can_transition_to(Phase::Thinking));
        assert!(!Phase::Thinking.can_transition_to(Phase::Responding));
    }

    #[test]
    fn test_trace_ignores_illegal() {
        let mut trace = PhaseTrace::new();
        trace.advance(Phase::Extracting);
        trace.advance(Phase::Done);
        trace.advance(Phase::Responding);
        trace.advance(Phase::Done);
        assert_eq!(
            trace.phases(),
            &[Phase::Thinking, Phase::Extracting, Phase::Responding, Phase::Done]
        );
        assert!(trace.current().is_terminal());
    }
}
