//! 模型池：按偏好顺序排列的候选模型，带配额错误标记与当前指针
//!
//! - 候选顺序即偏好顺序（能力最强在前），运行时从不重排，只修改错误标记
//! - 配额耗尽时标记该候选并前移指针到下一个未标记且满足能力要求的候选（环绕）
//! - 所有可变状态在一把互斥锁之后，多个并发交换同时遇到配额错误也不会丢失更新

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::core::AgentError;
use crate::llm::LlmClient;

/// 候选模型
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCandidate {
    pub name: String,
    /// 每日请求额度（仅作展示，额度时钟不在本模块建模）
    pub daily_quota: Option<u32>,
    pub supports_tools: bool,
    pub supports_vision: bool,
    /// 配额耗尽标记；成功调用或 reset_errors 时清除
    pub error_flag: bool,
    /// 连续配额失败次数，用于手动切换的重试预算
    pub quota_failures: u32,
}

impl ModelCandidate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            daily_quota: None,
            supports_tools: true,
            supports_vision: false,
            error_flag: false,
            quota_failures: 0,
        }
    }

    pub fn with_daily_quota(mut self, quota: u32) -> Self {
        self.daily_quota = Some(quota);
        self
    }

    pub fn with_tools(mut self, supported: bool) -> Self {
        self.supports_tools = supported;
        self
    }

    pub fn with_vision(mut self, supported: bool) -> Self {
        self.supports_vision = supported;
        self
    }
}

/// 一次调用对候选能力的要求
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelRequirements {
    pub tools: bool,
    pub vision: bool,
}

impl ModelRequirements {
    pub fn satisfied_by(&self, candidate: &ModelCandidate) -> bool {
        (!self.tools || candidate.supports_tools) && (!self.vision || candidate.supports_vision)
    }

    fn admits(&self, candidate: &ModelCandidate) -> bool {
        !candidate.error_flag && self.satisfied_by(candidate)
    }
}

/// 选中的模型：候选快照 + 对应客户端
#[derive(Clone)]
pub struct ActiveModel {
    pub candidate: ModelCandidate,
    pub client: Arc<dyn LlmClient>,
}

impl std::fmt::Debug for ActiveModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveModel")
            .field("candidate", &self.candidate)
            .finish_non_exhaustive()
    }
}

/// 状态快照（供诊断与切换界面）
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    #[serde(flatten)]
    pub candidate: ModelCandidate,
    pub is_current: bool,
    /// 该后端累计消耗的 token（不统计用量的后端为 0）
    pub total_tokens: u64,
}

struct PoolState {
    candidates: Vec<ModelCandidate>,
    current: usize,
}

impl PoolState {
    fn index_of(&self, name: &str) -> Option<usize> {
        self.candidates.iter().position(|c| c.name == name)
    }

    /// 从 start 之后（环绕，最后检查 start 本身）寻找第一个满足 pred 的候选
    fn find_from(&self, start: usize, pred: impl Fn(&ModelCandidate) -> bool) -> Option<usize> {
        let n = self.candidates.len();
        (1..=n)
            .map(|step| (start + step) % n)
            .find(|&i| pred(&self.candidates[i]))
    }
}

/// 模型池
pub struct ModelPool {
    clients: Vec<Arc<dyn LlmClient>>,
    state: Mutex<PoolState>,
    switch_retry_budget: u32,
}

impl ModelPool {
    /// 创建模型池；候选不能为空，名称不能重复
    pub fn new(
        entries: Vec<(ModelCandidate, Arc<dyn LlmClient>)>,
        switch_retry_budget: u32,
    ) -> Result<Self, AgentError> {
        if entries.is_empty() {
            return Err(AgentError::ConfigError(
                "model pool needs at least one candidate".to_string(),
            ));
        }
        let mut candidates = Vec::with_capacity(entries.len());
        let mut clients = Vec::with_capacity(entries.len());
        for (candidate, client) in entries {
            if candidates.iter().any(|c: &ModelCandidate| c.name == candidate.name) {
                return Err(AgentError::ConfigError(format!(
                    "duplicate model name in pool: {}",
                    candidate.name
                )));
            }
            candidates.push(candidate);
            clients.push(client);
        }
        Ok(Self {
            clients,
            state: Mutex::new(PoolState {
                candidates,
                current: 0,
            }),
            switch_retry_budget,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn active_at(&self, state: &PoolState, index: usize) -> ActiveModel {
        ActiveModel {
            candidate: state.candidates[index].clone(),
            client: Arc::clone(&self.clients[index]),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// 当前候选
    pub fn current(&self) -> ModelCandidate {
        let state = self.lock();
        state.candidates[state.current].clone()
    }

    /// 为一次调用选择模型：当前候选可用则直接返回，否则前移到下一个可用候选
    pub fn select(&self, requirements: ModelRequirements) -> Result<ActiveModel, AgentError> {
        let mut state = self.lock();
        let current = state.current;
        if requirements.admits(&state.candidates[current]) {
            return Ok(self.active_at(&state, current));
        }
        match state.find_from(current, |c| requirements.admits(c)) {
            Some(next) => {
                tracing::info!(
                    from = %state.candidates[current].name,
                    to = %state.candidates[next].name,
                    "model pool advanced to eligible candidate"
                );
                state.current = next;
                Ok(self.active_at(&state, next))
            }
            None => Err(AgentError::NoAvailableModel {
                tried: state.candidates.iter().map(|c| c.name.clone()).collect(),
            }),
        }
    }

    /// 报告配额耗尽：标记该候选，并把当前指针移到下一个未标记且满足要求的候选
    ///
    /// 若其它交换已经把指针移离该候选且当前候选仍然可用，则保持指针不动。
    /// 没有满足要求的候选时返回 NoAvailableModel；此时若仍有未标记候选（只是能力不符），
    /// 指针也会移过去，保证 current() 不会停在已标记的候选上。
    pub fn report_quota_exceeded(
        &self,
        name: &str,
        requirements: ModelRequirements,
    ) -> Result<ActiveModel, AgentError> {
        let mut state = self.lock();
        let Some(index) = state.index_of(name) else {
            return Err(AgentError::UnknownModel(name.to_string()));
        };
        {
            let candidate = &mut state.candidates[index];
            candidate.error_flag = true;
            candidate.quota_failures = candidate.quota_failures.saturating_add(1);
        }
        tracing::warn!(model = %name, "model quota exceeded, flagged");

        let current = state.current;
        if current != index && requirements.admits(&state.candidates[current]) {
            return Ok(self.active_at(&state, current));
        }

        let start = if current == index { index } else { current };
        if let Some(next) = state.find_from(start, |c| requirements.admits(c)) {
            state.current = next;
            tracing::info!(to = %state.candidates[next].name, "model pool rotated");
            return Ok(self.active_at(&state, next));
        }

        if state.candidates[state.current].error_flag {
            if let Some(unflagged) = state.find_from(start, |c| !c.error_flag) {
                state.current = unflagged;
            }
        }
        Err(AgentError::NoAvailableModel {
            tried: state
                .candidates
                .iter()
                .filter(|c| c.error_flag || !requirements.satisfied_by(c))
                .map(|c| c.name.clone())
                .collect(),
        })
    }

    /// 报告成功：清除该候选的错误标记与失败计数
    pub fn report_success(&self, name: &str) {
        let mut state = self.lock();
        if let Some(index) = state.index_of(name) {
            let candidate = &mut state.candidates[index];
            if candidate.error_flag || candidate.quota_failures > 0 {
                tracing::info!(model = %name, "model recovered, error flag cleared");
            }
            candidate.error_flag = false;
            candidate.quota_failures = 0;
        }
    }

    /// 备选候选：返回 name 之后（环绕）第一个未标记、满足要求且不在 exclude 中的候选。
    /// name 本身总被排除；不修改任何状态，也不移动当前指针
    pub fn fallback_for(
        &self,
        name: &str,
        requirements: ModelRequirements,
        exclude: &[String],
    ) -> Option<ActiveModel> {
        let state = self.lock();
        let index = state.index_of(name)?;
        state
            .find_from(index, |c| {
                c.name != name && !exclude.contains(&c.name) && requirements.admits(c)
            })
            .map(|i| self.active_at(&state, i))
    }

    /// 手动切换（操作员 / UI）：模型必须存在，且配额失败次数未超过重试预算。
    /// 成功时清除该候选自身的标记，不影响其它候选的标记。
    pub fn switch_to(&self, name: &str) -> Result<ModelCandidate, AgentError> {
        let mut state = self.lock();
        let Some(index) = state.index_of(name) else {
            return Err(AgentError::UnknownModel(name.to_string()));
        };
        let failures = state.candidates[index].quota_failures;
        if failures > self.switch_retry_budget {
            return Err(AgentError::RetryBudgetExceeded {
                name: name.to_string(),
                failures,
            });
        }
        state.candidates[index].error_flag = false;
        state.current = index;
        tracing::info!(model = %name, "model switched manually");
        Ok(state.candidates[index].clone())
    }

    /// 清除所有错误标记（如每日额度刷新），指针回到首选候选
    pub fn reset_errors(&self) {
        let mut state = self.lock();
        for candidate in state.candidates.iter_mut() {
            candidate.error_flag = false;
            candidate.quota_failures = 0;
        }
        state.current = 0;
        tracing::info!("model pool errors reset");
    }

    pub fn status(&self) -> Vec<ModelStatus> {
        let state = self.lock();
        state
            .candidates
            .iter()
            .enumerate()
            .map(|(i, c)| ModelStatus {
                candidate: c.clone(),
                is_current: i == state.current,
                total_tokens: self.clients[i].token_usage().2,
            })
            .collect()
    }
}
