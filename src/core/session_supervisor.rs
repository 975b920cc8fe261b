//! 会话监管：交换级取消
//!
//! 持有根 CancellationToken；每次交换领取一个子 token，用户 Ctrl+C 时只取消当前交换，
//! 进程退出时取消根 token 以停止全部交换。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct SessionSupervisor {
    root: CancellationToken,
    current: Mutex<Option<CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            current: Mutex::new(None),
        }
    }

    /// 为新交换创建子 token，并记为当前交换
    pub fn begin_exchange(&self) -> CancellationToken {
        let token = self.root.child_token();
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(token.clone());
        token
    }

    /// 取消当前交换（若有）；返回是否确有交换被取消
    pub fn cancel_current(&self) -> bool {
        let current = self
            .current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match current {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// 取消全部交换（退出时）
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
