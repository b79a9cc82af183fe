use super::GuardTicket;
use crate::lockout::{FailureOutcome, LockoutEngine};
use std::sync::Arc;

/// 结果上报
///
/// 认证处理器每次校验失败调用一次 `report_failure`，成功调用一次 `report_success`。
/// 没有凭据（请求没经过守卫，或存储被禁用）时都是空操作。
#[derive(Clone)]
pub struct OutcomeReporter {
    engine: Arc<LockoutEngine>,
}

impl OutcomeReporter {
    pub fn new(engine: Arc<LockoutEngine>) -> Self {
        Self { engine }
    }

    pub async fn report_failure(&self, ticket: Option<&GuardTicket>) -> Option<FailureOutcome> {
        let ticket = ticket?;
        Some(
            self.engine
                .record_failure(&ticket.endpoint, &ticket.fingerprint)
                .await,
        )
    }

    pub async fn report_success(&self, ticket: Option<&GuardTicket>) {
        if let Some(ticket) = ticket {
            self.engine
                .record_success(&ticket.endpoint, &ticket.fingerprint)
                .await;
        }
    }
}
