//! 流水线错误类型

use std::time::Duration;

use thiserror::Error;

use super::item::Interruption;

/// 提交与生命周期错误
///
/// 所有变体都只影响单个请求：不会 panic，也不会泄漏准入令牌。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// 准入闸门在等待窗口内没有空位
    #[error("system at capacity ({max_concurrent} in flight), waited {waited:?} - try again later")]
    CapacityExceeded {
        max_concurrent: usize,
        waited: Duration,
    },

    /// 第一阶段队列在交接窗口内一直是满的
    #[error("stage `{stage}` backed up after {waited:?} - system degraded")]
    StageBackedUp { stage: String, waited: Duration },

    /// 调用方上下文在准入或交接完成前结束
    #[error("request cancelled: {0}")]
    Cancelled(Interruption),

    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error("coordinator already started")]
    AlreadyStarted,

    #[error("invalid coordinator config: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    /// 调用方可以稍后重试（或主动降级）的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::CapacityExceeded { .. } | PipelineError::StageBackedUp { .. }
        )
    }

    /// 稳定的短标签，用于日志字段
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::CapacityExceeded { .. } => "capacity_exceeded",
            PipelineError::StageBackedUp { .. } => "stage_backed_up",
            PipelineError::Cancelled(_) => "cancelled",
            PipelineError::ShuttingDown => "shutting_down",
            PipelineError::AlreadyStarted => "already_started",
            PipelineError::InvalidConfig(_) => "invalid_config",
        }
    }
}
