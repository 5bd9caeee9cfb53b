//! 工作项、阶段结果与单项生命周期

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// 工作项标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item-{}", self.0)
    }
}

/// 上下文结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Interruption {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interruption::Cancelled => f.write_str("context cancelled"),
            Interruption::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// 单个工作项的取消上下文
///
/// 由调用方的取消令牌和可选截止时间组成。工作项在流水线中的每个阻塞点
/// （准入、入队、阶段处理、阶段交接）都会与它赛跑。
#[derive(Debug, Clone, Default)]
pub struct ItemContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ItemContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// 截止时间只会收紧，不会放宽
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// 派生子上下文：父级取消会传递给子级，反之不会
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn interruption(&self) -> Option<Interruption> {
        if self.token.is_cancelled() {
            Some(Interruption::Cancelled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(Interruption::DeadlineExceeded)
        } else {
            None
        }
    }

    pub fn is_done(&self) -> bool {
        self.interruption().is_some()
    }

    /// 等待上下文结束
    pub async fn done(&self) -> Interruption {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Interruption::Cancelled,
                    _ = sleep_until(deadline) => Interruption::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Interruption::Cancelled
            }
        }
    }
}

/// 工作项状态机，只能向前推进
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Admitted,
    InStage1,
    InStage2,
    InStage3,
    Completed,
    Rejected,
    Abandoned,
}

impl ItemState {
    /// 阶段编号从1开始
    pub fn for_stage(stage: usize) -> Self {
        match stage {
            1 => ItemState::InStage1,
            2 => ItemState::InStage2,
            _ => ItemState::InStage3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Completed | ItemState::Rejected | ItemState::Abandoned
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Admitted => "admitted",
            ItemState::InStage1 => "in_stage_1",
            ItemState::InStage2 => "in_stage_2",
            ItemState::InStage3 => "in_stage_3",
            ItemState::Completed => "completed",
            ItemState::Rejected => "rejected",
            ItemState::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 提交时创建的工作项，进入第一阶段队列
#[derive(Debug)]
pub struct WorkItem<P> {
    pub id: ItemId,
    pub payload: P,
    pub created_at: Instant,
    pub ctx: ItemContext,
}

/// 阶段产出，每个阶段替换一次
///
/// `created_at` 保留工作项的原始创建时间，用于端到端延迟统计。
#[derive(Debug)]
pub struct StageResult<P> {
    pub id: ItemId,
    pub payload: P,
    pub stage: usize,
    pub created_at: Instant,
    pub ctx: ItemContext,
}

/// 跨阶段传递且与载荷无关的部分
#[derive(Debug)]
pub(crate) struct Carry {
    pub id: ItemId,
    pub created_at: Instant,
    pub ctx: ItemContext,
}

impl<P> StageResult<P> {
    pub(crate) fn from_carry(carry: Carry, stage: usize, payload: P) -> Self {
        Self {
            id: carry.id,
            payload,
            stage,
            created_at: carry.created_at,
            ctx: carry.ctx,
        }
    }
}

/// 阶段队列中可被 worker 消费的单元
pub(crate) trait StageInput<P>: Send + 'static {
    fn id(&self) -> ItemId;
    fn context(&self) -> &ItemContext;
    fn into_parts(self) -> (P, Carry);
}

impl<P: Send + 'static> StageInput<P> for WorkItem<P> {
    fn id(&self) -> ItemId {
        self.id
    }

    fn context(&self) -> &ItemContext {
        &self.ctx
    }

    fn into_parts(self) -> (P, Carry) {
        (
            self.payload,
            Carry {
                id: self.id,
                created_at: self.created_at,
                ctx: self.ctx,
            },
        )
    }
}

impl<P: Send + 'static> StageInput<P> for StageResult<P> {
    fn id(&self) -> ItemId {
        self.id
    }

    fn context(&self) -> &ItemContext {
        &self.ctx
    }

    fn into_parts(self) -> (P, Carry) {
        (
            self.payload,
            Carry {
                id: self.id,
                created_at: self.created_at,
                ctx: self.ctx,
            },
        )
    }
}

/// 工作项未完成就离开流水线的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    Cancelled,
    DeadlineExceeded,
    Failed(String),
    Panicked(String),
    Shutdown,
    Dropped,
}

impl AbandonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbandonReason::Cancelled => "cancelled",
            AbandonReason::DeadlineExceeded => "deadline_exceeded",
            AbandonReason::Failed(_) => "failed",
            AbandonReason::Panicked(_) => "panicked",
            AbandonReason::Shutdown => "shutdown",
            AbandonReason::Dropped => "dropped",
        }
    }
}

impl From<Interruption> for AbandonReason {
    fn from(value: Interruption) -> Self {
        match value {
            Interruption::Cancelled => AbandonReason::Cancelled,
            Interruption::DeadlineExceeded => AbandonReason::DeadlineExceeded,
        }
    }
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbandonReason::Failed(msg) => write!(f, "failed: {msg}"),
            AbandonReason::Panicked(msg) => write!(f, "panicked: {msg}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// 已准入工作项的终态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome<P> {
    Completed { payload: P, latency: Duration },
    Abandoned { state: ItemState, reason: AbandonReason },
}

impl<P> ItemOutcome<P> {
    pub fn is_completed(&self) -> bool {
        matches!(self, ItemOutcome::Completed { .. })
    }

    pub fn state(&self) -> ItemState {
        match self {
            ItemOutcome::Completed { .. } => ItemState::Completed,
            ItemOutcome::Abandoned { .. } => ItemState::Abandoned,
        }
    }
}

/// 提交成功后返回给调用方的回执
///
/// 丢弃回执不影响工作项的处理。
#[derive(Debug)]
pub struct Receipt<P> {
    id: ItemId,
    outcome: oneshot::Receiver<ItemOutcome<P>>,
}

impl<P> Receipt<P> {
    pub(crate) fn new(id: ItemId, outcome: oneshot::Receiver<ItemOutcome<P>>) -> Self {
        Self { id, outcome }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    /// 等待工作项到达终态
    pub async fn outcome(self) -> ItemOutcome<P> {
        self.outcome.await.unwrap_or(ItemOutcome::Abandoned {
            state: ItemState::Admitted,
            reason: AbandonReason::Dropped,
        })
    }
}
