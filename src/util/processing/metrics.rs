//! 流水线聚合指标
//!
//! 所有计数只在一把互斥锁内修改，锁只覆盖计数更新本身。

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default)]
struct MetricsState {
    active: usize,
    peak_active: usize,
    completed: u64,
    rejected: u64,
    abandoned: u64,
    total_latency: Duration,
    max_latency: Duration,
}

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    state: Mutex<MetricsState>,
}

/// 某一时刻的指标快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub active: usize,
    pub peak_active: usize,
    pub completed: u64,
    pub rejected: u64,
    pub abandoned: u64,
    pub total_latency: Duration,
    pub avg_latency: Duration,
    pub max_latency: Duration,
}

impl MetricsSnapshot {
    /// 已进入终态的工作项数（不含准入前被拒绝的）
    pub fn settled(&self) -> u64 {
        self.completed + self.abandoned
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_admitted(&self) {
        let mut state = self.state.lock();
        state.active += 1;
        state.peak_active = state.peak_active.max(state.active);
    }

    /// 准入前被拒绝
    pub(crate) fn record_rejected(&self) {
        self.state.lock().rejected += 1;
    }

    /// 拿到令牌但未能进入第一阶段
    pub(crate) fn record_rejected_after_admission(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        state.rejected += 1;
    }

    pub(crate) fn record_completed(&self, latency: Duration) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        state.completed += 1;
        state.total_latency += latency;
        state.max_latency = state.max_latency.max(latency);
    }

    pub(crate) fn record_abandoned(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        state.abandoned += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        let avg_latency = average_latency(state.total_latency, state.completed);

        MetricsSnapshot {
            active: state.active,
            peak_active: state.peak_active,
            completed: state.completed,
            rejected: state.rejected,
            abandoned: state.abandoned,
            total_latency: state.total_latency,
            avg_latency,
            max_latency: state.max_latency,
        }
    }
}

fn average_latency(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / count as u128;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}
