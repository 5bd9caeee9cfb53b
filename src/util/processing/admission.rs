//! 准入闸门
//!
//! 全局并发上限的唯一入口。令牌以 `OwnedSemaphorePermit` 实现，
//! 所有权保证每个令牌恰好归还一次。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{sleep, Instant};
use tracing::debug;

use super::error::PipelineError;
use super::item::ItemContext;
use crate::util::logging::standards::events;

#[derive(Debug, Default)]
struct GateCounters {
    acquired: u64,
    released: u64,
}

#[derive(Debug)]
struct GateInner {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    counters: Mutex<GateCounters>,
}

impl GateInner {
    fn record_released(&self) {
        self.counters.lock().released += 1;
    }
}

/// 计数型准入闸门
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

/// 一个单位的系统容量
///
/// 持有即占用；drop 时自动归还。
#[derive(Debug)]
pub struct AdmissionToken {
    permit: Option<OwnedSemaphorePermit>,
    gate: Arc<GateInner>,
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.gate.record_released();
            drop(permit);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub max_concurrent: usize,
    pub available: usize,
    pub acquired: u64,
    pub released: u64,
}

impl GateStats {
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }

    pub fn is_saturated(&self) -> bool {
        self.available == 0
    }
}

impl AdmissionGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
                counters: Mutex::new(GateCounters::default()),
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// 获取一个容量单位
    ///
    /// 在有空位、上下文结束、超时三者中先发生者处返回。失败时不产生副作用。
    pub async fn acquire(
        &self,
        ctx: &ItemContext,
        timeout: Duration,
    ) -> Result<AdmissionToken, PipelineError> {
        let started = Instant::now();
        let semaphore = Arc::clone(&self.inner.semaphore);

        let permit = tokio::select! {
            biased;
            cause = ctx.done() => return Err(PipelineError::Cancelled(cause)),
            acquired = semaphore.acquire_owned() => {
                acquired.map_err(|_| PipelineError::ShuttingDown)?
            }
            _ = sleep(timeout) => {
                return Err(PipelineError::CapacityExceeded {
                    max_concurrent: self.inner.max_concurrent,
                    waited: started.elapsed(),
                });
            }
        };

        Ok(self.issue(permit))
    }

    /// 非阻塞获取
    pub fn try_acquire(&self) -> Result<AdmissionToken, PipelineError> {
        match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(self.issue(permit)),
            Err(TryAcquireError::NoPermits) => Err(PipelineError::CapacityExceeded {
                max_concurrent: self.inner.max_concurrent,
                waited: Duration::ZERO,
            }),
            Err(TryAcquireError::Closed) => Err(PipelineError::ShuttingDown),
        }
    }

    /// 归还令牌，等价于 drop
    pub fn release(&self, token: AdmissionToken) {
        debug_assert!(Arc::ptr_eq(&self.inner, &token.gate));
        drop(token);
    }

    /// 关闭闸门：等待中的和之后的获取都会返回 `ShuttingDown`
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.semaphore.is_closed()
    }

    pub fn stats(&self) -> GateStats {
        let counters = self.inner.counters.lock();
        GateStats {
            max_concurrent: self.inner.max_concurrent,
            available: self.inner.semaphore.available_permits(),
            acquired: counters.acquired,
            released: counters.released,
        }
    }

    fn issue(&self, permit: OwnedSemaphorePermit) -> AdmissionToken {
        self.inner.counters.lock().acquired += 1;
        debug!(
            target: "processing.pipeline",
            event = events::GATE_ACQUIRED,
            remaining_permits = self.inner.semaphore.available_permits()
        );
        AdmissionToken {
            permit: Some(permit),
            gate: Arc::clone(&self.inner),
        }
    }
}
