//! 已准入工作项的租约
//!
//! 租约持有准入令牌和终态通知通道。worker 与上下文观察任务都可能尝试结算，
//! 谁先取走令牌谁生效，因此令牌恰好释放一次、终态恰好产生一次。
//! 租约在未结算时被 drop（例如队列被整体丢弃）会按 `Dropped` 放弃处理。

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::admission::AdmissionToken;
use super::item::{AbandonReason, ItemContext, ItemId, ItemOutcome, ItemState, Receipt};
use super::metrics::PipelineMetrics;
use crate::util::logging::standards::events;

struct Ticket<P> {
    token: AdmissionToken,
    outcome: oneshot::Sender<ItemOutcome<P>>,
}

struct LeaseSlot<P> {
    state: ItemState,
    ticket: Option<Ticket<P>>,
}

struct LeaseInner<P> {
    id: ItemId,
    metrics: Arc<PipelineMetrics>,
    settled: CancellationToken,
    slot: Mutex<LeaseSlot<P>>,
}

enum Settlement<P> {
    Completed { payload: P, latency: Duration },
    Abandoned(AbandonReason),
    Rejected,
}

impl<P> LeaseInner<P> {
    fn finish(&self, ticket: Ticket<P>, previous: ItemState, settlement: Settlement<P>) {
        // 先更新指标再归还令牌：active 永远不超过未归还的令牌数
        let outcome = match settlement {
            Settlement::Completed { payload, latency } => {
                self.metrics.record_completed(latency);
                debug!(
                    target: "processing.pipeline",
                    event = events::ITEM_COMPLETE,
                    item = %self.id,
                    latency_ms = latency.as_millis() as u64
                );
                Some(ItemOutcome::Completed { payload, latency })
            }
            Settlement::Abandoned(reason) => {
                self.metrics.record_abandoned();
                warn!(
                    target: "processing.pipeline",
                    event = events::ITEM_ABANDONED,
                    item = %self.id,
                    state = %previous,
                    reason = %reason
                );
                Some(ItemOutcome::Abandoned {
                    state: previous,
                    reason,
                })
            }
            Settlement::Rejected => {
                self.metrics.record_rejected_after_admission();
                None
            }
        };

        drop(ticket.token);
        if let Some(outcome) = outcome {
            // 回执可能已被调用方丢弃
            let _ = ticket.outcome.send(outcome);
        }
        self.settled.cancel();
    }
}

impl<P> Drop for LeaseInner<P> {
    fn drop(&mut self) {
        let slot = self.slot.get_mut();
        if let Some(ticket) = slot.ticket.take() {
            let previous = slot.state;
            slot.state = ItemState::Abandoned;
            self.finish(
                ticket,
                previous,
                Settlement::Abandoned(AbandonReason::Dropped),
            );
        }
    }
}

pub(crate) struct ItemLease<P> {
    inner: Arc<LeaseInner<P>>,
}

impl<P> Clone for ItemLease<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Send + 'static> ItemLease<P> {
    /// 为刚拿到令牌的工作项建立租约
    pub fn admit(
        id: ItemId,
        token: AdmissionToken,
        metrics: Arc<PipelineMetrics>,
    ) -> (Self, Receipt<P>) {
        let (tx, rx) = oneshot::channel();
        metrics.record_admitted();

        let lease = Self {
            inner: Arc::new(LeaseInner {
                id,
                metrics,
                settled: CancellationToken::new(),
                slot: Mutex::new(LeaseSlot {
                    state: ItemState::Admitted,
                    ticket: Some(Ticket {
                        token,
                        outcome: tx,
                    }),
                }),
            }),
        };

        (lease, Receipt::new(id, rx))
    }

    pub fn id(&self) -> ItemId {
        self.inner.id
    }

    pub fn state(&self) -> ItemState {
        self.inner.slot.lock().state
    }

    pub fn is_settled(&self) -> bool {
        self.inner.settled.is_cancelled()
    }

    /// 推进到下一个非终态，已结算时返回 false
    pub fn enter(&self, next: ItemState) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.ticket.is_none() {
            return false;
        }
        debug_assert!(!next.is_terminal() && next > slot.state);
        slot.state = next;
        true
    }

    pub fn complete(&self, payload: P, latency: Duration) -> bool {
        self.settle(
            ItemState::Completed,
            Settlement::Completed { payload, latency },
        )
    }

    pub fn abandon(&self, reason: AbandonReason) -> bool {
        self.settle(ItemState::Abandoned, Settlement::Abandoned(reason))
    }

    pub fn reject(&self) -> bool {
        self.settle(ItemState::Rejected, Settlement::Rejected)
    }

    pub fn watcher(&self) -> LeaseWatcher<P> {
        LeaseWatcher {
            lease: Arc::downgrade(&self.inner),
            settled: self.inner.settled.clone(),
        }
    }

    fn settle(&self, terminal: ItemState, settlement: Settlement<P>) -> bool {
        let (ticket, previous) = {
            let mut slot = self.inner.slot.lock();
            let Some(ticket) = slot.ticket.take() else {
                return false;
            };
            let previous = slot.state;
            slot.state = terminal;
            (ticket, previous)
        };

        self.inner.finish(ticket, previous, settlement);
        true
    }
}

/// 在工作项排队期间监听其上下文
///
/// 只持有弱引用：工作项结算或被丢弃后观察任务随即退出。
pub(crate) struct LeaseWatcher<P> {
    lease: Weak<LeaseInner<P>>,
    settled: CancellationToken,
}

impl<P: Send + 'static> LeaseWatcher<P> {
    pub async fn watch(self, ctx: ItemContext, shutdown: CancellationToken) {
        tokio::select! {
            biased;
            _ = self.settled.cancelled() => {}
            _ = shutdown.cancelled() => {}
            cause = ctx.done() => {
                if let Some(inner) = self.lease.upgrade() {
                    ItemLease { inner }.abandon(cause.into());
                }
            }
        }
    }
}
