//! 阶段队列与固定大小的 worker 池
//!
//! 每个阶段 = 一个有界队列 + N 个 worker。worker 一次只取一个工作项，
//! 处理后阻塞地交给下一阶段队列；下游满时的阻塞就是向上游传播的背压。

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::item::{
    AbandonReason, Interruption, ItemContext, ItemId, ItemState, StageInput, StageResult,
};
use super::lease::ItemLease;
use crate::util::logging::standards::events;

/// 单个阶段的业务逻辑
#[async_trait]
pub trait StageHandler<P: Send + 'static>: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// 把一个载荷变换为下一阶段的载荷
    async fn process(&self, id: ItemId, payload: P) -> anyhow::Result<P>;
}

/// 模拟处理耗时的阶段：随机休眠后给载荷加上 `stage{n}-` 前缀
#[derive(Debug, Clone)]
pub struct SimulatedStage {
    name: String,
    stage: usize,
    min_latency: Duration,
    max_latency: Duration,
}

impl SimulatedStage {
    pub fn new(
        name: impl Into<String>,
        stage: usize,
        min_latency: Duration,
        max_latency: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            stage,
            min_latency,
            max_latency: max_latency.max(min_latency),
        }
    }

    pub fn min_latency(&self) -> Duration {
        self.min_latency
    }

    fn pick_delay(&self) -> Duration {
        if self.max_latency <= self.min_latency {
            return self.min_latency;
        }
        let low = self.min_latency.as_nanos() as u64;
        let high = self.max_latency.as_nanos() as u64;
        Duration::from_nanos(rand::thread_rng().gen_range(low..=high))
    }
}

#[async_trait]
impl StageHandler<String> for SimulatedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, _id: ItemId, payload: String) -> anyhow::Result<String> {
        let delay = self.pick_delay();
        sleep(delay).await;
        Ok(format!("stage{}-{}", self.stage, payload))
    }
}

/// 闭包适配器
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> FnStage<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<P, F, Fut> StageHandler<P> for FnStage<F>
where
    P: Send + 'static,
    F: Fn(ItemId, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<P>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, id: ItemId, payload: P) -> anyhow::Result<P> {
        (self.f)(id, payload).await
    }
}

/// 队列中的一个单元：工作内容 + 租约
pub(crate) struct Queued<T, P> {
    pub unit: T,
    pub lease: ItemLease<P>,
}

pub(crate) type Inbox<M> = Arc<AsyncMutex<mpsc::Receiver<M>>>;

#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub stage: usize,
    pub name: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub queued: usize,
}

impl StageStatus {
    pub fn utilization(&self) -> f64 {
        if self.queue_capacity == 0 {
            return 0.0;
        }
        self.queued as f64 / self.queue_capacity as f64
    }
}

/// 有界阶段队列
///
/// 多个 worker 共享同一个接收端，每次只有一个 worker 在等待。
pub(crate) struct StageQueue<M> {
    stage: usize,
    name: Arc<str>,
    workers: usize,
    capacity: usize,
    tx: mpsc::Sender<M>,
    rx: Inbox<M>,
}

impl<M: Send + 'static> StageQueue<M> {
    pub fn new(stage: usize, name: &str, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            stage,
            name: Arc::from(name),
            workers,
            capacity,
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
        }
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn sender(&self) -> &mpsc::Sender<M> {
        &self.tx
    }

    pub fn inbox(&self) -> Inbox<M> {
        Arc::clone(&self.rx)
    }

    pub fn status(&self) -> StageStatus {
        StageStatus {
            stage: self.stage,
            name: self.name.to_string(),
            workers: self.workers,
            queue_capacity: self.capacity,
            queued: self.capacity.saturating_sub(self.tx.capacity()),
        }
    }

    /// 关闭接收端并取出剩余单元，只应在所有 worker 退出后调用
    pub async fn close_and_drain(&self) -> Vec<M> {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut leftovers = Vec::new();
        while let Some(message) = rx.recv().await {
            leftovers.push(message);
        }
        leftovers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandoffFailure {
    Shutdown,
    Interrupted(Interruption),
    TimedOut(Duration),
    Closed,
}

impl HandoffFailure {
    pub fn abandon_reason(&self) -> AbandonReason {
        match self {
            HandoffFailure::Interrupted(cause) => (*cause).into(),
            HandoffFailure::TimedOut(_) => AbandonReason::Failed("handoff timed out".to_string()),
            HandoffFailure::Shutdown | HandoffFailure::Closed => AbandonReason::Shutdown,
        }
    }
}

/// 阻塞地把单元交给下游队列
///
/// 与工作项上下文、停机信号、可选超时赛跑。失败时原样交还单元。
pub(crate) async fn hand_off<M>(
    tx: &mpsc::Sender<M>,
    message: M,
    ctx: &ItemContext,
    shutdown: &CancellationToken,
    limit: Option<Duration>,
) -> Result<(), (HandoffFailure, M)> {
    let started = Instant::now();
    let window = async move {
        match limit {
            Some(limit) => sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err((HandoffFailure::Shutdown, message)),
        cause = ctx.done() => Err((HandoffFailure::Interrupted(cause), message)),
        reserved = tx.reserve() => match reserved {
            Ok(permit) => {
                permit.send(message);
                Ok(())
            }
            Err(_) => Err((HandoffFailure::Closed, message)),
        },
        _ = window => Err((HandoffFailure::TimedOut(started.elapsed()), message)),
    }
}

pub(crate) enum Downstream<P> {
    Next(mpsc::Sender<Queued<StageResult<P>, P>>),
    Sink { slow_threshold: Duration },
}

impl<P> Clone for Downstream<P> {
    fn clone(&self) -> Self {
        match self {
            Downstream::Next(tx) => Downstream::Next(tx.clone()),
            Downstream::Sink { slow_threshold } => Downstream::Sink {
                slow_threshold: *slow_threshold,
            },
        }
    }
}

pub(crate) struct StageWorker<T, P: Send + 'static> {
    pub stage: usize,
    pub worker_id: usize,
    pub name: Arc<str>,
    pub handler: Arc<dyn StageHandler<P>>,
    pub inbox: Inbox<Queued<T, P>>,
    pub downstream: Downstream<P>,
    pub shutdown: CancellationToken,
}

impl<T, P> StageWorker<T, P>
where
    T: StageInput<P>,
    P: Send + 'static,
{
    pub async fn run(self) {
        debug!(
            target: "processing.pipeline",
            event = events::WORKER_START,
            stage = %self.name,
            worker = self.worker_id
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = recv_shared(&self.inbox) => next,
            };
            let Some(queued) = next else {
                break;
            };
            self.handle(queued).await;
        }

        debug!(
            target: "processing.pipeline",
            event = events::WORKER_EXIT,
            stage = %self.name,
            worker = self.worker_id
        );
    }

    async fn handle(&self, queued: Queued<T, P>) {
        let Queued { unit, lease } = queued;

        // 排队期间已被上下文观察任务结算
        if lease.is_settled() {
            debug!(
                target: "processing.pipeline",
                event = events::PIPELINE_STAGE,
                stage = %self.name,
                item = %unit.id(),
                "discard settled item"
            );
            return;
        }
        if let Some(cause) = unit.context().interruption() {
            lease.abandon(cause.into());
            return;
        }

        let (payload, carry) = unit.into_parts();
        let id = carry.id;
        let started = Instant::now();

        let processed = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                lease.abandon(AbandonReason::Shutdown);
                return;
            }
            cause = carry.ctx.done() => {
                lease.abandon(cause.into());
                return;
            }
            result = AssertUnwindSafe(self.handler.process(id, payload)).catch_unwind() => result,
        };

        let payload = match processed {
            Ok(Ok(payload)) => payload,
            Ok(Err(err)) => {
                warn!(
                    target: "processing.pipeline",
                    event = events::PIPELINE_ERROR,
                    stage = %self.name,
                    item = %id,
                    error = %err
                );
                lease.abandon(AbandonReason::Failed(format!("{err:#}")));
                return;
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    target: "processing.pipeline",
                    event = events::WORKER_PANIC,
                    stage = %self.name,
                    worker = self.worker_id,
                    item = %id,
                    reason = %message
                );
                lease.abandon(AbandonReason::Panicked(message));
                return;
            }
        };

        debug!(
            target: "processing.pipeline",
            event = events::PIPELINE_STAGE,
            stage = %self.name,
            item = %id,
            duration_ms = started.elapsed().as_millis() as u64
        );

        match &self.downstream {
            Downstream::Sink { slow_threshold } => {
                let latency = carry.created_at.elapsed();
                if lease.complete(payload, latency) && latency > *slow_threshold {
                    warn!(
                        target: "processing.pipeline",
                        event = events::PIPELINE_SLOW,
                        item = %id,
                        latency_ms = latency.as_millis() as u64,
                        "slow but controlled"
                    );
                }
            }
            Downstream::Next(tx) => {
                // 状态在交接前推进：排队等待下一阶段即视为处于下一阶段
                if !lease.enter(ItemState::for_stage(self.stage + 1)) {
                    return;
                }
                let ctx = carry.ctx.clone();
                let result = StageResult::from_carry(carry, self.stage, payload);
                let message = Queued {
                    unit: result,
                    lease: lease.clone(),
                };
                if let Err((failure, _message)) =
                    hand_off(tx, message, &ctx, &self.shutdown, None).await
                {
                    lease.abandon(failure.abandon_reason());
                }
            }
        }
    }
}

async fn recv_shared<M>(inbox: &AsyncMutex<mpsc::Receiver<M>>) -> Option<M> {
    inbox.lock().await.recv().await
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    }
}
