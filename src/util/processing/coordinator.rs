//! 三阶段工作协调器
//!
//! 准入闸门 + 三个有界阶段队列 + 固定 worker 池。
//! 提交路径同步地完成准入和第一阶段入队，之后的处理全部异步进行。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::admission::{AdmissionGate, GateStats};
use super::error::PipelineError;
use super::item::{
    AbandonReason, ItemContext, ItemId, ItemState, Receipt, StageInput, StageResult, WorkItem,
};
use super::lease::ItemLease;
use super::metrics::{MetricsSnapshot, PipelineMetrics};
use super::stage::{
    hand_off, Downstream, HandoffFailure, Queued, StageHandler, StageQueue, StageStatus,
    StageWorker,
};
use crate::util::logging::standards::events;

pub const STAGE_COUNT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSettings {
    pub name: String,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl StageSettings {
    pub fn new(name: impl Into<String>, workers: usize, queue_capacity: usize) -> Self {
        Self {
            name: name.into(),
            workers,
            queue_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// 同时在流水线中的最大工作项数
    pub max_concurrent: usize,
    /// 等待准入令牌的上限
    pub admission_timeout: Duration,
    /// 进入第一阶段队列的等待上限
    pub handoff_timeout: Duration,
    /// 超过该端到端延迟的完成项记录告警
    pub slow_item_threshold: Duration,
    pub stages: [StageSettings; STAGE_COUNT],
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 50,
            admission_timeout: Duration::from_millis(100),
            handoff_timeout: Duration::from_secs(1),
            slow_item_threshold: Duration::from_secs(2),
            stages: [
                StageSettings::new("stage1", 5, 5),
                StageSettings::new("stage2", 3, 3),
                StageSettings::new("stage3", 2, 2),
            ],
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_concurrent == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.admission_timeout.is_zero() {
            return Err(PipelineError::InvalidConfig(
                "admission_timeout must be positive".to_string(),
            ));
        }
        if self.handoff_timeout.is_zero() {
            return Err(PipelineError::InvalidConfig(
                "handoff_timeout must be positive".to_string(),
            ));
        }
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.workers == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "stage {} ({}) needs at least one worker",
                    index + 1,
                    stage.name
                )));
            }
            if stage.queue_capacity == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "stage {} ({}) needs a queue capacity of at least 1",
                    index + 1,
                    stage.name
                )));
            }
        }
        Ok(())
    }

    pub fn total_workers(&self) -> usize {
        self.stages.iter().map(|s| s.workers).sum()
    }
}

/// 整体负载视图
#[derive(Debug, Clone, Serialize)]
pub struct SystemLoadInfo {
    pub total_active_items: usize,
    pub max_concurrent: usize,
    pub system_utilization_percent: f64,
    pub bottleneck_stage: Option<String>,
    pub can_accept_new_items: bool,
    pub stages: Vec<StageStatus>,
}

type Stage1Queue<P> = StageQueue<Queued<WorkItem<P>, P>>;
type LaterQueue<P> = StageQueue<Queued<StageResult<P>, P>>;

pub struct WorkCoordinator<P: Send + 'static> {
    config: CoordinatorConfig,
    gate: AdmissionGate,
    metrics: Arc<PipelineMetrics>,
    handlers: [Arc<dyn StageHandler<P>>; STAGE_COUNT],
    stage1: Stage1Queue<P>,
    stage2: LaterQueue<P>,
    stage3: LaterQueue<P>,
    shutdown: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    next_id: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: Send + 'static> WorkCoordinator<P> {
    pub fn new(
        config: CoordinatorConfig,
        handlers: [Arc<dyn StageHandler<P>>; STAGE_COUNT],
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let [s1, s2, s3] = &config.stages;
        let stage1 = StageQueue::new(1, &s1.name, s1.workers, s1.queue_capacity);
        let stage2 = StageQueue::new(2, &s2.name, s2.workers, s2.queue_capacity);
        let stage3 = StageQueue::new(3, &s3.name, s3.workers, s3.queue_capacity);

        Ok(Self {
            gate: AdmissionGate::new(config.max_concurrent),
            metrics: Arc::new(PipelineMetrics::new()),
            handlers,
            stage1,
            stage2,
            stage3,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// 提交一个工作项
    ///
    /// 先在准入窗口内拿令牌，再在交接窗口内进入第一阶段队列；任一步失败都会
    /// 归还令牌并返回错误。成功时立即返回回执，处理异步进行。
    pub async fn submit(&self, ctx: ItemContext, payload: P) -> Result<Receipt<P>, PipelineError> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }
        let submitted_at = Instant::now();

        let token = match self.gate.acquire(&ctx, self.config.admission_timeout).await {
            Ok(token) => token,
            Err(err) => {
                if err != PipelineError::ShuttingDown {
                    self.metrics.record_rejected();
                }
                warn!(
                    target: "processing.pipeline",
                    event = events::ITEM_REJECTED,
                    kind = err.kind(),
                    error = %err
                );
                return Err(err);
            }
        };

        // 端到端延迟从拿到令牌开始计算，不含准入等待
        let created_at = Instant::now();
        let id = ItemId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (lease, receipt) = ItemLease::admit(id, token, Arc::clone(&self.metrics));
        lease.enter(ItemState::InStage1);

        let message = Queued {
            unit: WorkItem {
                id,
                payload,
                created_at,
                ctx: ctx.clone(),
            },
            lease: lease.clone(),
        };

        match hand_off(
            self.stage1.sender(),
            message,
            &ctx,
            &self.shutdown,
            Some(self.config.handoff_timeout),
        )
        .await
        {
            Ok(()) => {
                debug!(
                    target: "processing.pipeline",
                    event = events::ITEM_ADMITTED,
                    item = %id,
                    wait_ms = submitted_at.elapsed().as_millis() as u64
                );
                tokio::spawn(lease.watcher().watch(ctx, self.shutdown.clone()));
                Ok(receipt)
            }
            Err((failure, message)) => {
                lease.reject();
                drop(message);
                let err = match failure {
                    HandoffFailure::TimedOut(waited) => PipelineError::StageBackedUp {
                        stage: self.stage1.name().to_string(),
                        waited,
                    },
                    HandoffFailure::Interrupted(cause) => PipelineError::Cancelled(cause),
                    HandoffFailure::Shutdown | HandoffFailure::Closed => {
                        PipelineError::ShuttingDown
                    }
                };
                warn!(
                    target: "processing.pipeline",
                    event = events::ITEM_REJECTED,
                    item = %id,
                    kind = err.kind(),
                    error = %err
                );
                Err(err)
            }
        }
    }

    /// 启动所有阶段的 worker 池，需要在 tokio 运行时内调用
    pub fn start(&self) -> Result<(), PipelineError> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            error!(
                target: "processing.pipeline",
                event = events::COORDINATOR_START,
                "coordinator started twice"
            );
            return Err(PipelineError::AlreadyStarted);
        }

        let slow_threshold = self.config.slow_item_threshold;
        let mut handles = Vec::with_capacity(self.config.total_workers());
        handles.extend(self.spawn_pool(
            &self.stage1,
            &self.handlers[0],
            Downstream::Next(self.stage2.sender().clone()),
        ));
        handles.extend(self.spawn_pool(
            &self.stage2,
            &self.handlers[1],
            Downstream::Next(self.stage3.sender().clone()),
        ));
        handles.extend(self.spawn_pool(
            &self.stage3,
            &self.handlers[2],
            Downstream::Sink { slow_threshold },
        ));
        self.workers.lock().extend(handles);

        info!(
            target: "processing.pipeline",
            event = events::COORDINATOR_START,
            max_concurrent = self.config.max_concurrent,
            stage1_workers = self.stage1.workers(),
            stage2_workers = self.stage2.workers(),
            stage3_workers = self.stage3.workers(),
            "[ok] 工作协调器已启动"
        );
        Ok(())
    }

    fn spawn_pool<T: StageInput<P>>(
        &self,
        queue: &StageQueue<Queued<T, P>>,
        handler: &Arc<dyn StageHandler<P>>,
        downstream: Downstream<P>,
    ) -> Vec<JoinHandle<()>> {
        (0..queue.workers())
            .map(|worker_id| {
                let worker = StageWorker {
                    stage: queue.stage(),
                    worker_id,
                    name: Arc::clone(queue.name()),
                    handler: Arc::clone(handler),
                    inbox: queue.inbox(),
                    downstream: downstream.clone(),
                    shutdown: self.shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }

    /// 停机：发出信号、关闭闸门、等待所有 worker 退出，再把队列中剩余的工作项
    /// 全部放弃。返回后 `acquired == released`。重复调用直接返回。
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            target: "processing.pipeline",
            event = events::COORDINATOR_STOP,
            "正在停止工作协调器"
        );

        self.shutdown.cancel();
        self.gate.close();

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                error!(
                    target: "processing.pipeline",
                    event = events::COORDINATOR_STOP,
                    error = %err,
                    "worker 任务异常退出"
                );
            }
        }

        let mut drained = abandon_all(self.stage1.close_and_drain().await);
        drained += abandon_all(self.stage2.close_and_drain().await);
        drained += abandon_all(self.stage3.close_and_drain().await);

        let snapshot = self.metrics.snapshot();
        let gate = self.gate.stats();
        info!(
            target: "processing.pipeline",
            event = events::COORDINATOR_STOP,
            drained,
            completed = snapshot.completed,
            rejected = snapshot.rejected,
            abandoned = snapshot.abandoned,
            acquired = gate.acquired,
            released = gate.released,
            "[ok] 工作协调器已停止"
        );
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shutdown.is_cancelled()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn gate_stats(&self) -> GateStats {
        self.gate.stats()
    }

    pub fn stage_status(&self) -> Vec<StageStatus> {
        vec![
            self.stage1.status(),
            self.stage2.status(),
            self.stage3.status(),
        ]
    }

    pub fn load_info(&self) -> SystemLoadInfo {
        let gate = self.gate.stats();
        let stages = self.stage_status();
        let active = gate.outstanding() as usize;

        SystemLoadInfo {
            total_active_items: active,
            max_concurrent: gate.max_concurrent,
            system_utilization_percent: active as f64 / gate.max_concurrent as f64 * 100.0,
            bottleneck_stage: identify_bottleneck_stage(&stages),
            can_accept_new_items: !self.shutdown.is_cancelled()
                && gate.available > 0
                && stages[0].queued < stages[0].queue_capacity,
            stages,
        }
    }
}

impl<P: Send + 'static> Drop for WorkCoordinator<P> {
    fn drop(&mut self) {
        // worker 退出后队列随之释放，未结算的租约按 Dropped 处理
        self.shutdown.cancel();
    }
}

fn abandon_all<T, P: Send + 'static>(leftovers: Vec<Queued<T, P>>) -> usize {
    leftovers
        .into_iter()
        .filter(|queued| queued.lease.abandon(AbandonReason::Shutdown))
        .count()
}

/// 队列占用率最高的阶段；并列时取更靠下游的阶段，全部空闲时为 None
fn identify_bottleneck_stage(stages: &[StageStatus]) -> Option<String> {
    let mut bottleneck: Option<&StageStatus> = None;
    for stage in stages.iter().filter(|s| s.queued > 0) {
        match bottleneck {
            Some(current) if stage.utilization() < current.utilization() => {}
            _ => bottleneck = Some(stage),
        }
    }
    bottleneck.map(|s| s.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::processing::item::{Interruption, ItemOutcome};
    use crate::util::processing::stage::{FnStage, SimulatedStage};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;
    use tokio::time::sleep;

    /// 进入后一直阻塞，直到测试放行
    struct StalledStage {
        entered: Arc<AtomicUsize>,
        release: Arc<Semaphore>,
    }

    impl StalledStage {
        fn new() -> (Self, Arc<AtomicUsize>, Arc<Semaphore>) {
            let entered = Arc::new(AtomicUsize::new(0));
            let release = Arc::new(Semaphore::new(0));
            (
                Self {
                    entered: Arc::clone(&entered),
                    release: Arc::clone(&release),
                },
                entered,
                release,
            )
        }
    }

    #[async_trait]
    impl StageHandler<u32> for StalledStage {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn process(&self, _id: ItemId, payload: u32) -> anyhow::Result<u32> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            self.release.acquire().await?.forget();
            Ok(payload)
        }
    }

    fn instant() -> Arc<dyn StageHandler<u32>> {
        Arc::new(FnStage::new("instant", |_id: ItemId, n: u32| async move {
            Ok::<_, anyhow::Error>(n + 1)
        }))
    }

    fn config(max_concurrent: usize, workers: [usize; 3], capacity: [usize; 3]) -> CoordinatorConfig {
        CoordinatorConfig {
            max_concurrent,
            admission_timeout: Duration::from_secs(5),
            handoff_timeout: Duration::from_secs(5),
            slow_item_threshold: Duration::from_secs(2),
            stages: [
                StageSettings::new("stage1", workers[0], capacity[0]),
                StageSettings::new("stage2", workers[1], capacity[1]),
                StageSettings::new("stage3", workers[2], capacity[2]),
            ],
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_back_to_back_submits_complete_without_deadlock() {
        let coordinator =
            WorkCoordinator::new(config(2, [1, 1, 1], [1, 1, 1]), [instant(), instant(), instant()])
                .unwrap();
        coordinator.start().unwrap();

        let mut receipts = Vec::new();
        for n in 0..5 {
            receipts.push(coordinator.submit(ItemContext::new(), n).await.unwrap());
        }

        let outcomes = tokio::time::timeout(
            Duration::from_secs(5),
            futures::future::join_all(receipts.into_iter().map(|r| r.outcome())),
        )
        .await
        .expect("pipeline deadlocked");

        for (n, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                ItemOutcome::Completed { payload, .. } => assert_eq!(payload, n as u32 + 3),
                other => panic!("item {n} not completed: {other:?}"),
            }
        }

        let metrics = coordinator.metrics();
        assert_eq!(metrics.completed, 5);
        assert_eq!(metrics.active, 0);
        assert!(metrics.peak_active <= 2);
        let gate = coordinator.gate_stats();
        assert_eq!(gate.acquired, 5);
        assert_eq!(gate.released, 5);
        coordinator.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_exceeded_while_item_stalled() {
        let (stalled, entered, release) = StalledStage::new();
        let mut cfg = config(1, [1, 1, 1], [1, 1, 1]);
        cfg.admission_timeout = Duration::from_millis(50);
        let coordinator = WorkCoordinator::new(cfg, [Arc::new(stalled), instant(), instant()]).unwrap();
        coordinator.start().unwrap();

        let a = coordinator.submit(ItemContext::new(), 1).await.unwrap();
        wait_until(|| entered.load(Ordering::SeqCst) == 1).await;

        let started = std::time::Instant::now();
        let err = coordinator.submit(ItemContext::new(), 2).await.unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(err, PipelineError::CapacityExceeded { max_concurrent: 1, .. }));
        assert!(err.is_retryable());
        assert!(waited >= Duration::from_millis(45));
        assert!(waited < Duration::from_millis(500));
        assert_eq!(coordinator.metrics().rejected, 1);

        release.add_permits(1);
        assert!(a.outcome().await.is_completed());
        assert_eq!(coordinator.metrics().active, 0);
        coordinator.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_item_waiting_in_stage2_queue() {
        let (stalled, entered, release) = StalledStage::new();
        let coordinator = WorkCoordinator::new(
            config(4, [1, 1, 1], [2, 2, 2]),
            [instant(), Arc::new(stalled), instant()],
        )
        .unwrap();
        coordinator.start().unwrap();

        let a = coordinator.submit(ItemContext::new(), 1).await.unwrap();
        wait_until(|| entered.load(Ordering::SeqCst) == 1).await;

        let ctx_b = ItemContext::new();
        let b = coordinator.submit(ctx_b.clone(), 2).await.unwrap();
        wait_until(|| coordinator.stage_status()[1].queued == 1).await;
        assert_eq!(coordinator.gate_stats().outstanding(), 2);

        ctx_b.cancel();
        assert_eq!(
            b.outcome().await,
            ItemOutcome::Abandoned {
                state: ItemState::InStage2,
                reason: AbandonReason::Cancelled,
            }
        );
        assert_eq!(coordinator.gate_stats().outstanding(), 1);
        assert_eq!(coordinator.metrics().abandoned, 1);

        // 其他工作项不受影响
        release.add_permits(1);
        match a.outcome().await {
            ItemOutcome::Completed { payload, .. } => assert_eq!(payload, 3),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let metrics = coordinator.metrics();
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.abandoned, 1);
        assert_eq!(metrics.active, 0);
        coordinator.stop().await;
        // 被取消的工作项仍在队列中，worker 取到后直接丢弃，不会再次进入 stage2
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_active_never_exceeds_max_under_overload() {
        let slow = || -> Arc<dyn StageHandler<u32>> {
            Arc::new(FnStage::new("slow", |_id: ItemId, n: u32| async move {
                sleep(Duration::from_millis(5)).await;
                Ok::<_, anyhow::Error>(n)
            }))
        };
        let mut cfg = config(3, [2, 2, 1], [2, 2, 1]);
        cfg.admission_timeout = Duration::from_millis(20);
        cfg.handoff_timeout = Duration::from_millis(20);
        let coordinator = Arc::new(WorkCoordinator::new(cfg, [slow(), slow(), slow()]).unwrap());
        coordinator.start().unwrap();

        let sampler = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                for _ in 0..100 {
                    let metrics = coordinator.metrics();
                    let gate = coordinator.gate_stats();
                    assert!(metrics.active <= 3);
                    assert!(gate.outstanding() <= 3);
                    sleep(Duration::from_millis(2)).await;
                }
            })
        };

        let submits = (0..30u32).map(|n| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                match coordinator.submit(ItemContext::new(), n).await {
                    Ok(receipt) => Some(receipt.outcome().await),
                    Err(err) => {
                        assert!(err.is_retryable(), "unexpected error: {err}");
                        None
                    }
                }
            })
        });
        let results = futures::future::join_all(submits).await;
        sampler.await.unwrap();

        let completed = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|outcome| matches!(outcome, Some(o) if o.is_completed()))
            .count() as u64;

        let metrics = coordinator.metrics();
        assert_eq!(metrics.completed, completed);
        assert_eq!(metrics.completed + metrics.rejected, 30);
        assert_eq!(metrics.abandoned, 0);
        assert_eq!(metrics.active, 0);
        assert!(metrics.peak_active <= 3);
        let gate = coordinator.gate_stats();
        assert_eq!(gate.acquired - gate.released, metrics.active as u64);
        coordinator.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_latency_covers_stage_minimums() {
        let stages: [Arc<dyn StageHandler<String>>; 3] = [
            Arc::new(SimulatedStage::new(
                "stage1",
                1,
                Duration::from_millis(10),
                Duration::from_millis(20),
            )),
            Arc::new(SimulatedStage::new(
                "stage2",
                2,
                Duration::from_millis(20),
                Duration::from_millis(30),
            )),
            Arc::new(SimulatedStage::new(
                "stage3",
                3,
                Duration::from_millis(30),
                Duration::from_millis(40),
            )),
        ];
        let coordinator = WorkCoordinator::new(CoordinatorConfig::default(), stages).unwrap();
        coordinator.start().unwrap();

        let receipt = coordinator
            .submit(ItemContext::new(), "req".to_string())
            .await
            .unwrap();
        match receipt.outcome().await {
            ItemOutcome::Completed { payload, latency } => {
                assert_eq!(payload, "stage3-stage2-stage1-req");
                assert!(latency >= Duration::from_millis(60));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(coordinator.metrics().avg_latency >= Duration::from_millis(60));
        coordinator.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panicking_handler_only_abandons_its_item() {
        let fragile: Arc<dyn StageHandler<u32>> =
            Arc::new(FnStage::new("fragile", |_id: ItemId, n: u32| async move {
                if n == 1 {
                    panic!("boom");
                }
                Ok::<_, anyhow::Error>(n)
            }));
        let coordinator =
            WorkCoordinator::new(config(4, [1, 1, 1], [2, 2, 2]), [instant(), fragile, instant()])
                .unwrap();
        coordinator.start().unwrap();

        let first = coordinator.submit(ItemContext::new(), 0).await.unwrap();
        let second = coordinator.submit(ItemContext::new(), 5).await.unwrap();

        assert_eq!(
            first.outcome().await,
            ItemOutcome::Abandoned {
                state: ItemState::InStage2,
                reason: AbandonReason::Panicked("boom".to_string()),
            }
        );
        // 同一个 worker 继续处理后续工作项
        assert!(second.outcome().await.is_completed());

        let metrics = coordinator.metrics();
        assert_eq!(metrics.abandoned, 1);
        assert_eq!(metrics.completed, 1);
        assert_eq!(coordinator.gate_stats().outstanding(), 0);
        coordinator.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_handler_error_abandons_item() {
        let failing: Arc<dyn StageHandler<u32>> =
            Arc::new(FnStage::new("failing", |_id: ItemId, _n: u32| async move {
                Err::<u32, _>(anyhow::anyhow!("downstream unavailable"))
            }));
        let coordinator =
            WorkCoordinator::new(config(2, [1, 1, 1], [1, 1, 1]), [instant(), instant(), failing])
                .unwrap();
        coordinator.start().unwrap();

        let receipt = coordinator.submit(ItemContext::new(), 7).await.unwrap();
        match receipt.outcome().await {
            ItemOutcome::Abandoned {
                state: ItemState::InStage3,
                reason: AbandonReason::Failed(msg),
            } => assert!(msg.contains("downstream unavailable")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(coordinator.metrics().active, 0);
        coordinator.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_deadline_expires_while_queued() {
        let (stalled, entered, release) = StalledStage::new();
        let coordinator = WorkCoordinator::new(
            config(4, [1, 1, 1], [2, 2, 2]),
            [Arc::new(stalled), instant(), instant()],
        )
        .unwrap();
        coordinator.start().unwrap();

        let a = coordinator.submit(ItemContext::new(), 1).await.unwrap();
        wait_until(|| entered.load(Ordering::SeqCst) == 1).await;

        let b = coordinator
            .submit(ItemContext::new().with_timeout(Duration::from_millis(30)), 2)
            .await
            .unwrap();
        assert_eq!(
            b.outcome().await,
            ItemOutcome::Abandoned {
                state: ItemState::InStage1,
                reason: AbandonReason::DeadlineExceeded,
            }
        );

        release.add_permits(1);
        assert!(a.outcome().await.is_completed());
        coordinator.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_drains_queues_and_balances_tokens() {
        let (stalled, entered, _release) = StalledStage::new();
        let coordinator = WorkCoordinator::new(
            config(5, [1, 1, 1], [3, 1, 1]),
            [Arc::new(stalled), instant(), instant()],
        )
        .unwrap();
        coordinator.start().unwrap();

        let mut receipts = Vec::new();
        for n in 0..3 {
            receipts.push(coordinator.submit(ItemContext::new(), n).await.unwrap());
        }
        wait_until(|| entered.load(Ordering::SeqCst) == 1).await;
        assert_eq!(coordinator.gate_stats().outstanding(), 3);

        coordinator.stop().await;
        assert!(!coordinator.is_running());

        for receipt in receipts {
            match receipt.outcome().await {
                ItemOutcome::Abandoned { reason, .. } => {
                    assert_eq!(reason, AbandonReason::Shutdown)
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        let gate = coordinator.gate_stats();
        assert_eq!(gate.acquired, 3);
        assert_eq!(gate.acquired, gate.released);
        assert_eq!(coordinator.metrics().active, 0);
        assert_eq!(coordinator.metrics().abandoned, 3);

        assert_eq!(
            coordinator.submit(ItemContext::new(), 9).await.unwrap_err(),
            PipelineError::ShuttingDown
        );
        // 重复停止无副作用
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let coordinator =
            WorkCoordinator::new(config(1, [1, 1, 1], [1, 1, 1]), [instant(), instant(), instant()])
                .unwrap();
        coordinator.start().unwrap();
        assert!(coordinator.is_running());
        assert_eq!(coordinator.start().unwrap_err(), PipelineError::AlreadyStarted);
        coordinator.stop().await;
        assert_eq!(coordinator.start().unwrap_err(), PipelineError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_stage1_backed_up_rejects_and_releases_token() {
        let mut cfg = config(5, [1, 1, 1], [1, 1, 1]);
        cfg.handoff_timeout = Duration::from_millis(30);
        // 不启动 worker，第一阶段队列只能容纳一个
        let coordinator = WorkCoordinator::new(cfg, [instant(), instant(), instant()]).unwrap();

        let _queued = coordinator.submit(ItemContext::new(), 1).await.unwrap();
        let err = coordinator.submit(ItemContext::new(), 2).await.unwrap_err();

        match &err {
            PipelineError::StageBackedUp { stage, waited } => {
                assert_eq!(stage, "stage1");
                assert!(*waited >= Duration::from_millis(25));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let metrics = coordinator.metrics();
        assert_eq!(metrics.rejected, 1);
        assert_eq!(metrics.active, 1);
        assert_eq!(coordinator.gate_stats().outstanding(), 1);

        let load = coordinator.load_info();
        assert_eq!(load.bottleneck_stage.as_deref(), Some("stage1"));
        assert!(!load.can_accept_new_items);
        assert!((load.system_utilization_percent - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cancel_during_stage1_handoff_returns_token() {
        // 不启动 worker，第一阶段队列只能容纳一个
        let coordinator =
            WorkCoordinator::new(config(5, [1, 1, 1], [1, 1, 1]), [instant(), instant(), instant()])
                .unwrap();
        let _queued = coordinator.submit(ItemContext::new(), 1).await.unwrap();

        let outstanding = coordinator.gate_stats().outstanding();
        let active = coordinator.metrics().active;
        assert_eq!(outstanding, 1);

        let ctx = ItemContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = coordinator.submit(ctx, 2).await.unwrap_err();
        assert_eq!(err, PipelineError::Cancelled(Interruption::Cancelled));

        let gate = coordinator.gate_stats();
        assert_eq!(gate.acquired, 2);
        assert_eq!(gate.outstanding(), outstanding);
        let metrics = coordinator.metrics();
        assert_eq!(metrics.active, active);
        assert_eq!(metrics.rejected, 1);
        assert_eq!(metrics.abandoned, 0);

        coordinator.stop().await;
        let gate = coordinator.gate_stats();
        assert_eq!(gate.acquired, gate.released);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_latency_excludes_admission_wait() {
        let (stalled, entered, release) = StalledStage::new();
        let coordinator = Arc::new(
            WorkCoordinator::new(
                config(1, [1, 1, 1], [1, 1, 1]),
                [Arc::new(stalled), instant(), instant()],
            )
            .unwrap(),
        );
        coordinator.start().unwrap();

        let a = coordinator.submit(ItemContext::new(), 1).await.unwrap();
        wait_until(|| entered.load(Ordering::SeqCst) == 1).await;

        // b 在闸门处等待 a 完成
        let waiter = Arc::clone(&coordinator);
        let b = tokio::spawn(async move { waiter.submit(ItemContext::new(), 2).await });
        sleep(Duration::from_millis(200)).await;
        release.add_permits(2);

        assert!(a.outcome().await.is_completed());
        let b = b.await.unwrap().unwrap();
        match b.outcome().await {
            ItemOutcome::Completed { latency, .. } => {
                assert!(latency < Duration::from_millis(150), "latency {latency:?}")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_cancelled_context_rejected_before_admission() {
        let coordinator =
            WorkCoordinator::new(config(1, [1, 1, 1], [1, 1, 1]), [instant(), instant(), instant()])
                .unwrap();
        let ctx = ItemContext::new();
        ctx.cancel();

        assert_eq!(
            coordinator.submit(ctx, 1).await.unwrap_err(),
            PipelineError::Cancelled(Interruption::Cancelled)
        );
        assert_eq!(coordinator.metrics().rejected, 1);
        assert_eq!(coordinator.gate_stats().acquired, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = WorkCoordinator::new(
            config(1, [1, 0, 1], [1, 1, 1]),
            [instant(), instant(), instant()],
        )
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::InvalidConfig(msg) if msg.contains("stage2")));

        let mut cfg = CoordinatorConfig::default();
        cfg.max_concurrent = 0;
        assert!(cfg.validate().is_err());
        assert_eq!(CoordinatorConfig::default().total_workers(), 10);
    }

    #[test]
    fn test_bottleneck_prefers_fullest_stage() {
        let status = |stage: usize, queued: usize, capacity: usize| StageStatus {
            stage,
            name: format!("stage{stage}"),
            workers: 1,
            queue_capacity: capacity,
            queued,
        };

        assert_eq!(
            identify_bottleneck_stage(&[status(1, 0, 5), status(2, 0, 3), status(3, 0, 2)]),
            None
        );
        assert_eq!(
            identify_bottleneck_stage(&[status(1, 4, 5), status(2, 1, 3), status(3, 2, 2)]),
            Some("stage3".to_string())
        );
        assert_eq!(
            identify_bottleneck_stage(&[status(1, 5, 5), status(2, 3, 3), status(3, 1, 2)]),
            Some("stage2".to_string())
        );
    }
}
