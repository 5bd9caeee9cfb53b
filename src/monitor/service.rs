use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::health::HealthReport;
use crate::util::logging::standards::events;
use crate::util::processing::WorkCoordinator;

/// 周期性输出流水线指标与健康状态
pub struct MetricsReporter {
    interval: Duration,
    shutdown: CancellationToken,
}

impl MetricsReporter {
    pub fn new(interval: Duration, shutdown: CancellationToken) -> Self {
        Self { interval, shutdown }
    }

    /// 在后台启动，收到停止信号后退出
    pub fn spawn<P: Send + 'static>(self, coordinator: Arc<WorkCoordinator<P>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            // 第一次 tick 立即返回
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                Self::report(&coordinator);
            }

            info!("指标上报任务已停止");
        })
    }

    pub fn report<P: Send + 'static>(coordinator: &WorkCoordinator<P>) -> HealthReport {
        let report = HealthReport::evaluate(coordinator.metrics(), coordinator.gate_stats());
        let load = coordinator.load_info();

        if report.status.is_healthy() {
            info!(
                event = events::METRICS_REPORT,
                status = report.status.as_str(),
                utilization_percent = load.system_utilization_percent,
                bottleneck = load.bottleneck_stage.as_deref().unwrap_or("none"),
                "{}",
                report
            );
        } else {
            warn!(
                event = events::METRICS_REPORT,
                status = report.status.as_str(),
                utilization_percent = load.system_utilization_percent,
                bottleneck = load.bottleneck_stage.as_deref().unwrap_or("none"),
                "{}",
                report
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::health::HealthStatus;
    use crate::util::processing::{CoordinatorConfig, FnStage, ItemId, StageHandler};

    fn passthrough() -> Arc<dyn StageHandler<u32>> {
        Arc::new(FnStage::new("pass", |_id: ItemId, n: u32| async move {
            Ok::<_, anyhow::Error>(n)
        }))
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let coordinator = Arc::new(
            WorkCoordinator::new(
                CoordinatorConfig::default(),
                [passthrough(), passthrough(), passthrough()],
            )
            .unwrap(),
        );
        let shutdown = CancellationToken::new();
        let handle = MetricsReporter::new(Duration::from_millis(10), shutdown.clone())
            .spawn(Arc::clone(&coordinator));

        time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter should stop")
            .unwrap();

        assert_eq!(
            MetricsReporter::report(&coordinator).status,
            HealthStatus::Healthy
        );
    }
}
