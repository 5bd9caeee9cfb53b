//! 程序启动模块
//!
//! 负责组装完整的运行流程：
//! - 配置管理 (config.rs)
//! - 标准输入驱动 (feeder.rs)
//!
//! 使用示例：
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use pipeline_gate::server::PipelineBootstrap;
//!
//! let bootstrap = PipelineBootstrap::new(None)?;
//! bootstrap.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod feeder;

pub use config::ConfigManager;
pub use feeder::{DrainSummary, FeedSummary, LineFeeder};

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::io::BufReader;
use tokio::signal::ctrl_c;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::build_info;
use crate::monitor::MetricsReporter;
use crate::util::config::{Config, ConfigWriter, ValidationReport};
use crate::util::log::LogGuards;
use crate::util::logging::standards::events;
use crate::util::processing::{SimulatedStage, StageHandler, WorkCoordinator};

/// 引导程序，持有配置与日志守卫
pub struct PipelineBootstrap {
    config: Config,
    validation_report: ValidationReport,
    _log_guard: LogGuards,
}

impl PipelineBootstrap {
    pub fn new(config_path: Option<&Path>) -> Result<Self> {
        let (config, validation_report) = ConfigManager::load_and_validate(config_path)?;
        let log_guard = ConfigManager::initialize_logging(&config)?;

        if validation_report.has_errors() {
            warn!(event = events::CONFIG_INVALID, errors = validation_report.errors.len());
            return Err(anyhow!(
                "配置验证失败: {}",
                validation_report.error_summary()
            ));
        }
        info!(event = events::CONFIG_LOADED, warnings = validation_report.warnings.len());

        Ok(Self {
            config,
            validation_report,
            _log_guard: log_guard,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn validation_report(&self) -> &ValidationReport {
        &self.validation_report
    }

    /// 从标准输入读取工作项直到输入结束或收到退出信号
    pub async fn start(self) -> Result<()> {
        info!(event = events::PIPELINE_START, "=== 流水线启动 ===");
        info!("版本信息: {}", build_info::summary());

        let coordinator = Arc::new(build_coordinator(&self.config)?);
        coordinator.start()?;

        let reporter_stop = CancellationToken::new();
        let reporter = self.config.runtime.metrics_interval().map(|interval| {
            MetricsReporter::new(interval, reporter_stop.clone()).spawn(Arc::clone(&coordinator))
        });

        // 退出信号只停止读取，已接受的工作项由协调器停机时统一结算
        let feed_stop = CancellationToken::new();
        let signal_task = {
            let feed_stop = feed_stop.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                feed_stop.cancel();
            })
        };

        let mut feeder = LineFeeder::new(
            Arc::clone(&coordinator),
            self.config.pipeline.item_timeout(),
            feed_stop.clone(),
        );
        let feed_result = feeder.feed(BufReader::new(tokio::io::stdin())).await;

        let drain_limit = if feed_stop.is_cancelled() {
            std::time::Duration::ZERO
        } else {
            self.config.runtime.drain_timeout()
        };
        let drained = feeder.drain(drain_limit).await;
        if drained.pending > 0 {
            warn!(
                pending = drained.pending,
                "仍有工作项未结束，停机时将被放弃"
            );
        }

        coordinator.stop().await;
        // 停机后剩余的结果都已结算
        let remaining = feeder.drain(std::time::Duration::from_secs(1)).await;

        signal_task.abort();
        reporter_stop.cancel();
        if let Some(handle) = reporter {
            let _ = handle.await;
        }

        let final_report = MetricsReporter::report(&coordinator);
        info!(
            completed = drained.completed + remaining.completed,
            abandoned = drained.abandoned + remaining.abandoned,
            "=== 流水线结束 === {}",
            final_report
        );
        match final_report.to_json() {
            Ok(json) => info!(event = events::METRICS_REPORT, report = %json, "最终报告"),
            Err(e) => warn!("最终报告序列化失败: {}", e),
        }

        let summary = feed_result?;
        info!(
            accepted = summary.accepted,
            rejected = summary.rejected,
            skipped = summary.skipped,
            "输入统计"
        );
        Ok(())
    }
}

/// 按配置创建协调器，每个阶段使用模拟处理器
pub fn build_coordinator(config: &Config) -> Result<WorkCoordinator<String>> {
    // 阶段数量不符时在这里返回错误
    let coordinator_config = config.pipeline.coordinator_config()?;

    let stages = &config.pipeline.stages;
    let handler = |index: usize| -> Arc<dyn StageHandler<String>> {
        let stage = &stages[index];
        Arc::new(SimulatedStage::new(
            stage.name.clone(),
            index + 1,
            stage.min_latency(),
            stage.max_latency(),
        ))
    };

    Ok(WorkCoordinator::new(
        coordinator_config,
        [handler(0), handler(1), handler(2)],
    )?)
}

/// 便捷函数：加载配置并运行流水线
pub async fn start_pipeline(config_path: Option<&Path>) -> Result<()> {
    let bootstrap = PipelineBootstrap::new(config_path)?;
    bootstrap.start().await
}

/// 便捷函数：只检查配置，不初始化日志
pub fn check_config(config_path: Option<&Path>) -> Result<ValidationReport> {
    let (_, report) = ConfigManager::load_and_validate(config_path)?;
    Ok(report)
}

/// 便捷函数：输出默认配置模板
pub fn template() -> Result<String> {
    ConfigWriter::template_yaml()
}

/// 等待退出信号
async fn shutdown_signal() {
    tokio::select! {
        _ = ctrl_c() => {
            info!(event = events::COORDINATOR_STOP, signal = "SIGINT");
        }
        _ = wait_for_sigterm() => {
            info!(event = events::COORDINATOR_STOP, signal = "SIGTERM");
        }
    }
}

async fn wait_for_sigterm() {
    #[cfg(unix)]
    {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("无法监听 SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::processing::{ItemContext, ItemOutcome};

    #[tokio::test]
    async fn test_build_coordinator_from_default_config() {
        let mut config = Config::default();
        for stage in &mut config.pipeline.stages {
            stage.min_latency_ms = 1;
            stage.max_latency_ms = 2;
        }

        let coordinator = build_coordinator(&config).unwrap();
        assert_eq!(coordinator.config().max_concurrent, 50);
        coordinator.start().unwrap();

        let receipt = coordinator
            .submit(ItemContext::new(), "line".to_string())
            .await
            .unwrap();
        match receipt.outcome().await {
            ItemOutcome::Completed { payload, .. } => {
                assert_eq!(payload, "stage3-stage2-stage1-line")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        coordinator.stop().await;
    }

    #[test]
    fn test_build_coordinator_rejects_wrong_stage_count() {
        let mut config = Config::default();
        config.pipeline.stages.pop();
        assert!(build_coordinator(&config).is_err());
    }

    #[test]
    fn test_template_is_parseable() {
        let yaml = template().unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
