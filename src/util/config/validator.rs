//! 配置验证模块
//! 提供配置的验证、检查和诊断功能

use super::types::*;
use crate::util::processing::STAGE_COUNT;
use std::fmt;

/// 队列容量超过 worker 数的该倍数时视为“隐藏队列”
const QUEUE_TO_WORKER_RATIO_WARN: usize = 4;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// 配置验证器
pub struct ConfigValidator;

impl ConfigValidator {
    /// 全面验证配置
    pub fn validate_all(config: &Config) -> ValidationReport {
        let mut report = ValidationReport::new();

        // 验证流水线配置
        Self::validate_pipeline_config(&config.pipeline, &mut report);

        // 验证阶段配置
        Self::validate_stage_configs(&config.pipeline, &mut report);

        // 验证日志配置
        Self::validate_logging_config(&config.logging, &mut report);

        // 验证运行时配置
        Self::validate_runtime_config(&config.runtime, &mut report);

        report
    }

    fn validate_pipeline_config(pipeline: &PipelineConfig, report: &mut ValidationReport) {
        if pipeline.max_concurrent == 0 {
            report.add_error("pipeline.max_concurrent", "最大并发数必须大于0");
        }
        if pipeline.admission_timeout_ms == 0 {
            report.add_error("pipeline.admission_timeout_ms", "准入等待时间必须大于0");
        }
        if pipeline.handoff_timeout_ms == 0 {
            report.add_error("pipeline.handoff_timeout_ms", "第一阶段交接时间必须大于0");
        }
        if pipeline.item_timeout_ms == 0 {
            report.add_info("pipeline.item_timeout_ms", "未设置工作项截止时间");
        } else if pipeline.item_timeout_ms <= pipeline.admission_timeout_ms {
            report.add_warning(
                "pipeline.item_timeout_ms",
                &format!(
                    "工作项截止时间({}ms)不大于准入等待时间({}ms)，排队的工作项可能全部超时",
                    pipeline.item_timeout_ms, pipeline.admission_timeout_ms
                ),
            );
        }

        let total_workers: usize = pipeline.stages.iter().map(|s| s.workers).sum();
        if pipeline.max_concurrent > 0 && pipeline.max_concurrent < total_workers {
            report.add_warning(
                "pipeline.max_concurrent",
                &format!(
                    "最大并发数({})小于 worker 总数({})，部分 worker 将长期空闲",
                    pipeline.max_concurrent, total_workers
                ),
            );
        }
    }

    fn validate_stage_configs(pipeline: &PipelineConfig, report: &mut ValidationReport) {
        if pipeline.stages.len() != STAGE_COUNT {
            report.add_error(
                "pipeline.stages",
                &format!(
                    "流水线需要 {} 个阶段，实际配置了 {} 个",
                    STAGE_COUNT,
                    pipeline.stages.len()
                ),
            );
        }

        for (index, stage) in pipeline.stages.iter().enumerate() {
            let field = |name: &str| format!("pipeline.stages[{index}].{name}");

            if stage.name.trim().is_empty() {
                report.add_error(&field("name"), "阶段名称不能为空");
            }
            if stage.workers == 0 {
                report.add_error(&field("workers"), "worker 数必须大于0");
            }
            if stage.queue_capacity == 0 {
                report.add_error(&field("queue_capacity"), "队列容量必须大于0");
            }
            if stage.min_latency_ms > stage.max_latency_ms {
                report.add_error(
                    &field("min_latency_ms"),
                    &format!(
                        "最小耗时({}ms)大于最大耗时({}ms)",
                        stage.min_latency_ms, stage.max_latency_ms
                    ),
                );
            }
            if stage.workers > 0 && stage.queue_capacity > stage.workers * QUEUE_TO_WORKER_RATIO_WARN
            {
                report.add_warning(
                    &field("queue_capacity"),
                    &format!(
                        "队列容量({})超过 worker 数({})的{}倍，缓冲区会变成隐藏队列",
                        stage.queue_capacity, stage.workers, QUEUE_TO_WORKER_RATIO_WARN
                    ),
                );
            }
        }
    }

    fn validate_logging_config(logging: &LoggingConfig, report: &mut ValidationReport) {
        if !VALID_LOG_LEVELS.contains(&logging.level.to_lowercase().as_str()) {
            report.add_error(
                "logging.level",
                &format!("无效的日志级别: {}", logging.level),
            );
        }

        if logging.file.enabled && logging.file.directory.trim().is_empty() {
            report.add_error("logging.file.directory", "启用文件日志时目录不能为空");
        }

        if let Some(days) = logging.file.retention_days {
            if days == 0 {
                report.add_warning("logging.file.retention_days", "日志保留天数为0，将不会清理");
            }
        }

        if let Some(level_config) = &logging.level_config {
            for (target, level) in &level_config.overrides {
                if !VALID_LOG_LEVELS.contains(&level.to_lowercase().as_str()) {
                    report.add_warning(
                        "logging.level_config.overrides",
                        &format!("忽略无效的日志级别: {target}={level}"),
                    );
                }
            }
        }
    }

    fn validate_runtime_config(runtime: &RuntimeConfig, report: &mut ValidationReport) {
        if runtime.metrics_interval_secs == 0 {
            report.add_info("runtime.metrics_interval_secs", "周期性指标日志已关闭");
        }
        if runtime.drain_timeout_secs == 0 {
            report.add_warning(
                "runtime.drain_timeout_secs",
                "排空等待时间为0，输入结束后会立即停止并放弃未完成的工作项",
            );
        }
    }
}

/// 验证报告
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub info: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, field: &str, message: &str) {
        self.errors.push(ValidationIssue::new(field, message));
    }

    pub fn add_warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationIssue::new(field, message));
    }

    pub fn add_info(&mut self, field: &str, message: &str) {
        self.info.push(ValidationIssue::new(field, message));
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        !self.has_errors()
    }

    /// 错误汇总为一行，用于启动失败时的提示
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|issue| issue.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// 验证问题
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
