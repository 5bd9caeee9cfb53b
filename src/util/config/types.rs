//! 配置结构定义模块
//! 包含系统配置的所有数据结构

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::util::processing::{CoordinatorConfig, StageSettings, STAGE_COUNT};

/// 顶层配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 流水线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_admission_timeout_ms")]
    pub admission_timeout_ms: u64,
    #[serde(default = "default_handoff_timeout_ms")]
    pub handoff_timeout_ms: u64,
    /// 单个工作项的端到端截止时间，0 表示不限制
    #[serde(default = "default_item_timeout_ms")]
    pub item_timeout_ms: u64,
    #[serde(default = "default_slow_item_threshold_ms")]
    pub slow_item_threshold_ms: u64,
    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,
}

/// 单个阶段配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub workers: usize,
    pub queue_capacity: usize,
    /// 模拟处理耗时下限
    #[serde(default)]
    pub min_latency_ms: u64,
    /// 模拟处理耗时上限
    #[serde(default)]
    pub max_latency_ms: u64,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: LogFileConfig,
    pub structured: Option<bool>,
    #[serde(default)]
    pub level_config: Option<LevelConfig>,
    #[serde(default)]
    pub enable_debug_file: bool,
}

/// 日志文件配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFileConfig {
    pub enabled: bool,
    pub directory: String,
    pub retention_days: Option<u32>,
}

/// 日志级别配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelConfig {
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

/// 运行时配置（命令行程序使用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 周期性指标日志间隔，0 表示关闭
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    /// 输入结束后等待流水线排空的上限
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    50
}

fn default_admission_timeout_ms() -> u64 {
    100
}

fn default_handoff_timeout_ms() -> u64 {
    1000
}

fn default_item_timeout_ms() -> u64 {
    5000
}

fn default_slow_item_threshold_ms() -> u64 {
    2000
}

fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new("stage1", 5, 5, 50, 100),
        StageConfig::new("stage2", 3, 3, 100, 200),
        StageConfig::new("stage3", 2, 2, 200, 500),
    ]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_interval_secs() -> u64 {
    10
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            admission_timeout_ms: default_admission_timeout_ms(),
            handoff_timeout_ms: default_handoff_timeout_ms(),
            item_timeout_ms: default_item_timeout_ms(),
            slow_item_threshold_ms: default_slow_item_threshold_ms(),
            stages: default_stages(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: LogFileConfig::default(),
            structured: Some(false),
            level_config: None,
            enable_debug_file: false,
        }
    }
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: "runtime/logs".to_string(),
            retention_days: Some(7),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            metrics_interval_secs: default_metrics_interval_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl StageConfig {
    pub fn new(
        name: &str,
        workers: usize,
        queue_capacity: usize,
        min_latency_ms: u64,
        max_latency_ms: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            workers,
            queue_capacity,
            min_latency_ms,
            max_latency_ms,
        }
    }

    pub fn min_latency(&self) -> Duration {
        Duration::from_millis(self.min_latency_ms)
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }
}

impl PipelineConfig {
    pub fn item_timeout(&self) -> Option<Duration> {
        (self.item_timeout_ms > 0).then(|| Duration::from_millis(self.item_timeout_ms))
    }

    /// 转换为协调器配置，阶段数不为三时返回错误
    pub fn coordinator_config(&self) -> anyhow::Result<CoordinatorConfig> {
        let stages: [StageSettings; STAGE_COUNT] = self
            .stages
            .iter()
            .map(|s| StageSettings::new(s.name.clone(), s.workers, s.queue_capacity))
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|v: Vec<StageSettings>| {
                anyhow::anyhow!("流水线需要 {} 个阶段，实际配置了 {} 个", STAGE_COUNT, v.len())
            })?;

        Ok(CoordinatorConfig {
            max_concurrent: self.max_concurrent,
            admission_timeout: Duration::from_millis(self.admission_timeout_ms),
            handoff_timeout: Duration::from_millis(self.handoff_timeout_ms),
            slow_item_threshold: Duration::from_millis(self.slow_item_threshold_ms),
            stages,
        })
    }
}

impl RuntimeConfig {
    pub fn metrics_interval(&self) -> Option<Duration> {
        (self.metrics_interval_secs > 0).then(|| Duration::from_secs(self.metrics_interval_secs))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
