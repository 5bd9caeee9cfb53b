//! 配置加载和管理模块
//! 处理配置文件的读取、写入和环境变量覆盖

use super::types::*;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从YAML文件读取配置
    pub fn read_yaml(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let config = serde_yaml::from_str(&config_str)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config)
    }

    /// 从环境变量读取配置覆盖
    pub fn apply_env_overrides(config: Config) -> Config {
        Self::apply_overrides_from(config, |key| std::env::var(key).ok())
    }

    /// 按给定的查找函数应用覆盖，便于测试时不触碰进程环境
    pub fn apply_overrides_from(
        mut config: Config,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Config {
        tracing::info!("[tool] 应用环境变量配置覆盖...");

        if let Some(raw) = lookup("PIPELINE_MAX_CONCURRENT") {
            match raw.trim().parse::<usize>() {
                Ok(value) => {
                    config.pipeline.max_concurrent = value;
                    tracing::info!("[ok] 环境变量覆盖最大并发数: {}", value);
                }
                Err(_) => tracing::warn!("[warn] 忽略无效的 PIPELINE_MAX_CONCURRENT: {}", raw),
            }
        }

        if let Some(value) = Self::parse_millis(&lookup, "PIPELINE_ADMISSION_TIMEOUT_MS") {
            config.pipeline.admission_timeout_ms = value;
            tracing::info!("[ok] 环境变量覆盖准入等待时间: {}ms", value);
        }

        if let Some(value) = Self::parse_millis(&lookup, "PIPELINE_HANDOFF_TIMEOUT_MS") {
            config.pipeline.handoff_timeout_ms = value;
            tracing::info!("[ok] 环境变量覆盖第一阶段交接时间: {}ms", value);
        }

        if let Some(value) = Self::parse_millis(&lookup, "PIPELINE_ITEM_TIMEOUT_MS") {
            config.pipeline.item_timeout_ms = value;
            tracing::info!("[ok] 环境变量覆盖工作项截止时间: {}ms", value);
        }

        if let Some(level) = lookup("PIPELINE_LOG_LEVEL") {
            let level = level.trim().to_ascii_lowercase();
            if !level.is_empty() {
                tracing::info!("[ok] 环境变量覆盖日志级别: {}", level);
                config.logging.level = level;
            }
        }

        if let Some(raw) = lookup("PIPELINE_LOG_STRUCTURED") {
            match Self::parse_bool(&raw) {
                Ok(value) => {
                    config.logging.structured = Some(value);
                    tracing::info!("[ok] 环境变量覆盖结构化日志: {}", value);
                }
                Err(()) => {
                    tracing::warn!("[warn] 忽略无效的 PIPELINE_LOG_STRUCTURED: {}", raw)
                }
            }
        }

        config
    }

    fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
        let raw = lookup(key)?;
        match raw.trim().parse::<u64>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("[warn] 忽略无效的 {}: {}", key, raw);
                None
            }
        }
    }

    fn parse_bool(value: &str) -> Result<bool, ()> {
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(true),
            "false" | "0" | "no" | "n" => Ok(false),
            _ => Err(()),
        }
    }

    /// 配置文件 + 环境变量
    pub fn load_with_env_overrides(path: impl AsRef<Path>) -> Result<Config> {
        let base_config = Self::read_yaml(path)?;
        let config = Self::apply_env_overrides(base_config);

        tracing::info!("[ok] 配置加载完成");
        Ok(config)
    }
}

/// 配置写入器
pub struct ConfigWriter;

impl ConfigWriter {
    /// 将配置写入YAML文件
    pub fn write_yaml(config: &Config, path: impl AsRef<Path>) -> Result<()> {
        let yaml_content = serde_yaml::to_string(config)?;
        fs::write(path, yaml_content)?;
        Ok(())
    }

    /// 写入配置到指定路径，确保目录存在
    pub fn write_yaml_with_dir(config: &Config, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::write_yaml(config, path)
    }

    /// 生成配置模板
    pub fn generate_template() -> Config {
        Config::default()
    }

    /// 配置模板的YAML文本
    pub fn template_yaml() -> Result<String> {
        Ok(serde_yaml::to_string(&Self::generate_template())?)
    }
}
