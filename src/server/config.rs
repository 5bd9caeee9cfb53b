//! 配置管理模块
//! 负责配置文件的查找、加载、验证与日志初始化

use crate::util::config::{Config, ConfigLoader, ConfigValidator, ConfigWriter, ValidationReport};
use crate::util::log::{log_init_with_config, LogGuards};
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CONFIG_FILE_NAME: &str = "config.yaml";
pub const LOG_FILE_PREFIX: &str = "pipeline-gate";

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 加载和验证配置
    ///
    /// 未显式指定路径时按约定位置查找。文件不存在时写出模板并返回错误，
    /// 由使用者检查模板后再启动。
    pub fn load_and_validate(explicit_path: Option<&Path>) -> Result<(Config, ValidationReport)> {
        info!("[clipboard] 开始加载配置文件...");

        let config_path = explicit_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| Self::find_config_file_path(CONFIG_FILE_NAME));
        info!("配置文件路径: {}", config_path.display());

        if !config_path.exists() {
            return Err(Self::handle_missing_config(&config_path));
        }

        let config = ConfigLoader::load_with_env_overrides(&config_path)?;
        let validation_report = Self::validate_config(&config);

        info!("[ok] 配置加载完成");
        Ok((config, validation_report))
    }

    /// 初始化日志系统，返回的守卫需要在程序退出前一直持有
    pub fn initialize_logging(config: &Config) -> Result<LogGuards> {
        let guards = log_init_with_config(LOG_FILE_PREFIX, &config.logging)?;
        info!("[ok] 日志系统初始化完成");
        Ok(guards)
    }

    /// 验证配置并输出结果
    pub fn validate_config(config: &Config) -> ValidationReport {
        let report = ConfigValidator::validate_all(config);

        if report.has_errors() {
            warn!("[warn] 配置验证发现错误: {}", report.errors.len());
            for error in &report.errors {
                warn!("  - {}", error);
            }
        }
        if !report.warnings.is_empty() {
            info!("ℹ 配置验证发现警告: {}", report.warnings.len());
            for warning in &report.warnings {
                info!("  - {}", warning);
            }
        }

        report
    }

    /// 查找配置文件路径，适应开发和部署目录结构
    pub fn find_config_file_path(filename: &str) -> PathBuf {
        let current_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::find_config_file_path_from(&current_dir, std::env::current_exe().ok(), filename)
    }

    fn find_config_file_path_from(
        current_dir: &Path,
        exe_path: Option<PathBuf>,
        filename: &str,
    ) -> PathBuf {
        // 情况1：当前目录下的 config/
        let config_in_current = current_dir.join("config").join(filename);
        if config_in_current.exists() {
            return config_in_current;
        }

        // 情况2：在 bin/ 目录运行时，上级目录的 config/
        if let Some(parent) = current_dir.parent() {
            let config_in_parent = parent.join("config").join(filename);
            if config_in_parent.exists() {
                return config_in_parent;
            }
        }

        // 情况3：可执行文件位于 bin/ 时，项目根目录的 config/
        if let Some(exe_dir) = exe_path.as_deref().and_then(Path::parent) {
            if exe_dir.file_name() == Some(std::ffi::OsStr::new("bin")) {
                if let Some(project_root) = exe_dir.parent() {
                    let config_in_root = project_root.join("config").join(filename);
                    if config_in_root.exists() {
                        return config_in_root;
                    }
                }
            }
        }

        // 情况4：直接在当前目录
        let dev_path = current_dir.join(filename);
        if dev_path.exists() {
            return dev_path;
        }

        // 都不存在时默认使用 config/
        current_dir.join("config").join(filename)
    }

    fn handle_missing_config(config_path: &Path) -> anyhow::Error {
        info!("[note] 创建默认配置文件: {}", config_path.display());
        match ConfigWriter::generate_template().write_yaml_to_path(config_path) {
            Ok(()) => anyhow::anyhow!(
                "配置文件不存在，已生成模板: {}，请检查后重新启动",
                config_path.display()
            ),
            Err(write_err) => anyhow::anyhow!(
                "配置文件不存在: {}，且生成模板失败: {}",
                config_path.display(),
                write_err
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_writes_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join(CONFIG_FILE_NAME);

        let err = ConfigManager::load_and_validate(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("已生成模板"));
        assert_eq!(Config::read_yaml(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_load_reports_validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "pipeline:\n  stages:\n    - name: only\n      workers: 1\n      queue_capacity: 1\n",
        )
        .unwrap();

        let (config, report) = ConfigManager::load_and_validate(Some(&path)).unwrap();
        assert_eq!(config.pipeline.stages.len(), 1);
        assert!(report.has_errors());
    }

    #[test]
    fn test_find_config_prefers_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(dir.path().join("config").join(CONFIG_FILE_NAME), "{}").unwrap();

        let found =
            ConfigManager::find_config_file_path_from(&bin, Some(bin.join("pipeline-gate")), CONFIG_FILE_NAME);
        assert_eq!(found, dir.path().join("config").join(CONFIG_FILE_NAME));

        let elsewhere = tempfile::tempdir().unwrap();
        let fallback =
            ConfigManager::find_config_file_path_from(elsewhere.path(), None, CONFIG_FILE_NAME);
        assert_eq!(fallback, elsewhere.path().join("config").join(CONFIG_FILE_NAME));
    }
}
