//! 有界三阶段工作流水线：准入控制、阶段间背压与优雅停机。

pub mod build_info;
pub mod monitor;
pub mod server;
pub mod util;

pub use util::config::Config;
pub use util::processing::{
    CoordinatorConfig, ItemContext, ItemOutcome, PipelineError, Receipt, StageHandler,
    WorkCoordinator,
};

/// 查找配置文件路径，适应开发和部署目录结构
pub fn find_config_file_path(filename: &str) -> std::path::PathBuf {
    server::config::ConfigManager::find_config_file_path(filename)
}
