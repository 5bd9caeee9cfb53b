use crate::util::config::{LevelConfig, LoggingConfig};
use std::io;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter::EnvFilter, Layer, Registry};

const CRATE_TARGET: &str = "pipeline_gate";
const PIPELINE_TARGET: &str = "processing.pipeline";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// 日志写入器守卫，drop 时刷新缓冲区
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

/// 按配置初始化日志：控制台 + 可选的按天滚动文件 + 可选的 debug 文件
pub fn log_init_with_config(file_prefix: &str, config: &LoggingConfig) -> anyhow::Result<LogGuards> {
    let level_filter = parse_level_filter(&config.level);
    let filter_expression = build_env_filter_expression(level_filter, config.level_config.as_ref());
    let use_json = config.structured.unwrap_or(false);

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guards = Vec::new();

    let stdout_filter = env_filter(&filter_expression, level_filter);
    if use_json {
        layers.push(
            layer()
                .json()
                .with_writer(io::stdout)
                .with_filter(stdout_filter)
                .boxed(),
        );
    } else {
        layers.push(
            layer()
                .without_time()
                .with_target(false)
                .with_writer(io::stdout)
                .with_filter(stdout_filter)
                .boxed(),
        );
    }

    let mut log_dir = None;
    if config.file.enabled {
        let dir = resolve_log_dir(&config.file.directory);
        std::fs::create_dir_all(&dir)?;

        let file_appender = daily(&dir, format!("{}-info", file_prefix));
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        guards.push(guard);
        let file_filter = env_filter(&filter_expression, level_filter);
        layers.push(if use_json {
            layer()
                .json()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_filter(file_filter)
                .boxed()
        } else {
            layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_filter(file_filter)
                .boxed()
        });

        if config.enable_debug_file {
            let debug_appender = daily(&dir, format!("{}-debug", file_prefix));
            let (debug_nb, debug_guard) = tracing_appender::non_blocking(debug_appender);
            guards.push(debug_guard);
            let debug_expression =
                build_env_filter_expression(LevelFilter::DEBUG, config.level_config.as_ref());
            layers.push(
                layer()
                    .with_ansi(false)
                    .with_writer(debug_nb)
                    .with_filter(env_filter(&debug_expression, LevelFilter::DEBUG))
                    .boxed(),
            );
        }

        log_dir = Some(dir);
    }

    Registry::default().with(layers).try_init()?;

    match &log_dir {
        Some(dir) => {
            tracing::info!(
                event = "log.init",
                level = %config.level,
                console = true,
                file = true,
                directory = %dir.display(),
                rotation = "daily",
                structured = use_json,
                split_debug = config.enable_debug_file,
                debug_file = format!("{}-debug", file_prefix)
            );
            if let Some(retention) = config.file.retention_days {
                tracing::info!(event = "log.retention", days = retention);
                if let Err(e) = cleanup_old_logs(dir, file_prefix, retention) {
                    tracing::warn!("清理旧日志失败: {}", e);
                }
            }
        }
        None => {
            tracing::info!(event = "log.init", level = %config.level, console = true, file = false, structured = use_json);
        }
    }

    Ok(LogGuards { _guards: guards })
}

/// 相对路径基于当前工作目录；在 bin 目录下运行时使用上级目录
pub fn resolve_log_dir(directory: &str) -> PathBuf {
    let path = Path::new(directory);
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let current_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    if current_dir.file_name() == Some(std::ffi::OsStr::new("bin")) {
        if let Some(parent) = current_dir.parent() {
            return parent.join(directory);
        }
    }
    current_dir.join(directory)
}

pub fn cleanup_old_logs(log_dir: &Path, file_prefix: &str, retention_days: u32) -> anyhow::Result<()> {
    if !log_dir.exists() {
        tracing::debug!("日志目录不存在: {}", log_dir.display());
        return Ok(());
    }
    if retention_days == 0 {
        return Ok(());
    }

    let cutoff_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs()
        .saturating_sub(retention_days as u64 * 24 * 60 * 60);

    let mut deleted_count = 0;
    let mut total_size_deleted = 0u64;
    let mut error_count = 0;

    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        // 只处理本程序的日志文件
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("");
        if !file_name.starts_with(file_prefix) {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let check_time = metadata
            .modified()
            .or_else(|_| metadata.created())
            .unwrap_or_else(|_| std::time::SystemTime::now());
        let Ok(file_time) = check_time.duration_since(std::time::UNIX_EPOCH) else {
            continue;
        };

        if file_time.as_secs() < cutoff_time {
            let file_size = metadata.len();
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    deleted_count += 1;
                    total_size_deleted += file_size;
                    tracing::debug!("已删除过期日志: {}", path.display());
                }
                Err(e) => {
                    error_count += 1;
                    tracing::warn!("删除日志文件失败: {} - {}", path.display(), e);
                }
            }
        }
    }

    if deleted_count > 0 {
        let size_mb = total_size_deleted as f64 / (1024.0 * 1024.0);
        tracing::info!(
            "已清理 {} 个过期日志文件，释放空间 {:.2} MB",
            deleted_count,
            size_mb
        );
    }
    if error_count > 0 {
        tracing::warn!("有 {} 个文件清理失败", error_count);
    }

    Ok(())
}

fn env_filter(expression: &str, fallback: LevelFilter) -> EnvFilter {
    EnvFilter::try_new(expression).unwrap_or_else(|_| EnvFilter::new(level_filter_to_str(fallback)))
}

fn parse_level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

fn build_env_filter_expression(
    default_level: LevelFilter,
    level_config: Option<&LevelConfig>,
) -> String {
    let mut directives = vec![level_filter_to_str(default_level).to_string()];

    if let Some(cfg) = level_config {
        if let Some(level) = cfg.pipeline.as_deref().and_then(normalize_level_str) {
            // 流水线日志使用显式 target
            directives.push(format!("{PIPELINE_TARGET}={level}"));
            directives.push(format!("{CRATE_TARGET}::util::processing={level}"));
        }
        if let Some(level) = cfg.config.as_deref().and_then(normalize_level_str) {
            directives.push(format!("{CRATE_TARGET}::util::config={level}"));
        }
        if let Some(level) = cfg.server.as_deref().and_then(normalize_level_str) {
            directives.push(format!("{CRATE_TARGET}::server={level}"));
            directives.push(format!("{CRATE_TARGET}::monitor={level}"));
        }

        let mut overrides: Vec<_> = cfg.overrides.iter().collect();
        overrides.sort();
        for (target, level_str) in overrides {
            if let Some(level) = normalize_level_str(level_str) {
                directives.push(format!("{}={level}", normalize_directive_target(target)));
            }
        }
    }

    directives.join(",")
}

fn normalize_level_str(level: &str) -> Option<&'static str> {
    match level.to_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

fn level_filter_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "off",
        LevelFilter::ERROR => "error",
        LevelFilter::WARN => "warn",
        LevelFilter::INFO => "info",
        LevelFilter::DEBUG => "debug",
        LevelFilter::TRACE => "trace",
    }
}

fn normalize_directive_target(target: &str) -> String {
    if let Some(raw) = target.strip_prefix("target:") {
        raw.to_string()
    } else if target.contains("::") {
        target.to_string()
    } else {
        let path = target.replace('.', "::");
        format!("{CRATE_TARGET}::{path}")
    }
}
