// 流水线监控模块
// 健康评估与周期性指标输出

pub mod health;
pub mod service;

pub use health::{HealthReport, HealthStatus};
pub use service::MetricsReporter;
