use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::util::processing::{GateStats, MetricsSnapshot};

/// 流水线健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// 准入闸门已满，新请求只能等待或被拒绝
    Saturated,
    /// 拒绝数超过完成数
    Unavailable,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Saturated => "saturated",
            HealthStatus::Unavailable => "unavailable",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// 一次健康评估的结果
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
    pub gate: GateStats,
}

impl HealthReport {
    pub fn evaluate(metrics: MetricsSnapshot, gate: GateStats) -> Self {
        let status = if metrics.rejected > metrics.completed {
            HealthStatus::Unavailable
        } else if gate.is_saturated() {
            HealthStatus::Saturated
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            checked_at: Utc::now(),
            metrics,
            gate,
        }
    }

    /// 输出为单行 JSON，供结构化日志或外部采集使用
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} active={} completed={} rejected={} abandoned={} avg_latency={:?}",
            self.status.as_str(),
            self.metrics.active,
            self.metrics.completed,
            self.metrics.rejected,
            self.metrics.abandoned,
            self.metrics.avg_latency
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gate(available: usize) -> GateStats {
        GateStats {
            max_concurrent: 4,
            available,
            acquired: 10,
            released: 10 - (4 - available as u64),
        }
    }

    #[test]
    fn test_health_classification() {
        let mut metrics = MetricsSnapshot {
            completed: 10,
            rejected: 2,
            ..Default::default()
        };
        assert_eq!(
            HealthReport::evaluate(metrics, gate(2)).status,
            HealthStatus::Healthy
        );
        assert_eq!(
            HealthReport::evaluate(metrics, gate(0)).status,
            HealthStatus::Saturated
        );

        metrics.rejected = 11;
        assert_eq!(
            HealthReport::evaluate(metrics, gate(2)).status,
            HealthStatus::Unavailable
        );
    }

    #[test]
    fn test_display_format() {
        let metrics = MetricsSnapshot {
            active: 3,
            completed: 7,
            rejected: 1,
            abandoned: 2,
            avg_latency: Duration::from_millis(350),
            ..Default::default()
        };
        let report = HealthReport::evaluate(metrics, gate(1));
        assert_eq!(
            report.to_string(),
            "healthy active=3 completed=7 rejected=1 abandoned=2 avg_latency=350ms"
        );
    }

    #[test]
    fn test_json_snapshot() {
        let metrics = MetricsSnapshot {
            completed: 5,
            rejected: 1,
            ..Default::default()
        };
        let json = HealthReport::evaluate(metrics, gate(0)).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["status"], "saturated");
        assert_eq!(value["metrics"]["completed"], 5);
        assert_eq!(value["gate"]["max_concurrent"], 4);
        assert!(value["checked_at"].is_string());
    }
}
