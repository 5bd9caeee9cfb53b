//! Centralised logging metadata (event names, shared keys, etc.).

/// Canonical event names used across the service.
pub mod events {
    /// Coordinator lifecycle.
    pub const COORDINATOR_START: &str = "coordinator.start";
    pub const COORDINATOR_STOP: &str = "coordinator.stop";

    /// 准入闸门与单个工作项。
    pub const GATE_ACQUIRED: &str = "gate.acquired";
    pub const ITEM_ADMITTED: &str = "item.admitted";
    pub const ITEM_REJECTED: &str = "item.rejected";
    pub const ITEM_COMPLETE: &str = "item.complete";
    pub const ITEM_ABANDONED: &str = "item.abandoned";

    /// 阶段 Worker。
    pub const WORKER_START: &str = "worker.start";
    pub const WORKER_EXIT: &str = "worker.exit";
    pub const WORKER_PANIC: &str = "worker.panic";

    /// Processing pipeline.
    pub const PIPELINE_START: &str = "processing.pipeline_start";
    pub const PIPELINE_STAGE: &str = "processing.stage";
    pub const PIPELINE_SLOW: &str = "processing.slow_item";
    pub const PIPELINE_COMPLETE: &str = "processing.complete";
    pub const PIPELINE_ERROR: &str = "processing.error";

    /// Input feeding and periodic reports.
    pub const FEED_ACCEPTED: &str = "feed.accepted";
    pub const FEED_REJECTED: &str = "feed.rejected";
    pub const FEED_EOF: &str = "feed.eof";
    pub const METRICS_REPORT: &str = "metrics.report";

    /// Configuration.
    pub const CONFIG_LOADED: &str = "config.load.success";
    pub const CONFIG_INVALID: &str = "config.validate.failed";
}
