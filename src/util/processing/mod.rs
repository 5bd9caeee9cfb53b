//! 有界三阶段处理流水线
//!
//! ```text
//! submit → [准入闸门] → 阶段1队列 → 阶段2队列 → 阶段3队列 → 完成
//!              ↓            ↓           ↓           ↓
//!        max_concurrent   N1个线程    N2个线程    N3个线程
//! ```
//!
//! 准入闸门限制系统内的工作项总数，阶段之间使用有界队列传递，
//! 下游变慢时上游在交接处等待，压力最终传导到 `submit`。

pub mod admission;
pub mod coordinator;
pub mod error;
pub mod item;
mod lease;
pub mod metrics;
pub mod stage;

pub use admission::{AdmissionGate, AdmissionToken, GateStats};
pub use coordinator::{
    CoordinatorConfig, StageSettings, SystemLoadInfo, WorkCoordinator, STAGE_COUNT,
};
pub use error::PipelineError;
pub use item::{
    AbandonReason, Interruption, ItemContext, ItemId, ItemOutcome, ItemState, Receipt,
    StageResult, WorkItem,
};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use stage::{FnStage, SimulatedStage, StageHandler, StageStatus};
