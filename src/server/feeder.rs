//! 行输入驱动
//!
//! 每一行输入作为一个工作项提交。提交是同步有界的：闸门已满时读取也随之变慢，
//! 等待超时的行被拒绝并记录。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::util::logging::standards::events;
use crate::util::processing::{ItemContext, ItemOutcome, PipelineError, Receipt, WorkCoordinator};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedSummary {
    pub accepted: u64,
    pub rejected: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub completed: u64,
    pub abandoned: u64,
    /// 等待超时时仍未结束的工作项
    pub pending: usize,
}

pub struct LineFeeder {
    coordinator: Arc<WorkCoordinator<String>>,
    item_timeout: Option<Duration>,
    stop: CancellationToken,
    outcomes: JoinSet<bool>,
}

impl LineFeeder {
    pub fn new(
        coordinator: Arc<WorkCoordinator<String>>,
        item_timeout: Option<Duration>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            item_timeout,
            stop,
            outcomes: JoinSet::new(),
        }
    }

    /// 读取到输入结束、停止信号或协调器停机为止
    ///
    /// 不是合法 UTF-8 的行记为跳过，不影响后续输入。
    pub async fn feed<R: AsyncBufRead + Unpin>(&mut self, mut reader: R) -> Result<FeedSummary> {
        let mut summary = FeedSummary::default();
        let mut buf = Vec::new();
        let mut line_no = 0u64;

        loop {
            buf.clear();
            let read = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                read = reader.read_until(b'\n', &mut buf) => read?,
            };
            if read == 0 {
                info!(event = events::FEED_EOF, accepted = summary.accepted, rejected = summary.rejected);
                break;
            }
            line_no += 1;

            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(err) => {
                    summary.skipped += 1;
                    warn!(event = events::FEED_REJECTED, line = line_no, "跳过非 UTF-8 输入行: {}", err);
                    continue;
                }
            };
            let payload = line.trim();
            if payload.is_empty() {
                summary.skipped += 1;
                continue;
            }

            let mut ctx = ItemContext::new();
            if let Some(timeout) = self.item_timeout {
                ctx = ctx.with_timeout(timeout);
            }

            match self.coordinator.submit(ctx, payload.to_string()).await {
                Ok(receipt) => {
                    summary.accepted += 1;
                    info!(event = events::FEED_ACCEPTED, item = %receipt.id(), "accepted");
                    self.outcomes.spawn(report_outcome(receipt));
                }
                Err(PipelineError::ShuttingDown) => {
                    summary.rejected += 1;
                    warn!(event = events::FEED_REJECTED, "协调器已停止，停止读取输入");
                    break;
                }
                Err(err) => {
                    summary.rejected += 1;
                    if err.is_retryable() {
                        warn!(event = events::FEED_REJECTED, kind = err.kind(), "service unavailable: {}", err);
                    } else {
                        warn!(event = events::FEED_REJECTED, kind = err.kind(), "request failed: {}", err);
                    }
                }
            }
        }

        Ok(summary)
    }

    /// 等待已接受的工作项结束，最多等待 `limit`
    pub async fn drain(&mut self, limit: Duration) -> DrainSummary {
        let mut summary = DrainSummary::default();

        let _ = tokio::time::timeout(limit, async {
            while let Some(joined) = self.outcomes.join_next().await {
                match joined {
                    Ok(true) => summary.completed += 1,
                    Ok(false) => summary.abandoned += 1,
                    Err(err) => warn!("结果等待任务异常: {}", err),
                }
            }
        })
        .await;

        summary.pending = self.outcomes.len();
        summary
    }
}

async fn report_outcome(receipt: Receipt<String>) -> bool {
    let id = receipt.id();
    match receipt.outcome().await {
        ItemOutcome::Completed { payload, latency } => {
            info!(
                event = events::PIPELINE_COMPLETE,
                item = %id,
                latency_ms = latency.as_millis() as u64,
                "{}",
                payload
            );
            true
        }
        ItemOutcome::Abandoned { state, reason } => {
            warn!(
                event = events::PIPELINE_ERROR,
                item = %id,
                state = %state,
                reason = %reason
            );
            false
        }
    }
}
