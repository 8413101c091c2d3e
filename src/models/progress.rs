use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 某一时刻的进度快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub tracker_id: String,
    pub process_id: String,
    /// 在该 tracker 日志中的序号（从 0 开始）
    pub sequence: usize,
    pub timestamp: DateTime<Utc>,
    pub status: JobStatus,
    pub message: String,
    pub progress_percentage: f64,
    pub current_batch: usize,
    pub total_batches: usize,
    pub items_processed: usize,
    pub total_items: usize,
    pub found_items: usize,
    pub not_found_items: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 进度百分比，限制在 [0, 100]；总批次为 0 时返回 0
pub fn progress_percentage(current_batch: usize, total_batches: usize) -> f64 {
    if total_batches == 0 {
        return 0.0;
    }
    (current_batch as f64 / total_batches as f64 * 100.0).clamp(0.0, 100.0)
}
