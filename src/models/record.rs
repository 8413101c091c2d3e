//! 持久化记录：每一次批次尝试写一条，写入后不再修改

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::outcome::MatchOutcome;
use crate::models::usage::TokenUsage;

/// 记录状态（同时决定存储分区）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Successful,
    Failed,
}

impl RecordStatus {
    /// 存储分区名
    pub fn partition(self) -> &'static str {
        match self {
            RecordStatus::Successful => "successful",
            RecordStatus::Failed => "failed",
        }
    }
}

/// 单条引用校验的诊断信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDiagnostics {
    pub row_id: u32,
    pub sheet_confidence: f64,
    pub spec_confidence: f64,
    pub overall_confidence: f64,
    #[serde(default)]
    pub dropped_references: Vec<String>,
}

/// 一次批次尝试的持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub session_id: String,
    pub process_id: String,
    pub batch_index: usize,
    /// 第几次尝试（从 1 开始），时间戳相同时用于排序
    #[serde(default)]
    pub attempt: u32,
    #[serde(rename = "timestamp")]
    pub attempt_timestamp: DateTime<Utc>,
    pub status: RecordStatus,
    /// 本批包含的检查项，失败记录也能据此生成兜底结果
    #[serde(default)]
    pub row_ids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcomes: Option<Vec<MatchOutcome>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<ReferenceDiagnostics>,
}

/// 记录所属的批次尝试
#[derive(Debug, Clone)]
pub struct AttemptInfo<'a> {
    pub session_id: &'a str,
    pub process_id: &'a str,
    pub batch_index: usize,
    pub attempt: u32,
    pub row_ids: Vec<u32>,
}

impl BatchRecord {
    pub fn successful(
        info: AttemptInfo<'_>,
        outcomes: Vec<MatchOutcome>,
        token_usage: TokenUsage,
        diagnostics: Vec<ReferenceDiagnostics>,
    ) -> Self {
        Self {
            session_id: info.session_id.to_string(),
            process_id: info.process_id.to_string(),
            batch_index: info.batch_index,
            attempt: info.attempt,
            attempt_timestamp: Utc::now(),
            status: RecordStatus::Successful,
            row_ids: info.row_ids,
            outcomes: Some(outcomes),
            error_message: None,
            token_usage,
            diagnostics,
        }
    }

    pub fn failed(info: AttemptInfo<'_>, error_message: impl Into<String>, token_usage: TokenUsage) -> Self {
        Self {
            session_id: info.session_id.to_string(),
            process_id: info.process_id.to_string(),
            batch_index: info.batch_index,
            attempt: info.attempt,
            attempt_timestamp: Utc::now(),
            status: RecordStatus::Failed,
            row_ids: info.row_ids,
            outcomes: None,
            error_message: Some(error_message.into()),
            token_usage,
            diagnostics: Vec::new(),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status == RecordStatus::Successful
    }

    /// 存储键：`<分区>/<session>_<process>_batch_<索引>_attempt_<次数>_<时间戳>.json`
    pub fn storage_key(&self) -> String {
        format!(
            "{}/{}_{}_batch_{:03}_attempt_{}_{}.json",
            self.status.partition(),
            self.session_id,
            self.process_id,
            self.batch_index,
            self.attempt,
            self.attempt_timestamp.format("%Y%m%dT%H%M%S%.9fZ")
        )
    }

    /// 本记录对应的结果：成功记录返回真实结果，失败记录返回兜底结果
    pub fn resolved_outcomes(&self) -> Vec<MatchOutcome> {
        match (&self.status, &self.outcomes) {
            (RecordStatus::Successful, Some(outcomes)) => outcomes.clone(),
            _ => {
                let cause = self.error_message.as_deref().unwrap_or("unknown error");
                MatchOutcome::fallback_for_rows(&self.row_ids, cause)
            }
        }
    }

    /// 同一批次内的先后顺序
    pub fn ordering_key(&self) -> (DateTime<Utc>, u32) {
        (self.attempt_timestamp, self.attempt)
    }
}
