//! 合并某个会话/任务的全部批次记录，生成最终报告
//!
//! 每个批次取最后一条记录（按时间戳，时间戳相同按尝试次数），
//! 失败记录展开为兜底结果，最终按 row_id 排序。输入记录不变时输出逐字节相同。

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::StoreError;
use crate::models::{BatchRecord, MatchOutcome, TokenUsage};
use crate::services::result_store::{retention_cutoff, ResultStore, COMBINED_PARTITION};

const KEY_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.9fZ";

/// 合并后的报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedReport {
    pub session_id: String,
    pub process_id: String,
    /// 有记录的批次数
    pub total_batches: usize,
    pub successful_batches: usize,
    pub failed_batches: usize,
    /// 全部批次尝试次数
    pub total_attempts: usize,
    pub total_items: usize,
    pub found_items: usize,
    pub not_found_items: usize,
    /// 由失败记录生成的兜底结果数量
    pub fallback_items: usize,
    /// successful_batches / total_batches × 100
    pub success_rate: f64,
    pub token_usage: TokenUsage,
    pub outcomes: Vec<MatchOutcome>,
}

impl CombinedReport {
    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// 从记录列表构建报告（纯函数）
///
/// `records` 需已按会话/任务过滤，按存储键排序。
pub fn build_report(session_id: &str, process_id: &str, records: &[BatchRecord]) -> CombinedReport {
    let mut latest: BTreeMap<usize, &BatchRecord> = BTreeMap::new();
    for record in records {
        match latest.get(&record.batch_index) {
            Some(current) if current.ordering_key() >= record.ordering_key() => {}
            _ => {
                latest.insert(record.batch_index, record);
            }
        }
    }

    let token_usage: TokenUsage = records.iter().map(|r| r.token_usage).sum();

    let mut by_row: BTreeMap<u32, MatchOutcome> = BTreeMap::new();
    let mut successful_batches = 0;
    let mut fallback_items = 0;
    for record in latest.values() {
        let outcomes = record.resolved_outcomes();
        if record.is_successful() {
            successful_batches += 1;
        } else {
            fallback_items += outcomes.len();
        }
        for outcome in outcomes {
            by_row.entry(outcome.row_id).or_insert(outcome);
        }
    }

    let outcomes: Vec<MatchOutcome> = by_row.into_values().collect();
    let found_items = outcomes.iter().filter(|o| o.found).count();
    let total_batches = latest.len();
    let success_rate = if total_batches == 0 {
        0.0
    } else {
        successful_batches as f64 / total_batches as f64 * 100.0
    };

    CombinedReport {
        session_id: session_id.to_string(),
        process_id: process_id.to_string(),
        total_batches,
        successful_batches,
        failed_batches: total_batches - successful_batches,
        total_attempts: records.len(),
        total_items: outcomes.len(),
        found_items,
        not_found_items: outcomes.len() - found_items,
        fallback_items,
        success_rate,
        token_usage,
        outcomes,
    }
}

/// 结果合并器
pub struct ResultCombiner {
    store: Arc<ResultStore>,
}

impl ResultCombiner {
    pub fn new(store: Arc<ResultStore>) -> Self {
        Self { store }
    }

    /// 合并某个会话/任务的全部记录
    pub async fn combine(&self, session_id: &str, process_id: &str) -> Result<CombinedReport, StoreError> {
        let records: Vec<BatchRecord> = self
            .store
            .records_for(session_id, process_id)
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect();

        let report = build_report(session_id, process_id, &records);
        info!(
            "📋 [任务 {}] 合并 {} 条记录: {} 批, 找到 {}/{}",
            process_id,
            report.total_attempts,
            report.total_batches,
            report.found_items,
            report.total_items
        );
        Ok(report)
    }

    /// 保存合并报告到 combined 分区，返回存储键
    pub async fn save_combined(&self, report: &CombinedReport) -> Result<String, StoreError> {
        let key = format!(
            "{}/{}_{}_combined_{}.json",
            COMBINED_PARTITION,
            report.session_id,
            report.process_id,
            Utc::now().format(KEY_TIMESTAMP_FORMAT)
        );
        self.store.put_json(&key, report).await?;
        info!("💾 合并报告已保存: {}", key);
        Ok(key)
    }

    /// 删除保存时间早于 `max_age` 的合并报告，返回删除数量
    ///
    /// 保存时间取自存储键中的时间戳，无法解析的键保留。
    pub async fn cleanup_combined_older_than(&self, max_age: Duration) -> Result<usize, StoreError> {
        let Some(cutoff) = retention_cutoff(Utc::now(), max_age) else {
            return Ok(0);
        };

        let mut deleted = 0;
        for key in self.store.keys(COMBINED_PARTITION).await? {
            let expired = saved_at(&key).is_some_and(|at| at < cutoff);
            if expired && self.store.delete(&key).await? {
                deleted += 1;
            }
        }
        info!("🧹 已清理 {} 个过期合并报告", deleted);
        Ok(deleted)
    }

    /// 最近一次保存的合并报告
    pub async fn latest_combined(
        &self,
        session_id: &str,
        process_id: &str,
    ) -> Result<Option<CombinedReport>, StoreError> {
        let reports: Vec<(String, CombinedReport)> = self.store.read_partition(COMBINED_PARTITION).await?;
        Ok(reports
            .into_iter()
            .filter(|(_, r)| r.session_id == session_id && r.process_id == process_id)
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, report)| report))
    }
}

/// 从 `combined/<session>_<process>_combined_<时间戳>.json` 中取出保存时间
fn saved_at(key: &str) -> Option<DateTime<Utc>> {
    let stamp = key.strip_suffix(".json")?.rsplit_once("_combined_")?.1;
    NaiveDateTime::parse_from_str(stamp, KEY_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
