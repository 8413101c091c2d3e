//! 批次处理流程 - 流程层
//!
//! 核心职责：定义"一个批次"的完整处理流程
//!
//! 流程顺序（每次尝试）：
//! 1. 检查任务截止时间，过期则不再发起新的尝试
//! 2. 调用 oracle（单次调用有超时，已发出的调用会等到结束）
//! 3. 校验结果形状（数量、row_id 是否属于本批、是否重复）
//! 4. 引用校验与修正
//! 5. 写入尝试记录（成功或失败）
//! 6. 失败则按退避时间等待后重试，重试耗尽时生成兜底结果

use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::{self, Instant};
use tracing::{error, info, warn};

use crate::config::SchedulerOptions;
use crate::error::{AppResult, OracleError};
use crate::models::{
    batch_confidence_score, AttemptInfo, Batch, BatchRecord, JobStatus, MatchOutcome, ReferenceDiagnostics,
    TokenUsage,
};
use crate::services::{DocumentContext, MatchOracle, ProgressTracker, ReferenceValidator, ResultStore};
use crate::utils::logging::log_batch_complete;
use crate::workflow::batch_ctx::BatchCtx;

/// 批次的最终结论
#[derive(Debug, Clone, PartialEq)]
pub enum BatchResolution {
    /// 某次尝试成功
    Succeeded {
        attempts: u32,
        outcomes: Vec<MatchOutcome>,
    },
    /// 重试耗尽，使用兜底结果
    Exhausted {
        attempts: u32,
        last_error: OracleError,
        outcomes: Vec<MatchOutcome>,
    },
    /// 截止时间已过，批次未完成
    DeadlineExceeded {
        attempts: u32,
        last_error: Option<OracleError>,
    },
}

impl BatchResolution {
    pub fn attempts(&self) -> u32 {
        match self {
            BatchResolution::Succeeded { attempts, .. }
            | BatchResolution::Exhausted { attempts, .. }
            | BatchResolution::DeadlineExceeded { attempts, .. } => *attempts,
        }
    }

    pub fn outcomes(&self) -> &[MatchOutcome] {
        match self {
            BatchResolution::Succeeded { outcomes, .. } | BatchResolution::Exhausted { outcomes, .. } => outcomes,
            BatchResolution::DeadlineExceeded { .. } => &[],
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, BatchResolution::DeadlineExceeded { .. })
    }
}

/// 一个任务内所有批次共享的处理流程
///
/// - 决定何时调用 oracle、何时重试、何时兜底
/// - 只依赖业务能力（services）
pub struct BatchFlow {
    oracle: Arc<dyn MatchOracle>,
    validator: Arc<ReferenceValidator>,
    store: Arc<ResultStore>,
    tracker: Arc<ProgressTracker>,
    options: SchedulerOptions,
    context: Arc<DocumentContext>,
    prior_instructions: Option<String>,
    tracker_id: String,
    deadline: Instant,
}

impl BatchFlow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        oracle: Arc<dyn MatchOracle>,
        validator: Arc<ReferenceValidator>,
        store: Arc<ResultStore>,
        tracker: Arc<ProgressTracker>,
        options: SchedulerOptions,
        context: Arc<DocumentContext>,
        prior_instructions: Option<String>,
        tracker_id: String,
        deadline: Instant,
    ) -> Self {
        Self {
            oracle,
            validator,
            store,
            tracker,
            options,
            context,
            prior_instructions,
            tracker_id,
            deadline,
        }
    }

    /// 处理一个批次直到成功、重试耗尽或截止时间到达
    ///
    /// 只有存储和进度跟踪的错误会返回 `Err`，oracle 的错误都在这里消化。
    pub async fn run(&self, batch: &Batch, ctx: &BatchCtx) -> AppResult<BatchResolution> {
        let max_attempts = self.options.max_attempts();
        let mut last_error: Option<OracleError> = None;
        let mut attempt: u32 = 0;

        while attempt < max_attempts {
            if Instant::now() >= self.deadline {
                warn!("{} ⏰ 已到达任务截止时间，停止尝试 (已尝试 {} 次)", ctx, attempt);
                return Ok(BatchResolution::DeadlineExceeded { attempts: attempt, last_error });
            }

            attempt += 1;
            let info = AttemptInfo {
                session_id: &ctx.session_id,
                process_id: &ctx.process_id,
                batch_index: batch.batch_index,
                attempt,
                row_ids: batch.row_ids(),
            };

            match self.attempt(batch, ctx, attempt).await {
                Ok((outcomes, usage, diagnostics)) => {
                    let found = outcomes.iter().filter(|o| o.found).count();
                    info!(
                        "{} ✓ 第 {} 次尝试成功: 找到 {}/{}，置信度得分 {:.2}",
                        ctx,
                        attempt,
                        found,
                        outcomes.len(),
                        batch_confidence_score(&outcomes)
                    );

                    self.tracker
                        .update(&self.tracker_id, batch.batch_index, &outcomes, JobStatus::Processing, None)?;
                    let record = BatchRecord::successful(info, outcomes.clone(), usage, diagnostics);
                    self.store.persist(&record).await?;

                    log_batch_complete(ctx.batch_number(), ctx.total_batches, found, outcomes.len());
                    return Ok(BatchResolution::Succeeded { attempts: attempt, outcomes });
                }
                Err((err, usage)) => {
                    warn!("{} ⚠️ 第 {}/{} 次尝试失败: {}", ctx, attempt, max_attempts, err);
                    let record = BatchRecord::failed(info, err.to_string(), usage);
                    self.store.persist(&record).await?;
                    last_error = Some(err);
                }
            }

            if attempt < max_attempts {
                self.backoff(attempt).await;
            }
        }

        let last_error = last_error.unwrap_or_else(|| OracleError::Api("no attempt was made".to_string()));
        error!("{} ❌ 重试 {} 次后仍失败，使用兜底结果: {}", ctx, attempt, last_error);

        let outcomes = MatchOutcome::fallback_for_batch(batch, &last_error.to_string());
        self.tracker
            .update(&self.tracker_id, batch.batch_index, &outcomes, JobStatus::Processing, None)?;
        log_batch_complete(ctx.batch_number(), ctx.total_batches, 0, outcomes.len());

        Ok(BatchResolution::Exhausted {
            attempts: attempt,
            last_error,
            outcomes,
        })
    }

    /// 一次尝试：调用 oracle → 形状校验 → 引用校验
    async fn attempt(
        &self,
        batch: &Batch,
        ctx: &BatchCtx,
        attempt: u32,
    ) -> Result<(Vec<MatchOutcome>, TokenUsage, Vec<ReferenceDiagnostics>), (OracleError, TokenUsage)> {
        info!("{} 🔍 第 {} 次调用 oracle ({} 项)", ctx, attempt, batch.len());

        let call = self
            .oracle
            .match_batch(batch, &self.context, self.prior_instructions.as_deref());
        // 已发出的调用不受任务截止时间影响
        let answer = match time::timeout(self.options.oracle_timeout, call).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(err)) => return Err((err, TokenUsage::default())),
            Err(_) => return Err((OracleError::timeout(self.options.oracle_timeout), TokenUsage::default())),
        };

        let usage = answer.usage;
        let outcomes = check_shape(batch, answer.outcomes).map_err(|err| (err, usage))?;

        let mut corrected = Vec::with_capacity(outcomes.len());
        let mut diagnostics = Vec::with_capacity(outcomes.len());
        for outcome in &outcomes {
            let validated = self.validator.validate(outcome);
            if !validated.diagnostics.dropped_references.is_empty() {
                warn!(
                    "{} 检查项 #{} 丢弃无效引用: {:?}",
                    ctx, outcome.row_id, validated.diagnostics.dropped_references
                );
            }
            corrected.push(validated.outcome.normalized());
            diagnostics.push(validated.diagnostics);
        }

        Ok((corrected, usage, diagnostics))
    }

    /// 退避等待，不超过截止时间
    async fn backoff(&self, attempt: u32) {
        let delay = self.options.delay_for_attempt(attempt);
        let wake_at = Instant::now()
            .checked_add(delay)
            .map_or(self.deadline, |at| at.min(self.deadline));
        time::sleep_until(wake_at).await;
    }
}

/// 校验 oracle 结果与批次一致：数量相同、row_id 都属于本批且不重复
///
/// 通过后按 row_id 排序返回。
pub fn check_shape(batch: &Batch, mut outcomes: Vec<MatchOutcome>) -> Result<Vec<MatchOutcome>, OracleError> {
    if outcomes.len() != batch.len() {
        return Err(OracleError::Validation(format!(
            "结果数量 {} 与批次大小 {} 不一致",
            outcomes.len(),
            batch.len()
        )));
    }

    let mut seen = HashSet::with_capacity(outcomes.len());
    for outcome in &outcomes {
        if !batch.contains_row(outcome.row_id) {
            return Err(OracleError::Validation(format!("未知的 row_id {}", outcome.row_id)));
        }
        if !seen.insert(outcome.row_id) {
            return Err(OracleError::Validation(format!("重复的 row_id {}", outcome.row_id)));
        }
    }

    outcomes.sort_by_key(|o| o.row_id);
    Ok(outcomes)
}
