//! 批次调度器 - 编排层
//!
//! ## 职责
//!
//! 1. **切分**：把目录切成固定大小的批次
//! 2. **并发控制**：使用 Semaphore 限制同时处理的批次数量
//! 3. **生命周期**：维护任务状态机和进度跟踪器
//! 4. **结果汇总**：按 row_id 排序输出全部结果
//!
//! 单个批次的重试、校验、写记录由 `workflow::BatchFlow` 完成。

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerOptions;
use crate::error::{AppError, AppResult, OracleError};
use crate::models::{split_into_batches, Batch, JobStatus, MatchOutcome, WorkItem};
use crate::orchestrator::job::{Job, JobRegistry};
use crate::services::{DocumentContext, MatchOracle, ProgressTracker, ReferenceValidator, ResultStore};
use crate::utils::logging::log_job_start;
use crate::workflow::{BatchCtx, BatchFlow, BatchResolution};

/// 任务参数
#[derive(Debug, Clone)]
pub struct JobContext {
    pub session_id: String,
    pub document_context: Arc<DocumentContext>,
    /// 附加在系统指令后的说明
    pub prior_instructions: Option<String>,
    /// 整个任务的超时时间
    pub timeout: Duration,
}

impl JobContext {
    pub fn new(session_id: impl Into<String>, document_context: DocumentContext, timeout: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            document_context: Arc::new(document_context),
            prior_instructions: None,
            timeout,
        }
    }

    pub fn with_prior_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.prior_instructions = Some(instructions.into());
        self
    }
}

/// 任务结束后的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub process_id: String,
    pub session_id: String,
    pub tracker_id: String,
    pub status: JobStatus,
    /// 已完成批次的结果，按 row_id 排序
    pub outcomes: Vec<MatchOutcome>,
    /// 兜底结果数量
    pub fallback_count: usize,
    /// 截止时间到达时仍未完成的批次数量
    pub unresolved_batches: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 后台任务句柄
pub struct JobHandle {
    pub process_id: String,
    pub session_id: String,
    pub tracker_id: String,
    status: watch::Receiver<JobStatus>,
    task: JoinHandle<AppResult<ResultSet>>,
}

impl JobHandle {
    /// 当前状态
    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// 等待任务进入终态，超时返回 None
    pub async fn wait(&mut self, timeout: Duration) -> Option<JobStatus> {
        let waited = match time::timeout(timeout, self.status.wait_for(|s| s.is_terminal())).await {
            Ok(Ok(status)) => Some(*status),
            Ok(Err(_)) => None,
            Err(_) => return None,
        };
        if waited.is_some() {
            return waited;
        }

        // 发送端已关闭，以最后一次状态为准
        let status = *self.status.borrow();
        status.is_terminal().then_some(status)
    }

    /// 等待任务结束并取回结果
    pub async fn join(self) -> AppResult<ResultSet> {
        self.task
            .await
            .map_err(|e| AppError::other(format!("任务执行失败: {}", e)))?
    }
}

/// 批次调度器
#[derive(Clone)]
pub struct BatchScheduler {
    oracle: Arc<dyn MatchOracle>,
    validator: Arc<ReferenceValidator>,
    store: Arc<ResultStore>,
    tracker: Arc<ProgressTracker>,
    registry: Arc<JobRegistry>,
    options: SchedulerOptions,
}

impl BatchScheduler {
    pub fn new(
        oracle: Arc<dyn MatchOracle>,
        validator: Arc<ReferenceValidator>,
        store: Arc<ResultStore>,
        tracker: Arc<ProgressTracker>,
        registry: Arc<JobRegistry>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            oracle,
            validator,
            store,
            tracker,
            registry,
            options,
        }
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// 运行一个任务直到结束
    pub async fn run(
        &self,
        catalog: &[WorkItem],
        batch_size: usize,
        concurrency_limit: usize,
        ctx: JobContext,
    ) -> AppResult<ResultSet> {
        self.submit(catalog.to_vec(), batch_size, concurrency_limit, ctx)
            .join()
            .await
    }

    /// 在后台启动任务，立即返回句柄
    pub fn submit(
        &self,
        catalog: Vec<WorkItem>,
        batch_size: usize,
        concurrency_limit: usize,
        ctx: JobContext,
    ) -> JobHandle {
        let process_id = Uuid::new_v4().to_string();
        let batches = split_into_batches(&catalog, batch_size);
        let total_items = catalog.len();

        let tracker_id = self.tracker.create_tracker(&process_id, batches.len(), total_items);
        self.registry.insert(Job::new(
            &process_id,
            &ctx.session_id,
            &tracker_id,
            batches.len(),
            total_items,
        ));

        let (status_tx, status_rx) = watch::channel(JobStatus::Pending);
        let scheduler = self.clone();
        let run = JobRun {
            process_id: process_id.clone(),
            tracker_id: tracker_id.clone(),
            deadline: job_deadline(Instant::now(), ctx.timeout),
            ctx,
            status_tx,
        };
        let session_id = run.ctx.session_id.clone();

        let task = tokio::spawn(async move {
            scheduler
                .execute(run, batches, total_items, concurrency_limit)
                .await
        });

        JobHandle {
            process_id,
            session_id,
            tracker_id,
            status: status_rx,
            task,
        }
    }

    async fn execute(
        &self,
        run: JobRun,
        batches: Vec<Batch>,
        total_items: usize,
        concurrency_limit: usize,
    ) -> AppResult<ResultSet> {
        let total_batches = batches.len();
        log_job_start(&run.process_id, total_items, total_batches);
        self.set_status(&run, JobStatus::Processing, None)?;

        if batches.is_empty() {
            info!("[任务 {}] 目录为空，直接完成", run.process_id);
            self.set_status(&run, JobStatus::Completed, None)?;
            return Ok(run.result_set(JobStatus::Completed, Vec::new(), 0, 0, None));
        }

        // 准备文档上下文，失败说明 oracle 不可用
        let prepared = time::timeout(self.options.oracle_timeout, self.oracle.prepare(&run.ctx.document_context))
            .await
            .unwrap_or_else(|_| Err(OracleError::timeout(self.options.oracle_timeout)));
        if let Err(e) = prepared {
            let message = format!("oracle unavailable: {}", e);
            error!("[任务 {}] ❌ 文档上下文准备失败: {}", run.process_id, e);
            self.set_status(&run, JobStatus::Failed, Some(message.clone()))?;
            return Ok(run.result_set(JobStatus::Failed, Vec::new(), 0, total_batches, Some(message)));
        }

        let flow = Arc::new(BatchFlow::new(
            self.oracle.clone(),
            self.validator.clone(),
            self.store.clone(),
            self.tracker.clone(),
            self.options.clone(),
            run.ctx.document_context.clone(),
            run.ctx.prior_instructions.clone(),
            run.tracker_id.clone(),
            run.deadline,
        ));
        let semaphore = Arc::new(Semaphore::new(concurrency_limit.max(1)));
        let halted = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(total_batches);

        for batch in batches {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::other(format!("无法获取并发许可: {}", e)))?;
            if halted.load(Ordering::SeqCst) {
                break;
            }

            let flow = flow.clone();
            let halted = halted.clone();
            let batch_ctx = BatchCtx::new(&run.ctx.session_id, &run.process_id, batch.batch_index, total_batches);

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let result = flow.run(&batch, &batch_ctx).await;
                if let Err(e) = &result {
                    error!("{} ❌ 处理过程中发生错误: {}", batch_ctx, e);
                    halted.store(true, Ordering::SeqCst);
                }
                result
            });
            handles.push(handle);
        }

        let mut summary = JobSummary::default();
        let mut worker_error: Option<AppError> = None;
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(resolution)) => summary.add(resolution),
                Ok(Err(e)) => {
                    worker_error.get_or_insert(e);
                }
                Err(e) => {
                    worker_error.get_or_insert(AppError::other(format!("批次任务异常退出: {}", e)));
                }
            }
        }

        if let Some(e) = worker_error {
            self.set_status(&run, JobStatus::Failed, Some(e.to_string()))?;
            return Err(e);
        }

        let deadline_elapsed = Instant::now() >= run.deadline;
        let (status, message) = summary.final_status(total_batches, deadline_elapsed);
        let unresolved = total_batches - summary.resolved;
        self.set_status(&run, status, message.clone())?;

        info!(
            "📊 [任务 {}] {}: 成功 {} 批, 兜底 {} 批, 未完成 {} 批, 共尝试 {} 次",
            run.process_id, status, summary.succeeded, summary.exhausted, unresolved, summary.attempts
        );

        let mut outcomes = summary.outcomes;
        outcomes.sort_by_key(|o| o.row_id);
        Ok(run.result_set(status, outcomes, summary.fallback_count, unresolved, message))
    }

    fn set_status(&self, run: &JobRun, status: JobStatus, error: Option<String>) -> AppResult<()> {
        self.registry.transition(&run.process_id, status, error.clone())?;
        self.tracker.set_status(&run.tracker_id, status, error)?;
        run.status_tx.send_replace(status);
        Ok(())
    }
}

/// 任务截止时间，超出 `Instant` 表示范围时取一个足够远的时间点
fn job_deadline(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS))
}

/// 约 30 年
const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

struct JobRun {
    process_id: String,
    tracker_id: String,
    deadline: Instant,
    ctx: JobContext,
    status_tx: watch::Sender<JobStatus>,
}

impl JobRun {
    fn result_set(
        &self,
        status: JobStatus,
        outcomes: Vec<MatchOutcome>,
        fallback_count: usize,
        unresolved_batches: usize,
        error: Option<String>,
    ) -> ResultSet {
        ResultSet {
            process_id: self.process_id.clone(),
            session_id: self.ctx.session_id.clone(),
            tracker_id: self.tracker_id.clone(),
            status,
            outcomes,
            fallback_count,
            unresolved_batches,
            error,
        }
    }
}

#[derive(Default)]
struct JobSummary {
    resolved: usize,
    succeeded: usize,
    exhausted: usize,
    exhausted_unreachable: usize,
    attempts: u32,
    fallback_count: usize,
    outcomes: Vec<MatchOutcome>,
}

impl JobSummary {
    fn add(&mut self, resolution: BatchResolution) {
        self.attempts += resolution.attempts();
        match resolution {
            BatchResolution::Succeeded { outcomes, .. } => {
                self.resolved += 1;
                self.succeeded += 1;
                self.outcomes.extend(outcomes);
            }
            BatchResolution::Exhausted {
                outcomes, last_error, ..
            } => {
                self.resolved += 1;
                self.exhausted += 1;
                if last_error.is_unreachable() {
                    self.exhausted_unreachable += 1;
                }
                self.fallback_count += outcomes.len();
                self.outcomes.extend(outcomes);
            }
            BatchResolution::DeadlineExceeded { .. } => {}
        }
    }

    /// 全部批次在截止时间前完成为 Completed；截止时间到达仍有未完成批次，
    /// 或没有任何批次成功且全部因 oracle 不可达而耗尽时为 Failed
    ///
    /// 截止时间前已发出的调用会等到结束，其结果保留，但任务仍为 Failed。
    fn final_status(&self, total_batches: usize, deadline_elapsed: bool) -> (JobStatus, Option<String>) {
        let unresolved = total_batches - self.resolved;
        if unresolved > 0 {
            warn!("⏰ 截止时间已到，{} 个批次未完成", unresolved);
            return (
                JobStatus::Failed,
                Some(format!("deadline exceeded: {} of {} batches unresolved", unresolved, total_batches)),
            );
        }
        if deadline_elapsed {
            warn!("⏰ 部分批次在截止时间之后才完成");
            return (
                JobStatus::Failed,
                Some("deadline exceeded: processing deadline elapsed before the job finished".to_string()),
            );
        }
        if self.succeeded == 0 && self.exhausted > 0 && self.exhausted_unreachable == self.exhausted {
            return (JobStatus::Failed, Some("oracle unreachable for every batch".to_string()));
        }
        (JobStatus::Completed, None)
    }
}
