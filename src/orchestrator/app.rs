//! 应用入口 - 编排层
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：日志文件、配置校验、存储目录、oracle
//! 2. **加载目录**：读取 TOML 检查项目录和文档上下文
//! 3. **运行任务**：委托 BatchScheduler 完成全部批次
//! 4. **合并结果**：合并记录并保存报告，输出全局统计
//! 5. **清理**：按保留期限删除旧记录和旧报告

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::models::{load_catalog, JobStatus};
use crate::orchestrator::batch_scheduler::{BatchScheduler, JobContext};
use crate::orchestrator::job::JobRegistry;
use crate::services::{
    CombinedReport, DocumentContext, FileBlobStore, LlmOracle, ProgressTracker, ReferenceValidator,
    ResultCombiner, ResultStore,
};
use crate::utils::logging::{init_log_file, log_startup, print_final_stats};

/// 应用主结构
pub struct App {
    config: Config,
    scheduler: BatchScheduler,
    combiner: ResultCombiner,
    store: Arc<ResultStore>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        init_log_file(&config.output_log_file)?;
        config.validate()?;

        let oracle = LlmOracle::new(&config);
        log_startup(config.batch_size, config.max_concurrent_batches, oracle.model_name());

        let blobs = FileBlobStore::new(config.storage_root());
        blobs
            .ensure_layout()
            .await
            .with_context(|| format!("无法创建存储目录: {}", config.json_storage_folder))?;
        let store = Arc::new(ResultStore::new(Arc::new(blobs)));

        let validator = ReferenceValidator::new().context("引用格式规则编译失败")?;
        let scheduler = BatchScheduler::new(
            Arc::new(oracle),
            Arc::new(validator),
            store.clone(),
            Arc::new(ProgressTracker::new()),
            Arc::new(JobRegistry::new()),
            config.scheduler_options(),
        );
        let combiner = ResultCombiner::new(store.clone());

        Ok(Self {
            config,
            scheduler,
            combiner,
            store,
        })
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<CombinedReport> {
        info!("\n📁 正在加载检查项目录: {}", self.config.catalog_path);
        let catalog = load_catalog(Path::new(&self.config.catalog_path)).await?;
        if catalog.is_empty() {
            warn!("⚠️ 目录中没有有效的检查项");
        }

        let document = self.load_document_context().await?;
        let session_id = self
            .config
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info!("🔑 会话 ID: {}", session_id);

        let ctx = JobContext::new(&session_id, document, self.config.processing_timeout());
        let result = self
            .scheduler
            .run(
                &catalog,
                self.config.batch_size,
                self.config.max_concurrent_batches,
                ctx,
            )
            .await?;

        if result.status == JobStatus::Failed {
            warn!(
                "⚠️ 任务失败: {}，合并已有的部分结果",
                result.error.as_deref().unwrap_or("unknown")
            );
        }

        let report = self.combiner.combine(&session_id, &result.process_id).await?;
        self.combiner.save_combined(&report).await?;

        print_final_stats(
            report.found_items,
            report.total_items,
            report.success_rate,
            &self.config.output_log_file,
        );

        self.cleanup_expired().await?;

        let stats = self.store.storage_stats().await?;
        info!(
            "🗂️ 存储统计: 成功记录 {}, 失败记录 {}, 合并报告 {}",
            stats.successful_records, stats.failed_records, stats.combined_reports
        );

        Ok(report)
    }

    /// 按保留期限清理旧记录和旧报告
    async fn cleanup_expired(&self) -> Result<()> {
        if let Some(max_age) = self.config.record_retention() {
            self.store.cleanup_older_than(max_age).await?;
        }
        if let Some(max_age) = self.config.combined_retention() {
            self.combiner.cleanup_combined_older_than(max_age).await?;
        }
        Ok(())
    }

    /// 读取文档上下文，未配置时使用默认文本
    async fn load_document_context(&self) -> Result<DocumentContext> {
        match &self.config.document_context_file {
            Some(path) => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("无法读取文档上下文: {}", path))?;
                info!("📄 已加载文档上下文: {} ({} 字符)", path, text.chars().count());
                Ok(DocumentContext::new(text))
            }
            None => Ok(DocumentContext::default()),
        }
    }
}
