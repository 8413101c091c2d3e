//! # Checklist Match
//!
//! 用 LLM 在施工图纸和规范文档中批量查找检查项的 Rust 应用程序
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 数据模型（Models）
//! - `models/` - 检查项、批次、匹配结果、尝试记录、进度快照
//! - `loaders` - TOML 目录加载
//!
//! ### ② 业务能力层（Services）
//! - `MatchOracle` / `LlmOracle` - 批次匹配能力
//! - `ReferenceValidator` - 图纸编号与规范章节的校验和修正
//! - `ProgressTracker` - 任务进度跟踪
//! - `ResultStore` / `ResultCombiner` - 记录存储与合并
//!
//! ### ③ 流程层（Workflow）
//! - `BatchCtx` - 上下文封装（session + process + 批次编号）
//! - `BatchFlow` - 单批流程（oracle → 形状校验 → 引用校验 → 记录 → 重试/兜底）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_scheduler` - 批次调度，管理并发和任务状态
//! - `orchestrator/app` - 应用入口
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::{Config, SchedulerOptions};
pub use error::{AppError, AppResult, OracleError};
pub use models::{Batch, BatchRecord, Confidence, JobStatus, MatchOutcome, ProgressSnapshot, TokenUsage, WorkItem};
pub use orchestrator::{App, BatchScheduler, JobContext, JobHandle, JobRegistry, ResultSet};
pub use services::{
    CombinedReport, DocumentContext, MatchOracle, OracleAnswer, ProgressTracker, ReferenceValidator,
    ResultCombiner, ResultStore,
};
pub use workflow::{BatchCtx, BatchFlow, BatchResolution};
