//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责任务生命周期和并发调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app` - 应用入口
//! - 初始化日志、存储、oracle
//! - 加载目录，运行任务，合并并保存报告
//!
//! ### `batch_scheduler` - 批次调度器
//! - 切分批次，控制并发数量（Semaphore）
//! - 维护任务状态与进度，判定任务最终状态
//!
//! ### `job` - 任务注册表
//! - 任务状态机 `Pending → Processing → {Completed, Failed}`
//!
//! ## 层次关系
//!
//! ```text
//! app (加载目录 / 合并报告)
//!     ↓
//! batch_scheduler (处理 Vec<Batch>)
//!     ↓
//! workflow::BatchFlow (处理单个 Batch)
//!     ↓
//! services (能力层：oracle / validator / tracker / store)
//! ```

pub mod app;
pub mod batch_scheduler;
pub mod job;

pub use app::App;
pub use batch_scheduler::{BatchScheduler, JobContext, JobHandle, ResultSet};
pub use job::{Job, JobRegistry};
