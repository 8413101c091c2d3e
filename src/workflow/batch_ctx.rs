//! 批次处理上下文
//!
//! 封装"我正在处理哪个任务的第几批"这一信息

use std::fmt::Display;

/// 批次处理上下文
#[derive(Debug, Clone)]
pub struct BatchCtx {
    pub session_id: String,
    pub process_id: String,
    /// 批次索引（从 0 开始）
    pub batch_index: usize,
    pub total_batches: usize,
}

impl BatchCtx {
    pub fn new(session_id: &str, process_id: &str, batch_index: usize, total_batches: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            process_id: process_id.to_string(),
            batch_index,
            total_batches,
        }
    }

    /// 日志显示用的批次编号（从 1 开始）
    pub fn batch_number(&self) -> usize {
        self.batch_index + 1
    }
}

impl Display for BatchCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[批次 {}/{}]", self.batch_number(), self.total_batches)
    }
}
