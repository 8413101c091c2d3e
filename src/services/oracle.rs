//! 匹配 oracle 接口
//!
//! oracle 负责"一批检查项在文档中能否找到"的判断，可能很慢、会失败、也会答错。
//! 调度器只依赖这个 trait，测试中用脚本化实现替换。

use async_trait::async_trait;

use crate::error::OracleError;
use crate::models::{Batch, MatchOutcome, TokenUsage};

/// 文档上下文（只读，所有批次共享）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentContext {
    pub text: String,
}

impl DocumentContext {
    pub const DEFAULT_TEXT: &'static str =
        "Construction drawings and specifications uploaded for checklist review.";

    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Default for DocumentContext {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TEXT)
    }
}

/// oracle 的一次回答
#[derive(Debug, Clone, PartialEq)]
pub struct OracleAnswer {
    pub outcomes: Vec<MatchOutcome>,
    pub usage: TokenUsage,
}

/// 匹配 oracle
#[async_trait]
pub trait MatchOracle: Send + Sync {
    /// 任务开始前准备文档上下文，失败表示 oracle 不可用
    async fn prepare(&self, _context: &DocumentContext) -> Result<(), OracleError> {
        Ok(())
    }

    /// 匹配一个批次，结果中的 row_id 必须来自该批次
    async fn match_batch(
        &self,
        batch: &Batch,
        context: &DocumentContext,
        prior_instructions: Option<&str>,
    ) -> Result<OracleAnswer, OracleError>;
}
