use serde::{Deserialize, Serialize};

/// 检查项（目录中的一条需求）
///
/// `row_id` 在目录加载时分配（从 1 开始），之后不再变化，也不会复用。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub row_id: u32,
    pub category: String,
    pub scope_of_work: String,
    /// 检查项正文
    pub description: String,
    pub sector: String,
}

impl WorkItem {
    pub fn new(
        row_id: u32,
        category: impl Into<String>,
        scope_of_work: impl Into<String>,
        description: impl Into<String>,
        sector: impl Into<String>,
    ) -> Self {
        Self {
            row_id,
            category: category.into(),
            scope_of_work: scope_of_work.into(),
            description: description.into(),
            sector: sector.into(),
        }
    }
}

/// 批次：目录中一段连续的检查项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// 批次在任务内的索引（从 0 开始）
    pub batch_index: usize,
    pub items: Vec<WorkItem>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 本批所有检查项的 row_id（保持顺序）
    pub fn row_ids(&self) -> Vec<u32> {
        self.items.iter().map(|item| item.row_id).collect()
    }

    pub fn contains_row(&self, row_id: u32) -> bool {
        self.items.iter().any(|item| item.row_id == row_id)
    }
}

/// 把目录切分为若干批次
///
/// 每批最多 `batch_size` 项，最后一批可以更小；空目录得到零个批次。
/// `batch_size` 为 0 时按 1 处理。
pub fn split_into_batches(catalog: &[WorkItem], batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    catalog
        .chunks(batch_size)
        .enumerate()
        .map(|(batch_index, chunk)| Batch {
            batch_index,
            items: chunk.to_vec(),
        })
        .collect()
}

/// 批次数量：ceil(total / batch_size)
pub fn batch_count(total_items: usize, batch_size: usize) -> usize {
    let batch_size = batch_size.max(1);
    (total_items + batch_size - 1) / batch_size
}
