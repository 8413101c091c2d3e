use crate::models::work_item::WorkItem;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::fs;

/// TOML 目录文件中的一行
///
/// ```toml
/// [[items]]
/// category = "Concrete"
/// scope_of_work = "Foundations"
/// checklist = "Verify rebar spacing"
/// sector = "Commercial"
/// ```
#[derive(Debug, Clone, Deserialize)]
struct CatalogRow {
    #[serde(default)]
    category: String,
    #[serde(default)]
    scope_of_work: String,
    #[serde(default)]
    checklist: String,
    #[serde(default)]
    sector: String,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    items: Vec<CatalogRow>,
}

/// 从 TOML 文本解析目录
///
/// 检查项正文为空的行会被丢弃，其余行按文件顺序分配 row_id（从 1 开始）。
pub fn parse_catalog(content: &str) -> Result<Vec<WorkItem>> {
    let file: CatalogFile = toml::from_str(content).context("无法解析目录 TOML")?;

    let items = file
        .items
        .into_iter()
        .filter(|row| !row.checklist.trim().is_empty())
        .enumerate()
        .map(|(idx, row)| {
            WorkItem::new(
                idx as u32 + 1,
                row.category.trim(),
                row.scope_of_work.trim(),
                row.checklist.trim(),
                row.sector.trim(),
            )
        })
        .collect();

    Ok(items)
}

/// 从 TOML 文件加载目录
pub async fn load_catalog(path: &Path) -> Result<Vec<WorkItem>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("无法读取目录文件: {}", path.display()))?;

    let items = parse_catalog(&content)
        .with_context(|| format!("无法解析目录文件: {}", path.display()))?;

    tracing::info!(
        "成功加载 {} 个检查项: {}",
        items.len(),
        path.file_name().unwrap_or_default().to_string_lossy()
    );

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[items]]
category = "Concrete"
scope_of_work = "Foundations"
checklist = "Verify rebar spacing"
sector = "Commercial"

[[items]]
category = "Blank"
checklist = "   "

[[items]]
category = " Electrical "
scope_of_work = "Power"
checklist = "Panel schedules provided"
sector = "Residential"
"#;

    #[test]
    fn test_parse_catalog_assigns_row_ids() {
        let items = parse_catalog(SAMPLE).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].row_id, 1);
        assert_eq!(items[0].description, "Verify rebar spacing");
        assert_eq!(items[1].row_id, 2);
        assert_eq!(items[1].category, "Electrical");
    }

    #[test]
    fn test_parse_catalog_rejects_invalid_toml() {
        assert!(parse_catalog("[[items]\ncategory = ").is_err());
    }

    #[test]
    fn test_parse_empty_catalog() {
        assert!(parse_catalog("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_catalog_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let items = load_catalog(&path).await.unwrap();
        assert_eq!(items.len(), 2);

        assert!(load_catalog(&dir.path().join("missing.toml")).await.is_err());
    }
}
