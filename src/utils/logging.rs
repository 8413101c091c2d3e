/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use anyhow::Result;
use std::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 初始化 tracing 输出
///
/// 优先使用 `RUST_LOG`，否则按 `verbose` 选择 debug / info。重复调用不会报错。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 初始化日志文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n检查项匹配日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)?;
    Ok(())
}

/// 记录程序启动信息
pub fn log_startup(batch_size: usize, max_concurrent: usize, model: &str) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 检查项批量匹配模式");
    info!("📊 每批 {} 项, 最大并发批次: {}", batch_size, max_concurrent);
    info!("🤖 模型: {}", model);
    info!("{}", "=".repeat(60));
}

/// 记录任务开始信息
///
/// # 参数
/// - `process_id`: 任务 ID
/// - `total_items`: 检查项总数
/// - `total_batches`: 批次总数
pub fn log_job_start(process_id: &str, total_items: usize, total_batches: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📦 [任务 {}] 开始处理", process_id);
    info!("📄 共 {} 个检查项, 分为 {} 批", total_items, total_batches);
    info!("{}", "=".repeat(60));
}

/// 记录批次完成信息
pub fn log_batch_complete(batch_num: usize, total_batches: usize, found: usize, total: usize) {
    info!("{}", "─".repeat(60));
    info!("✓ 第 {}/{} 批完成: 找到 {}/{}", batch_num, total_batches, found, total);
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息
///
/// # 参数
/// - `found`: 已找到数量
/// - `total`: 检查项总数
/// - `success_rate`: 批次成功率（百分比，0~100）
/// - `log_file_path`: 日志文件路径
pub fn print_final_stats(found: usize, total: usize, success_rate: f64, log_file_path: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 已找到: {}/{}", found, total);
    info!("❌ 未找到: {}", total.saturating_sub(found));
    info!("{}", success_rate_line(success_rate));
    info!("{}", "=".repeat(60));
    info!("\n日志已保存至: {}", log_file_path);
}

/// 批次成功率日志行，`success_rate` 已是百分比
pub fn success_rate_line(success_rate: f64) -> String {
    format!("📈 批次成功率: {:.1}%", success_rate)
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度（按字符计）
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
