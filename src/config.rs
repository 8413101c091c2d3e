use crate::error::ConfigError;
use std::path::PathBuf;
use std::time::Duration;

/// 程序配置
#[derive(Clone, Debug)]
pub struct Config {
    // --- 批处理配置 ---
    /// 每批检查项数量
    pub batch_size: usize,
    /// 同时处理的批次数量
    pub max_concurrent_batches: usize,
    /// 每批失败后最多重试次数（总尝试次数为 max_retries + 1）
    pub max_retries: u32,
    /// 首次重试前等待秒数
    pub batch_retry_delay: f64,
    /// 重试等待的增长倍数
    pub batch_backoff_factor: f64,
    /// 单次 oracle 调用超时（秒）
    pub oracle_timeout: u64,
    /// 整个任务的超时（秒）
    pub processing_timeout: u64,
    // --- 存储与输入 ---
    /// JSON 结果存储目录
    pub json_storage_folder: String,
    /// 检查项目录文件（TOML）
    pub catalog_path: String,
    /// 文档上下文文件，为空时使用空上下文
    pub document_context_file: Option<String>,
    /// 会话 ID，为空时自动生成
    pub session_id: Option<String>,
    /// 批次记录保留天数，0 表示不清理
    pub record_retention_days: u64,
    /// 合并报告保留小时数，0 表示不清理
    pub combined_retention_hours: u64,
    // --- 日志 ---
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    pub llm_max_tokens: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrent_batches: 3,
            max_retries: 3,
            batch_retry_delay: 5.0,
            batch_backoff_factor: 3.0,
            oracle_timeout: 300,
            processing_timeout: 3600,
            json_storage_folder: "json_outputs".to_string(),
            catalog_path: "master_checklist.toml".to_string(),
            document_context_file: None,
            session_id: None,
            record_retention_days: 7,
            combined_retention_hours: 24,
            verbose_logging: false,
            output_log_file: "output.txt".to_string(),
            llm_api_key: String::new(),
            llm_api_base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            llm_model_name: "gemini-2.5-pro".to_string(),
            llm_max_tokens: 65536,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// 从环境变量读取配置，缺失或无法解析的值使用默认值
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            batch_size: env_or("BATCH_SIZE", default.batch_size),
            max_concurrent_batches: env_or("MAX_CONCURRENT_BATCHES", default.max_concurrent_batches),
            max_retries: env_or("MAX_RETRIES", default.max_retries),
            batch_retry_delay: env_or("BATCH_RETRY_DELAY", default.batch_retry_delay),
            batch_backoff_factor: env_or("BATCH_BACKOFF_FACTOR", default.batch_backoff_factor),
            oracle_timeout: env_or("ORACLE_TIMEOUT", default.oracle_timeout),
            processing_timeout: env_or("PROCESSING_TIMEOUT", default.processing_timeout),
            json_storage_folder: std::env::var("JSON_STORAGE_FOLDER").unwrap_or(default.json_storage_folder),
            catalog_path: std::env::var("CATALOG_PATH").unwrap_or(default.catalog_path),
            document_context_file: env_opt("DOCUMENT_CONTEXT_FILE"),
            session_id: env_opt("SESSION_ID"),
            record_retention_days: env_or("RECORD_RETENTION_DAYS", default.record_retention_days),
            combined_retention_hours: env_or("COMBINED_RETENTION_HOURS", default.combined_retention_hours),
            verbose_logging: env_or("VERBOSE_LOGGING", default.verbose_logging),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(default.output_log_file),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(default.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(default.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(default.llm_model_name),
            llm_max_tokens: env_or("LLM_MAX_TOKENS", default.llm_max_tokens),
        }
    }

    /// 检查取值范围
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |name: &str, reason: &str| ConfigError::InvalidValue {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if self.batch_size == 0 {
            return Err(invalid("BATCH_SIZE", "必须大于 0"));
        }
        if self.max_concurrent_batches == 0 {
            return Err(invalid("MAX_CONCURRENT_BATCHES", "必须大于 0"));
        }
        if !(self.batch_retry_delay.is_finite() && self.batch_retry_delay >= 0.0) {
            return Err(invalid("BATCH_RETRY_DELAY", "必须是非负数"));
        }
        if !(self.batch_backoff_factor.is_finite() && self.batch_backoff_factor >= 1.0) {
            return Err(invalid("BATCH_BACKOFF_FACTOR", "必须不小于 1"));
        }
        if self.processing_timeout == 0 {
            return Err(invalid("PROCESSING_TIMEOUT", "必须大于 0"));
        }
        Ok(())
    }

    pub fn storage_root(&self) -> PathBuf {
        PathBuf::from(&self.json_storage_folder)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout)
    }

    /// 批次记录保留时长，未启用时为 None
    pub fn record_retention(&self) -> Option<Duration> {
        (self.record_retention_days > 0)
            .then(|| Duration::from_secs(self.record_retention_days.saturating_mul(86_400)))
    }

    /// 合并报告保留时长，未启用时为 None
    pub fn combined_retention(&self) -> Option<Duration> {
        (self.combined_retention_hours > 0)
            .then(|| Duration::from_secs(self.combined_retention_hours.saturating_mul(3_600)))
    }

    /// 调度器使用的重试/超时参数
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs_f64(self.batch_retry_delay.max(0.0)),
            backoff_factor: self.batch_backoff_factor.max(1.0),
            oracle_timeout: Duration::from_secs(self.oracle_timeout.max(1)),
        }
    }
}

/// 批次重试与超时参数
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerOptions {
    /// 失败后最多重试次数
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_factor: f64,
    pub oracle_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Config::default().scheduler_options()
    }
}

impl SchedulerOptions {
    /// 每批最多尝试次数
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// 第 `attempt` 次失败后的等待时间：`retry_delay * backoff_factor^(attempt-1)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.retry_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if secs.is_finite() {
            Duration::from_secs_f64(secs.min(u32::MAX as f64))
        } else {
            Duration::from_secs(u32::MAX as u64)
        }
    }
}
