use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// oracle 调用错误
    #[error("Oracle错误: {0}")]
    Oracle(#[from] OracleError),
    /// 结果存储错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 进度跟踪错误
    #[error("进度错误: {0}")]
    Tracker(#[from] TrackerError),
    /// 任务生命周期错误
    #[error("任务错误: {0}")]
    Job(#[from] JobError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 文件读写错误
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
    /// JSON 解析错误
    #[error("JSON错误: {0}")]
    Json(#[from] serde_json::Error),
    /// TOML 解析错误
    #[error("TOML错误: {0}")]
    Toml(#[from] toml::de::Error),
    /// 其他错误
    #[error("错误: {0}")]
    Other(String),
}

/// oracle（匹配服务）错误
///
/// 调度器对所有 oracle 错误统一重试，`is_unreachable` 只用于判断任务是否整体失败。
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OracleError {
    /// 服务无法连接
    #[error("无法连接匹配服务: {0}")]
    Unreachable(String),
    /// 单次调用超时
    #[error("匹配服务调用超时 ({millis}毫秒)")]
    Timeout { millis: u64 },
    /// 服务返回错误
    #[error("匹配服务调用失败: {0}")]
    Api(String),
    /// 返回内容无法解析
    #[error("匹配服务返回格式错误: {0}")]
    MalformedAnswer(String),
    /// 返回内容与批次不一致
    #[error("批次结果校验失败: {0}")]
    Validation(String),
}

impl OracleError {
    pub fn timeout(limit: std::time::Duration) -> Self {
        OracleError::Timeout {
            millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, OracleError::Unreachable(_))
    }
}

/// 结果存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 键已存在（记录不可覆盖）
    #[error("存储键已存在: {key}")]
    KeyCollision { key: String },
    /// 读写失败
    #[error("存储读写失败 ({key}): {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    /// 序列化失败
    #[error("记录序列化失败: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 进度跟踪错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    /// tracker 不存在或已清理
    #[error("进度跟踪器不存在: {0}")]
    NotFound(String),
    /// 已进入终态，不再接受更新
    #[error("进度跟踪器已结束 ({tracker_id}: {status})")]
    Terminal { tracker_id: String, status: String },
}

/// 任务生命周期错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("任务不存在: {0}")]
    NotFound(String),
    #[error("非法状态迁移 ({process_id}): {from} -> {to}")]
    InvalidTransition {
        process_id: String,
        from: String,
        to: String,
    },
}

/// 配置错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// 取值不合法
    #[error("配置项 {name} 不合法: {reason}")]
    InvalidValue { name: String, reason: String },
}

// ========== 便捷构造函数 ==========

impl AppError {
    pub fn other(msg: impl Into<String>) -> Self {
        AppError::Other(msg.into())
    }
}

impl StoreError {
    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            key: key.into(),
            source,
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
