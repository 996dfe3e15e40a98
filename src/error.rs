// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 错误分类 (Error taxonomy)
//!
//! 每一类错误对应一种恢复策略:
//! - 连接错误: 由 ConnectionSupervisor 重试
//! - 单样本评分错误: 只影响该样本
//! - 工作线程任务错误: 只影响该任务
//! - 持久化错误: 记录日志, 轨迹仍然视为已完成
//! - 配置错误: 启动时立即失败

use std::path::PathBuf;

use thiserror::Error;

/// 配置错误 (启动阶段检测, 任何摄像头启动前失败)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no cameras configured")]
    NoCameras,
    #[error("camera {id} has an empty source address")]
    MissingSource { id: u32 },
    #[error("camera id {id} is configured more than once")]
    DuplicateCamera { id: u32 },
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// 视频源错误 (暂时性, 交给重连状态机处理)
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("connection to {address} failed: {reason}")]
    Connect { address: String, reason: String },
    #[error("read from {address} failed: {reason}")]
    Read { address: String, reason: String },
    #[error("no frame from {address} within {timeout_ms} ms")]
    Timeout { address: String, timeout_ms: u64 },
    #[error("source {address} is not connected")]
    NotConnected { address: String },
}

/// 单个样本的评分/标注错误
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("annotation failed: {0}")]
    Annotate(String),
}

/// 工作线程池中单个任务的失败
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task {index} failed: {message}")]
    Failed { index: usize, message: String },
    #[error("task {index} panicked: {message}")]
    Panicked { index: usize, message: String },
}

impl TaskError {
    pub fn index(&self) -> usize {
        match self {
            Self::Failed { index, .. } | Self::Panicked { index, .. } => *index,
        }
    }
}

/// 输出持久化错误
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to prepare output directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// 检测器调用错误
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("detector service has stopped")]
    ServiceStopped,
    #[error("detector returned {got} results for {expected} frames")]
    BatchMismatch { expected: usize, got: usize },
    #[error("detector failed: {0}")]
    Backend(String),
}

/// 终止摄像头处理单元的错误 (只上报给该单元自身的调用者)
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera {camera} gave up after {attempts} consecutive connection attempts")]
    ReconnectExhausted { camera: u32, attempts: u32 },
    #[error("camera {camera} processing thread panicked: {message}")]
    Panicked { camera: u32, message: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}
