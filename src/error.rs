use std::path::PathBuf;

use thiserror::Error;

/// 加载与解析 uVision 工程时对外可见的错误
#[derive(Debug, Error)]
pub enum KeilError {
    /// XML 格式错误（工程文件、.uvmpw 或 .pdsc）
    #[error("failed to parse '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },

    /// 目标的 XML 结构与工具链类型不符
    #[error("target '{target}': {message}")]
    StructuralValidation { target: String, message: String },

    /// 工程文件被 uVision 占用，重试次数耗尽
    #[error("'{}' is still locked after {attempts} attempts", path.display())]
    FileLocked { path: PathBuf, attempts: u32 },

    /// 同一目标已有构建任务在运行
    #[error("a task is already running for target '{target}', please wait for it to finish")]
    TaskRunning { target: String },

    /// 找不到指定名称的目标
    #[error("target '{0}' not found")]
    TargetNotFound(String),

    #[error("io error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KeilError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KeilError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        KeilError::Parse {
            path: path.into(),
            message: message.into(),
        }
    }
}
