//! 错误处理模块
//!
//! 定义了描述符堆子系统中使用的统一错误类型，使用 `thiserror` 提供友好的错误消息。
//!
//! # 错误分类
//!
//! - **容量耗尽**：不是错误值。分配器返回空分配（null allocation），由调用者决定扩容或放弃
//! - **编程错误**：释放到错误的管理器、重叠释放、非 2 的幂对齐等，使用断言处理
//! - **设备调用失败**：描述符堆或 Fence 创建失败，在构造阶段作为错误返回

use thiserror::Error;

/// 统一的 Result 类型
///
/// 所有可能返回错误的函数都应该使用这个类型。
pub type Result<T> = std::result::Result<T, DistHeapError>;

/// DistHeap 的错误类型
#[derive(Debug, Error)]
pub enum DistHeapError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// 图形 API 错误
    #[error("Graphics error: {0}")]
    Graphics(#[from] GraphicsError),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 日志系统错误
    #[error("Log error: {0}")]
    Log(String),

    /// 初始化错误
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// 运行时错误
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// 配置相关的错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件未找到
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    /// 配置文件解析失败
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// 配置值无效
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 图形 API 相关的错误
#[derive(Debug, Error)]
pub enum GraphicsError {
    /// 设备创建失败
    #[error("Device creation failed: {0}")]
    DeviceCreation(String),

    /// 描述符堆创建失败
    #[error("Descriptor heap creation failed: {0}")]
    DescriptorHeapCreation(String),

    /// Fence 创建失败
    #[error("Fence creation failed: {0}")]
    FenceCreation(String),

    /// 等待 Fence 失败
    #[error("Fence wait failed: {0}")]
    FenceWait(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err: DistHeapError =
            GraphicsError::DescriptorHeapCreation("out of memory".to_string()).into();
        assert_eq!(
            err.to_string(),
            "Graphics error: Descriptor heap creation failed: out of memory"
        );

        let err: DistHeapError = ConfigError::InvalidValue {
            field: "descriptors.dynamic_chunk_sizes".to_string(),
            reason: "must be greater than 0".to_string(),
        }
        .into();
        assert!(err.to_string().contains("descriptors.dynamic_chunk_sizes"));
    }
}
