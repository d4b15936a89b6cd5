//! 统一错误类型定义
//!
//! 使用 `thiserror` 定义缓存模块的所有错误类型。校验类错误（字段、比较符、过滤树）
//! 只影响单次查询；拉取与存储错误会上抛给调用方，但不会破坏已有缓存。

use std::path::PathBuf;
use thiserror::Error;

/// 缓存模块的统一错误类型
#[derive(Error, Debug)]
pub enum CacheError {
    /// 文件 I/O 错误
    #[error("文件 I/O 错误: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON 序列化/反序列化错误
    #[error("JSON 序列化错误: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    /// TOML 反序列化错误
    #[error("TOML 反序列化错误: {0}")]
    TomlDeserialization(#[from] toml::de::Error),

    /// 底层存储（SQLite）错误
    #[error("存储错误: {0}")]
    Storage(#[from] rusqlite::Error),

    /// 过滤、投影或排序引用了模式中不存在的字段
    #[error("未知字段: {field}")]
    UnknownField { field: String },

    /// 比较符无法识别，或不适用于该字段类型
    #[error("不支持的比较符 {comparator}: {reason}")]
    UnsupportedComparator { comparator: String, reason: String },

    /// 过滤树结构不合法（空子节点、值数量不符等）
    #[error("无效的过滤表达式: {0}")]
    InvalidFilter(String),

    /// 请求参数不合法
    #[error("无效的请求: {0}")]
    InvalidRequest(String),

    /// 资源标识无法映射为物理表名
    #[error("无效的资源标识: {0:?}")]
    InvalidResource(String),

    /// 资源没有可查询的缓存表
    #[error("未找到资源: {0}")]
    ResourceNotFound(String),

    /// 刷新后的记录不再包含过滤依赖的字段，这些字段按全空处理
    #[error("资源 {resource} 模式漂移，以下字段按空值处理: {}", fields.join(", "))]
    SchemaDrift {
        resource: String,
        fields: Vec<String>,
    },

    /// 外部数据源拉取失败（含超时）
    #[error("外部数据拉取失败: {resource}: {reason}")]
    ExternalFetchFailed { resource: String, reason: String },

    /// 并发错误（锁中毒）
    #[error("并发错误: {0}")]
    Concurrency(String),
}

/// 便于与现有代码集成的类型别名
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// 从 `std::io::Error` 和路径创建 I/O 错误
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// 便捷构造：未知字段
    pub fn unknown_field(field: impl Into<String>) -> Self {
        Self::UnknownField {
            field: field.into(),
        }
    }

    /// 便捷构造：不支持的比较符
    pub fn unsupported(comparator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedComparator {
            comparator: comparator.into(),
            reason: reason.into(),
        }
    }

    /// 是否为查询校验错误（不改变任何缓存状态）
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownField { .. }
                | Self::UnsupportedComparator { .. }
                | Self::InvalidFilter(_)
                | Self::InvalidRequest(_)
                | Self::InvalidResource(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::ResourceNotFound("orders".to_string());
        assert_eq!(err.to_string(), "未找到资源: orders");
    }

    #[test]
    fn test_io_error_construction() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = CacheError::io("/path/to/cache.db", io_err);
        assert!(err.to_string().contains("/path/to/cache.db"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid json").unwrap_err();
        let err: CacheError = json_err.into();
        assert!(matches!(err, CacheError::JsonSerialization(_)));
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: CacheError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, CacheError::Storage(_)));
        assert!(!err.is_validation());
    }

    #[test]
    fn test_anyhow_conversion() {
        let err = CacheError::unknown_field("priority");
        let anyhow_err: anyhow::Error = err.into();
        assert!(anyhow_err.to_string().contains("未知字段"));
        assert!(anyhow_err.to_string().contains("priority"));
    }

    #[test]
    fn test_schema_drift_lists_fields() {
        let err = CacheError::SchemaDrift {
            resource: "orders".to_string(),
            fields: vec!["status".to_string(), "owner".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "资源 orders 模式漂移，以下字段按空值处理: status, owner"
        );
    }

    #[test]
    fn test_validation_classification() {
        assert!(CacheError::InvalidFilter("empty".to_string()).is_validation());
        assert!(CacheError::unsupported("matches", "unknown").is_validation());
        assert!(!CacheError::ExternalFetchFailed {
            resource: "orders".to_string(),
            reason: "timeout".to_string(),
        }
        .is_validation());
    }
}
