//! 表格缓存数据层
//!
//! 把远程表格 API 的资源整表缓存到嵌入式 SQLite，按 TTL 判断新鲜度，
//! 并把布尔过滤树翻译为参数化 SQL 在本地执行。
//!
//! # 模块组织
//!
//! - `error`: 统一错误类型定义
//! - `managers`: SQLite 连接与事务管理
//! - `schema`: 列模型与模式推断
//! - `store`: 资源物理表的生命周期（替换、查询、删除）
//! - `cache`: TTL 元数据与策略
//! - `filter`: 过滤树模型、相对日期与 SQL 翻译
//! - `query`: 链式查询构造器
//! - `source`: 外部数据源接口
//! - `manager`: 统一入口 `CacheCoordinator`
//!
//! # 使用示例
//!
//! ```rust
//! use crate::data::{CacheCoordinator, Comparator, FilterExpression, GetRequest};
//!
//! let coordinator = CacheCoordinator::open(config.cache.clone(), source)?;
//!
//! let request = GetRequest::new("orders", ["id", "status"])
//!     .filter(FilterExpression::condition("status", Comparator::Is, "open"))
//!     .limit(20);
//! let result = coordinator.get(request).await?;
//! ```

pub mod cache;
pub mod error;
pub mod filter;
pub mod manager;
pub mod managers;
pub mod query;
pub mod schema;
pub mod source;
pub mod store;


pub use cache::{CacheStatus, MetadataEntry, TtlMetadata, TtlPolicy, DEFAULT_TTL_SECONDS};
pub use error::{CacheError, Result};
pub use filter::{Comparator, DateMode, FilterExpression, FilterValue, LogicalOp};
pub use manager::{CacheCoordinator, CacheState, GetRequest, GetResult, ResourceStatus};
pub use managers::SqliteManager;
pub use query::{QueryBuilder, QueryResult};
pub use schema::{Column, ColumnType, HintedField, Record, SchemaHint, SchemaInferencer};
pub use source::DataSource;
pub use store::{QueryRow, SortDirection, TableSchema, TableStore};
