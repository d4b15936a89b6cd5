//! 缓存新鲜度管理
//!
//! - `ttl`: 资源级 TTL 元数据与策略（表粒度，一个资源一对时间戳）

pub mod ttl;

pub use ttl::{CacheStatus, MetadataEntry, TtlMetadata, TtlPolicy, DEFAULT_TTL_SECONDS};
