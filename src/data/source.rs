//! 外部数据源接口
//!
//! 缓存只消费远程表格 API 的两个操作：拉取资源的全部记录（分页由实现方处理，
//! 返回完整快照）与可选的模式提示。重试策略属于实现方，缓存内部不重试。

use crate::data::schema::{Record, SchemaHint};
use anyhow::Result;
use async_trait::async_trait;

/// 远程数据源
#[async_trait]
pub trait DataSource: Send + Sync {
    /// 拉取资源的全部记录
    async fn fetch_all_records(&self, resource: &str) -> Result<Vec<Record>>;

    /// 资源的模式提示
    ///
    /// 默认实现：无提示，仅依赖记录推断
    async fn fetch_schema_hint(&self, _resource: &str) -> Result<Option<SchemaHint>> {
        Ok(None)
    }
}
