//! 缓存协调器
//!
//! 唯一与外部数据源交互的组件，按资源维护状态机：
//!
//! ```text
//! Absent → Populating → Valid → Expired → Populating → Valid → ...
//! ```
//!
//! - `Valid` 的读请求直接查询缓存表，不访问外部数据源
//! - `Absent` / `Expired` 或 `bypass` 请求先整表刷新再查询
//! - 刷新失败（含超时）时缓存保持原状；`allow_stale` 请求可继续读取旧数据
//! - 远程写操作不会触发失效，只有 TTL 过期、`bypass` 或 `invalidate` 改变状态
//!
//! # 使用示例
//!
//! ```rust
//! use std::sync::Arc;
//! use crate::data::{CacheCoordinator, GetRequest};
//!
//! let coordinator = CacheCoordinator::open(config.cache.clone(), Arc::new(source))?;
//!
//! let result = coordinator
//!     .get(GetRequest::new("orders", ["id", "title"]).filter(open_orders))
//!     .await?;
//! println!("{} / {}", result.rows.len(), result.total_count);
//! ```

use crate::data::cache::{CacheStatus, TtlMetadata};
use crate::data::filter::FilterExpression;
use crate::data::managers::SqliteManager;
use crate::data::query::QueryBuilder;
use crate::data::schema::SchemaInferencer;
use crate::data::source::DataSource;
use crate::data::store::{QueryRow, RefreshStamp, SortDirection, TableStore};
use crate::data::{CacheError, Result};
use crate::models::config::CacheConfig;
use crate::utils::clock::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 资源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Absent,
    Populating,
    Valid,
    Expired,
}

/// 读请求
#[derive(Debug, Clone)]
pub struct GetRequest {
    pub resource: String,
    /// 投影字段，必须非空
    pub fields: Vec<String>,
    pub filter: Option<FilterExpression>,
    pub sort: Vec<(String, SortDirection)>,
    pub limit: Option<usize>,
    pub offset: usize,
    /// 无论状态如何都重新拉取
    pub bypass: bool,
    /// 刷新失败时允许返回过期数据
    pub allow_stale: bool,
    /// 拉取超时，缺省使用配置值
    pub timeout: Option<Duration>,
}

impl GetRequest {
    pub fn new<I, S>(resource: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource: resource.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            filter: None,
            sort: Vec::new(),
            limit: None,
            offset: 0,
            bypass: false,
            allow_stale: false,
            timeout: None,
        }
    }

    pub fn filter(mut self, filter: FilterExpression) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn allow_stale(mut self, allow_stale: bool) -> Self {
        self.allow_stale = allow_stale;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 读结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GetResult {
    pub rows: Vec<QueryRow>,
    pub total_count: usize,
    pub cached_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// 本次请求是否刷新了缓存
    pub refreshed: bool,
    /// 是否为刷新失败后返回的过期数据
    pub stale: bool,
    /// 过滤或投影引用、但当前模式中已不存在的字段
    pub drifted_fields: Vec<String>,
}

/// 单个资源的状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceStatus {
    pub resource_id: String,
    pub state: CacheState,
    pub row_count: usize,
    pub cached_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ttl_seconds: u64,
}

/// 缓存协调器
pub struct CacheCoordinator {
    db: SqliteManager,
    store: TableStore,
    ttl: TtlMetadata,
    source: Arc<dyn DataSource>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    /// 正在刷新的资源及其进行中的刷新次数
    populating: Mutex<HashMap<String, usize>>,
}

/// 刷新期间把资源标记为 `Populating`
///
/// 同一资源可能有多个刷新重叠，计数归零时才清除标记。
struct PopulatingGuard<'a> {
    counts: &'a Mutex<HashMap<String, usize>>,
    resource: String,
}

impl<'a> PopulatingGuard<'a> {
    fn enter(counts: &'a Mutex<HashMap<String, usize>>, resource: &str) -> Result<Self> {
        *counts
            .lock()
            .map_err(|e| CacheError::Concurrency(e.to_string()))?
            .entry(resource.to_string())
            .or_insert(0) += 1;
        Ok(Self {
            counts,
            resource: resource.to_string(),
        })
    }
}

impl Drop for PopulatingGuard<'_> {
    fn drop(&mut self) {
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(count) = counts.get_mut(&self.resource) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.resource);
            }
        }
    }
}

impl CacheCoordinator {
    /// 按配置打开缓存数据库
    pub fn open(config: CacheConfig, source: Arc<dyn DataSource>) -> Result<Self> {
        Self::with_clock(config, source, Arc::new(SystemClock))
    }

    /// 使用指定时钟打开缓存数据库
    pub fn with_clock(
        config: CacheConfig,
        source: Arc<dyn DataSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let db = if config.is_in_memory() {
            SqliteManager::open_in_memory()?
        } else {
            SqliteManager::open(&config.effective_db_path())?
        };
        let store = TableStore::new(db.clone())?;
        let ttl = TtlMetadata::new(db.clone(), config.default_ttl_seconds)?;

        let mut overrides: Vec<_> = config.ttl_overrides.iter().collect();
        overrides.sort();
        for (resource, seconds) in overrides {
            ttl.set_policy(resource, *seconds)?;
        }

        tracing::info!(
            db_path = ?db.db_path(),
            default_ttl_seconds = config.default_ttl_seconds,
            overrides = config.ttl_overrides.len(),
            "缓存协调器已就绪"
        );

        Ok(Self {
            db,
            store,
            ttl,
            source,
            clock,
            config,
            populating: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub fn ttl(&self) -> &TtlMetadata {
        &self.ttl
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// 读取资源
    pub async fn get(&self, request: GetRequest) -> Result<GetResult> {
        if request.fields.is_empty() {
            return Err(CacheError::InvalidRequest(
                "fields 不能为空，请显式列出需要的字段".to_string(),
            ));
        }

        let now = self.clock.now();
        let resource = request.resource.as_str();
        let valid = self.ttl.is_valid(resource, now)?;

        let mut refreshed = false;
        let mut stale = false;
        if request.bypass || !valid {
            match self.refresh(resource, request.timeout).await {
                Ok(()) => refreshed = true,
                Err(err @ CacheError::ExternalFetchFailed { .. })
                    if request.allow_stale && self.store.exists(resource)? =>
                {
                    tracing::warn!(
                        resource = %resource,
                        error = %err,
                        "刷新失败，返回过期数据"
                    );
                    stale = !valid;
                }
                Err(err) => return Err(err),
            }
        } else {
            tracing::debug!(resource = %resource, "缓存命中");
        }

        let result = match self.query(&request, now) {
            // 元数据有效但表已不存在：按未命中处理，刷新一次后重试
            Err(CacheError::ResourceNotFound(_)) if !refreshed => {
                tracing::warn!(resource = %resource, "缓存表缺失，重新拉取");
                self.refresh(resource, request.timeout).await?;
                refreshed = true;
                stale = false;
                self.query(&request, now)?
            }
            other => other?,
        };

        Ok(GetResult {
            refreshed,
            stale,
            ..result
        })
    }

    fn query(&self, request: &GetRequest, now: DateTime<Utc>) -> Result<GetResult> {
        let resource = request.resource.as_str();
        let schema = self.store.schema(resource)?;

        let mut referenced: Vec<&str> = request.fields.iter().map(String::as_str).collect();
        if let Some(filter) = &request.filter {
            referenced.extend(filter.fields());
        }
        referenced.extend(request.sort.iter().map(|(field, _)| field.as_str()));
        let mut drifted_fields: Vec<String> = Vec::new();
        for field in referenced {
            if schema.is_drifted(field) && !drifted_fields.iter().any(|f| f == field) {
                drifted_fields.push(field.to_string());
            }
        }
        if !drifted_fields.is_empty() {
            let drift = CacheError::SchemaDrift {
                resource: resource.to_string(),
                fields: drifted_fields.clone(),
            };
            tracing::warn!(resource = %resource, error = %drift, "模式漂移");
        }

        let mut builder = QueryBuilder::new(&self.store, resource)?
            .with_limits(self.config.default_limit, self.config.max_limit)
            .select(request.fields.iter().cloned())
            .offset(request.offset)
            .at(now);
        if let Some(filter) = &request.filter {
            builder = builder.filter(filter.clone());
        }
        for (field, direction) in &request.sort {
            builder = builder.order_by(field.clone(), *direction);
        }
        if let Some(limit) = request.limit {
            builder = builder.limit(limit);
        }

        let output = builder.execute()?;
        let entry = self.ttl.entry(resource)?;
        Ok(GetResult {
            total_count: output.total_count,
            cached_at: entry.as_ref().map(|e| e.cached_at),
            expires_at: entry.as_ref().map(|e| e.expires_at),
            rows: output.rows,
            refreshed: false,
            stale: false,
            drifted_fields,
        })
    }

    /// 整表刷新：拉取 → 推断 → 替换表与元数据（同一事务）
    ///
    /// 失败时缓存状态不变。
    pub async fn refresh(&self, resource: &str, timeout: Option<Duration>) -> Result<()> {
        let _guard = PopulatingGuard::enter(&self.populating, resource)?;
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_secs(self.config.fetch_timeout_seconds));

        let fetched = tokio::time::timeout(timeout, async {
            let records = self.source.fetch_all_records(resource).await?;
            let hint = match self.source.fetch_schema_hint(resource).await {
                Ok(hint) => hint,
                Err(e) => {
                    tracing::warn!(resource = %resource, error = %format!("{e:#}"), "模式提示获取失败，仅按记录推断");
                    None
                }
            };
            anyhow::Ok((records, hint))
        })
        .await;

        let (records, hint) = match fetched {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                return Err(CacheError::ExternalFetchFailed {
                    resource: resource.to_string(),
                    reason: format!("{e:#}"),
                })
            }
            Err(_) => {
                return Err(CacheError::ExternalFetchFailed {
                    resource: resource.to_string(),
                    reason: format!("拉取超时（{} 秒）", timeout.as_secs_f64()),
                })
            }
        };

        let schema = SchemaInferencer::infer_with_hint(&records, hint.as_ref());
        let ttl_seconds = self.ttl.policy_for(resource)?;
        let now = self.clock.now();
        let stamp = RefreshStamp::new(now, ttl_seconds);

        let rows = self.db.transaction(|tx| {
            let rows = TableStore::replace_on(tx, resource, &schema, &records, stamp)?;
            TtlMetadata::record_refresh_on(tx, resource, ttl_seconds, now)?;
            Ok(rows)
        })?;

        tracing::info!(
            resource = %resource,
            rows,
            columns = schema.len(),
            ttl_seconds,
            expires_at = %stamp.expires_at,
            "缓存已刷新"
        );
        Ok(())
    }

    /// 使资源失效，下一次读取进入 `Absent` 状态
    pub fn invalidate(&self, resource: &str) -> Result<bool> {
        let removed = self.db.transaction(|tx| {
            let dropped = TableStore::drop_on(tx, resource)?;
            let cleared = TtlMetadata::remove_on(tx, resource)?;
            Ok(dropped || cleared)
        })?;
        tracing::info!(resource = %resource, removed, "缓存已失效");
        Ok(removed)
    }

    /// 使全部资源失效，返回删除的表数量
    pub fn invalidate_all(&self) -> Result<usize> {
        let (tables, entries) = self.db.transaction(|tx| {
            let tables = TableStore::drop_all_on(tx)?;
            let entries = TtlMetadata::clear_on(tx)?;
            Ok((tables, entries))
        })?;
        tracing::info!(tables, entries, "全部缓存已失效");
        Ok(tables)
    }

    /// 显式清理已过期的资源（没有后台清理线程）
    pub fn evict_expired(&self) -> Result<Vec<String>> {
        let expired = self.ttl.expired(self.clock.now())?;
        for resource in &expired {
            self.invalidate(resource)?;
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "已清理过期缓存");
        }
        Ok(expired)
    }

    /// 资源状态；`None` 返回所有已知资源
    pub fn status(&self, resource: Option<&str>) -> Result<Vec<ResourceStatus>> {
        let now = self.clock.now();
        let ids: Vec<String> = match resource {
            Some(id) => vec![id.to_string()],
            None => {
                let mut ids: Vec<String> = self
                    .ttl
                    .entries()?
                    .into_iter()
                    .map(|e| e.resource_id)
                    .chain(self.store.list()?.into_iter().map(|t| t.resource_id))
                    .chain(self.populating_ids()?)
                    .collect();
                ids.sort();
                ids.dedup();
                ids
            }
        };

        let populating = self.populating_ids()?;
        ids.into_iter()
            .map(|id| {
                let entry = self.ttl.entry(&id)?;
                let row_count = match self.store.schema(&id) {
                    Ok(schema) => schema.row_count,
                    Err(CacheError::ResourceNotFound(_)) => 0,
                    Err(e) => return Err(e),
                };
                let state = if populating.contains(&id) {
                    CacheState::Populating
                } else {
                    match self.ttl.status(&id, now)? {
                        CacheStatus::Empty => CacheState::Absent,
                        CacheStatus::Valid => CacheState::Valid,
                        CacheStatus::Expired => CacheState::Expired,
                    }
                };
                Ok(ResourceStatus {
                    ttl_seconds: match &entry {
                        Some(e) => e.ttl_seconds,
                        None => self.ttl.policy_for(&id)?,
                    },
                    cached_at: entry.as_ref().map(|e| e.cached_at),
                    expires_at: entry.as_ref().map(|e| e.expires_at),
                    resource_id: id,
                    state,
                    row_count,
                })
            })
            .collect()
    }

    fn populating_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .populating
            .lock()
            .map_err(|e| CacheError::Concurrency(e.to_string()))?
            .keys()
            .cloned()
            .collect())
    }

    /// 设置资源 TTL，影响之后的刷新
    pub fn set_policy(&self, resource: &str, ttl_seconds: u64) -> Result<()> {
        self.ttl.set_policy(resource, ttl_seconds)
    }

    /// 移除资源 TTL 覆盖
    pub fn clear_policy(&self, resource: &str) -> Result<bool> {
        self.ttl.clear_policy(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::filter::Comparator;
    use crate::data::schema::{ColumnType, HintedField, SchemaHint};
    use crate::data::source::testing::MemorySource;
    use crate::utils::clock::testing::ManualClock;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        source: Arc<MemorySource>,
        clock: Arc<ManualClock>,
        coordinator: CacheCoordinator,
    }

    fn fixture(source: MemorySource) -> Fixture {
        let source = Arc::new(source);
        let clock = Arc::new(ManualClock::at(0));
        let coordinator =
            CacheCoordinator::with_clock(CacheConfig::in_memory(), source.clone(), clock.clone())
                .unwrap();
        Fixture {
            source,
            clock,
            coordinator,
        }
    }

    fn orders_source() -> MemorySource {
        MemorySource::new().with_table(
            "orders",
            json!([{"id": 1, "status": "open"}, {"id": 2, "status": "closed"}]),
        )
    }

    fn open_orders() -> GetRequest {
        GetRequest::new("orders", ["id"])
            .filter(FilterExpression::condition("status", Comparator::Is, "open"))
    }

    #[tokio::test]
    async fn test_orders_scenario() {
        let f = fixture(orders_source());
        f.coordinator.set_policy("orders", 3600).unwrap();

        // t=0 填充
        f.coordinator.refresh("orders", None).await.unwrap();
        assert_eq!(f.source.fetches(), 1);

        let result = f.coordinator.get(open_orders()).await.unwrap();
        assert_eq!(f.source.fetches(), 1);
        assert!(!result.refreshed);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].to_record(), json!({"id": 1}).as_object().unwrap().clone());

        f.clock.set(3601);
        let result = f.coordinator.get(open_orders()).await.unwrap();
        assert_eq!(f.source.fetches(), 2);
        assert!(result.refreshed);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.cached_at.unwrap().timestamp(), 3601);
        assert_eq!(result.expires_at.unwrap().timestamp(), 7201);
    }

    #[tokio::test]
    async fn test_first_read_populates() {
        let f = fixture(orders_source());
        let status = f.coordinator.status(Some("orders")).unwrap();
        assert_eq!(status[0].state, CacheState::Absent);

        let result = f.coordinator.get(GetRequest::new("orders", ["id", "status"])).await.unwrap();
        assert!(result.refreshed);
        assert_eq!(result.total_count, 2);

        let status = f.coordinator.status(Some("orders")).unwrap();
        assert_eq!(status[0].state, CacheState::Valid);
        assert_eq!(status[0].row_count, 2);
        assert_eq!(status[0].ttl_seconds, 14_400);
    }

    #[tokio::test]
    async fn test_empty_fields_rejected() {
        let f = fixture(orders_source());
        let result = f.coordinator.get(GetRequest::new("orders", Vec::<String>::new())).await;
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
        assert_eq!(f.source.fetches(), 0);
    }

    #[tokio::test]
    async fn test_bypass_always_fetches() {
        let f = fixture(orders_source());
        f.coordinator.get(open_orders()).await.unwrap();
        let result = f.coordinator.get(open_orders().bypass(true)).await.unwrap();
        assert!(result.refreshed);
        assert_eq!(f.source.fetches(), 2);

        // 之后的普通读取仍走缓存
        f.coordinator.get(open_orders()).await.unwrap();
        assert_eq!(f.source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_cache_untouched() {
        let f = fixture(orders_source());
        f.coordinator.set_policy("orders", 60).unwrap();
        f.coordinator.get(open_orders()).await.unwrap();

        f.clock.set(120);
        f.source.fail(true);
        let err = f.coordinator.get(open_orders()).await.unwrap_err();
        assert!(matches!(err, CacheError::ExternalFetchFailed { ref reason, .. } if reason.contains("503")));

        let status = f.coordinator.status(Some("orders")).unwrap();
        assert_eq!(status[0].state, CacheState::Expired);
        assert_eq!(status[0].row_count, 2);

        let result = f.coordinator.get(open_orders().allow_stale(true)).await.unwrap();
        assert!(result.stale);
        assert!(!result.refreshed);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.cached_at.unwrap().timestamp(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_without_cache() {
        let f = fixture(MemorySource::new());
        let err = f
            .coordinator
            .get(GetRequest::new("missing", ["id"]).allow_stale(true))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::ExternalFetchFailed { .. }));
        assert_eq!(
            f.coordinator.status(Some("missing")).unwrap()[0].state,
            CacheState::Absent
        );
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let f = fixture(orders_source());
        f.source.delay(Some(Duration::from_millis(500)));
        let err = f
            .coordinator
            .get(open_orders().timeout(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::ExternalFetchFailed { ref reason, .. } if reason.contains("超时")));
        assert!(!f.coordinator.store().exists("orders").unwrap());
        assert!(f.coordinator.status(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hint_failure_is_not_fatal() {
        let f = fixture(orders_source());
        f.source.fail_hint(true);
        let result = f.coordinator.get(open_orders()).await.unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_hint_columns_are_queryable() {
        let f = fixture(orders_source());
        f.source.set_hint(
            "orders",
            SchemaHint {
                fields: vec![HintedField {
                    name: "assignees".to_string(),
                    column_type: ColumnType::Json,
                }],
            },
        );
        let result = f
            .coordinator
            .get(GetRequest::new("orders", ["id", "assignees"]).filter(
                FilterExpression::condition("assignees", Comparator::IsEmpty, true),
            ))
            .await
            .unwrap();
        assert_eq!(result.total_count, 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let f = fixture(orders_source());
        f.coordinator.get(open_orders()).await.unwrap();

        assert!(f.coordinator.invalidate("orders").unwrap());
        assert!(!f.coordinator.invalidate("orders").unwrap());
        assert_eq!(
            f.coordinator.status(Some("orders")).unwrap()[0].state,
            CacheState::Absent
        );

        f.coordinator.get(open_orders()).await.unwrap();
        assert_eq!(f.source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_all_and_status_listing() {
        let source = orders_source().with_table("users", json!([{"id": 1, "name": "ana"}]));
        let f = fixture(source);
        f.coordinator.get(GetRequest::new("orders", ["id"])).await.unwrap();
        f.coordinator.get(GetRequest::new("users", ["name"])).await.unwrap();

        let ids: Vec<String> = f
            .coordinator
            .status(None)
            .unwrap()
            .into_iter()
            .map(|s| s.resource_id)
            .collect();
        assert_eq!(ids, vec!["orders", "users"]);

        assert_eq!(f.coordinator.invalidate_all().unwrap(), 2);
        assert!(f.coordinator.status(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_refreshes_keep_populating() {
        let f = fixture(orders_source());
        let first = PopulatingGuard::enter(&f.coordinator.populating, "orders").unwrap();
        let second = PopulatingGuard::enter(&f.coordinator.populating, "orders").unwrap();

        drop(first);
        assert_eq!(
            f.coordinator.status(Some("orders")).unwrap()[0].state,
            CacheState::Populating
        );

        drop(second);
        assert_eq!(
            f.coordinator.status(Some("orders")).unwrap()[0].state,
            CacheState::Absent
        );
        assert!(f.coordinator.populating.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_all_is_atomic() {
        let f = fixture(orders_source());
        f.coordinator.get(open_orders()).await.unwrap();

        // 元数据表缺失时清空失败，资源表必须随之回滚
        f.coordinator
            .store()
            .database()
            .execute_raw("DROP TABLE cache_metadata")
            .unwrap();
        assert!(f.coordinator.invalidate_all().is_err());
        assert!(f.coordinator.store().exists("orders").unwrap());
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let source = orders_source().with_table("users", json!([{"id": 1}]));
        let f = fixture(source);
        f.coordinator.set_policy("orders", 10).unwrap();
        f.coordinator.get(GetRequest::new("orders", ["id"])).await.unwrap();
        f.coordinator.get(GetRequest::new("users", ["id"])).await.unwrap();

        f.clock.set(10);
        assert_eq!(f.coordinator.evict_expired().unwrap(), vec!["orders"]);
        assert!(!f.coordinator.store().exists("orders").unwrap());
        assert!(f.coordinator.store().exists("users").unwrap());
    }

    #[tokio::test]
    async fn test_policy_changes_apply_to_next_refresh() {
        let f = fixture(orders_source());
        f.coordinator.get(open_orders()).await.unwrap();
        f.coordinator.set_policy("orders", 5).unwrap();

        let status = &f.coordinator.status(Some("orders")).unwrap()[0];
        assert_eq!(status.ttl_seconds, 14_400);

        f.coordinator.get(open_orders().bypass(true)).await.unwrap();
        let status = &f.coordinator.status(Some("orders")).unwrap()[0];
        assert_eq!(status.ttl_seconds, 5);
        assert_eq!(status.expires_at.unwrap().timestamp(), 5);

        assert!(f.coordinator.clear_policy("orders").unwrap());
    }

    #[tokio::test]
    async fn test_schema_drift_reads_as_null() {
        let f = fixture(orders_source());
        f.coordinator.get(open_orders()).await.unwrap();

        f.source.set_table("orders", json!([{"id": 3}, {"id": 4}]));
        let result = f
            .coordinator
            .get(
                GetRequest::new("orders", ["id", "status"])
                    .filter(FilterExpression::condition("status", Comparator::IsNot, "open"))
                    .bypass(true),
            )
            .await
            .unwrap();

        assert_eq!(result.drifted_fields, vec!["status"]);
        assert_eq!(result.total_count, 2);
        assert!(result.rows.iter().all(|r| r.get("status") == Some(&serde_json::Value::Null)));

        let result = f.coordinator.get(open_orders()).await.unwrap();
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn test_missing_table_with_valid_metadata_is_a_miss() {
        let f = fixture(orders_source());
        f.coordinator.get(open_orders()).await.unwrap();
        f.coordinator.store().drop_resource("orders").unwrap();

        let result = f.coordinator.get(open_orders()).await.unwrap();
        assert!(result.refreshed);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(f.source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_validation_errors_do_not_fetch_twice() {
        let f = fixture(orders_source());
        f.coordinator.get(open_orders()).await.unwrap();

        let err = f
            .coordinator
            .get(GetRequest::new("orders", ["owner"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::UnknownField { .. }));
        assert_eq!(f.source.fetches(), 1);
    }

    #[tokio::test]
    async fn test_config_overrides_and_file_database() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = CacheConfig {
            db_path: Some(temp_dir.path().join("cache.db")),
            ..CacheConfig::default()
        };
        config.ttl_overrides.insert("orders".to_string(), 42);

        let source = Arc::new(orders_source());
        {
            let coordinator = CacheCoordinator::open(config.clone(), source.clone()).unwrap();
            assert_eq!(coordinator.ttl().policy_for("orders").unwrap(), 42);
            coordinator.get(open_orders()).await.unwrap();
        }

        // 重新打开后缓存仍然有效
        let coordinator = CacheCoordinator::open(config, source.clone()).unwrap();
        let result = coordinator.get(open_orders()).await.unwrap();
        assert!(!result.refreshed);
        assert_eq!(source.fetches(), 1);
    }
}
