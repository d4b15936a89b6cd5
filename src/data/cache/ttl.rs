//! TTL 元数据
//!
//! 每个资源只有一对 `cached_at` / `expires_at`，与物理表中每行携带的时间戳一致。
//! 过期只在访问时惰性判断，没有后台清理线程。
//!
//! 持久化两张表：
//! - `cache_metadata(resource_id, ttl_seconds, cached_at, expires_at)`
//! - `cache_policies(resource_id, ttl_seconds)`：显式配置的 TTL 覆盖
//!
//! # 使用示例
//!
//! ```rust
//! use crate::data::cache::TtlMetadata;
//!
//! let ttl = TtlMetadata::new(db.clone(), DEFAULT_TTL_SECONDS)?;
//! ttl.set_policy("orders", 3600)?;
//!
//! let seconds = ttl.policy_for("orders")?;
//! ttl.record_refresh("orders", seconds, now)?;
//! assert!(ttl.is_valid("orders", now)?);
//! ```

use crate::data::managers::SqliteManager;
use crate::data::store::RefreshStamp;
use crate::data::Result;
use crate::utils::clock::from_unix;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// 默认 TTL：4 小时
pub const DEFAULT_TTL_SECONDS: u64 = 4 * 60 * 60;

const METADATA_TABLE: &str = "cache_metadata";
const POLICY_TABLE: &str = "cache_policies";

/// 资源缓存状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Empty,
    Valid,
    Expired,
}

/// 一个资源的元数据记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub resource_id: String,
    pub ttl_seconds: u64,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MetadataEntry {
    /// `now < expires_at`，按秒比较
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() < self.expires_at.timestamp()
    }
}

/// TTL 覆盖策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlPolicy {
    pub resource_id: String,
    pub ttl_seconds: u64,
}

/// TTL 元数据存储
#[derive(Debug, Clone)]
pub struct TtlMetadata {
    db: SqliteManager,
    default_ttl: u64,
}

impl TtlMetadata {
    /// 创建元数据存储并确保表存在
    pub fn new(db: SqliteManager, default_ttl_seconds: u64) -> Result<Self> {
        db.execute_raw(&format!(
            "CREATE TABLE IF NOT EXISTS {METADATA_TABLE} (
                resource_id TEXT PRIMARY KEY,
                ttl_seconds INTEGER NOT NULL,
                cached_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {POLICY_TABLE} (
                resource_id TEXT PRIMARY KEY,
                ttl_seconds INTEGER NOT NULL
            );"
        ))?;
        Ok(Self {
            db,
            default_ttl: default_ttl_seconds,
        })
    }

    /// 全局默认 TTL
    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }

    /// 缓存条目存在且未过期
    pub fn is_valid(&self, resource: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .entry(resource)?
            .is_some_and(|entry| entry.is_valid(now)))
    }

    /// 记录一次刷新：`cached_at = now`，`expires_at = now + ttl`
    pub fn record_refresh(
        &self,
        resource: &str,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<MetadataEntry> {
        self.db
            .with_connection(|conn| Self::record_refresh_on(conn, resource, ttl_seconds, now))
    }

    /// 在调用方持有的事务上记录刷新
    pub fn record_refresh_on(
        conn: &Connection,
        resource: &str,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<MetadataEntry> {
        let stamp = RefreshStamp::new(now, ttl_seconds);
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {METADATA_TABLE} (resource_id, ttl_seconds, cached_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)"
            ),
            params![
                resource,
                ttl_to_sql(ttl_seconds),
                stamp.cached_at.timestamp(),
                stamp.expires_at.timestamp(),
            ],
        )?;
        Ok(MetadataEntry {
            resource_id: resource.to_string(),
            ttl_seconds,
            cached_at: stamp.cached_at,
            expires_at: stamp.expires_at,
        })
    }

    /// 资源的 TTL：显式覆盖优先，否则使用全局默认值
    pub fn policy_for(&self, resource: &str) -> Result<u64> {
        self.db.with_connection(|conn| {
            let ttl: Option<i64> = conn
                .query_row(
                    &format!("SELECT ttl_seconds FROM {POLICY_TABLE} WHERE resource_id = ?1"),
                    [resource],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(ttl.map(ttl_from_sql).unwrap_or(self.default_ttl))
        })
    }

    /// 设置资源的 TTL 覆盖
    ///
    /// 只影响之后的刷新，已缓存条目的 `expires_at` 不变。
    pub fn set_policy(&self, resource: &str, ttl_seconds: u64) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {POLICY_TABLE} (resource_id, ttl_seconds) VALUES (?1, ?2)"
                ),
                params![resource, ttl_to_sql(ttl_seconds)],
            )?;
            Ok(())
        })?;
        tracing::info!(resource = %resource, ttl_seconds, "TTL 策略已更新");
        Ok(())
    }

    /// 移除资源的 TTL 覆盖，返回之前是否存在
    pub fn clear_policy(&self, resource: &str) -> Result<bool> {
        self.db.with_connection(|conn| {
            let removed = conn.execute(
                &format!("DELETE FROM {POLICY_TABLE} WHERE resource_id = ?1"),
                [resource],
            )?;
            Ok(removed > 0)
        })
    }

    /// 所有 TTL 覆盖
    pub fn policies(&self) -> Result<Vec<TtlPolicy>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT resource_id, ttl_seconds FROM {POLICY_TABLE} ORDER BY resource_id"
            ))?;
            let policies = stmt
                .query_map([], |row| {
                    Ok(TtlPolicy {
                        resource_id: row.get(0)?,
                        ttl_seconds: ttl_from_sql(row.get(1)?),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(policies)
        })
    }

    /// 资源的缓存状态
    pub fn status(&self, resource: &str, now: DateTime<Utc>) -> Result<CacheStatus> {
        Ok(match self.entry(resource)? {
            None => CacheStatus::Empty,
            Some(entry) if entry.is_valid(now) => CacheStatus::Valid,
            Some(_) => CacheStatus::Expired,
        })
    }

    /// 读取单个资源的元数据
    pub fn entry(&self, resource: &str) -> Result<Option<MetadataEntry>> {
        self.db.with_connection(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT resource_id, ttl_seconds, cached_at, expires_at
                         FROM {METADATA_TABLE} WHERE resource_id = ?1"
                    ),
                    [resource],
                    metadata_row,
                )
                .optional()?)
        })
    }

    /// 全部元数据记录
    pub fn entries(&self) -> Result<Vec<MetadataEntry>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT resource_id, ttl_seconds, cached_at, expires_at
                 FROM {METADATA_TABLE} ORDER BY resource_id"
            ))?;
            let entries = stmt
                .query_map([], metadata_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// 已过期的资源列表
    pub fn expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT resource_id FROM {METADATA_TABLE} WHERE expires_at <= ?1 ORDER BY resource_id"
            ))?;
            let ids = stmt
                .query_map([now.timestamp()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// 删除单个资源的元数据（TTL 覆盖保留）
    pub fn remove(&self, resource: &str) -> Result<bool> {
        self.db.with_connection(|conn| Self::remove_on(conn, resource))
    }

    /// 在调用方持有的事务上删除元数据
    pub fn remove_on(conn: &Connection, resource: &str) -> Result<bool> {
        let removed = conn.execute(
            &format!("DELETE FROM {METADATA_TABLE} WHERE resource_id = ?1"),
            [resource],
        )?;
        Ok(removed > 0)
    }

    /// 清空全部元数据，返回删除的条目数
    pub fn clear(&self) -> Result<usize> {
        self.db.with_connection(Self::clear_on)
    }

    pub fn clear_on(conn: &Connection) -> Result<usize> {
        Ok(conn.execute(&format!("DELETE FROM {METADATA_TABLE}"), [])?)
    }
}

fn metadata_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetadataEntry> {
    Ok(MetadataEntry {
        resource_id: row.get(0)?,
        ttl_seconds: ttl_from_sql(row.get(1)?),
        cached_at: from_unix(row.get(2)?),
        expires_at: from_unix(row.get(3)?),
    })
}

fn ttl_to_sql(ttl_seconds: u64) -> i64 {
    i64::try_from(ttl_seconds).unwrap_or(i64::MAX)
}

fn ttl_from_sql(ttl_seconds: i64) -> u64 {
    u64::try_from(ttl_seconds).unwrap_or_default()
}
