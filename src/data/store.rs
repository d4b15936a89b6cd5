//! 资源物理表存储
//!
//! 每个资源对应一张物理表，刷新时整表重建（删除旧表 → 按模式建表 → 批量写入），
//! 整个过程在一个事务内完成：任何一步失败都会回滚，旧表保持可查询。
//!
//! 目录表 `cache_tables` 记录每个资源的物理表名、当前列模式、历史出现过的全部
//! 字段（用于识别模式漂移）与行数。
//!
//! # 使用示例
//!
//! ```rust
//! use crate::data::store::{RefreshStamp, TableStore};
//!
//! let store = TableStore::new(db.clone())?;
//! let schema = SchemaInferencer::infer(&records);
//! store.replace("orders", &schema, &records, RefreshStamp::new(now, 3600))?;
//!
//! let table = store.schema("orders")?;
//! ```

use crate::data::managers::sqlite::{quote_ident, table_exists_on, SqliteManager};
use crate::data::schema::{storage_column, Column, ColumnType, Record};
use crate::data::{CacheError, Result};
use crate::utils::clock::from_unix;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// 目录表名
pub const CATALOG_TABLE: &str = "cache_tables";

/// 物理表名前缀
const TABLE_PREFIX: &str = "rc_";
/// 物理表名中资源部分的最大长度
const MAX_NAME_LEN: usize = 48;

/// TTL 上限（100 年）
const MAX_TTL_SECONDS: u64 = 100 * 365 * 86_400;

/// 系统列：插入顺序
const ROW_COLUMN: &str = "_rc_row";
/// 系统列：本次刷新的缓存时间
const CACHED_AT_COLUMN: &str = "_rc_cached_at";
/// 系统列：本次刷新的过期时间
const EXPIRES_AT_COLUMN: &str = "_rc_expires_at";

static TABLE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^rc_[a-z0-9_]+$").unwrap());

/// 将资源标识映射为物理表名
///
/// 白名单只保留 `[a-z0-9_]`；标识被改写（大小写、非法字符、截断）时追加原始标识
/// SHA-256 的前 8 位十六进制，保证不同资源不会落到同一张表。
pub fn physical_table_name(resource: &str) -> Result<String> {
    if resource.trim().is_empty() {
        return Err(CacheError::InvalidResource(resource.to_string()));
    }

    let mut sanitized: String = resource
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    let altered = sanitized != resource || sanitized.len() > MAX_NAME_LEN;
    sanitized.truncate(MAX_NAME_LEN);
    if altered {
        let digest = Sha256::digest(resource.as_bytes());
        sanitized.push('_');
        for byte in &digest[..4] {
            sanitized.push_str(&format!("{byte:02x}"));
        }
    }

    let name = format!("{TABLE_PREFIX}{sanitized}");
    if !TABLE_NAME_RE.is_match(&name) {
        return Err(CacheError::InvalidResource(resource.to_string()));
    }
    Ok(name)
}

/// 一次刷新共享的时间戳对
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshStamp {
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RefreshStamp {
    pub fn new(now: DateTime<Utc>, ttl_seconds: u64) -> Self {
        let ttl = ChronoDuration::seconds(ttl_seconds.min(MAX_TTL_SECONDS) as i64);
        Self {
            cached_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

/// 资源在目录中的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub resource_id: String,
    pub table_name: String,
    /// 当前列模式（位置即物理列序号）
    pub columns: Vec<Column>,
    /// 该资源历次刷新出现过的全部字段
    pub known_columns: Vec<String>,
    pub row_count: usize,
}

impl TableSchema {
    /// 字段在当前模式中的位置
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// 字段曾经存在但本次刷新后消失
    pub fn is_drifted(&self, name: &str) -> bool {
        self.column(name).is_none() && self.known_columns.iter().any(|k| k == name)
    }
}

/// 参数化谓词：SQL 片段 + 按出现顺序绑定的参数（只使用匿名 `?` 占位符）
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// 排序方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// 投影列的数据来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSource {
    /// 当前模式中的第 `position` 列
    Stored {
        position: usize,
        column_type: ColumnType,
    },
    /// 漂移字段，整列为 NULL
    Null,
}

/// 输出列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedColumn {
    pub name: String,
    pub source: ColumnSource,
}

/// 排序项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTerm {
    pub position: usize,
    pub direction: SortDirection,
}

/// 编译后的存储层查询
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoreQuery {
    pub projection: Vec<ProjectedColumn>,
    pub predicate: Option<Predicate>,
    pub order: Vec<OrderTerm>,
    pub limit: usize,
    pub offset: usize,
}

/// 查询结果行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRow {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl QueryRow {
    /// 按字段名取值
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|i| &self.values[i])
    }

    /// 转换为记录（字段名 → 值）
    pub fn to_record(&self) -> Record {
        self.columns
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

/// 查询输出：分页后的行 + 过滤后的总行数
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    pub rows: Vec<QueryRow>,
    pub total_count: usize,
}

/// 资源物理表存储
#[derive(Debug, Clone)]
pub struct TableStore {
    db: SqliteManager,
}

impl TableStore {
    /// 创建存储并确保目录表存在
    pub fn new(db: SqliteManager) -> Result<Self> {
        db.execute_raw(&format!(
            "CREATE TABLE IF NOT EXISTS {CATALOG_TABLE} (
                resource_id TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                schema_json TEXT NOT NULL,
                known_columns_json TEXT NOT NULL,
                row_count INTEGER NOT NULL
            )"
        ))?;
        Ok(Self { db })
    }

    /// 底层数据库句柄
    pub fn database(&self) -> &SqliteManager {
        &self.db
    }

    /// 原子地替换资源的物理表
    ///
    /// 返回写入的行数。失败时旧表与目录记录保持不变。
    pub fn replace(
        &self,
        resource: &str,
        schema: &[Column],
        rows: &[Record],
        stamp: RefreshStamp,
    ) -> Result<usize> {
        self.db
            .transaction(|tx| Self::replace_on(tx, resource, schema, rows, stamp))
    }

    /// 在调用方持有的事务上执行替换
    pub fn replace_on(
        conn: &Connection,
        resource: &str,
        schema: &[Column],
        rows: &[Record],
        stamp: RefreshStamp,
    ) -> Result<usize> {
        let table = physical_table_name(resource)?;
        let quoted = quote_ident(&table);

        let mut known_columns: Vec<String> = conn
            .query_row(
                &format!("SELECT known_columns_json FROM {CATALOG_TABLE} WHERE resource_id = ?1"),
                [resource],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|json| serde_json::from_str(&json))
            .transpose()?
            .unwrap_or_default();
        for column in schema {
            if !known_columns.contains(&column.name) {
                known_columns.push(column.name.clone());
            }
        }

        conn.execute(&format!("DROP TABLE IF EXISTS {quoted}"), [])?;

        let mut ddl = format!(
            "CREATE TABLE {quoted} ({} INTEGER PRIMARY KEY, {} INTEGER NOT NULL, {} INTEGER NOT NULL",
            quote_ident(ROW_COLUMN),
            quote_ident(CACHED_AT_COLUMN),
            quote_ident(EXPIRES_AT_COLUMN),
        );
        for (position, column) in schema.iter().enumerate() {
            ddl.push_str(&format!(
                ", {} {}{}",
                quote_ident(&storage_column(position)),
                column.column_type.sql_type(),
                if column.nullable { "" } else { " NOT NULL" }
            ));
        }
        ddl.push(')');
        conn.execute(&ddl, [])?;

        let mut insert_columns = vec![quote_ident(CACHED_AT_COLUMN), quote_ident(EXPIRES_AT_COLUMN)];
        insert_columns.extend((0..schema.len()).map(|p| quote_ident(&storage_column(p))));
        let placeholders = vec!["?"; insert_columns.len()].join(", ");
        let insert_sql = format!(
            "INSERT INTO {quoted} ({}) VALUES ({placeholders})",
            insert_columns.join(", ")
        );

        {
            let mut stmt = conn.prepare(&insert_sql)?;
            for record in rows {
                let mut values = Vec::with_capacity(schema.len() + 2);
                values.push(SqlValue::Integer(stamp.cached_at.timestamp()));
                values.push(SqlValue::Integer(stamp.expires_at.timestamp()));
                for column in schema {
                    let value = record.get(&column.name).unwrap_or(&Value::Null);
                    values.push(column.column_type.encode(value));
                }
                stmt.execute(params_from_iter(values.iter()))?;
            }
        }

        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {CATALOG_TABLE}
                    (resource_id, table_name, schema_json, known_columns_json, row_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            params![
                resource,
                table,
                serde_json::to_string(schema)?,
                serde_json::to_string(&known_columns)?,
                rows.len() as i64,
            ],
        )?;

        tracing::debug!(
            resource = %resource,
            table = %table,
            columns = schema.len(),
            rows = rows.len(),
            "物理表已重建"
        );
        Ok(rows.len())
    }

    /// 读取资源的目录记录
    pub fn schema(&self, resource: &str) -> Result<TableSchema> {
        self.db.with_connection(|conn| Self::schema_on(conn, resource))
    }

    fn schema_on(conn: &Connection, resource: &str) -> Result<TableSchema> {
        let entry = conn
            .query_row(
                &format!(
                    "SELECT resource_id, table_name, schema_json, known_columns_json, row_count
                     FROM {CATALOG_TABLE} WHERE resource_id = ?1"
                ),
                [resource],
                catalog_row,
            )
            .optional()?
            .ok_or_else(|| CacheError::ResourceNotFound(resource.to_string()))?;

        let schema = entry.into_schema()?;
        if !table_exists_on(conn, &schema.table_name)? {
            return Err(CacheError::ResourceNotFound(resource.to_string()));
        }
        Ok(schema)
    }

    /// 资源是否有可查询的缓存表
    pub fn exists(&self, resource: &str) -> Result<bool> {
        match self.schema(resource) {
            Ok(_) => Ok(true),
            Err(CacheError::ResourceNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 列出所有已缓存的资源
    pub fn list(&self) -> Result<Vec<TableSchema>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT resource_id, table_name, schema_json, known_columns_json, row_count
                 FROM {CATALOG_TABLE} ORDER BY resource_id"
            ))?;
            let entries = stmt
                .query_map([], catalog_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            entries.into_iter().map(CatalogEntry::into_schema).collect()
        })
    }

    /// 执行已编译的查询
    pub fn query(&self, resource: &str, query: &StoreQuery) -> Result<Vec<QueryRow>> {
        let output = self.query_with(resource, |_| Ok(query.clone()))?;
        Ok(output.rows)
    }

    /// 统计满足谓词的行数
    pub fn count(&self, resource: &str, predicate: Option<&Predicate>) -> Result<usize> {
        self.db.with_connection(|conn| {
            let schema = Self::schema_on(conn, resource)?;
            Self::count_on(conn, &schema, predicate)
        })
    }

    /// 在同一把连接锁内读取模式、编译查询并执行
    ///
    /// `plan` 基于执行时的当前模式生成查询，避免模板查询在刷新之后引用错位的列；
    /// 总行数与分页结果来自同一个快照。
    pub fn query_with<F>(&self, resource: &str, plan: F) -> Result<QueryOutput>
    where
        F: FnOnce(&TableSchema) -> Result<StoreQuery>,
    {
        self.db.with_connection(|conn| {
            let schema = Self::schema_on(conn, resource)?;
            let query = plan(&schema)?;
            Self::validate_positions(&schema, &query)?;

            let total_count = Self::count_on(conn, &schema, query.predicate.as_ref())?;

            let mut select = vec![quote_ident(CACHED_AT_COLUMN), quote_ident(EXPIRES_AT_COLUMN)];
            for item in &query.projection {
                select.push(match item.source {
                    ColumnSource::Stored { position, .. } => quote_ident(&storage_column(position)),
                    ColumnSource::Null => "NULL".to_string(),
                });
            }

            let mut sql = format!(
                "SELECT {} FROM {}",
                select.join(", "),
                quote_ident(&schema.table_name)
            );
            let mut params: Vec<SqlValue> = Vec::new();
            if let Some(predicate) = &query.predicate {
                sql.push_str(" WHERE ");
                sql.push_str(&predicate.sql);
                params.extend(predicate.params.iter().cloned());
            }

            let mut order: Vec<String> = query
                .order
                .iter()
                .map(|term| {
                    format!(
                        "{} {}",
                        quote_ident(&storage_column(term.position)),
                        term.direction.as_sql()
                    )
                })
                .collect();
            order.push(quote_ident(ROW_COLUMN));
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(SqlValue::Integer(i64::try_from(query.limit).unwrap_or(i64::MAX)));
            params.push(SqlValue::Integer(i64::try_from(query.offset).unwrap_or(i64::MAX)));

            tracing::trace!(resource = %resource, sql = %sql, "执行缓存查询");

            let names: Vec<String> = query.projection.iter().map(|p| p.name.clone()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    let mut values = Vec::with_capacity(query.projection.len());
                    for (i, item) in query.projection.iter().enumerate() {
                        let value = match item.source {
                            ColumnSource::Stored { column_type, .. } => {
                                column_type.decode(row.get_ref(i + 2)?)
                            }
                            ColumnSource::Null => Value::Null,
                        };
                        values.push(value);
                    }
                    Ok(QueryRow {
                        columns: names.clone(),
                        values,
                        cached_at: from_unix(row.get(0)?),
                        expires_at: from_unix(row.get(1)?),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(QueryOutput { rows, total_count })
        })
    }

    fn count_on(
        conn: &Connection,
        schema: &TableSchema,
        predicate: Option<&Predicate>,
    ) -> Result<usize> {
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&schema.table_name));
        let params: &[SqlValue] = match predicate {
            Some(p) => {
                sql.push_str(" WHERE ");
                sql.push_str(&p.sql);
                &p.params
            }
            None => &[],
        };
        let count: i64 = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn validate_positions(schema: &TableSchema, query: &StoreQuery) -> Result<()> {
        let width = schema.columns.len();
        let projected = query.projection.iter().filter_map(|p| match p.source {
            ColumnSource::Stored { position, .. } => Some(position),
            ColumnSource::Null => None,
        });
        let ordered = query.order.iter().map(|o| o.position);
        match projected.chain(ordered).find(|p| *p >= width) {
            Some(position) => Err(CacheError::InvalidRequest(format!(
                "列位置 {position} 超出资源 {} 的模式宽度 {width}",
                schema.resource_id
            ))),
            None => Ok(()),
        }
    }

    /// 删除资源的物理表与目录记录（幂等）
    ///
    /// 返回删除前是否存在。
    pub fn drop_resource(&self, resource: &str) -> Result<bool> {
        self.db.transaction(|tx| Self::drop_on(tx, resource))
    }

    /// 在调用方持有的事务上删除资源
    pub fn drop_on(conn: &Connection, resource: &str) -> Result<bool> {
        let table = physical_table_name(resource)?;
        let existed = table_exists_on(conn, &table)?;
        conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&table)), [])?;
        let removed = conn.execute(
            &format!("DELETE FROM {CATALOG_TABLE} WHERE resource_id = ?1"),
            [resource],
        )?;
        Ok(existed || removed > 0)
    }

    /// 删除全部资源表（含目录中遗失的孤儿表），返回删除的表数量
    pub fn drop_all(&self) -> Result<usize> {
        self.db.transaction(|tx| Self::drop_all_on(tx))
    }

    /// 在调用方持有的事务上删除全部资源表
    pub fn drop_all_on(conn: &Connection) -> Result<usize> {
        let tables: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'rc\\_%' ESCAPE '\\'",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            names
        };
        for table in &tables {
            conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), [])?;
        }
        conn.execute(&format!("DELETE FROM {CATALOG_TABLE}"), [])?;
        Ok(tables.len())
    }
}

/// 目录表中的原始行
struct CatalogEntry {
    resource_id: String,
    table_name: String,
    schema_json: String,
    known_columns_json: String,
    row_count: i64,
}

impl CatalogEntry {
    fn into_schema(self) -> Result<TableSchema> {
        Ok(TableSchema {
            resource_id: self.resource_id,
            table_name: self.table_name,
            columns: serde_json::from_str(&self.schema_json)?,
            known_columns: serde_json::from_str(&self.known_columns_json)?,
            row_count: usize::try_from(self.row_count).unwrap_or_default(),
        })
    }
}

fn catalog_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CatalogEntry> {
    Ok(CatalogEntry {
        resource_id: row.get(0)?,
        table_name: row.get(1)?,
        schema_json: row.get(2)?,
        known_columns_json: row.get(3)?,
        row_count: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::schema::SchemaInferencer;
    use chrono::TimeZone;
    use serde_json::json;

    fn create_store() -> TableStore {
        TableStore::new(SqliteManager::open_in_memory().unwrap()).unwrap()
    }

    fn records(values: Value) -> Vec<Record> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    fn stamp_at(secs: i64, ttl: u64) -> RefreshStamp {
        RefreshStamp::new(Utc.timestamp_opt(secs, 0).unwrap(), ttl)
    }

    fn select_all(schema: &TableSchema) -> StoreQuery {
        StoreQuery {
            projection: schema
                .columns
                .iter()
                .enumerate()
                .map(|(position, c)| ProjectedColumn {
                    name: c.name.clone(),
                    source: ColumnSource::Stored {
                        position,
                        column_type: c.column_type,
                    },
                })
                .collect(),
            limit: 100,
            ..Default::default()
        }
    }

    fn orders() -> Vec<Record> {
        records(json!([
            {"id": 1, "status": "open", "tags": ["a", "b"], "urgent": true},
            {"id": 2, "status": "closed", "tags": [], "urgent": false}
        ]))
    }

    #[test]
    fn test_physical_table_name_sanitizer() {
        assert_eq!(physical_table_name("orders").unwrap(), "rc_orders");
        assert_eq!(physical_table_name("tbl_01").unwrap(), "rc_tbl_01");

        let spaced = physical_table_name("My Orders").unwrap();
        assert!(spaced.starts_with("rc_my_orders_"));
        assert_ne!(spaced, physical_table_name("my_orders").unwrap());
        assert_ne!(
            physical_table_name("Orders").unwrap(),
            physical_table_name("orders").unwrap()
        );

        let hostile = physical_table_name("x\"; DROP TABLE cache_tables; --").unwrap();
        assert!(hostile
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));

        let long = physical_table_name(&"a".repeat(200)).unwrap();
        assert!(long.len() <= TABLE_PREFIX.len() + MAX_NAME_LEN + 9);

        assert!(matches!(
            physical_table_name("  "),
            Err(CacheError::InvalidResource(_))
        ));
    }

    #[test]
    fn test_replace_and_query_roundtrip() {
        let store = create_store();
        let rows = orders();
        let schema = SchemaInferencer::infer(&rows);

        let written = store.replace("orders", &schema, &rows, stamp_at(0, 3600)).unwrap();
        assert_eq!(written, 2);

        let table = store.schema("orders").unwrap();
        assert_eq!(table.row_count, 2);
        assert_eq!(table.columns, schema);

        let result = store.query("orders", &select_all(&table)).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].get("id"), Some(&json!(1)));
        assert_eq!(result[0].get("tags"), Some(&json!(["a", "b"])));
        assert_eq!(result[0].get("urgent"), Some(&json!(true)));
        assert_eq!(result[1].to_record(), rows[1]);
    }

    #[test]
    fn test_snapshot_shares_one_stamp() {
        let store = create_store();
        let rows = orders();
        let schema = SchemaInferencer::infer(&rows);
        let stamp = stamp_at(1_700_000_000, 60);
        store.replace("orders", &schema, &rows, stamp).unwrap();

        let table = store.schema("orders").unwrap();
        for row in store.query("orders", &select_all(&table)).unwrap() {
            assert_eq!(row.cached_at, stamp.cached_at);
            assert_eq!(row.expires_at, stamp.expires_at);
        }
    }

    #[test]
    fn test_idempotent_replace() {
        let store = create_store();
        let rows = orders();
        let schema = SchemaInferencer::infer(&rows);
        let stamp = stamp_at(0, 3600);

        store.replace("orders", &schema, &rows, stamp).unwrap();
        let table = store.schema("orders").unwrap();
        let first = store.query("orders", &select_all(&table)).unwrap();

        store.replace("orders", &schema, &rows, stamp).unwrap();
        let second = store.query("orders", &select_all(&table)).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.schema("orders").unwrap().row_count, 2);
    }

    #[test]
    fn test_failed_replace_keeps_previous_table() {
        let store = create_store();
        let rows = orders();
        let schema = SchemaInferencer::infer(&rows);
        store.replace("orders", &schema, &rows, stamp_at(0, 3600)).unwrap();

        // 第二行缺少非空列 id，写入中途失败
        let broken = records(json!([
            {"id": 3, "status": "new", "tags": [], "urgent": false},
            {"status": "missing id"}
        ]));
        let result = store.replace("orders", &schema, &broken, stamp_at(10, 3600));
        assert!(matches!(result, Err(CacheError::Storage(_))));

        let table = store.schema("orders").unwrap();
        assert_eq!(table.row_count, 2);
        let rows_after = store.query("orders", &select_all(&table)).unwrap();
        assert_eq!(rows_after.len(), 2);
        assert_eq!(rows_after[0].get("id"), Some(&json!(1)));
        assert_eq!(rows_after[0].cached_at, Utc.timestamp_opt(0, 0).unwrap());
    }

    #[test]
    fn test_query_missing_resource() {
        let store = create_store();
        let result = store.query("nothing", &StoreQuery::default());
        assert!(matches!(result, Err(CacheError::ResourceNotFound(_))));
        assert!(!store.exists("nothing").unwrap());
    }

    #[test]
    fn test_count_with_and_without_predicate() {
        let store = create_store();
        let rows = orders();
        store
            .replace("orders", &SchemaInferencer::infer(&rows), &rows, stamp_at(0, 60))
            .unwrap();

        assert_eq!(store.count("orders", None).unwrap(), 2);

        let position = store.schema("orders").unwrap().position("urgent").unwrap();
        let urgent = Predicate {
            sql: format!("{} = ?", quote_ident(&storage_column(position))),
            params: vec![SqlValue::Integer(1)],
        };
        assert_eq!(store.count("orders", Some(&urgent)).unwrap(), 1);

        let none = Predicate {
            sql: format!("{} = ?", quote_ident(&storage_column(position))),
            params: vec![SqlValue::Integer(7)],
        };
        assert_eq!(store.count("orders", Some(&none)).unwrap(), 0);

        assert!(matches!(
            store.count("nothing", None),
            Err(CacheError::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_drop_is_idempotent() {
        let store = create_store();
        let rows = orders();
        store
            .replace("orders", &SchemaInferencer::infer(&rows), &rows, stamp_at(0, 60))
            .unwrap();

        assert!(store.drop_resource("orders").unwrap());
        assert!(!store.drop_resource("orders").unwrap());
        assert!(!store.exists("orders").unwrap());
    }

    #[test]
    fn test_drop_all() {
        let store = create_store();
        let rows = orders();
        let schema = SchemaInferencer::infer(&rows);
        store.replace("orders", &schema, &rows, stamp_at(0, 60)).unwrap();
        store.replace("Backlog Items", &schema, &rows, stamp_at(0, 60)).unwrap();

        assert_eq!(store.drop_all().unwrap(), 2);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_known_columns_accumulate() {
        let store = create_store();
        let first = records(json!([{"id": 1, "status": "open"}]));
        store
            .replace("orders", &SchemaInferencer::infer(&first), &first, stamp_at(0, 60))
            .unwrap();

        let second = records(json!([{"id": 1, "owner": "ana"}]));
        store
            .replace("orders", &SchemaInferencer::infer(&second), &second, stamp_at(60, 60))
            .unwrap();

        let table = store.schema("orders").unwrap();
        assert_eq!(table.known_columns, vec!["id", "status", "owner"]);
        assert!(table.is_drifted("status"));
        assert!(!table.is_drifted("owner"));
        assert!(!table.is_drifted("never_seen"));
    }

    #[test]
    fn test_awkward_field_names_are_stored_positionally() {
        let store = create_store();
        let rows = records(json!([
            {"Name": "a", "name": "b", "x\"; DROP TABLE t; --": 1, "Due Date": "2024-01-05"}
        ]));
        let schema = SchemaInferencer::infer(&rows);
        store.replace("weird", &schema, &rows, stamp_at(0, 60)).unwrap();

        let table = store.schema("weird").unwrap();
        let result = store.query("weird", &select_all(&table)).unwrap();
        assert_eq!(result[0].to_record(), rows[0]);
    }

    #[test]
    fn test_empty_schema_is_queryable() {
        let store = create_store();
        store.replace("empty", &[], &[], stamp_at(0, 60)).unwrap();
        let table = store.schema("empty").unwrap();
        assert_eq!(table.row_count, 0);
        assert!(store.query("empty", &select_all(&table)).unwrap().is_empty());
    }

    #[test]
    fn test_query_with_reports_total_count() {
        let store = create_store();
        let rows = records(json!([{"n": 1}, {"n": 2}, {"n": 3}, {"n": 4}]));
        store
            .replace("nums", &SchemaInferencer::infer(&rows), &rows, stamp_at(0, 60))
            .unwrap();

        let output = store
            .query_with("nums", |schema| {
                let mut query = select_all(schema);
                query.predicate = Some(Predicate {
                    sql: "\"c0\" > ?".to_string(),
                    params: vec![SqlValue::Integer(1)],
                });
                query.order = vec![OrderTerm {
                    position: 0,
                    direction: SortDirection::Desc,
                }];
                query.limit = 2;
                Ok(query)
            })
            .unwrap();

        assert_eq!(output.total_count, 3);
        let values: Vec<&Value> = output.rows.iter().map(|r| &r.values[0]).collect();
        assert_eq!(values, vec![&json!(4), &json!(3)]);
    }

    #[test]
    fn test_out_of_range_position_rejected() {
        let store = create_store();
        let rows = records(json!([{"n": 1}]));
        store
            .replace("nums", &SchemaInferencer::infer(&rows), &rows, stamp_at(0, 60))
            .unwrap();

        let query = StoreQuery {
            order: vec![OrderTerm {
                position: 5,
                direction: SortDirection::Asc,
            }],
            limit: 10,
            ..Default::default()
        };
        assert!(matches!(
            store.query("nums", &query),
            Err(CacheError::InvalidRequest(_))
        ));
    }
}
