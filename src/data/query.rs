//! 链式查询构造器
//!
//! 每次调用都返回新的构造器值，部分构造的查询可以作为模板反复使用：
//!
//! ```rust
//! use crate::data::query::QueryBuilder;
//!
//! let open = QueryBuilder::new(&store, "orders")?
//!     .select(["id", "title"])
//!     .filter(FilterExpression::condition("status", Comparator::Is, "open"));
//!
//! let first_page = open.limit(20).execute()?;
//! let second_page = open.limit(20).offset(20).execute()?;
//! ```
//!
//! 字段、过滤与排序在 `execute()` 时按当前列模式编译，因此模板在资源刷新之后
//! 依然引用正确的物理列。

use crate::data::filter::{FilterExpression, FilterTranslator};
use crate::data::store::{
    ColumnSource, OrderTerm, ProjectedColumn, QueryRow, SortDirection, StoreQuery, TableSchema,
    TableStore,
};
use crate::data::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// 未指定 limit 时的默认行数
pub const DEFAULT_LIMIT: usize = 100;
/// limit 上限
pub const MAX_LIMIT: usize = 1000;

/// 查询结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub rows: Vec<QueryRow>,
    /// 过滤后、分页前的总行数
    pub total_count: usize,
}

/// 链式查询构造器
#[derive(Debug, Clone)]
pub struct QueryBuilder<'a> {
    store: &'a TableStore,
    resource: String,
    fields: Vec<String>,
    filter: Option<FilterExpression>,
    order: Vec<(String, SortDirection)>,
    limit: Option<usize>,
    offset: usize,
    now: Option<DateTime<Utc>>,
    default_limit: usize,
    max_limit: usize,
}

impl<'a> QueryBuilder<'a> {
    /// 针对资源创建构造器，资源没有缓存表时返回 `ResourceNotFound`
    pub fn new(store: &'a TableStore, resource: &str) -> Result<Self> {
        store.schema(resource)?;
        Ok(Self {
            store,
            resource: resource.to_string(),
            fields: Vec::new(),
            filter: None,
            order: Vec::new(),
            limit: None,
            offset: 0,
            now: None,
            default_limit: DEFAULT_LIMIT,
            max_limit: MAX_LIMIT,
        })
    }

    /// 投影字段，空列表表示全部列
    pub fn select<I, S>(&self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            ..self.clone()
        }
    }

    /// 过滤条件（替换之前的条件）
    pub fn filter(&self, expr: FilterExpression) -> Self {
        Self {
            filter: Some(expr),
            ..self.clone()
        }
    }

    /// 追加排序项
    pub fn order_by(&self, field: impl Into<String>, direction: SortDirection) -> Self {
        let mut next = self.clone();
        next.order.push((field.into(), direction));
        next
    }

    pub fn limit(&self, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..self.clone()
        }
    }

    pub fn offset(&self, offset: usize) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }

    /// 相对日期的解析时刻，默认为执行时的系统时间
    pub fn at(&self, now: DateTime<Utc>) -> Self {
        Self {
            now: Some(now),
            ..self.clone()
        }
    }

    /// 覆盖默认 limit 与上限
    pub fn with_limits(&self, default_limit: usize, max_limit: usize) -> Self {
        Self {
            default_limit,
            max_limit: max_limit.max(1),
            ..self.clone()
        }
    }

    /// 实际生效的 limit
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(self.default_limit)
            .min(self.max_limit)
    }

    /// 按给定列模式编译为存储层查询
    pub fn build(&self, schema: &TableSchema) -> Result<StoreQuery> {
        let projection = if self.fields.is_empty() {
            schema
                .columns
                .iter()
                .enumerate()
                .map(|(position, column)| ProjectedColumn {
                    name: column.name.clone(),
                    source: ColumnSource::Stored {
                        position,
                        column_type: column.column_type,
                    },
                })
                .collect()
        } else {
            self.fields
                .iter()
                .map(|field| project(schema, field))
                .collect::<Result<Vec<_>>>()?
        };

        let mut order = Vec::with_capacity(self.order.len());
        for (field, direction) in &self.order {
            match schema.position(field) {
                Some(position) => order.push(OrderTerm {
                    position,
                    direction: *direction,
                }),
                // 漂移字段整列为空，排序无意义
                None if schema.is_drifted(field) => {}
                None => return Err(CacheError::unknown_field(field.as_str())),
            }
        }

        let predicate = self
            .filter
            .as_ref()
            .map(|expr| {
                FilterTranslator::new(schema, self.now.unwrap_or_else(Utc::now)).translate(expr)
            })
            .transpose()?;

        Ok(StoreQuery {
            projection,
            predicate,
            order,
            limit: self.effective_limit(),
            offset: self.offset,
        })
    }

    /// 执行查询
    ///
    /// 编译与执行在同一把连接锁内完成，总行数与结果行来自同一快照。
    pub fn execute(&self) -> Result<QueryResult> {
        let output = self
            .store
            .query_with(&self.resource, |schema| self.build(schema))?;
        tracing::debug!(
            resource = %self.resource,
            rows = output.rows.len(),
            total = output.total_count,
            "缓存查询完成"
        );
        Ok(QueryResult {
            rows: output.rows,
            total_count: output.total_count,
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

fn project(schema: &TableSchema, field: &str) -> Result<ProjectedColumn> {
    let source = match schema.position(field) {
        Some(position) => ColumnSource::Stored {
            position,
            column_type: schema.columns[position].column_type,
        },
        None if schema.is_drifted(field) => ColumnSource::Null,
        None => return Err(CacheError::unknown_field(field)),
    };
    Ok(ProjectedColumn {
        name: field.to_string(),
        source,
    })
}
