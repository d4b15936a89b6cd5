//! 过滤树 → 参数化 SQL 谓词
//!
//! 所有值都作为绑定参数传入，只有经过 [`quote_ident`] 处理的物理列名进入 SQL 文本。
//! 参数顺序与 `?` 占位符的出现顺序一致。
//!
//! 否定类比较符（`is_not`、`not_contains`、`is_none_of`、`has_none_of`）
//! 对空值返回真：一个没有值的字段既不“是”也不“包含”任何东西。

use super::{Comparator, DateMode, FilterExpression, FilterValue};
use crate::data::managers::quote_ident;
use crate::data::schema::{storage_column, ColumnType};
use crate::data::store::{Predicate, TableSchema};
use crate::data::{CacheError, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;

/// 便捷入口：按给定时钟翻译过滤树
pub fn translate(
    expr: &FilterExpression,
    schema: &TableSchema,
    now: DateTime<Utc>,
) -> Result<Predicate> {
    FilterTranslator::new(schema, now).translate(expr)
}

/// 比较的目标列
struct Target<'f> {
    field: &'f str,
    /// SQL 中的列表达式，漂移字段为 `NULL`
    expr: String,
    column_type: ColumnType,
}

#[derive(Clone, Copy)]
enum Bound {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Bound {
    fn of(comparator: Comparator) -> Option<(Bound, bool)> {
        use Comparator::*;
        Some(match comparator {
            IsLessThan => (Bound::Lt, false),
            IsLessThanOrEqual => (Bound::Lte, false),
            IsGreaterThan => (Bound::Gt, false),
            IsGreaterThanOrEqual => (Bound::Gte, false),
            IsBefore => (Bound::Lt, true),
            IsOnOrBefore => (Bound::Lte, true),
            IsAfter => (Bound::Gt, true),
            IsOnOrAfter => (Bound::Gte, true),
            _ => return None,
        })
    }

    fn operator(self) -> &'static str {
        match self {
            Bound::Lt => "<",
            Bound::Lte => "<=",
            Bound::Gt => ">",
            Bound::Gte => ">=",
        }
    }
}

/// 过滤翻译器
///
/// 持有当前列模式与翻译时刻；相对日期在此刻解析。
pub struct FilterTranslator<'a> {
    schema: &'a TableSchema,
    now: DateTime<Utc>,
}

impl<'a> FilterTranslator<'a> {
    pub fn new(schema: &'a TableSchema, now: DateTime<Utc>) -> Self {
        Self { schema, now }
    }

    pub fn translate(&self, expr: &FilterExpression) -> Result<Predicate> {
        match expr {
            FilterExpression::Group { op, children } => {
                if children.is_empty() {
                    return Err(CacheError::InvalidFilter(format!(
                        "{} 分组没有子条件",
                        op.as_str()
                    )));
                }
                let mut parts = Vec::with_capacity(children.len());
                let mut params = Vec::new();
                for child in children {
                    let predicate = self.translate(child)?;
                    parts.push(predicate.sql);
                    params.extend(predicate.params);
                }
                let joiner = format!(" {} ", op.as_str());
                Ok(Predicate {
                    sql: format!("({})", parts.join(&joiner)),
                    params,
                })
            }
            FilterExpression::Condition {
                field,
                comparator,
                value,
            } => {
                let target = self.target(field)?;
                self.condition(&target, *comparator, value)
            }
        }
    }

    fn target<'f>(&self, field: &'f str) -> Result<Target<'f>> {
        if let Some(position) = self.schema.position(field) {
            return Ok(Target {
                field,
                expr: quote_ident(&storage_column(position)),
                column_type: self.schema.columns[position].column_type,
            });
        }
        if self.schema.is_drifted(field) {
            // 刷新后消失的字段按整列为空处理
            return Ok(Target {
                field,
                expr: "NULL".to_string(),
                column_type: ColumnType::Text,
            });
        }
        Err(CacheError::unknown_field(field))
    }

    fn condition(
        &self,
        target: &Target<'_>,
        comparator: Comparator,
        value: &FilterValue,
    ) -> Result<Predicate> {
        use Comparator::*;
        match comparator {
            Is => self.equality(target, comparator, value, false),
            IsNot => self.equality(target, comparator, value, true),
            Contains => substring(target, comparator, value, false),
            NotContains => substring(target, comparator, value, true),
            IsAnyOf | HasAnyOf => membership(target, comparator, value, false),
            IsNoneOf | HasNoneOf => membership(target, comparator, value, true),
            HasAllOf | IsExactly => containment(target, comparator, value),
            IsEmpty => Ok(emptiness(target, false)),
            IsNotEmpty => Ok(emptiness(target, true)),
            IsGreaterThan | IsLessThan | IsGreaterThanOrEqual | IsLessThanOrEqual | IsBefore
            | IsAfter | IsOnOrBefore | IsOnOrAfter => self.ordering(target, comparator, value),
        }
    }

    fn equality(
        &self,
        target: &Target<'_>,
        comparator: Comparator,
        value: &FilterValue,
        negate: bool,
    ) -> Result<Predicate> {
        let col = &target.expr;
        if let FilterValue::Date(mode) = value {
            let day = date_operand(target, comparator)?;
            let window = mode.resolve(self.now);
            let inner = format!("({day} >= ? AND {day} < ?)");
            let sql = if negate {
                format!("({col} IS NULL OR NOT COALESCE({inner}, 0))")
            } else {
                inner
            };
            return Ok(Predicate {
                sql,
                params: vec![
                    SqlValue::Integer(window.start),
                    SqlValue::Integer(window.end),
                ],
            });
        }

        let param = if target.column_type == ColumnType::Json {
            SqlValue::Text(json_literal(target, comparator, value)?.to_string())
        } else {
            bind_scalar(target, comparator, value)?
        };
        let sql = if negate {
            format!("({col} IS NULL OR {col} <> ?)")
        } else {
            format!("{col} = ?")
        };
        Ok(Predicate {
            sql,
            params: vec![param],
        })
    }

    fn ordering(
        &self,
        target: &Target<'_>,
        comparator: Comparator,
        value: &FilterValue,
    ) -> Result<Predicate> {
        let Some((bound, date_family)) = Bound::of(comparator) else {
            return Err(CacheError::unsupported(comparator.as_str(), "不是顺序比较符"));
        };
        if matches!(target.column_type, ColumnType::Boolean | ColumnType::Json) {
            return Err(not_applicable(target, comparator));
        }

        let col = &target.expr;
        let numeric_column = target.column_type.is_numeric();
        match value {
            FilterValue::Date(mode) => self.date_bound(target, comparator, bound, mode),
            FilterValue::Text(text) if date_family => {
                let mode: DateMode = text.parse()?;
                self.date_bound(target, comparator, bound, &mode)
            }
            FilterValue::Text(text) if numeric_column => {
                let number = parse_number(text).ok_or_else(|| {
                    CacheError::InvalidFilter(format!(
                        "数值字段 {} 的 {comparator} 条件需要数值，收到 {text:?}",
                        target.field
                    ))
                })?;
                Ok(Predicate {
                    sql: format!("{col} {} ?", bound.operator()),
                    params: vec![number],
                })
            }
            FilterValue::Text(text) => Ok(Predicate {
                sql: format!("{col} {} ?", bound.operator()),
                params: vec![SqlValue::Text(text.clone())],
            }),
            FilterValue::Integer(_) | FilterValue::Real(_) => {
                let param = bind_element(target, comparator, value)?;
                let sql = if numeric_column {
                    format!("{col} {} ?", bound.operator())
                } else {
                    // 文本列只有完整的数值文本参与比较，'n/a' 与 '' 不会被当作 0
                    format!(
                        "(trim({col}) <> '' AND CAST(trim({col}) AS NUMERIC) = trim({col}) \
                         AND CAST({col} AS REAL) {} ?)",
                        bound.operator()
                    )
                };
                Ok(Predicate {
                    sql,
                    params: vec![param],
                })
            }
            other => Err(wrong_value(target, comparator, other)),
        }
    }

    fn date_bound(
        &self,
        target: &Target<'_>,
        comparator: Comparator,
        bound: Bound,
        mode: &DateMode,
    ) -> Result<Predicate> {
        let day = date_operand(target, comparator)?;
        let window = mode.resolve(self.now);
        let (op, boundary) = match bound {
            Bound::Lt => ("<", window.start),
            Bound::Lte => ("<", window.end),
            Bound::Gt => (">=", window.end),
            Bound::Gte => (">=", window.start),
        };
        Ok(Predicate {
            sql: format!("{day} {op} ?"),
            params: vec![SqlValue::Integer(boundary)],
        })
    }
}

/// 日期比较的列表达式：数值列视为 Unix 秒，文本列经 `unixepoch()` 转换
fn date_operand(target: &Target<'_>, comparator: Comparator) -> Result<String> {
    match target.column_type {
        ColumnType::Integer | ColumnType::Real => Ok(target.expr.clone()),
        ColumnType::Text => Ok(format!("unixepoch({})", target.expr)),
        ColumnType::Boolean | ColumnType::Json => Err(not_applicable(target, comparator)),
    }
}

fn substring(
    target: &Target<'_>,
    comparator: Comparator,
    value: &FilterValue,
    negate: bool,
) -> Result<Predicate> {
    let needle = match value {
        FilterValue::Text(s) => s.clone(),
        FilterValue::Integer(i) => i.to_string(),
        FilterValue::Real(f) => render_real(*f),
        other => return Err(wrong_value(target, comparator, other)),
    };
    let col = &target.expr;
    let inner = match target.column_type {
        ColumnType::Boolean => return Err(not_applicable(target, comparator)),
        ColumnType::Text => format!("{col} LIKE ? ESCAPE '\\'"),
        ColumnType::Integer | ColumnType::Real => format!("CAST({col} AS TEXT) LIKE ? ESCAPE '\\'"),
        ColumnType::Json => format!(
            "EXISTS (SELECT 1 FROM json_each({col}) WHERE json_each.value LIKE ? ESCAPE '\\')"
        ),
    };
    let sql = if negate {
        format!("({col} IS NULL OR NOT ({inner}))")
    } else {
        inner
    };
    Ok(Predicate {
        sql,
        params: vec![SqlValue::Text(format!("%{}%", escape_like(&needle)))],
    })
}

fn membership(
    target: &Target<'_>,
    comparator: Comparator,
    value: &FilterValue,
    negate: bool,
) -> Result<Predicate> {
    let items = list_operand(target, comparator, value)?;
    let col = &target.expr;
    let placeholders = vec!["?"; items.len()].join(", ");

    if target.column_type == ColumnType::Json {
        let params = items
            .iter()
            .map(|item| bind_element(target, comparator, item))
            .collect::<Result<Vec<_>>>()?;
        let exists = format!(
            "EXISTS (SELECT 1 FROM json_each({col}) WHERE json_each.value IN ({placeholders}))"
        );
        let sql = if negate { format!("NOT {exists}") } else { exists };
        return Ok(Predicate { sql, params });
    }

    let params = items
        .iter()
        .map(|item| bind_scalar(target, comparator, item))
        .collect::<Result<Vec<_>>>()?;
    let sql = if negate {
        format!("({col} IS NULL OR {col} NOT IN ({placeholders}))")
    } else {
        format!("{col} IN ({placeholders})")
    };
    Ok(Predicate { sql, params })
}

/// `has_all_of`：逐值包含的合取；`is_exactly`：再加上去重后元素个数相等
fn containment(
    target: &Target<'_>,
    comparator: Comparator,
    value: &FilterValue,
) -> Result<Predicate> {
    let items = list_operand(target, comparator, value)?;
    let json = target.column_type == ColumnType::Json;

    let mut distinct: Vec<SqlValue> = Vec::with_capacity(items.len());
    for item in items {
        let bound = if json {
            bind_element(target, comparator, item)?
        } else {
            bind_scalar(target, comparator, item)?
        };
        if !distinct.contains(&bound) {
            distinct.push(bound);
        }
    }

    let col = &target.expr;
    let mut clauses: Vec<String> = distinct
        .iter()
        .map(|_| {
            if json {
                format!("EXISTS (SELECT 1 FROM json_each({col}) WHERE json_each.value = ?)")
            } else {
                format!("{col} = ?")
            }
        })
        .collect();
    let mut params = distinct;

    if json && comparator == Comparator::IsExactly {
        clauses.push(format!(
            "(SELECT COUNT(DISTINCT json_each.value) FROM json_each({col})) = ?"
        ));
        params.push(SqlValue::Integer(params.len() as i64));
    }

    Ok(Predicate {
        sql: format!("({})", clauses.join(" AND ")),
        params,
    })
}

fn emptiness(target: &Target<'_>, negate: bool) -> Predicate {
    let col = &target.expr;
    let sql = match (target.column_type, negate) {
        (ColumnType::Text, false) => format!("({col} IS NULL OR {col} = '')"),
        (ColumnType::Text, true) => format!("({col} IS NOT NULL AND {col} <> '')"),
        (ColumnType::Json, false) => format!("({col} IS NULL OR {col} IN ('[]', '{{}}'))"),
        (ColumnType::Json, true) => format!("({col} IS NOT NULL AND {col} NOT IN ('[]', '{{}}'))"),
        (_, false) => format!("{col} IS NULL"),
        (_, true) => format!("{col} IS NOT NULL"),
    };
    Predicate {
        sql,
        params: Vec::new(),
    }
}

fn list_operand<'v>(
    target: &Target<'_>,
    comparator: Comparator,
    value: &'v FilterValue,
) -> Result<&'v [FilterValue]> {
    match value {
        FilterValue::List(items) if !items.is_empty() => Ok(items),
        FilterValue::List(_) => Err(CacheError::InvalidFilter(format!(
            "字段 {} 的 {comparator} 条件需要非空列表",
            target.field
        ))),
        other => Err(CacheError::InvalidFilter(format!(
            "字段 {} 的 {comparator} 条件需要列表，收到 {}",
            target.field,
            other.kind()
        ))),
    }
}

/// 按列类型绑定标量值
fn bind_scalar(
    target: &Target<'_>,
    comparator: Comparator,
    value: &FilterValue,
) -> Result<SqlValue> {
    Ok(match (target.column_type, value) {
        (ColumnType::Boolean, FilterValue::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        (ColumnType::Boolean, FilterValue::Integer(i)) if *i == 0 || *i == 1 => {
            SqlValue::Integer(*i)
        }
        (ColumnType::Boolean, FilterValue::Text(s)) if s == "true" || s == "false" => {
            SqlValue::Integer(i64::from(s == "true"))
        }
        (ColumnType::Boolean, other @ (FilterValue::Integer(_) | FilterValue::Real(_) | FilterValue::Text(_))) => {
            return Err(CacheError::InvalidFilter(format!(
                "布尔字段 {} 只能与布尔值比较，收到 {}",
                target.field,
                other.kind()
            )))
        }
        (ColumnType::Integer | ColumnType::Real, FilterValue::Bool(b)) => {
            SqlValue::Integer(i64::from(*b))
        }
        (ColumnType::Integer | ColumnType::Real, FilterValue::Integer(i)) => SqlValue::Integer(*i),
        (ColumnType::Integer | ColumnType::Real, FilterValue::Real(f)) => SqlValue::Real(*f),
        (ColumnType::Integer | ColumnType::Real, FilterValue::Text(s)) => {
            parse_number(s).unwrap_or_else(|| SqlValue::Text(s.clone()))
        }
        (ColumnType::Text | ColumnType::Json, FilterValue::Text(s)) => SqlValue::Text(s.clone()),
        (ColumnType::Text | ColumnType::Json, FilterValue::Integer(i)) => {
            SqlValue::Text(i.to_string())
        }
        (ColumnType::Text | ColumnType::Json, FilterValue::Real(f)) => {
            SqlValue::Text(render_real(*f))
        }
        (ColumnType::Text | ColumnType::Json, FilterValue::Bool(b)) => {
            SqlValue::Text(b.to_string())
        }
        (_, other) => return Err(wrong_value(target, comparator, other)),
    })
}

/// 绑定 `json_each.value` 的比较值（JSON 布尔在 SQLite 中表现为 0/1）
fn bind_element(
    target: &Target<'_>,
    comparator: Comparator,
    value: &FilterValue,
) -> Result<SqlValue> {
    Ok(match value {
        FilterValue::Text(s) => SqlValue::Text(s.clone()),
        FilterValue::Integer(i) => SqlValue::Integer(*i),
        FilterValue::Real(f) => SqlValue::Real(*f),
        FilterValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        other => return Err(wrong_value(target, comparator, other)),
    })
}

/// JSON 列的等值比较：与写入时相同的序列化形式
fn json_literal(
    target: &Target<'_>,
    comparator: Comparator,
    value: &FilterValue,
) -> Result<serde_json::Value> {
    use serde_json::Value;
    Ok(match value {
        FilterValue::Bool(b) => Value::Bool(*b),
        FilterValue::Integer(i) => Value::from(*i),
        FilterValue::Real(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| CacheError::InvalidFilter(format!("无法表示的数值: {f}")))?,
        FilterValue::Text(s) => Value::String(s.clone()),
        FilterValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| json_literal(target, comparator, item))
                .collect::<Result<Vec<_>>>()?,
        ),
        other => return Err(wrong_value(target, comparator, other)),
    })
}

fn parse_number(text: &str) -> Option<SqlValue> {
    let text = text.trim();
    text.parse::<i64>()
        .map(SqlValue::Integer)
        .or_else(|_| text.parse::<f64>().map(SqlValue::Real))
        .ok()
}

/// 与写入文本列时一致的实数渲染
fn render_real(f: f64) -> String {
    serde_json::Number::from_f64(f)
        .map(|n| n.to_string())
        .unwrap_or_else(|| f.to_string())
}

/// 转义 LIKE 通配符（转义符为反斜杠）
fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn not_applicable(target: &Target<'_>, comparator: Comparator) -> CacheError {
    CacheError::unsupported(
        comparator.as_str(),
        format!("不适用于 {} 类型字段 {}", target.column_type, target.field),
    )
}

fn wrong_value(target: &Target<'_>, comparator: Comparator, value: &FilterValue) -> CacheError {
    let hint = match value {
        FilterValue::Null => "（判断空值请使用 is_empty）",
        _ => "",
    };
    CacheError::InvalidFilter(format!(
        "字段 {} 的 {comparator} 条件不接受 {} 值{hint}",
        target.field,
        value.kind()
    ))
}
