//! 过滤表达式
//!
//! 过滤条件是一棵不可变的布尔树：叶子为 `(字段, 比较符, 值)`，内部节点为
//! AND / OR 组合。值是封闭的标签联合 [`FilterValue`]，翻译器对其穷举匹配。
//!
//! - `date`: 日期模式解析与时间窗口
//! - `translator`: 过滤树 → 参数化 SQL 谓词
//!
//! # JSON 形式
//!
//! ```json
//! {"and": [
//!     {"field": "status", "comparator": "is_any_of", "value": ["open", "pending"]},
//!     {"field": "due", "comparator": "is_before", "value": {"date": "7 days ago"}}
//! ]}
//! ```

pub mod date;
pub mod translator;

pub use date::{DateMode, DateWindow};
pub use translator::{translate, FilterTranslator};

use crate::data::{CacheError, Result};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// 逻辑运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    pub fn as_str(self) -> &'static str {
        match self {
            LogicalOp::And => "AND",
            LogicalOp::Or => "OR",
        }
    }
}

/// 比较符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparator {
    Is,
    IsNot,
    Contains,
    NotContains,
    IsAnyOf,
    IsNoneOf,
    HasAnyOf,
    HasAllOf,
    HasNoneOf,
    IsExactly,
    IsEmpty,
    IsNotEmpty,
    IsGreaterThan,
    IsLessThan,
    IsGreaterThanOrEqual,
    IsLessThanOrEqual,
    IsBefore,
    IsAfter,
    IsOnOrBefore,
    IsOnOrAfter,
}

impl Comparator {
    pub const ALL: [Comparator; 20] = [
        Comparator::Is,
        Comparator::IsNot,
        Comparator::Contains,
        Comparator::NotContains,
        Comparator::IsAnyOf,
        Comparator::IsNoneOf,
        Comparator::HasAnyOf,
        Comparator::HasAllOf,
        Comparator::HasNoneOf,
        Comparator::IsExactly,
        Comparator::IsEmpty,
        Comparator::IsNotEmpty,
        Comparator::IsGreaterThan,
        Comparator::IsLessThan,
        Comparator::IsGreaterThanOrEqual,
        Comparator::IsLessThanOrEqual,
        Comparator::IsBefore,
        Comparator::IsAfter,
        Comparator::IsOnOrBefore,
        Comparator::IsOnOrAfter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Comparator::Is => "is",
            Comparator::IsNot => "is_not",
            Comparator::Contains => "contains",
            Comparator::NotContains => "not_contains",
            Comparator::IsAnyOf => "is_any_of",
            Comparator::IsNoneOf => "is_none_of",
            Comparator::HasAnyOf => "has_any_of",
            Comparator::HasAllOf => "has_all_of",
            Comparator::HasNoneOf => "has_none_of",
            Comparator::IsExactly => "is_exactly",
            Comparator::IsEmpty => "is_empty",
            Comparator::IsNotEmpty => "is_not_empty",
            Comparator::IsGreaterThan => "is_greater_than",
            Comparator::IsLessThan => "is_less_than",
            Comparator::IsGreaterThanOrEqual => "is_greater_than_or_equal",
            Comparator::IsLessThanOrEqual => "is_less_than_or_equal",
            Comparator::IsBefore => "is_before",
            Comparator::IsAfter => "is_after",
            Comparator::IsOnOrBefore => "is_on_or_before",
            Comparator::IsOnOrAfter => "is_on_or_after",
        }
    }
}

impl FromStr for Comparator {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        let alias = match name.as_str() {
            "=" | "==" => Some(Comparator::Is),
            "!=" | "<>" => Some(Comparator::IsNot),
            ">" => Some(Comparator::IsGreaterThan),
            "<" => Some(Comparator::IsLessThan),
            ">=" => Some(Comparator::IsGreaterThanOrEqual),
            "<=" => Some(Comparator::IsLessThanOrEqual),
            _ => None,
        };
        alias
            .or_else(|| Comparator::ALL.into_iter().find(|c| c.as_str() == name))
            .ok_or_else(|| CacheError::unsupported(s, "无法识别的比较符"))
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 过滤值
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    List(Vec<FilterValue>),
    Date(DateMode),
}

impl FilterValue {
    /// 从 JSON 值构造；`{"date": "..."}` 解析为日期模式
    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(match value {
            Value::Null => FilterValue::Null,
            Value::Bool(b) => FilterValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FilterValue::Integer(i),
                None => FilterValue::Real(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => FilterValue::Text(s.clone()),
            Value::Array(items) => FilterValue::List(
                items
                    .iter()
                    .map(FilterValue::from_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Object(map) => match (map.get("date"), map.len()) {
                (Some(Value::String(phrase)), 1) => FilterValue::Date(phrase.parse()?),
                _ => {
                    return Err(CacheError::InvalidFilter(format!(
                        "不支持的对象值: {value}"
                    )))
                }
            },
        })
    }

    /// 值的类型名称（用于错误信息）
    pub fn kind(&self) -> &'static str {
        match self {
            FilterValue::Null => "null",
            FilterValue::Bool(_) => "boolean",
            FilterValue::Integer(_) => "integer",
            FilterValue::Real(_) => "real",
            FilterValue::Text(_) => "text",
            FilterValue::List(_) => "list",
            FilterValue::Date(_) => "date",
        }
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Integer(value)
    }
}

impl From<i32> for FilterValue {
    fn from(value: i32) -> Self {
        FilterValue::Integer(i64::from(value))
    }
}

impl From<f64> for FilterValue {
    fn from(value: f64) -> Self {
        FilterValue::Real(value)
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

impl From<DateMode> for FilterValue {
    fn from(value: DateMode) -> Self {
        FilterValue::Date(value)
    }
}

impl<T: Into<FilterValue>> From<Vec<T>> for FilterValue {
    fn from(values: Vec<T>) -> Self {
        FilterValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// 过滤表达式树
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpression {
    Condition {
        field: String,
        comparator: Comparator,
        value: FilterValue,
    },
    Group {
        op: LogicalOp,
        children: Vec<FilterExpression>,
    },
}

impl FilterExpression {
    pub fn condition(
        field: impl Into<String>,
        comparator: Comparator,
        value: impl Into<FilterValue>,
    ) -> Self {
        FilterExpression::Condition {
            field: field.into(),
            comparator,
            value: value.into(),
        }
    }

    pub fn and(children: Vec<FilterExpression>) -> Self {
        FilterExpression::Group {
            op: LogicalOp::And,
            children,
        }
    }

    pub fn or(children: Vec<FilterExpression>) -> Self {
        FilterExpression::Group {
            op: LogicalOp::Or,
            children,
        }
    }

    /// 从 JSON 解析过滤树
    pub fn from_json(value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| CacheError::InvalidFilter(format!("过滤节点必须是对象: {value}")))?;

        for (key, op) in [("and", LogicalOp::And), ("or", LogicalOp::Or)] {
            if let Some(children) = map.get(key) {
                if map.len() != 1 {
                    return Err(CacheError::InvalidFilter(format!(
                        "{key} 节点不能包含其他键"
                    )));
                }
                let children = children.as_array().ok_or_else(|| {
                    CacheError::InvalidFilter(format!("{key} 的子节点必须是数组"))
                })?;
                return Ok(FilterExpression::Group {
                    op,
                    children: children
                        .iter()
                        .map(FilterExpression::from_json)
                        .collect::<Result<Vec<_>>>()?,
                });
            }
        }

        let field = map
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| CacheError::InvalidFilter(format!("条件缺少 field: {value}")))?;
        let comparator = map
            .get("comparator")
            .and_then(Value::as_str)
            .ok_or_else(|| CacheError::InvalidFilter(format!("条件缺少 comparator: {value}")))?
            .parse()?;
        let value = map
            .get("value")
            .map(FilterValue::from_json)
            .transpose()?
            .unwrap_or(FilterValue::Null);

        Ok(FilterExpression::Condition {
            field: field.to_string(),
            comparator,
            value,
        })
    }

    /// 表达式引用的全部字段（按出现顺序去重）
    pub fn fields(&self) -> Vec<&str> {
        let mut fields = Vec::new();
        self.collect_fields(&mut fields);
        fields
    }

    fn collect_fields<'a>(&'a self, fields: &mut Vec<&'a str>) {
        match self {
            FilterExpression::Condition { field, .. } => {
                if !fields.contains(&field.as_str()) {
                    fields.push(field.as_str());
                }
            }
            FilterExpression::Group { children, .. } => {
                for child in children {
                    child.collect_fields(fields);
                }
            }
        }
    }
}
