//! 列模式与模式推断
//!
//! 远程记录是异构的键值映射，每个刷新周期从样本记录推断一次列模式：
//! - 列集合是所有样本记录键的并集，缺失字段存为 NULL
//! - 类型按 boolean → integer → real → text 逐级提升
//! - 对象/数组值强制整列为 json（序列化存储，不展开）
//!
//! 物理列名按位置生成（`c0`、`c1`…），逻辑列名只保存在目录中，
//! 因此任意字段名（含空格、大小写变体、引号）都不会进入 DDL。

use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// 远程数据源返回的一条记录
pub type Record = serde_json::Map<String, Value>;

/// 推断出的列类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Integer,
    Real,
    Text,
    Json,
}

impl ColumnType {
    /// 提升顺序中的位置
    fn rank(self) -> u8 {
        match self {
            ColumnType::Boolean => 0,
            ColumnType::Integer => 1,
            ColumnType::Real => 2,
            ColumnType::Text => 3,
            ColumnType::Json => 4,
        }
    }

    /// 能同时容纳两种类型的最窄类型
    pub fn join(self, other: ColumnType) -> ColumnType {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }

    /// 单个 JSON 值的类型，null 返回 `None`
    pub fn of_value(value: &Value) -> Option<ColumnType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Number(n) if n.is_i64() => Some(ColumnType::Integer),
            Value::Number(_) => Some(ColumnType::Real),
            Value::String(_) => Some(ColumnType::Text),
            Value::Array(_) | Value::Object(_) => Some(ColumnType::Json),
        }
    }

    /// 物理 DDL 类型
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Boolean | ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text | ColumnType::Json => "TEXT",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Text => "text",
            ColumnType::Json => "json",
        }
    }

    /// 是否为数值列
    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Real)
    }

    /// 将记录中的值编码为该列的存储值
    pub fn encode(self, value: &Value) -> SqlValue {
        match (self, value) {
            (_, Value::Null) => SqlValue::Null,
            (ColumnType::Json, v) => SqlValue::Text(v.to_string()),
            (ColumnType::Boolean | ColumnType::Integer, Value::Bool(b)) => {
                SqlValue::Integer(i64::from(*b))
            }
            (ColumnType::Integer, Value::Number(n)) if n.is_i64() => {
                SqlValue::Integer(n.as_i64().unwrap_or_default())
            }
            (ColumnType::Real, Value::Bool(b)) => SqlValue::Real(if *b { 1.0 } else { 0.0 }),
            (ColumnType::Integer | ColumnType::Real, Value::Number(n)) => match n.as_f64() {
                Some(f) => SqlValue::Real(f),
                None => SqlValue::Text(n.to_string()),
            },
            (_, Value::String(s)) => SqlValue::Text(s.clone()),
            (_, Value::Bool(b)) => SqlValue::Text(b.to_string()),
            (_, Value::Number(n)) => SqlValue::Text(n.to_string()),
            (_, v) => SqlValue::Text(v.to_string()),
        }
    }

    /// 将存储值解码回 JSON 值
    pub fn decode(self, value: ValueRef<'_>) -> Value {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) if self == ColumnType::Boolean => Value::Bool(i != 0),
            ValueRef::Integer(i) => Value::Number(i.into()),
            ValueRef::Real(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueRef::Text(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                if self == ColumnType::Json {
                    serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.into_owned()))
                } else {
                    Value::String(text.into_owned())
                }
            }
            ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一列的模式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// 逻辑字段名（远程记录中的键）
    pub name: String,
    /// 推断类型
    pub column_type: ColumnType,
    /// 是否允许为空
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable,
        }
    }
}

/// 第 `position` 列的物理列名
pub fn storage_column(position: usize) -> String {
    format!("c{position}")
}

/// 数据源提供的可选模式提示
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaHint {
    pub fields: Vec<HintedField>,
}

/// 模式提示中的单个字段声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintedField {
    pub name: String,
    pub column_type: ColumnType,
}

/// 模式推断器
pub struct SchemaInferencer;

impl SchemaInferencer {
    /// 从记录样本推断列模式
    ///
    /// 空输入返回空模式（资源合法地没有任何行）。
    pub fn infer(records: &[Record]) -> Vec<Column> {
        Self::infer_with_hint(records, None)
    }

    /// 结合数据源的模式提示推断列模式
    ///
    /// 提示中声明但样本里没有出现的字段作为可空列加入；
    /// 两边都有的字段取能容纳双方的类型。
    pub fn infer_with_hint(records: &[Record], hint: Option<&SchemaHint>) -> Vec<Column> {
        // (名称, 已观察到的类型, 出现次数, 是否见过 null)
        let mut order: Vec<String> = Vec::new();
        let mut observed: HashMap<String, (Option<ColumnType>, usize, bool)> = HashMap::new();

        for record in records {
            for (key, value) in record {
                let entry = observed.entry(key.clone()).or_insert_with(|| {
                    order.push(key.clone());
                    (None, 0, false)
                });
                entry.1 += 1;
                match ColumnType::of_value(value) {
                    Some(ty) => entry.0 = Some(entry.0.map_or(ty, |cur| cur.join(ty))),
                    None => entry.2 = true,
                }
            }
        }

        let mut columns: Vec<Column> = order
            .into_iter()
            .map(|name| {
                let (ty, seen, saw_null) = observed[&name];
                Column {
                    // 只有 null 的字段按 text 处理
                    column_type: ty.unwrap_or(ColumnType::Text),
                    nullable: saw_null || seen < records.len(),
                    name,
                }
            })
            .collect();

        if let Some(hint) = hint {
            for field in &hint.fields {
                match columns.iter_mut().find(|c| c.name == field.name) {
                    Some(column) => {
                        let observed_type = observed.get(&field.name).and_then(|o| o.0);
                        column.column_type = match observed_type {
                            Some(ty) => ty.join(field.column_type),
                            None => field.column_type,
                        };
                    }
                    None => columns.push(Column::new(&field.name, field.column_type, true)),
                }
            }
        }

        tracing::trace!(columns = columns.len(), records = records.len(), "模式推断完成");
        columns
    }
}
