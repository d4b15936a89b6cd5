// lib.rs - 表格缓存库入口

pub mod core;
pub mod data;
pub mod models;
pub mod utils;

pub use models::*;

pub use data::{
    CacheCoordinator, CacheError, CacheState, Comparator, DataSource, FilterExpression,
    FilterValue, GetRequest, GetResult, QueryBuilder, Record, ResourceStatus, SchemaHint,
    SortDirection,
};

pub use core::{init_logger, update_log_level};
pub use utils::{Clock, SystemClock};
