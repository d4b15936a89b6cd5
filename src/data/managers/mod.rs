//! 存储管理器
//!
//! - `sqlite`: 嵌入式 SQLite 连接与事务管理

pub mod sqlite;

pub use sqlite::{quote_ident, SqliteManager};
