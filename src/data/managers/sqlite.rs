//! SQLite 数据库管理器
//!
//! 缓存的所有持久状态（每个资源一张物理表 + 元数据表 + 策略表）都存放在同一个
//! 嵌入式数据库文件中。本管理器只负责连接与事务，表结构由各组件自行维护。
//!
//! - 单连接 + `Arc<Mutex>`，可在组件之间克隆共享
//! - 事务支持（失败自动回滚）
//! - 文件数据库启用 WAL 与 busy timeout
//!
//! # 使用示例
//!
//! ```rust
//! use std::path::Path;
//! use crate::data::managers::SqliteManager;
//!
//! let manager = SqliteManager::open(Path::new("cache.db"))?;
//!
//! manager.transaction(|tx| {
//!     tx.execute("DELETE FROM cache_metadata WHERE resource_id = ?1", ["orders"])?;
//!     Ok(())
//! })?;
//! ```

use crate::data::{CacheError, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// 内存数据库路径标记
const MEMORY_PATH: &str = ":memory:";

/// 写锁等待上限
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite 管理器
///
/// 克隆开销很小（共享同一连接），供 `TableStore` 与 `TtlMetadata` 共用。
#[derive(Clone, Debug)]
pub struct SqliteManager {
    /// 数据库连接
    conn: Arc<Mutex<Connection>>,
    /// 数据库路径（用于错误报告）
    db_path: PathBuf,
}

impl SqliteManager {
    /// 打开（或创建）数据库文件
    ///
    /// # 参数
    ///
    /// - `path`: 数据库文件路径，父目录不存在时自动创建
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Self::open_connection(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        })
    }

    /// 打开内存数据库（测试与临时嵌入场景）
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: PathBuf::from(MEMORY_PATH),
        })
    }

    /// 打开数据库连接
    fn open_connection(path: &Path) -> Result<Connection> {
        // 创建父目录
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CacheError::io(parent.to_path_buf(), e))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL 下读者看到的始终是已提交的快照
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = ?path, journal_mode = %mode, "缓存数据库已打开");
        Ok(conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CacheError::Concurrency(e.to_string()))
    }

    /// 在持有连接的情况下执行只读或单语句操作
    pub fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// 执行事务
    ///
    /// 闭包返回 `Err` 时事务在 drop 时回滚，数据库保持调用前的状态。
    ///
    /// # 示例
    ///
    /// ```rust
    /// manager.transaction(|tx| {
    ///     tx.execute("DROP TABLE IF EXISTS rc_orders", [])?;
    ///     tx.execute("DELETE FROM cache_tables WHERE resource_id = ?1", ["orders"])?;
    ///     Ok(())
    /// })?;
    /// ```
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let mut conn = self.lock()?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;

        Ok(result)
    }

    /// 检查表是否存在
    pub fn table_exists(&self, table_name: &str) -> Result<bool> {
        self.with_connection(|conn| table_exists_on(conn, table_name))
    }

    /// 执行原始 SQL（用于 DDL 等操作）
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
    }

    /// 获取数据库路径
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

/// 在给定连接（或事务）上检查表是否存在
pub(crate) fn table_exists_on(conn: &Connection, table_name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [table_name],
        |row| row.get(0),
    )?;

    Ok(count > 0)
}

/// 将标识符包裹为 SQL 双引号标识符
///
/// 标识符无法作为绑定参数，内部的双引号按 SQL 规则翻倍转义。
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
