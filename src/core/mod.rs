//! 核心基础设施
//!
//! - `logger`: 日志系统初始化与级别热更新

pub mod logger;

pub use logger::{init_logger, update_log_level};
