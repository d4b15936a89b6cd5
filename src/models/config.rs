// 缓存与日志配置，可从 TOML 文件加载并由环境变量覆盖
use crate::data::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// 数据库路径覆盖
pub const ENV_DB_PATH: &str = "TABLE_CACHE_DB_PATH";
/// 默认 TTL（秒）覆盖
pub const ENV_DEFAULT_TTL: &str = "TABLE_CACHE_DEFAULT_TTL";
/// 拉取超时（秒）覆盖
pub const ENV_FETCH_TIMEOUT: &str = "TABLE_CACHE_FETCH_TIMEOUT";
/// 日志级别覆盖
pub const ENV_LOG_LEVEL: &str = "TABLE_CACHE_LOG_LEVEL";

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// 解析字符串为日志级别
    pub fn parse(level: &str) -> Option<LogLevel> {
        match level.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// 日志输出目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

/// 日志配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub output: LogOutput,
    /// 日志目录（文件输出时使用）
    #[serde(default)]
    pub file_path: Option<String>,
}

/// 缓存配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 数据库文件路径，缺省为数据目录下的 `table-cache/cache.db`
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    /// 外部拉取超时（秒）
    #[serde(default = "default_fetch_timeout_seconds")]
    pub fetch_timeout_seconds: u64,
    /// 资源级 TTL 覆盖，打开缓存时写入策略表
    #[serde(default)]
    pub ttl_overrides: HashMap<String, u64>,
}

fn default_ttl_seconds() -> u64 {
    crate::data::cache::DEFAULT_TTL_SECONDS
}

fn default_limit() -> usize {
    crate::data::query::DEFAULT_LIMIT
}

fn default_max_limit() -> usize {
    crate::data::query::MAX_LIMIT
}

fn default_fetch_timeout_seconds() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            default_ttl_seconds: default_ttl_seconds(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            fetch_timeout_seconds: default_fetch_timeout_seconds(),
            ttl_overrides: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// 内存数据库配置（测试与临时嵌入）
    pub fn in_memory() -> Self {
        Self {
            db_path: Some(PathBuf::from(":memory:")),
            ..Self::default()
        }
    }

    /// 默认数据库路径
    pub fn default_db_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("table-cache")
            .join("cache.db")
    }

    /// 有效的数据库路径
    pub fn effective_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(Self::default_db_path)
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path.as_deref() == Some(Path::new(":memory:"))
    }
}

/// 顶层配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// 从 TOML 文件加载并应用环境变量覆盖
    ///
    /// 文件不存在时使用默认配置。
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| CacheError::io(path, e))?;
            Self::from_toml_str(&content)?
        } else {
            tracing::debug!(path = ?path, "配置文件不存在，使用默认配置");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// 解析 TOML 文本（不应用环境变量）
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// 应用环境变量覆盖，无法解析的值记录警告后忽略
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(ENV_DB_PATH) {
            if !path.trim().is_empty() {
                self.cache.db_path = Some(PathBuf::from(path));
            }
        }
        if let Some(ttl) = parse_env::<u64>(ENV_DEFAULT_TTL) {
            self.cache.default_ttl_seconds = ttl;
        }
        if let Some(timeout) = parse_env::<u64>(ENV_FETCH_TIMEOUT) {
            self.cache.fetch_timeout_seconds = timeout;
        }
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            match LogLevel::parse(&level) {
                Some(level) => self.log.level = level,
                None => tracing::warn!(value = %level, "无效的日志级别环境变量，已忽略"),
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "无法解析的环境变量，已忽略");
            None
        }
    }
}
