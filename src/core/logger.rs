//! 日志初始化
//!
//! 可重载的级别过滤层 + 按配置组合的输出层（控制台 / 按天滚动的文件，文本或 JSON）。
//! 级别可以通过 [`update_log_level`] 热更新；格式与输出目标只在初始化时生效。

use crate::models::config::{LogConfig, LogFormat, LogLevel, LogOutput};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload::{self, Handle},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "table-cache";

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// 级别过滤层的 reload handle
static LOG_LEVEL_HANDLE: OnceLock<Handle<EnvFilter, Registry>> = OnceLock::new();

/// 文件写入线程的 guard，drop 后缓冲的日志不再落盘
static FILE_GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

/// 初始化日志系统
///
/// `RUST_LOG` 存在时优先使用，否则按配置级别过滤本 crate，第三方库只输出 WARN 以上。
///
/// # 示例
/// ```no_run
/// use table_cache::core::init_logger;
/// use table_cache::models::config::{LogConfig, LogOutput};
///
/// let config = LogConfig {
///     output: LogOutput::Both,
///     ..LogConfig::default()
/// };
/// init_logger(&config)?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn init_logger(config: &LogConfig) -> anyhow::Result<()> {
    let (filter_layer, reload_handle) = reload::Layer::new(create_env_filter(config.level));
    if LOG_LEVEL_HANDLE.set(reload_handle).is_err() {
        anyhow::bail!("日志系统已初始化，不能重复初始化");
    }

    let layers = output_layers(config)?;
    Registry::default()
        .with(filter_layer)
        .with(layers)
        .try_init()?;

    tracing::info!(
        level = config.level.as_str(),
        format = ?config.format,
        output = ?config.output,
        file_path = ?config.file_path,
        "日志系统初始化完成"
    );
    Ok(())
}

/// 热更新日志级别
pub fn update_log_level(new_level: LogLevel) -> anyhow::Result<()> {
    let handle = LOG_LEVEL_HANDLE
        .get()
        .ok_or_else(|| anyhow::anyhow!("日志系统未初始化"))?;

    handle
        .reload(create_env_filter(new_level))
        .map_err(|e| anyhow::anyhow!("重载日志级别失败: {e}"))?;

    tracing::info!(new_level = new_level.as_str(), "日志级别已更新");
    Ok(())
}

fn create_env_filter(level: LogLevel) -> EnvFilter {
    // RUST_LOG=table_cache=trace,rusqlite=debug 之类的自定义指令优先
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directives(level))
}

/// 本 crate 使用配置级别，rusqlite 只输出 WARN 以上
fn default_directives(level: LogLevel) -> EnvFilter {
    EnvFilter::new(format!("table_cache={},rusqlite=warn", level.as_str()))
}

fn output_layers<S>(config: &LogConfig) -> anyhow::Result<Vec<BoxedLayer<S>>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let mut layers = Vec::with_capacity(2);
    if matches!(config.output, LogOutput::Console | LogOutput::Both) {
        layers.push(console_layer(config.format));
    }
    if matches!(config.output, LogOutput::File | LogOutput::Both) {
        let dir = log_dir(config.file_path.as_deref())?;
        layers.push(file_layer(config.format, &dir));
    }
    Ok(layers)
}

fn console_layer<S>(format: LogFormat) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(cfg!(debug_assertions));
    match format {
        LogFormat::Text => layer
            .with_ansi(true)
            .with_span_events(if cfg!(debug_assertions) {
                FmtSpan::CLOSE
            } else {
                FmtSpan::NONE
            })
            .boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

fn file_layer<S>(format: LogFormat, dir: &Path) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let (writer, guard) = non_blocking(rolling::daily(dir, LOG_FILE_PREFIX));
    FILE_GUARDS
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(guard);

    let layer = fmt::layer().with_writer(writer).with_ansi(false);
    match format {
        LogFormat::Text => layer.with_target(cfg!(debug_assertions)).boxed(),
        LogFormat::Json => layer.json().with_target(true).with_thread_ids(true).boxed(),
    }
}

/// 日志目录：配置值，缺省为数据目录下的 `table-cache/logs`
fn log_dir(file_path: Option<&str>) -> anyhow::Result<PathBuf> {
    let dir = match file_path {
        Some(path) => PathBuf::from(path),
        None => dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("无法获取数据目录"))?
            .join("table-cache")
            .join("logs"),
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_directives_include_level() {
        let rendered = default_directives(LogLevel::Debug).to_string();
        assert!(rendered.contains("table_cache=debug"));
        assert!(rendered.contains("rusqlite=warn"));
    }

    #[test]
    fn test_log_dir_is_created() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("logs").join("cache");
        let dir = log_dir(Some(&nested.to_string_lossy())).unwrap();
        assert_eq!(dir, nested);
        assert!(nested.is_dir());
    }

    #[test]
    fn test_output_layers_follow_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = LogConfig {
            file_path: Some(temp_dir.path().to_string_lossy().to_string()),
            ..LogConfig::default()
        };
        assert_eq!(output_layers::<Registry>(&config).unwrap().len(), 1);

        config.output = LogOutput::Both;
        config.format = LogFormat::Json;
        assert_eq!(output_layers::<Registry>(&config).unwrap().len(), 2);
    }

    #[test]
    fn test_update_before_init_fails() {
        if LOG_LEVEL_HANDLE.get().is_none() {
            assert!(update_log_level(LogLevel::Warn).is_err());
        }
    }
}
