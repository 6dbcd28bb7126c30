//! Logging bootstrap shared by the bridge services
//!
//! Console output always uses the bracketed level format; an optional daily
//! rolling file layer is written through a non-blocking appender. The level
//! filter sits behind a reload layer so it can be changed at runtime.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

pub type LogResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809123Z [INFO] Conn0 127.0.0.1:102 connected`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Appender guards must outlive the subscriber or buffered lines are lost
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

type EnvFilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_FILTER_HANDLE: OnceLock<EnvFilterReloadHandle> = OnceLock::new();
static CURRENT_LOG_LEVEL: OnceLock<Mutex<String>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, also the tracing target of the service crate
    pub service_name: String,
    /// Level applied to the service target when RUST_LOG is unset
    pub level: String,
    /// Directory for the rolling log file; `None` disables file output
    pub log_dir: Option<PathBuf>,
    /// Write the file layer as JSON lines
    pub enable_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            level: "debug".to_string(),
            log_dir: None,
            enable_json: false,
        }
    }
}

/// Filter directive used when RUST_LOG is not set.
fn default_directive(service_name: &str, level: &str) -> String {
    format!("info,{}={}", service_name, level)
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> LogResult<()> {
    let directive = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| default_directive(&config.service_name, &config.level));
    let env_filter = EnvFilter::try_new(&directive)?;

    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);

    let console_layer = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
            match guards.lock() {
                Ok(mut guards) => guards.push(guard),
                Err(poisoned) => poisoned.into_inner().push(guard),
            }

            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            Some(layer)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    let _ = LOG_FILTER_HANDLE.set(reload_handle);
    let _ = CURRENT_LOG_LEVEL.set(Mutex::new(directive));

    tracing::info!(
        "Logging: {} @ {}",
        config.service_name,
        config
            .log_dir
            .as_ref()
            .map_or_else(|| "console".to_string(), |d| d.display().to_string())
    );

    Ok(())
}

/// Replace the active filter directive (e.g. `"debug"` or `"info,tase2srv=trace"`).
pub fn set_log_level(directive: &str) -> LogResult<()> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or("logging not initialized (filter handle missing)")?;
    let filter = EnvFilter::try_new(directive)?;
    handle.reload(filter)?;

    if let Some(current) = CURRENT_LOG_LEVEL.get() {
        match current.lock() {
            Ok(mut slot) => *slot = directive.to_string(),
            Err(poisoned) => *poisoned.into_inner() = directive.to_string(),
        }
    }
    tracing::info!("Log level changed to {}", directive);
    Ok(())
}

/// Current filter directive, if logging was initialized.
pub fn current_log_level() -> Option<String> {
    CURRENT_LOG_LEVEL
        .get()
        .and_then(|level| level.lock().ok().map(|l| l.clone()))
}
