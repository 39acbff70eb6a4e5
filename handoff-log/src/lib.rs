//! Logging for the handoff task queue.
//!
//! Log output is controlled entirely through environment variables so that
//! workers and producers can be tuned without a rebuild.
//!
//! # Usage
//!
//! ```rust
//! use handoff_log::{debug, error, info, warn};
//!
//! info!("worker {} started", "worker_1a2b3c4d");
//! debug!(target: "handoff::queue", "claimed entry {}", "1700000000000-0");
//! warn!("status write refused");
//! error!("transport unavailable");
//! ```
//!
//! # Environment Variables
//!
//! - `HANDOFF_DEBUG=1` - Enable debug logging
//! - `HANDOFF_LOG_LEVEL=trace|debug|info|warn|error|off` - Set log level
//!   (`LOG_LEVEL` is read when this one is unset)
//! - `HANDOFF_LOG_FORMAT=pretty|compact|json` - Set output format
//! - `HANDOFF_LOG_TIMESTAMPS=1|0` - Include timestamps

use once_cell::sync::Lazy;
use std::env;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

// ============================================================================
// Log Levels
// ============================================================================

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Trace level (most verbose)
    Trace = 0,
    /// Debug level
    Debug = 1,
    /// Info level
    Info = 2,
    /// Warning level
    Warn = 3,
    /// Error level (least verbose)
    Error = 4,
    /// Off (no logging)
    Off = 5,
}

/// Error returned when a level or format name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownName(pub String);

impl std::fmt::Display for UnknownName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown name: {:?}", self.0)
    }
}

impl std::error::Error for UnknownName {}

impl FromStr for Level {
    type Err = UnknownName;

    /// Case-insensitive; accepts `warning`, `critical` and `none` as aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" | "critical" => Ok(Level::Error),
            "off" | "none" => Ok(Level::Off),
            _ => Err(UnknownName(s.to_string())),
        }
    }
}

impl Level {
    /// Upper-case level name used in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Off => "OFF",
        }
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Off => "off",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Level::Trace,
            1 => Level::Debug,
            2 => Level::Info,
            3 => Level::Warn,
            4 => Level::Error,
            _ => Level::Off,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Log Format
// ============================================================================

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human readable, one field per column
    Pretty,
    /// Short single-line format
    Compact,
    /// One JSON object per line
    Json,
}

impl FromStr for Format {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Format::Pretty),
            "compact" => Ok(Format::Compact),
            "json" => Ok(Format::Json),
            _ => Err(UnknownName(s.to_string())),
        }
    }
}

// ============================================================================
// Global Configuration
// ============================================================================

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

static CONFIG: Lazy<LogConfig> = Lazy::new(|| {
    let config = LogConfig::from_env();
    DEBUG_ENABLED.store(config.debug, Ordering::SeqCst);
    LOG_LEVEL.store(config.level as u8, Ordering::SeqCst);
    config
});

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Whether debug mode is enabled
    pub debug: bool,
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether to include timestamps
    pub timestamps: bool,
    /// Whether to include the log target
    pub module_path: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            level: Level::Info,
            format: Format::Pretty,
            timestamps: true,
            module_path: true,
        }
    }
}

fn flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl LogConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let debug = lookup("HANDOFF_DEBUG").map(|v| flag(&v)).unwrap_or(false);

        let level = lookup("HANDOFF_LOG_LEVEL")
            .or_else(|| lookup("LOG_LEVEL"))
            .and_then(|s| s.parse().ok())
            .unwrap_or(if debug { Level::Debug } else { Level::Info });

        let format = lookup("HANDOFF_LOG_FORMAT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(Format::Pretty);

        let timestamps = lookup("HANDOFF_LOG_TIMESTAMPS")
            .map(|v| flag(&v))
            .unwrap_or(true);

        let module_path = lookup("HANDOFF_LOG_MODULE")
            .map(|v| flag(&v))
            .unwrap_or(true);

        Self {
            debug,
            level,
            format,
            timestamps,
            module_path,
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Initialize logging eagerly.
///
/// The configuration is otherwise loaded on the first log call. With the
/// `tracing` feature this also installs the global tracing subscriber; a
/// subscriber that is already installed is left in place.
pub fn init() {
    Lazy::force(&CONFIG);

    #[cfg(feature = "tracing")]
    {
        use tracing::subscriber::set_global_default;
        let _ = set_global_default(tracing_compat::subscriber());
    }
}

/// Check if debug logging is enabled.
#[inline]
pub fn is_debug_enabled() -> bool {
    Lazy::force(&CONFIG);
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Check if a log level is enabled.
#[inline]
pub fn is_level_enabled(level: Level) -> bool {
    Lazy::force(&CONFIG);
    level != Level::Off && level as u8 >= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Current minimum level.
pub fn current_level() -> Level {
    Lazy::force(&CONFIG);
    Level::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Change the minimum level at runtime.
pub fn set_level(level: Level) {
    Lazy::force(&CONFIG);
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Enable or disable debug mode at runtime.
pub fn set_debug(enabled: bool) {
    Lazy::force(&CONFIG);
    DEBUG_ENABLED.store(enabled, Ordering::SeqCst);
    if enabled && current_level() > Level::Debug {
        set_level(Level::Debug);
    }
}

/// The global configuration.
pub fn config() -> &'static LogConfig {
    &CONFIG
}

// ============================================================================
// Log Output
// ============================================================================

/// Write one log line to stderr. Used by the macros.
#[doc(hidden)]
pub fn log(level: Level, target: &str, message: &str) {
    if !is_level_enabled(level) {
        return;
    }
    if let Some(line) = render(level, target, message, config()) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
    }
}

/// Format one line according to `config.format`.
fn render(level: Level, target: &str, message: &str, config: &LogConfig) -> Option<String> {
    let target = (config.module_path && !target.is_empty()).then_some(target);

    match config.format {
        Format::Json => json_line(level, target, message, config.timestamps),
        Format::Pretty => {
            let mut line = String::new();
            if config.timestamps {
                line.push_str(&chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f ").to_string());
            }
            line.push_str(&format!("{:5} ", level.as_str()));
            if let Some(target) = target {
                line.push_str(&format!("[{}] ", target));
            }
            line.push_str(message);
            Some(line)
        }
        Format::Compact => {
            let mut line = String::new();
            if config.timestamps {
                line.push_str(&chrono::Local::now().format("%H:%M:%S ").to_string());
            }
            // Single letter: T D I W E
            line.push_str(&level.as_str()[..1]);
            line.push(' ');
            if let Some(target) = target {
                line.push_str(target);
                line.push_str(": ");
            }
            line.push_str(message);
            Some(line)
        }
    }
}

#[cfg(feature = "json")]
fn json_line(level: Level, target: Option<&str>, message: &str, timestamps: bool) -> Option<String> {
    let mut line = serde_json::Map::new();
    if timestamps {
        line.insert("timestamp".into(), chrono::Utc::now().to_rfc3339().into());
    }
    line.insert("level".into(), level.as_str().into());
    if let Some(target) = target {
        line.insert("target".into(), target.into());
    }
    line.insert("message".into(), message.into());
    serde_json::to_string(&line).ok()
}

#[cfg(not(feature = "json"))]
fn json_line(level: Level, target: Option<&str>, message: &str, timestamps: bool) -> Option<String> {
    let mut fields = Vec::with_capacity(4);
    if timestamps {
        fields.push(format!(r#""timestamp":"{}""#, chrono::Utc::now().to_rfc3339()));
    }
    fields.push(format!(r#""level":"{}""#, level.as_str()));
    if let Some(target) = target {
        fields.push(format!(r#""target":"{}""#, escape_json(target)));
    }
    fields.push(format!(r#""message":"{}""#, escape_json(message)));
    Some(format!("{{{}}}", fields.join(",")))
}

#[cfg(not(feature = "json"))]
fn escape_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

// ============================================================================
// Macros
// ============================================================================

#[doc(hidden)]
#[macro_export]
macro_rules! __log {
    ($level:expr, target: $target:expr, $($arg:tt)+) => {{
        let level = $level;
        if $crate::is_level_enabled(level) {
            $crate::log(level, $target, &format!($($arg)+));
        }
    }};
    ($level:expr, $($arg:tt)+) => {
        $crate::__log!($level, target: module_path!(), $($arg)+)
    };
}

/// Log at trace level.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => { $crate::__log!($crate::Level::Trace, $($arg)+) };
}

/// Log at debug level.
///
/// Enabled by `HANDOFF_DEBUG=1` or `HANDOFF_LOG_LEVEL=debug`.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => { $crate::__log!($crate::Level::Debug, $($arg)+) };
}

/// Log at info level.
#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => { $crate::__log!($crate::Level::Info, $($arg)+) };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => { $crate::__log!($crate::Level::Warn, $($arg)+) };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => { $crate::__log!($crate::Level::Error, $($arg)+) };
}

// ============================================================================
// Tracing Integration
// ============================================================================

#[cfg(feature = "tracing")]
pub mod tracing_compat {
    //! Subscriber for crates that emit `tracing` events.

    use super::*;

    /// Registry with an `EnvFilter` seeded from the handoff log level.
    ///
    /// `RUST_LOG` takes precedence when set.
    pub fn subscriber() -> impl tracing::Subscriber + Send + Sync {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::{EnvFilter, fmt};

        let config = config();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.as_filter()));

        tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(config.module_path),
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
