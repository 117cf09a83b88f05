//! Leveled stderr logging for segnet.
//!
//! Each line is written under the stderr lock and tagged with the level and
//! the last segment of the emitting module path:
//!
//! ```text
//! [WARN]  async_socket: send failed on fd 7: errno 32
//! ```
//!
//! # Environment Variables
//!
//! - `SEGNET_LOG_LEVEL=<level>` - off|error|warn|info|debug|trace or 0..5 (default: warn)
//! - `SEGNET_LOG_FLUSH=1` - flush stderr after every line
//!
//! # Usage
//!
//! ```ignore
//! use segnet_core::{ninfo, ndebug};
//!
//! ninfo!("listening on {}", addr);
//! ndebug!("fd {} ready: {:?}", fd, events);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Once;

use crate::env::{env_get_bool, env_get_str};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit; `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static FLUSH: AtomicBool = AtomicBool::new(false);
static INIT: Once = Once::new();

/// Read `SEGNET_LOG_LEVEL` and `SEGNET_LOG_FLUSH`.
///
/// Runs once; later calls are no-ops. Called lazily by the first log line.
pub fn init() {
    INIT.call_once(|| {
        if let Some(level) = LogLevel::parse(&env_get_str("SEGNET_LOG_LEVEL", "")) {
            LEVEL.store(level as u8, Ordering::Relaxed);
        }
        FLUSH.store(env_get_bool("SEGNET_LOG_FLUSH", false), Ordering::Relaxed);
    });
}

#[inline]
pub fn log_level() -> LogLevel {
    init();
    LogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

/// Override the level; wins over the environment.
pub fn set_log_level(level: LogLevel) {
    init();
    LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    init();
    FLUSH.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

/// Last `::` segment of a module path.
#[doc(hidden)]
pub fn short_module(path: &str) -> &str {
    path.rsplit("::").next().unwrap_or(path)
}

#[doc(hidden)]
pub fn _log_impl(level: LogLevel, module: &str, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = write!(out, "{} {}: ", level.tag(), short_module(module));
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[macro_export]
macro_rules! nerror {
    ($($arg:tt)*) => {{
        $crate::logging::_log_impl(
            $crate::logging::LogLevel::Error,
            module_path!(),
            format_args!($($arg)*),
        );
    }};
}

#[macro_export]
macro_rules! nwarn {
    ($($arg:tt)*) => {{
        $crate::logging::_log_impl(
            $crate::logging::LogLevel::Warn,
            module_path!(),
            format_args!($($arg)*),
        );
    }};
}

#[macro_export]
macro_rules! ninfo {
    ($($arg:tt)*) => {{
        $crate::logging::_log_impl(
            $crate::logging::LogLevel::Info,
            module_path!(),
            format_args!($($arg)*),
        );
    }};
}

#[macro_export]
macro_rules! ndebug {
    ($($arg:tt)*) => {{
        $crate::logging::_log_impl(
            $crate::logging::LogLevel::Debug,
            module_path!(),
            format_args!($($arg)*),
        );
    }};
}

/// Per-event chatter; off unless `SEGNET_LOG_LEVEL=trace`.
#[macro_export]
macro_rules! ntrace {
    ($($arg:tt)*) => {{
        $crate::logging::_log_impl(
            $crate::logging::LogLevel::Trace,
            module_path!(),
            format_args!($($arg)*),
        );
    }};
}
