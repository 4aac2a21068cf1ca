//! Leveled diagnostic logging for the tau utility crates.
//!
//! A single process-wide [`Logger`] filters records by [`Level`]. Records
//! carry the module path of the call site and are written to stderr, so they
//! never interleave with a program's regular output.
//!
//! The level starts at [`Level::Warn`]; memory-management code logs page
//! commits and arena growth at `trace`, which should stay silent unless asked
//! for.
//!
//! # Example
//!
//! ```
//! use tau_log::{Level, debug, warn};
//!
//! tau_log::set_level(Level::Debug);
//!
//! let pages = 4;
//! debug!("committed {} pages", pages);
//! warn!("arena is nearly full");
//! ```
//!
//! # Environment
//!
//! [`init_from_env`] reads the `TAU_LOG` variable (`error`, `warn`, `info`,
//! `debug`, `trace`, or `off`) once at startup.

use std::fmt::{self, Arguments};
use std::io::Write;
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

/// Environment variable consulted by [`init_from_env`].
pub const ENV_VAR: &str = "TAU_LOG";

/// Stored level value meaning "log nothing".
const OFF: u8 = u8::MAX;

/// Severity of a log record.
///
/// Lower discriminants are more severe; a logger set to `Info` emits
/// `Error`, `Warn` and `Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Failures the caller cannot recover from.
    Error = 0,
    /// Suspicious but survivable conditions.
    Warn = 1,
    /// High-level progress.
    Info = 2,
    /// Diagnostic detail.
    Debug = 3,
    /// Per-operation detail (page commits, rotations).
    Trace = 4,
}

impl Level {
    /// All levels, most severe first.
    pub const ALL: [Level; 5] = [
        Level::Error,
        Level::Warn,
        Level::Info,
        Level::Debug,
        Level::Trace,
    ];

    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Upper-case name used in rendered records.
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Level::Error),
            1 => Some(Level::Warn),
            2 => Some(Level::Info),
            3 => Some(Level::Debug),
            4 => Some(Level::Trace),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Error returned when a string does not name a [`Level`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError {
    input: String,
}

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level: {:?}", self.input)
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for Level {
    type Err = ParseLevelError;

    /// Case-insensitive parse.
    ///
    /// ```
    /// use tau_log::Level;
    ///
    /// assert_eq!("trace".parse::<Level>(), Ok(Level::Trace));
    /// assert!("loud".parse::<Level>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseLevelError {
                input: s.to_owned(),
            })
    }
}

/// Process-wide log filter.
///
/// Obtain it with [`logger`]. The threshold is a single atomic byte so
/// checking it on a hot path costs one relaxed load.
pub struct Logger {
    threshold: AtomicU8,
}

impl Logger {
    const fn new(level: Level) -> Self {
        Logger {
            threshold: AtomicU8::new(level as u8),
        }
    }

    /// Sets the least severe level that is still emitted.
    pub fn set_level(&self, level: Level) {
        self.threshold.store(level as u8, Ordering::Relaxed);
    }

    /// Silences every record, including errors.
    pub fn disable(&self) {
        self.threshold.store(OFF, Ordering::Relaxed);
    }

    /// Current threshold, or `None` when disabled.
    pub fn level(&self) -> Option<Level> {
        Level::from_u8(self.threshold.load(Ordering::Relaxed))
    }

    /// Returns true when a record at `level` would be written.
    #[inline]
    pub fn enabled(&self, level: Level) -> bool {
        let threshold = self.threshold.load(Ordering::Relaxed);
        threshold != OFF && level as u8 <= threshold
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the process-wide logger, creating it at [`Level::Warn`].
pub fn logger() -> &'static Logger {
    LOGGER.get_or_init(|| Logger::new(Level::Warn))
}

/// Sets the global threshold.
pub fn set_level(level: Level) {
    logger().set_level(level);
}

/// Parses `s` and sets the global threshold. `"off"` disables logging.
///
/// ```
/// tau_log::set_level_from_str("debug").unwrap();
/// assert_eq!(tau_log::logger().level(), Some(tau_log::Level::Debug));
/// ```
pub fn set_level_from_str(s: &str) -> Result<(), ParseLevelError> {
    if s.trim().eq_ignore_ascii_case("off") {
        logger().disable();
        return Ok(());
    }
    set_level(s.parse()?);
    Ok(())
}

/// Applies the `TAU_LOG` environment variable, if set.
///
/// Returns the parse error for an unrecognized value and leaves the level
/// unchanged in that case.
pub fn init_from_env() -> Result<(), ParseLevelError> {
    match std::env::var(ENV_VAR) {
        Ok(value) => set_level_from_str(&value),
        Err(_) => Ok(()),
    }
}

/// Writes one record. Called by the macros after the level check.
#[doc(hidden)]
pub fn __write_record(level: Level, target: &str, args: Arguments<'_>) {
    const RESET: &str = "\x1b[0m";

    let color = level.color_code();
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    // A closed stderr is not worth failing the caller over.
    let _ = writeln!(out, "{color}[{level}]{RESET} {target}: {args}");
}

/// Logs at an explicit level.
///
/// ```
/// use tau_log::{log, Level};
///
/// log!(level: Level::Info, "reserved {} pages", 16);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {{
        let level = $level;
        if $crate::logger().enabled(level) {
            $crate::__write_record(level, module_path!(), format_args!($($arg)*));
        }
    }};
}

/// Returns true when a record at the given level would be written.
///
/// Use it to skip building expensive diagnostics.
#[macro_export]
macro_rules! log_enabled {
    ($level:expr) => {
        $crate::logger().enabled($level)
    };
}

/// Logs at [`Level::Error`].
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Error, $($arg)*)
    };
}

/// Logs at [`Level::Warn`].
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Warn, $($arg)*)
    };
}

/// Logs at [`Level::Info`].
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Info, $($arg)*)
    };
}

/// Logs at [`Level::Debug`].
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Debug, $($arg)*)
    };
}

/// Logs at [`Level::Trace`].
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Trace, $($arg)*)
    };
}
