//! A minimal, zero-dependency logging crate for the `oxibridge` workspace.
//!
//! Records go to stderr with the emitting module path and an optional ANSI
//! colour. The bridge calls into this crate from native copy/dispose hooks,
//! so the fast path (a disabled level) is a single relaxed atomic load.
//!
//! # Configuration
//!
//! - `OXIBRIDGE_LOG` selects the initial level (`error`, `warn`, `info`,
//!   `debug`, `trace`) when [`init_from_env`] runs.
//! - `NO_COLOR` disables colour codes.
//!
//! # Example
//!
//! ```
//! use oxibridge_log::{debug, info, Level};
//!
//! oxibridge_log::set_level(Level::Debug);
//!
//! let handle = 7;
//! info!("allocated handle {}", handle);
//! debug!("identity maps: {:?}", (1, 0));
//! ```

use std::fmt::{self, Arguments};
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

/// Environment variable read by [`init_from_env`] for the initial level.
pub const LEVEL_ENV: &str = "OXIBRIDGE_LOG";

/// Log levels, ordered from most severe (`Error`) to least severe (`Trace`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Unrecoverable failures, including lifetime invariant violations
    Error = 0,
    /// Suspicious situations the bridge recovered from
    Warn = 1,
    /// Registration and lifecycle milestones
    Info = 2,
    /// Identity and closure bookkeeping
    Debug = 3,
    /// Per-hook reference count traffic
    Trace = 4,
}

impl Level {
    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Returns the upper-case name of this level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Level {
        match raw {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            3 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a level name cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError(String);

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid log level: {}", self.0)
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for Level {
    type Err = ParseLevelError;

    /// Parses a level name, ignoring case and surrounding whitespace.
    ///
    /// ```
    /// use oxibridge_log::Level;
    ///
    /// assert_eq!("trace".parse::<Level>(), Ok(Level::Trace));
    /// assert_eq!(" Warn ".parse::<Level>(), Ok(Level::Warn));
    /// assert!("loud".parse::<Level>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Ok(Level::Error),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "INFO" => Ok(Level::Info),
            "DEBUG" => Ok(Level::Debug),
            "TRACE" => Ok(Level::Trace),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// A record kept by the capture sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Severity of the record
    pub level: Level,
    /// Module path of the call site
    pub target: String,
    /// Formatted message
    pub message: String,
}

/// The global logger.
///
/// Level and colour are atomics; the capture sink is only locked when a
/// record passes the level filter.
pub struct Logger {
    level: AtomicU8,
    color: AtomicBool,
    captured: Mutex<Option<Vec<Record>>>,
}

impl Logger {
    const fn new(level: Level) -> Self {
        Logger {
            level: AtomicU8::new(level as u8),
            color: AtomicBool::new(true),
            captured: Mutex::new(None),
        }
    }

    /// Sets the minimum level that is emitted.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::SeqCst);
    }

    /// Returns the current minimum level.
    #[must_use]
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Checks if a record at `level` would be emitted.
    #[must_use]
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed)
    }

    /// Enables or disables ANSI colour codes.
    pub fn set_color(&self, enabled: bool) {
        self.color.store(enabled, Ordering::Relaxed);
    }

    fn write(&self, level: Level, target: &str, args: Arguments<'_>) {
        let message = args.to_string();

        {
            let mut captured =
                self.captured.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(records) = captured.as_mut() {
                records.push(Record {
                    level,
                    target: target.to_string(),
                    message: message.clone(),
                });
            }
        }

        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        // A failed write to stderr has nowhere better to go.
        let _ = if self.color.load(Ordering::Relaxed) {
            writeln!(
                out,
                "{}[{}]\x1b[0m {target}: {message}",
                level.color_code(),
                level.as_str()
            )
        } else {
            writeln!(out, "[{}] {target}: {message}", level.as_str())
        };
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the global logger, creating it at `Level::Warn` on first use.
pub fn get_logger() -> &'static Logger {
    LOGGER.get_or_init(|| Logger::new(Level::Warn))
}

/// Sets the minimum level of the global logger.
pub fn set_level(level: Level) {
    get_logger().set_level(level);
}

/// Sets the minimum level from a level name.
///
/// # Errors
///
/// Returns [`ParseLevelError`] if `s` is not a level name.
pub fn set_level_from_str(s: &str) -> Result<(), ParseLevelError> {
    set_level(s.parse()?);
    Ok(())
}

/// Applies `OXIBRIDGE_LOG` and `NO_COLOR` to the global logger.
///
/// Returns the level that is in effect afterwards. An unparsable
/// `OXIBRIDGE_LOG` leaves the level unchanged.
pub fn init_from_env() -> Level {
    let logger = get_logger();
    if let Ok(value) = std::env::var(LEVEL_ENV) {
        if let Ok(level) = value.parse() {
            logger.set_level(level);
        }
    }
    if std::env::var_os("NO_COLOR").is_some() {
        logger.set_color(false);
    }
    logger.level()
}

/// Starts recording emitted records in memory.
///
/// Records are still written to stderr. Calling `capture` again keeps the
/// records gathered so far.
pub fn capture() {
    let mut captured = get_logger()
        .captured
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    captured.get_or_insert_with(Vec::new);
}

/// Drains the records gathered since [`capture`] was called.
pub fn take_captured() -> Vec<Record> {
    let mut captured = get_logger()
        .captured
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    captured.as_mut().map(std::mem::take).unwrap_or_default()
}

#[doc(hidden)]
pub fn __log_with_target(level: Level, target: &str, args: Arguments<'_>) {
    let logger = get_logger();
    if logger.enabled(level) {
        logger.write(level, target, args);
    }
}

/// Logs a message at the given level, tagged with the caller's module path.
///
/// ```
/// use oxibridge_log::{log, Level};
///
/// log!(level: Level::Warn, "descriptor {:#x} reclaimed late", 0x1000);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {
        {
            if $crate::get_logger().enabled($level) {
                $crate::__log_with_target(
                    $level,
                    module_path!(),
                    format_args!($($arg)*)
                );
            }
        }
    };
}

/// Logs at `Level::Error`.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Error, $($arg)*)
    };
}

/// Logs at `Level::Warn`.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Warn, $($arg)*)
    };
}

/// Logs at `Level::Info`.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Info, $($arg)*)
    };
}

/// Logs at `Level::Debug`.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Debug, $($arg)*)
    };
}

/// Logs at `Level::Trace`.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Trace, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Warn < Level::Info);
        assert!(Level::Info < Level::Debug);
        assert!(Level::Debug < Level::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("error".parse::<Level>(), Ok(Level::Error));
        assert_eq!("WARNING".parse::<Level>(), Ok(Level::Warn));
        assert_eq!("Info".parse::<Level>(), Ok(Level::Info));
        assert_eq!("debug\n".parse::<Level>(), Ok(Level::Debug));
        assert!("verbose".parse::<Level>().is_err());
    }

    #[test]
    fn test_level_round_trips_through_u8() {
        for level in [Level::Error, Level::Warn, Level::Info, Level::Debug, Level::Trace] {
            assert_eq!(Level::from_u8(level as u8), level);
        }
    }

    #[test]
    fn test_logger_level_filtering() {
        let logger = Logger::new(Level::Info);

        assert!(logger.enabled(Level::Error));
        assert!(logger.enabled(Level::Info));
        assert!(!logger.enabled(Level::Debug));

        logger.set_level(Level::Trace);
        assert!(logger.enabled(Level::Trace));
    }

    #[test]
    fn test_local_logger_capture() {
        let logger = Logger::new(Level::Trace);
        logger.set_color(false);
        *logger.captured.lock().unwrap() = Some(Vec::new());

        logger.write(Level::Debug, "oxibridge::test", format_args!("count {}", 2));

        let records = logger.captured.lock().unwrap().take().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, Level::Debug);
        assert_eq!(records[0].target, "oxibridge::test");
        assert_eq!(records[0].message, "count 2");
    }

    #[test]
    fn test_set_level_from_str_rejects_garbage() {
        assert!(set_level_from_str("nonsense").is_err());
    }

    #[test]
    fn test_thread_safety() {
        use std::thread;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                thread::spawn(move || {
                    warn!("thread {} warning", i);
                    trace!("thread {} trace", i);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
