//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for details
//!
//! The runtime logs through the `log` facade everywhere. This module offers
//! a built-in sink for programs that have not installed one of their own:
//! a line-oriented stderr logger that tags every record with the severity
//! and the current fiber, plus the low-level [`say`] path used by fatal
//! abort diagnostics, which writes straight to the standard-error file
//! descriptor without allocating so it survives a broken heap.
//!
//! Example:
//! ```no_run
//! use log::{info, LevelFilter};
//!
//! weft::log::init(LevelFilter::Debug);
//! info!("reactor starting");
//! ```

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

/// Severity levels of the built-in sink.
///
/// `Meta` is reserved for messages about the runtime itself (open/close,
/// watchdog and teardown diagnostics) and maps onto [`Level::Info`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
#[repr(u32)]
pub enum Severity {
    Error = 0,
    Warn = 1,
    Info = 2,
    Meta = 3,
    Debug = 4,
}

impl Severity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "E",
            Self::Warn => "W",
            Self::Info => "I",
            Self::Meta => "M",
            Self::Debug => "D",
        }
    }
}

impl From<Level> for Severity {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => Self::Error,
            Level::Warn => Self::Warn,
            Level::Info => Self::Info,
            Level::Debug => Self::Debug,
            Level::Trace => Self::Debug,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// ReactorLogger
////////////////////////////////////////////////////////////////////////////////

/// [Log](https://docs.rs/log/latest/log/trait.Log.html) trait implementation
/// writing one line per record to stderr.
///
/// Records emitted from fiber context carry the fiber's id so interleaved
/// cooperative logs remain attributable.
pub struct ReactorLogger {
    mapping: fn(Level) -> Severity,
}

impl ReactorLogger {
    #[inline(always)]
    pub const fn new() -> Self {
        const DEFAULT_MAPPING: fn(Level) -> Severity = |l: Level| {
            match l {
                Level::Error => Severity::Error,
                Level::Warn => Severity::Warn,
                Level::Info => Severity::Info,
                Level::Debug => Severity::Debug,
                Level::Trace => Severity::Debug,
            }
        };
        Self {
            mapping: DEFAULT_MAPPING,
        }
    }

    #[inline(always)]
    pub fn with_mapping(mapping: fn(Level) -> Severity) -> Self {
        Self { mapping }
    }

    /// Convert [`log::Level`] to [`Severity`] taking the mapping into
    /// account.
    #[inline(always)]
    pub fn convert_level(&self, level: Level) -> Severity {
        (self.mapping)(level)
    }
}

impl Default for ReactorLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for ReactorLogger {
    #[inline(always)]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let severity = self.convert_level(record.level());
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = match crate::fiber::current_name() {
            Some(name) => writeln!(
                out,
                "{}> {} [{}] {}",
                severity.as_str(),
                record.target(),
                name,
                record.args()
            ),
            None => writeln!(
                out,
                "{}> {} {}",
                severity.as_str(),
                record.target(),
                record.args()
            ),
        };
    }

    #[inline(always)]
    fn flush(&self) {}
}

static LOGGER: ReactorLogger = ReactorLogger::new();
static INSTALLED: OnceCell<()> = OnceCell::new();

/// Install the built-in stderr logger as the `log` facade sink and set the
/// maximum level. Subsequent calls only adjust the level.
pub fn init(max_level: LevelFilter) {
    INSTALLED.get_or_init(|| {
        // A logger may already be installed by the host program, that's fine.
        let _ = log::set_logger(&LOGGER);
    });
    log::set_max_level(max_level);
}

/// Get the current maximum level of the `log` facade.
#[inline(always)]
pub fn current_level() -> LevelFilter {
    log::max_level()
}

/// Set the current maximum level of the `log` facade.
#[inline(always)]
pub fn set_current_level(level: LevelFilter) {
    log::set_max_level(level);
}

////////////////////////////////////////////////////////////////////////////////
// say
////////////////////////////////////////////////////////////////////////////////

/// Writes a diagnostic line directly to the standard-error file descriptor.
///
/// Performs no allocation and takes no locks, so it is usable from fatal
/// paths (guard-page faults, watchdog aborts, signal handlers) where the
/// heap or the formatting machinery may no longer be trustworthy. The
/// message is truncated to an internal buffer bound.
pub fn say(severity: Severity, msg: &str) {
    let mut buf = [0u8; 512];
    let mut len = 0;
    for chunk in [severity.as_str().as_bytes(), b"> ", msg.as_bytes(), b"\n"].iter() {
        let take = chunk.len().min(buf.len() - len);
        buf[len..len + take].copy_from_slice(&chunk[..take]);
        len += take;
    }
    // Safety: writing a stack buffer to fd 2
    unsafe {
        libc::write(libc::STDERR_FILENO, buf.as_ptr().cast(), len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping() {
        assert_eq!(Severity::from(Level::Trace), Severity::Debug);
        assert_eq!(Severity::from(Level::Error), Severity::Error);
        assert!(Severity::Error < Severity::Debug);
    }

    #[test]
    fn say_does_not_panic_on_long_messages() {
        let long = "x".repeat(4096);
        say(Severity::Meta, &long);
    }
}
