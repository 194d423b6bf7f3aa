//! Hypervisor logging
//!
//! Leveled logging over the debug UART with a runtime filter. The macros are
//! safe to call from any core and from exception context: output is
//! serialized by a plain spinlock around the UART writer, and formatting
//! happens on the caller's stack.
//!
//! The debugger owns the UART once a GDB client attaches; at that point the
//! level should be dropped to `Error` so log traffic does not corrupt RSP
//! framing.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Global log level (default: INFO)
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Serializes multi-part writes from different cores
static LOG_LOCK: Mutex<()> = Mutex::new(());

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

#[inline]
pub fn is_enabled(level: LogLevel) -> bool {
    level <= get_level()
}

/// Writer that sinks formatted output into the debug UART
pub struct LogWriter;

impl Write for LogWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::platform::uart::debug_write(s.as_bytes());
        Ok(())
    }
}

pub fn log(level: LogLevel, args: fmt::Arguments) {
    if !is_enabled(level) {
        return;
    }

    let _guard = LOG_LOCK.lock();
    let mut writer = LogWriter;
    let _ = write!(writer, "[{}] ", level.as_str());
    let _ = writer.write_fmt(args);
    let _ = writer.write_str("\n");
}

#[macro_export]
macro_rules! printk {
    ($level:expr, $($arg:tt)*) => {
        $crate::lib::printk::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Debug, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filtering() {
        set_level(LogLevel::Warn);
        assert!(is_enabled(LogLevel::Error));
        assert!(is_enabled(LogLevel::Warn));
        assert!(!is_enabled(LogLevel::Info));
        assert!(!is_enabled(LogLevel::Debug));
        set_level(LogLevel::Info);
    }

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Error < LogLevel::Debug);
    }
}
