//! Structured kernel logging
//!
//! Level-filtered, component-tagged JSON records, one object per line, fanned
//! out to a fixed set of byte-synchronous sinks (today: the serial port).
//! Formatting happens once per call into a fixed-size stack buffer; the
//! logger never allocates. Records that are too large for the line buffer
//! (memory map dumps, allocator state) use the streaming API, which emits a
//! JSON prefix, the caller's payload, and a closing suffix as separate
//! writes.

use core::fmt::{self, Write};
use heapless::{String, Vec};
use spin::Mutex;

/// Maximum number of sinks a logger fans out to.
const MAX_WRITERS: usize = 4;

/// Size of the per-call line buffer.
const LINE_BUFFER_SIZE: usize = 1024;

/// A log sink: takes one complete chunk of output, already serialized.
pub type LogWriter = fn(&str);

/// Log severity, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

/// A structured logger: a set of sinks plus a minimum level.
pub struct Logger {
    writers: Vec<LogWriter, MAX_WRITERS>,
    min_level: LogLevel,
    streaming: bool,
}

impl Logger {
    pub const fn new() -> Self {
        Logger {
            writers: Vec::new(),
            min_level: LogLevel::Debug,
            streaming: false,
        }
    }

    fn emit(&self, chunk: &str) {
        for writer in &self.writers {
            writer(chunk);
        }
    }
}

/// Logger for kernel-proper components (boot, pmm, syscall, panic).
pub static KERNEL_DEBUG_LOGGER: Mutex<Logger> = Mutex::new(Logger::new());

/// Logger for hardware-facing components (serial, gdt, idt).
pub static HAL_LOGGER: Mutex<Logger> = Mutex::new(Logger::new());

/// Install sinks and the minimum level on a logger. Called once per logger
/// during boot; extra writers beyond the fixed capacity are dropped.
pub fn init(logger: &Mutex<Logger>, writers: &[LogWriter], min_level: LogLevel) {
    let mut logger = logger.lock();
    logger.writers.clear();
    for writer in writers {
        if logger.writers.push(*writer).is_err() {
            break;
        }
    }
    logger.min_level = min_level;
}

/// A `fmt::Write` adapter that silently truncates instead of erroring when
/// the backing buffer fills up.
struct TruncatingWriter<'a, const N: usize>(&'a mut String<N>);

impl<const N: usize> fmt::Write for TruncatingWriter<'_, N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let remaining = N - self.0.len();
        if s.len() <= remaining {
            self.0.push_str(s).ok();
        } else {
            // Cut on a char boundary at or below the remaining capacity.
            let mut cut = remaining;
            while cut > 0 && !s.is_char_boundary(cut) {
                cut -= 1;
            }
            self.0.push_str(&s[..cut]).ok();
        }
        Ok(())
    }
}

/// Append `s` to `dst` as JSON string contents (no surrounding quotes).
fn write_json_escaped<const N: usize>(dst: &mut TruncatingWriter<'_, N>, s: &str) {
    for ch in s.chars() {
        match ch {
            '"' => dst.write_str("\\\"").ok(),
            '\\' => dst.write_str("\\\\").ok(),
            '\n' => dst.write_str("\\n").ok(),
            '\r' => dst.write_str("\\r").ok(),
            '\t' => dst.write_str("\\t").ok(),
            c if (c as u32) < 0x20 => write!(dst, "\\u{:04x}", c as u32).ok(),
            c => dst.write_char(c).ok(),
        };
    }
}

/// Serialize the common record prefix `{"level":…,"component":…,"message":…`
/// into `line`, leaving the object open.
fn write_record_prefix(
    line: &mut String<LINE_BUFFER_SIZE>,
    level: LogLevel,
    component: &str,
    message: &str,
) {
    let mut out = TruncatingWriter(line);
    out.write_str("{\"level\":\"").ok();
    out.write_str(level.as_str()).ok();
    out.write_str("\",\"component\":\"").ok();
    write_json_escaped(&mut out, component);
    out.write_str("\",\"message\":\"").ok();
    write_json_escaped(&mut out, message);
    out.write_str("\"").ok();
}

/// Emit one complete JSON record to every sink of `logger`.
///
/// The formatted message has any trailing newline stripped so every record
/// stays one line. Blocking and synchronous; on buffer overflow the output
/// is truncated with no error.
pub fn log_message(
    logger: &Mutex<Logger>,
    level: LogLevel,
    component: &str,
    args: fmt::Arguments,
) {
    let logger = logger.lock();
    if level < logger.min_level {
        return;
    }

    let mut message: String<LINE_BUFFER_SIZE> = String::new();
    TruncatingWriter(&mut message).write_fmt(args).ok();
    let trimmed = message.as_str().trim_end_matches('\n');

    let mut line: String<LINE_BUFFER_SIZE> = String::new();
    write_record_prefix(&mut line, level, component, trimmed);
    TruncatingWriter(&mut line).write_str("}\n").ok();

    logger.emit(line.as_str());
}

/// Open a streamed record: emits the record prefix up to and including
/// `"data":`. The caller supplies the payload through `stream_data` and
/// closes with `stream_end`. Streamed records must not nest; a second
/// `stream_start` before `stream_end` is ignored.
pub fn stream_start(
    logger: &Mutex<Logger>,
    level: LogLevel,
    component: &str,
    message: &str,
) {
    let mut logger = logger.lock();
    if level < logger.min_level || logger.streaming {
        return;
    }
    logger.streaming = true;

    let mut line: String<LINE_BUFFER_SIZE> = String::new();
    write_record_prefix(&mut line, level, component, message);
    TruncatingWriter(&mut line).write_str(",\"data\":").ok();

    logger.emit(line.as_str());
}

/// Stream an opaque chunk of an open record's payload.
pub fn stream_data(logger: &Mutex<Logger>, data: &str) {
    let logger = logger.lock();
    if !logger.streaming {
        return;
    }
    logger.emit(data);
}

/// Close a streamed record.
pub fn stream_end(logger: &Mutex<Logger>) {
    let mut logger = logger.lock();
    if !logger.streaming {
        return;
    }
    logger.streaming = false;
    logger.emit("}\n");
}

/// Log to the kernel debug logger at a given level.
#[macro_export]
macro_rules! klog {
    ($level:expr, $component:expr, $($arg:tt)*) => {
        $crate::logger::log_message(
            &$crate::logger::KERNEL_DEBUG_LOGGER,
            $level,
            $component,
            format_args!($($arg)*),
        )
    };
}

#[macro_export]
macro_rules! log_debug {
    ($component:expr, $($arg:tt)*) => {
        $crate::klog!($crate::logger::LogLevel::Debug, $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_info {
    ($component:expr, $($arg:tt)*) => {
        $crate::klog!($crate::logger::LogLevel::Info, $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_warning {
    ($component:expr, $($arg:tt)*) => {
        $crate::klog!($crate::logger::LogLevel::Warning, $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_error {
    ($component:expr, $($arg:tt)*) => {
        $crate::klog!($crate::logger::LogLevel::Error, $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_fatal {
    ($component:expr, $($arg:tt)*) => {
        $crate::klog!($crate::logger::LogLevel::Fatal, $component, $($arg)*)
    };
}
