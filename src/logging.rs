//! Line-oriented logging with timestamps, source locations, and ANSI colour.
//!
//! Two macros share one writer:
//!
//! - [`tlog!`] always emits.
//! - [`tdebug!`] emits only when debug logging is on ([`set_debug`] or
//!   `DEVLIFE_LOG=debug` at [`init`]).
//!
//! ```text
//! 20260211T21:33:12.000 - src/sync.rs:142 - pull tasks: applied 5 of 5 record(s)
//! ```
//!
//! By default log lines go to stderr.  Call [`set_writer`] to redirect output
//! to any [`std::io::Write`] implementor.  Installing a custom writer also
//! disables ANSI colour codes.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};

use crate::clock::{civil_from_days, now_millis, MILLIS_PER_DAY};

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Initialize the logging system. Call once at startup before any logging.
pub fn init() {
    COLOUR_ENABLED.store(io::stderr().is_terminal(), Ordering::Relaxed);
    let debug = std::env::var("DEVLIFE_LOG")
        .map(|v| v.eq_ignore_ascii_case("debug"))
        .unwrap_or(false);
    DEBUG_ENABLED.store(debug, Ordering::Relaxed);
}

/// Replace the log writer and turn colour off.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    if let Ok(mut writer) = LOG_WRITER.lock() {
        *writer = w;
    }
}

pub fn set_debug(enabled: bool) {
    DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

const ID_COLOURS: &[&str] = &[
    "\x1b[91m", "\x1b[92m", "\x1b[93m", "\x1b[94m", "\x1b[95m", "\x1b[96m",
];

fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

const LOG_ID_TRUNCATE_LEN: usize = 8;

fn truncate_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(LOG_ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// Format a record id with consistent colour and truncation.
pub fn record_id(id: &str) -> String {
    let short = truncate_id(id);
    if colour_enabled() {
        format!("{}{short}{RESET}", hash_colour(id))
    } else {
        short.to_string()
    }
}

/// Format the current wall-clock time as `YYYYMMDDTHH:MM:SS.mmm`.
pub fn format_timestamp() -> String {
    let now = now_millis();
    let (y, m, d) = civil_from_days((now / MILLIS_PER_DAY) as i64);
    let day_ms = now % MILLIS_PER_DAY;
    let secs = day_ms / 1000;
    format!(
        "{:04}{:02}{:02}T{:02}:{:02}:{:02}.{:03}",
        y,
        m,
        d,
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60,
        day_ms % 1000
    )
}

/// Write a single log line to the current writer.
///
/// Called by the logging macros; not intended for direct use.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    if let Ok(mut writer) = LOG_WRITER.lock() {
        let _ = writeln!(*writer, "{formatted}");
    }
}

/// Emit a log line with timestamp and source location.
///
/// ```ignore
/// tlog!("push {}: {} record(s) failed: {}", collection, n, err);
/// ```
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}

/// Like [`tlog!`] but only emits when debug logging is enabled.
#[macro_export]
macro_rules! tdebug {
    ($($arg:tt)*) => {{
        if $crate::logging::debug_enabled() {
            $crate::logging::emit(file!(), line!(), &format!($($arg)*));
        }
    }};
}
