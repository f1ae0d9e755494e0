//! Wall-clock helpers shared by the store, the summaries, and logging.
//!
//! All persisted timestamps are integer milliseconds since the Unix epoch.
//! Calendar dates (deadlines, due dates, finance dates) are ISO `YYYY-MM-DD`
//! strings, which order correctly under plain string comparison.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

pub const MILLIS_PER_DAY: u64 = 86_400_000;

pub fn now_millis() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Civil date from days since epoch (Howard Hinnant's algorithm).
pub fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m as u32, d as u32)
}

/// The UTC calendar day containing `ms`, as `YYYY-MM-DD`.
pub fn iso_date(ms: Millis) -> String {
    let (y, m, d) = civil_from_days((ms / MILLIS_PER_DAY) as i64);
    format!("{y:04}-{m:02}-{d:02}")
}
