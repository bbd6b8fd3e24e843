//! # Schedule Module
//!
//! Decides when acquisitions happen.
//!
//! This module handles:
//! - Parsing the daily `HH:MM` slot table
//! - Gating acquisitions on a trusted wall clock
//! - Computing the next due slot (rolling over to the next day)
//! - Bounded waits that notice clock corrections

pub mod clock;
pub mod scheduler;
pub mod table;

pub use clock::{Clock, SystemClock};
pub use scheduler::{AcquisitionScheduler, SchedulePolicy, SchedulerState, Step};
pub use table::{ScheduleSlot, ScheduleTable};

/// Format a number of seconds for logs, e.g. `3h 05m` or `42s`
pub fn humanize_duration(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{}d {:02}h {:02}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
