//! # Acquisition Scheduler
//!
//! State machine deciding when the next capture is due.
//!
//! ```text
//! AwaitingClock ──trusted──▶ Idle ──next_due──▶ Waiting(t) ──t reached──▶ DueNow
//!       ▲                     │                    │                        │
//!       └──error / implausible wait / clock lost ──┘      capture_done ─────┘──▶ Idle
//! ```
//!
//! Waiting is expressed as bounded sleeps so clock corrections made during a
//! long wait are noticed within one poll interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::humanize_duration;
use super::table::ScheduleTable;
use crate::error::ClockError;

/// Timing knobs of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    /// Longest single sleep while waiting for a slot
    pub poll_interval: Duration,
    /// Sleep between clock trust checks
    pub clock_retry: Duration,
    /// Waits longer than this trigger clock re-validation
    pub max_wait: Duration,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            clock_retry: Duration::from_secs(5),
            max_wait: Duration::from_secs(90_000),
        }
    }
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Clock not trusted yet
    AwaitingClock,
    /// Next due time not computed
    Idle,
    /// Sleeping until the given instant
    Waiting(DateTime<Utc>),
    /// A capture should run now
    DueNow,
}

/// What the caller should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Sleep this long, then poll again
    Sleep(Duration),
    /// Run a capture, then call [`AcquisitionScheduler::capture_done`]
    Capture,
}

/// Decides when captures happen
pub struct AcquisitionScheduler<Tz: TimeZone> {
    table: ScheduleTable,
    clock: Arc<dyn Clock>,
    tz: Tz,
    policy: SchedulePolicy,
    state: SchedulerState,
}

impl<Tz: TimeZone> AcquisitionScheduler<Tz> {
    /// Create a scheduler evaluating slots in `tz`
    pub fn new(table: ScheduleTable, clock: Arc<dyn Clock>, tz: Tz, policy: SchedulePolicy) -> Self {
        Self {
            table,
            clock,
            tz,
            policy,
            state: SchedulerState::AwaitingClock,
        }
    }

    /// Current state
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Schedule in use
    pub fn table(&self) -> &ScheduleTable {
        &self.table
    }

    /// Next due instant after the current wall-clock time
    ///
    /// # Errors
    ///
    /// * [`ClockError::Untrusted`] while the clock is not synchronised
    /// * [`ClockError::InvalidSlot`] if the slot has no local time that day
    /// * [`ClockError::ImplausibleWait`] if the wait exceeds the ceiling
    pub fn next_due(&self) -> Result<DateTime<Utc>, ClockError> {
        let now = self.clock.now();
        if !self.clock.is_trusted() {
            return Err(ClockError::Untrusted {
                now: now.timestamp(),
                floor: self.clock.trusted_after(),
            });
        }

        let due = self.table.next_due(&now.with_timezone(&self.tz))?.with_timezone(&Utc);
        let wait_s = (due - now).num_seconds();
        let ceiling_s = self.policy.max_wait.as_secs() as i64;
        if wait_s > ceiling_s {
            return Err(ClockError::ImplausibleWait { wait_s, ceiling_s });
        }
        Ok(due)
    }

    /// Seconds until the next acquisition
    pub fn seconds_until_next_acquisition(&self) -> Result<u64, ClockError> {
        let due = self.next_due()?;
        Ok((due - self.clock.now()).num_seconds().max(0) as u64)
    }

    /// Advance the state machine and tell the caller what to do
    ///
    /// Never fails: clock problems send the scheduler back to
    /// [`SchedulerState::AwaitingClock`] and ask for a bounded sleep.
    pub fn poll(&mut self) -> Step {
        loop {
            match self.state {
                SchedulerState::AwaitingClock => {
                    if !self.clock.is_trusted() {
                        debug!("Clock not trusted yet, retrying in {:?}", self.policy.clock_retry);
                        return Step::Sleep(self.policy.clock_retry);
                    }
                    info!("Wall clock trusted at {}", self.clock.now());
                    self.state = SchedulerState::Idle;
                }
                SchedulerState::Idle => match self.next_due() {
                    Ok(due) => {
                        let wait = (due - self.clock.now()).num_seconds().max(0) as u64;
                        info!(
                            "Next acquisition at {} (in {})",
                            due.with_timezone(&self.tz).naive_local(),
                            humanize_duration(wait)
                        );
                        self.state = SchedulerState::Waiting(due);
                    }
                    Err(e) => return self.revalidate(e),
                },
                SchedulerState::Waiting(due) => {
                    if !self.clock.is_trusted() {
                        return self.revalidate(ClockError::Untrusted {
                            now: self.clock.now().timestamp(),
                            floor: self.clock.trusted_after(),
                        });
                    }
                    let now = self.clock.now();
                    if now >= due {
                        self.state = SchedulerState::DueNow;
                        continue;
                    }
                    let remaining = (due - now).to_std().unwrap_or(Duration::ZERO);
                    if remaining > self.policy.max_wait {
                        // Clock stepped backwards while waiting
                        warn!("Clock moved back, recomputing next acquisition");
                        self.state = SchedulerState::Idle;
                        continue;
                    }
                    return Step::Sleep(remaining.min(self.policy.poll_interval));
                }
                SchedulerState::DueNow => return Step::Capture,
            }
        }
    }

    /// Report that the capture for the current slot has been attempted
    ///
    /// Called regardless of the capture's outcome.
    pub fn capture_done(&mut self) {
        if self.state == SchedulerState::DueNow {
            self.state = SchedulerState::Idle;
        }
    }

    fn revalidate(&mut self, err: ClockError) -> Step {
        warn!("Deferring acquisition: {}", err);
        self.state = SchedulerState::AwaitingClock;
        Step::Sleep(self.policy.clock_retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::clock::mocks::MockClock;
    use crate::schedule::table::ScheduleSlot;

    fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, h, m, 0).unwrap()
    }

    fn scheduler(clock: &MockClock, slots: &[(u32, u32)]) -> AcquisitionScheduler<Utc> {
        let slots = slots.iter().map(|&(h, m)| ScheduleSlot::new(h, m).unwrap()).collect();
        AcquisitionScheduler::new(
            ScheduleTable::new(slots).unwrap(),
            Arc::new(clock.clone()),
            Utc,
            SchedulePolicy::default(),
        )
    }

    #[test]
    fn test_untrusted_clock_defers() {
        let clock = MockClock::new(Utc.timestamp_opt(120, 0).unwrap());
        let mut s = scheduler(&clock, &[(12, 0)]);

        assert_eq!(s.poll(), Step::Sleep(Duration::from_secs(5)));
        assert_eq!(s.state(), SchedulerState::AwaitingClock);
        assert!(matches!(s.seconds_until_next_acquisition(), Err(ClockError::Untrusted { now: 120, .. })));
    }

    #[test]
    fn test_waits_in_bounded_sleeps_then_captures() {
        let clock = MockClock::new(utc(10, 11, 58));
        let mut s = scheduler(&clock, &[(0, 0), (12, 0)]);

        assert_eq!(s.poll(), Step::Sleep(Duration::from_secs(60)));
        assert_eq!(s.state(), SchedulerState::Waiting(utc(10, 12, 0)));
        assert_eq!(s.seconds_until_next_acquisition().unwrap(), 120);

        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(s.poll(), Step::Sleep(Duration::from_secs(30)));

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(s.poll(), Step::Capture);
        assert_eq!(s.state(), SchedulerState::DueNow);

        s.capture_done();
        assert_eq!(s.state(), SchedulerState::Idle);
        s.poll();
        assert_eq!(s.state(), SchedulerState::Waiting(utc(11, 0, 0)));
    }

    #[test]
    fn test_late_night_rolls_to_next_day() {
        let clock = MockClock::new(utc(10, 23, 30));
        let s = scheduler(&clock, &[(0, 0), (12, 0)]);
        assert_eq!(s.next_due().unwrap(), utc(11, 0, 0));
    }

    #[test]
    fn test_implausible_wait_triggers_revalidation() {
        let clock = MockClock::new(utc(10, 11, 0));
        let slots = vec![ScheduleSlot::new(12, 0).unwrap()];
        let mut s = AcquisitionScheduler::new(
            ScheduleTable::new(slots).unwrap(),
            Arc::new(clock.clone()),
            Utc,
            SchedulePolicy {
                max_wait: Duration::from_secs(1800),
                ..SchedulePolicy::default()
            },
        );

        assert!(matches!(s.next_due(), Err(ClockError::ImplausibleWait { wait_s: 3600, ceiling_s: 1800 })));
        assert_eq!(s.poll(), Step::Sleep(Duration::from_secs(5)));
        assert_eq!(s.state(), SchedulerState::AwaitingClock);
    }

    #[test]
    fn test_clock_step_back_recomputes() {
        let clock = MockClock::new(utc(10, 11, 59));
        let mut s = scheduler(&clock, &[(12, 0)]);
        s.poll();
        assert_eq!(s.state(), SchedulerState::Waiting(utc(10, 12, 0)));

        // NTP correction moves the clock two days back
        clock.set(utc(8, 11, 59));
        assert_eq!(s.poll(), Step::Sleep(Duration::from_secs(60)));
        assert_eq!(s.state(), SchedulerState::Waiting(utc(8, 12, 0)));
    }

    #[test]
    fn test_losing_trust_while_waiting() {
        let clock = MockClock::new(utc(10, 11, 0));
        let mut s = scheduler(&clock, &[(12, 0)]);
        s.poll();

        clock.set(Utc.timestamp_opt(0, 0).unwrap());
        assert_eq!(s.poll(), Step::Sleep(Duration::from_secs(5)));
        assert_eq!(s.state(), SchedulerState::AwaitingClock);
    }

    #[test]
    fn test_capture_done_outside_due_is_ignored() {
        let clock = MockClock::new(utc(10, 11, 0));
        let mut s = scheduler(&clock, &[(12, 0)]);
        s.poll();
        s.capture_done();
        assert_eq!(s.state(), SchedulerState::Waiting(utc(10, 12, 0)));
    }
}
