//! Timers for subscription lifecycle.
//!
//! Two kinds, both returned as [`AbortHandle`]s so teardown can cancel them:
//! a one-shot delay (connection health check) and a weekly deadline at a
//! fixed weekday and hour in UTC (forced refresh). The action of a timer
//! runs in its own task, so aborting the timer never interrupts an action
//! that has already started.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveTime, Utc, Weekday};
use tidings_core::TidingsConfig;
use tokio::task::AbortHandle;
use tracing::debug;

const DEADLINE_GUARD: Duration = Duration::from_secs(60);

/// When lifecycle timers fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSchedule {
    /// How long a new subscription may stay unestablished.
    pub health_check_timeout: Duration,
    pub forced_refresh_weekday: Weekday,
    /// Hour of day (UTC); values past 23 are clamped.
    pub forced_refresh_hour: u32,
}

impl RefreshSchedule {
    pub fn from_config(config: &TidingsConfig) -> Self {
        Self {
            health_check_timeout: config.health_check_timeout,
            forced_refresh_weekday: config.forced_refresh_weekday,
            forced_refresh_hour: config.forced_refresh_hour,
        }
    }

    /// Time from `now` until the next forced refresh.
    pub fn until_forced_refresh(&self, now: DateTime<Utc>) -> Duration {
        duration_until_next(now, self.forced_refresh_weekday, self.forced_refresh_hour)
    }
}

/// Duration from `now` until the next `weekday` at `hour:00` UTC.
///
/// Always in `[0, 7 days)`: a target earlier in the current week wraps to
/// the following week.
pub fn duration_until_next(now: DateTime<Utc>, weekday: Weekday, hour: u32) -> Duration {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
    let days_ahead = (7 + weekday.num_days_from_monday() - now.weekday().num_days_from_monday()) % 7;

    let target_date = now
        .date_naive()
        .checked_add_days(Days::new(u64::from(days_ahead)))
        .unwrap_or_else(|| now.date_naive());
    let mut target = target_date.and_time(time).and_utc();
    if target < now {
        target += chrono::Duration::days(7);
    }

    (target - now).to_std().unwrap_or(Duration::ZERO)
}

/// Run `action` once after `delay`.
pub fn after<F>(delay: Duration, action: F) -> AbortHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        tokio::spawn(action);
    })
    .abort_handle()
}

/// Run `action` at every forced refresh deadline of `schedule` until aborted.
pub fn weekly<F, Fut>(schedule: RefreshSchedule, mut action: F) -> AbortHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let wait = schedule.until_forced_refresh(Utc::now());
            debug!(
                weekday = ?schedule.forced_refresh_weekday,
                hour = schedule.forced_refresh_hour,
                wait_secs = wait.as_secs(),
                "Weekly timer armed"
            );
            tokio::time::sleep(wait).await;
            tokio::spawn(action());
            // Step past the deadline so it is not matched again.
            tokio::time::sleep(DEADLINE_GUARD).await;
        }
    })
    .abort_handle()
}
