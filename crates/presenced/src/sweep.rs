//! Daily end-of-day absentee sweep.

use crate::service::AttendanceService;
use crate::store::Store;
use chrono::{NaiveDateTime, NaiveTime, TimeDelta};
use std::sync::Arc;
use std::time::Duration;

/// Time from `now` until the next occurrence of `hour:00:00`. An exact hit
/// schedules the following day.
pub fn until_next(now: NaiveDateTime, hour: u32) -> Duration {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let mut next = now.date().and_time(at);
    if next <= now {
        next += TimeDelta::days(1);
    }
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

/// Run the sweep every day at `hour` local time. Never returns.
pub async fn run_daily(service: Arc<AttendanceService<Store>>, hour: u32) {
    loop {
        let wait = until_next(chrono::Local::now().naive_local(), hour);
        tracing::debug!(wait_secs = wait.as_secs(), hour, "next absentee sweep scheduled");
        tokio::time::sleep(wait).await;

        match service.sweep_absentees().await {
            Ok(marked) => tracing::info!(marked, "scheduled absentee sweep complete"),
            Err(err) => tracing::error!(error = %err, "scheduled absentee sweep failed"),
        }
    }
}
