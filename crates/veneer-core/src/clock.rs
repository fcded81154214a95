//! Time source injected into every component that reads "now".

use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};

use crate::sync::lock;

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// The latest instant anything is scheduled for. Still a four-digit year, so
/// it encodes as RFC 3339.
pub fn end_of_time() -> DateTime<Utc> {
  NaiveDate::from_ymd_opt(9999, 12, 31)
    .and_then(|d| d.and_hms_nano_opt(23, 59, 59, 999_999_999))
    .map(|t| t.and_utc())
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at + by`, clamped to [`end_of_time`] instead of overflowing.
pub fn saturating_add(at: DateTime<Utc>, by: TimeDelta) -> DateTime<Utc> {
  match at.checked_add_signed(by) {
    Some(t) => t.min(end_of_time()),
    None if by < TimeDelta::zero() => DateTime::<Utc>::MIN_UTC,
    None => end_of_time(),
  }
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// A clock that only moves when told to. Useful for testing.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self { now: Mutex::new(start) }
  }

  pub fn advance(&self, by: TimeDelta) {
    let mut now = lock(&self.now);
    *now = saturating_add(*now, by);
  }

  pub fn set(&self, to: DateTime<Utc>) { *lock(&self.now) = to; }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> { *lock(&self.now) }
}
