//! Time-boxed hint that a manual, known-good refresh is in flight.
//!
//! While active, the event listener skips its automatic invalidations. The
//! flag expires on its own so a caller that never clears it cannot silence
//! the listener for good. It is a hint, not a lock: nothing ever waits on it.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
  clock::{Clock, saturating_add},
  sync::lock,
};

pub struct Suppression {
  expires_at: Mutex<Option<DateTime<Utc>>>,
  clock:      Arc<dyn Clock>,
}

impl Suppression {
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self { expires_at: Mutex::new(None), clock }
  }

  /// Raise the flag for `duration`, replacing any earlier expiry, or lower it
  /// immediately when `active` is `false`.
  pub fn set(&self, active: bool, duration: TimeDelta) {
    let mut expires_at = lock(&self.expires_at);
    *expires_at = if active {
      Some(saturating_add(self.clock.now(), duration))
    } else {
      None
    };
    tracing::debug!(active, expires_at = ?*expires_at, "suppression set");
  }

  pub fn is_suppressed(&self) -> bool {
    match *lock(&self.expires_at) {
      Some(at) => self.clock.now() < at,
      None => false,
    }
  }
}
