// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./time_test.rs"]
mod time_test;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use time::{Duration, OffsetDateTime};

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

// Converts a duration to whole nanoseconds, saturating at the i64 bounds.
#[must_use]
pub fn duration_nanos(duration: Duration) -> i64 {
  i64::try_from(duration.whole_nanoseconds()).unwrap_or(if duration.is_negative() {
    i64::MIN
  } else {
    i64::MAX
  })
}

// Truncates a nanosecond timestamp down to a multiple of the supplied resolution.
#[must_use]
pub const fn truncate_nanos(time_nanos: i64, resolution_nanos: i64) -> i64 {
  if resolution_nanos <= 0 {
    return time_nanos;
  }
  time_nanos - time_nanos.rem_euclid(resolution_nanos)
}

//
// TimeProvider
//

pub trait TimeProvider: Send + Sync + 'static {
  fn now_utc(&self) -> OffsetDateTime;

  fn unix_nanos(&self) -> i64 {
    i64::try_from(self.now_utc().unix_timestamp_nanos()).unwrap_or(i64::MAX)
  }
}

//
// RealTimeProvider
//

#[derive(Default)]
pub struct RealTimeProvider {}

impl TimeProvider for RealTimeProvider {
  fn now_utc(&self) -> OffsetDateTime {
    OffsetDateTime::now_utc()
  }
}

//
// TestTimeProvider
//

// Manually advanced clock. Cloning shares the underlying time.
#[derive(Clone, Default)]
pub struct TestTimeProvider {
  pub nanos: Arc<AtomicI64>,
}

impl TestTimeProvider {
  #[must_use]
  pub fn new(unix_seconds: i64) -> Self {
    Self {
      nanos: Arc::new(AtomicI64::new(unix_seconds * NANOS_PER_SECOND)),
    }
  }

  pub fn set(&self, time: Duration) {
    self.nanos.store(duration_nanos(time), Ordering::SeqCst);
  }

  pub fn advance(&self, by: Duration) {
    self.nanos.fetch_add(duration_nanos(by), Ordering::SeqCst);
  }
}

impl TimeProvider for TestTimeProvider {
  fn now_utc(&self) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.unix_nanos()))
      .unwrap_or(OffsetDateTime::UNIX_EPOCH)
  }

  fn unix_nanos(&self) -> i64 {
    self.nanos.load(Ordering::SeqCst)
  }
}

//
// TimeLock
//

// Guards the boundary between accepting writes stamped at time T and choosing a flush horizon
// covering T. Writers hold the shared side while reading the clock and stamping a sample, a flusher
// holds the exclusive side while choosing its horizon. Any sample accepted under the shared side
// is therefore stamped strictly before any horizon chosen by an exclusive holder that acquires the
// lock afterwards.
//
// Fairness follows parking_lot's RwLock: a waiting writer blocks new readers and the lock is handed
// off fairly at least every 0.5ms, so a flusher cannot be starved by continuous ingestion.
#[derive(Default)]
pub struct TimeLock {
  lock: RwLock<()>,
}

impl TimeLock {
  pub fn read(&self) -> RwLockReadGuard<'_, ()> {
    self.lock.read()
  }

  pub fn write(&self) -> RwLockWriteGuard<'_, ()> {
    self.lock.write()
  }
}
