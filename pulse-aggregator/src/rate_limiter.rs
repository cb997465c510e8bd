// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./rate_limiter_test.rs"]
mod rate_limiter_test;

use crate::time::{NANOS_PER_SECOND, truncate_nanos};
use std::sync::atomic::{AtomicI64, Ordering};

//
// RateLimiter
//

// Per-second window rate limiter. Each aligned second starts a new window with a fresh allowance
// of `limit` units. A limit of zero or less disables limiting.
#[derive(Debug)]
pub struct RateLimiter {
  limit: AtomicI64,
  window_start_nanos: AtomicI64,
  allowed: AtomicI64,
}

impl RateLimiter {
  #[must_use]
  pub const fn new(limit: i64) -> Self {
    Self {
      limit: AtomicI64::new(limit),
      window_start_nanos: AtomicI64::new(i64::MIN),
      allowed: AtomicI64::new(0),
    }
  }

  pub fn limit(&self) -> i64 {
    self.limit.load(Ordering::Relaxed)
  }

  pub fn reset(&self, limit: i64) {
    self.limit.store(limit, Ordering::Relaxed);
    self.window_start_nanos.store(i64::MIN, Ordering::Relaxed);
    self.allowed.store(0, Ordering::Relaxed);
  }

  // Consumes `units` from the current window. Returns false if that exceeds the allowance.
  pub fn is_allowed(&self, units: i64, now_nanos: i64) -> bool {
    let limit = self.limit();
    if limit <= 0 {
      return true;
    }

    let window_start = truncate_nanos(now_nanos, NANOS_PER_SECOND);
    let current = self.window_start_nanos.load(Ordering::Acquire);
    if window_start > current
      && self
        .window_start_nanos
        .compare_exchange(current, window_start, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
      self.allowed.store(0, Ordering::Release);
    }

    self.allowed.fetch_add(units, Ordering::AcqRel) + units <= limit
  }
}
