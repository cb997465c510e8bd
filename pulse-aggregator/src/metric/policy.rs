// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./policy_test.rs"]
mod policy_test;

use crate::time::{duration_nanos, truncate_nanos};
use humantime_serde::re::humantime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Display;
use std::str::FromStr;
use time::Duration;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PolicyError {
  #[error("invalid storage policy '{0}', expected <resolution>:<retention>")]
  Format(String),
  #[error("invalid duration '{0}'")]
  Duration(String),
  #[error("resolution must be positive")]
  NonPositiveResolution,
}

// Parses a human readable duration such as "10s", "40d" or "1h 30m".
pub fn parse_duration(input: &str) -> Result<Duration, PolicyError> {
  humantime::parse_duration(input)
    .ok()
    .and_then(|duration| Duration::try_from(duration).ok())
    .ok_or_else(|| PolicyError::Duration(input.to_string()))
}

// Whole days are written as "<n>d" so that common retentions stay short, everything else uses the
// humantime format.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
  if duration.is_positive() && duration.whole_nanoseconds() % Duration::DAY.whole_nanoseconds() == 0
  {
    return format!("{}d", duration.whole_days());
  }
  humantime::format_duration(duration.unsigned_abs()).to_string()
}

//
// StoragePolicy
//

// How long aggregated windows are and how long the results are retained downstream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoragePolicy {
  resolution: Duration,
  retention: Duration,
}

impl StoragePolicy {
  #[must_use]
  pub const fn new(resolution: Duration, retention: Duration) -> Self {
    Self {
      resolution,
      retention,
    }
  }

  #[must_use]
  pub const fn resolution(&self) -> Duration {
    self.resolution
  }

  #[must_use]
  pub const fn retention(&self) -> Duration {
    self.retention
  }

  #[must_use]
  pub fn resolution_nanos(&self) -> i64 {
    duration_nanos(self.resolution)
  }

  // Start of the window containing the timestamp.
  #[must_use]
  pub fn aligned_start(&self, time_nanos: i64) -> i64 {
    truncate_nanos(time_nanos, self.resolution_nanos())
  }
}

impl Display for StoragePolicy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "{}:{}",
      format_duration(self.resolution),
      format_duration(self.retention)
    )
  }
}

impl FromStr for StoragePolicy {
  type Err = PolicyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (resolution, retention) = s
      .split_once(':')
      .ok_or_else(|| PolicyError::Format(s.to_string()))?;
    let resolution = parse_duration(resolution)?;
    if !resolution.is_positive() {
      return Err(PolicyError::NonPositiveResolution);
    }
    Ok(Self::new(resolution, parse_duration(retention)?))
  }
}

impl Serialize for StoragePolicy {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for StoragePolicy {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}
