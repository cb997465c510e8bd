// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use crate::metric::policy::StoragePolicy;
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::time::Duration;

//
// FollowerFlushConfig
//

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FollowerFlushConfig {
  // How often to poll for work when there is no new flush times snapshot.
  #[serde(with = "humantime_serde")]
  pub check_every: Duration,
  // Maximum time to buffer data without seeing leader flush progress before flushing anyway.
  #[serde(with = "humantime_serde")]
  pub max_buffer_size: Duration,
  // Minimum time between two forced flushes.
  #[serde(with = "humantime_serde")]
  pub forced_flush_window_size: Duration,
  pub worker_pool_size: usize,
}

impl Default for FollowerFlushConfig {
  fn default() -> Self {
    Self {
      check_every: Duration::from_secs(1),
      max_buffer_size: Duration::from_secs(5 * 60),
      forced_flush_window_size: Duration::from_secs(10),
      worker_pool_size: 8,
    }
  }
}

//
// AggregatorConfig
//

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregatorConfig {
  // Entries idle for longer than this are expired.
  #[serde(with = "humantime_serde")]
  pub entry_ttl: Duration,
  // How often to sweep for expired entries. Each sweep is spread over the whole interval.
  #[serde(with = "humantime_serde")]
  pub entry_check_interval: Duration,
  // Fraction of entries checked per sweep batch.
  pub entry_check_batch_percentage: f64,
  // Per entry limit on raw values per second. 0 disables limiting.
  pub max_values_per_entry_per_second: i64,
  // Per shard limit on new entries per second. 0 disables limiting.
  pub max_new_entries_per_second: i64,
  pub default_storage_policies: Vec<StoragePolicy>,
  // Additional lateness allowed for forwarded metrics for every hop they went through.
  #[serde(with = "humantime_serde")]
  pub forwarding_delay_per_hop: Duration,
  // How far behind the current time a timed metric may be stamped. Timed lists are flushed this
  // much later than standard lists.
  #[serde(with = "humantime_serde")]
  pub timed_buffer_past: Duration,
  // How far ahead of the current time a timed metric may be stamped.
  #[serde(with = "humantime_serde")]
  pub timed_buffer_future: Duration,
  pub discard_nan_aggregated_values: bool,
  pub max_num_cached_source_sets: usize,
  pub elem_pool_size: usize,
  pub quantile_stream_pool_size: usize,
  pub timer_quantile_eps: f64,
  pub counter_prefix: String,
  pub timer_prefix: String,
  pub gauge_prefix: String,
  pub follower_flush: FollowerFlushConfig,
}

impl Default for AggregatorConfig {
  fn default() -> Self {
    Self {
      entry_ttl: Duration::from_secs(24 * 60 * 60),
      entry_check_interval: Duration::from_secs(60 * 60),
      entry_check_batch_percentage: 0.01,
      max_values_per_entry_per_second: 0,
      max_new_entries_per_second: 0,
      default_storage_policies: vec![
        StoragePolicy::new(time::Duration::seconds(10), time::Duration::days(2)),
        StoragePolicy::new(time::Duration::minutes(1), time::Duration::days(40)),
      ],
      forwarding_delay_per_hop: Duration::from_secs(15),
      timed_buffer_past: Duration::from_secs(60),
      timed_buffer_future: Duration::from_secs(10),
      discard_nan_aggregated_values: true,
      max_num_cached_source_sets: 2,
      elem_pool_size: 4096,
      quantile_stream_pool_size: 4096,
      timer_quantile_eps: 0.001,
      counter_prefix: "stats.counts.".to_string(),
      timer_prefix: "stats.timers.".to_string(),
      gauge_prefix: "stats.gauges.".to_string(),
      follower_flush: FollowerFlushConfig::default(),
    }
  }
}

impl AggregatorConfig {
  pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
    let config: Self = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
  }

  pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
    let file_contents = std::fs::read_to_string(path)?;
    Self::from_yaml(&file_contents)
  }

  pub fn validate(&self) -> anyhow::Result<()> {
    if self.entry_ttl.is_zero() {
      bail!("entry_ttl must be > 0");
    }
    if self.entry_check_interval.is_zero() {
      bail!("entry_check_interval must be > 0");
    }
    if self.entry_check_batch_percentage <= 0.0 || self.entry_check_batch_percentage > 1.0 {
      bail!("entry_check_batch_percentage must be > 0.0 and <= 1.0");
    }
    if self.default_storage_policies.is_empty() {
      bail!("default_storage_policies must not be empty");
    }
    if self.timer_quantile_eps <= 0.0 || self.timer_quantile_eps > 0.1 {
      bail!("timer_quantile_eps must be > 0.0 and <= 0.1");
    }
    if self.follower_flush.check_every.is_zero() {
      bail!("follower_flush.check_every must be > 0");
    }
    if self.follower_flush.worker_pool_size == 0 {
      bail!("follower_flush.worker_pool_size must be > 0");
    }
    Ok(())
  }
}
