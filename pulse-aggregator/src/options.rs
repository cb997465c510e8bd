// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::aggregation::quantile::QuantileStream;
use crate::config::AggregatorConfig;
use crate::element::MetricElem;
use crate::entry;
use crate::metric::MetricType;
use crate::metric::policy::StoragePolicy;
use crate::pool::ObjectPool;
use crate::time::{TimeLock, TimeProvider};
use bd_server_stats::stats::Scope;
use bytes::Bytes;
use std::sync::Arc;
use time::Duration;

//
// ElemOptions
//

// Shared by every element.
pub struct ElemOptions {
  pub counter_prefix: Bytes,
  pub timer_prefix: Bytes,
  pub gauge_prefix: Bytes,
  pub discard_nan_aggregated_values: bool,
  pub max_num_cached_source_sets: usize,
  pub timer_quantile_eps: f64,
  pub stream_pool: ObjectPool<QuantileStream>,
}

impl ElemOptions {
  #[must_use]
  pub fn new(config: &AggregatorConfig) -> Self {
    Self {
      counter_prefix: Bytes::from(config.counter_prefix.clone()),
      timer_prefix: Bytes::from(config.timer_prefix.clone()),
      gauge_prefix: Bytes::from(config.gauge_prefix.clone()),
      discard_nan_aggregated_values: config.discard_nan_aggregated_values,
      max_num_cached_source_sets: config.max_num_cached_source_sets,
      timer_quantile_eps: config.timer_quantile_eps,
      stream_pool: ObjectPool::new(config.quantile_stream_pool_size),
    }
  }

  #[must_use]
  pub fn prefix(&self, metric_type: MetricType) -> &[u8] {
    match metric_type {
      MetricType::Counter => &self.counter_prefix,
      MetricType::Timer => &self.timer_prefix,
      MetricType::Gauge => &self.gauge_prefix,
    }
  }

  pub fn new_stream(&self, quantiles: &[f64]) -> QuantileStream {
    match self.stream_pool.get() {
      Some(mut stream) => {
        stream.reset(self.timer_quantile_eps, quantiles);
        stream
      },
      None => QuantileStream::new(self.timer_quantile_eps, quantiles.to_vec()),
    }
  }

  pub fn release_stream(&self, stream: QuantileStream) {
    self.stream_pool.put(stream);
  }
}

//
// ElemPools
//

// Free lists of unbound elements, one per metric type.
pub struct ElemPools {
  elem_options: Arc<ElemOptions>,
  counters: ObjectPool<MetricElem>,
  timers: ObjectPool<MetricElem>,
  gauges: ObjectPool<MetricElem>,
}

impl ElemPools {
  #[must_use]
  pub fn new(elem_options: Arc<ElemOptions>, size: usize) -> Self {
    Self {
      elem_options,
      counters: ObjectPool::new(size),
      timers: ObjectPool::new(size),
      gauges: ObjectPool::new(size),
    }
  }

  const fn pool(&self, metric_type: MetricType) -> &ObjectPool<MetricElem> {
    match metric_type {
      MetricType::Counter => &self.counters,
      MetricType::Timer => &self.timers,
      MetricType::Gauge => &self.gauges,
    }
  }

  pub fn get(&self, metric_type: MetricType) -> MetricElem {
    self
      .pool(metric_type)
      .get_or_else(|| MetricElem::new(metric_type, self.elem_options.clone()))
  }

  // Pools an element if this was the last reference to it.
  pub fn release(&self, elem: Arc<MetricElem>) {
    if let Ok(elem) = Arc::try_unwrap(elem) {
      self.put(elem);
    }
  }

  pub fn put(&self, mut elem: MetricElem) {
    elem.reset();
    self.pool(elem.metric_type()).put(elem);
  }

  #[must_use]
  pub fn len(&self, metric_type: MetricType) -> usize {
    self.pool(metric_type).len()
  }
}

//
// Options
//

// Configuration shared by the entries, lists and maps of an aggregator instance.
pub struct Options {
  pub time_provider: Arc<dyn TimeProvider>,
  pub time_lock: Arc<TimeLock>,
  pub entry_ttl: Duration,
  pub entry_check_interval: Duration,
  pub entry_check_batch_percentage: f64,
  pub max_values_per_entry_per_second: i64,
  pub max_new_entries_per_second: i64,
  pub default_storage_policies: Vec<StoragePolicy>,
  pub forwarding_delay_per_hop: Duration,
  pub timed_buffer_past: Duration,
  pub timed_buffer_future: Duration,
  pub elem_options: Arc<ElemOptions>,
  pub elem_pools: ElemPools,
  pub scope: Scope,
  pub(crate) entry_stats: entry::Stats,
}

impl Options {
  pub fn new(
    config: &AggregatorConfig,
    time_provider: Arc<dyn TimeProvider>,
    scope: &Scope,
  ) -> anyhow::Result<Self> {
    config.validate()?;
    let elem_options = Arc::new(ElemOptions::new(config));
    Ok(Self {
      time_provider,
      time_lock: Arc::new(TimeLock::default()),
      entry_ttl: config.entry_ttl.try_into()?,
      entry_check_interval: config.entry_check_interval.try_into()?,
      entry_check_batch_percentage: config.entry_check_batch_percentage,
      max_values_per_entry_per_second: config.max_values_per_entry_per_second,
      max_new_entries_per_second: config.max_new_entries_per_second,
      default_storage_policies: config.default_storage_policies.clone(),
      forwarding_delay_per_hop: config.forwarding_delay_per_hop.try_into()?,
      timed_buffer_past: config.timed_buffer_past.try_into()?,
      timed_buffer_future: config.timed_buffer_future.try_into()?,
      elem_pools: ElemPools::new(elem_options.clone(), config.elem_pool_size),
      elem_options,
      scope: scope.clone(),
      entry_stats: entry::Stats::new(scope),
    })
  }

  // Forwarded metrics get one resolution of lateness, plus some slack for every hop they went
  // through.
  #[must_use]
  pub fn max_allowed_forwarding_delay(
    &self,
    resolution: Duration,
    num_forwarded_times: u32,
  ) -> Duration {
    resolution
      + self
        .forwarding_delay_per_hop
        .saturating_mul(i32::try_from(num_forwarded_times).unwrap_or(i32::MAX))
  }
}
