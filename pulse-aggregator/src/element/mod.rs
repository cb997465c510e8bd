// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

use crate::aggregation::Aggregation;
use crate::metric::aggregation_type::{AggregationType, AggregationTypes, flush_suffix};
use crate::metric::policy::StoragePolicy;
use crate::metric::{MetricType, MetricUnion};
use crate::options::ElemOptions;
use crate::pipeline::transformation::{Datapoint, TransformKind};
use crate::pipeline::{ParsedPipeline, Pipeline, PipelineError};
use bytes::Bytes;
use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ElemError {
  #[error("element is closed")]
  Closed,
  #[error("aggregation is closed")]
  AggregationClosed,
  #[error("duplicate forwarding source")]
  DuplicateForwardingSource,
  #[error("aggregation types are invalid for {0} metrics")]
  InvalidAggregationTypes(MetricType),
  #[error("{got} value written to {expected} element")]
  MetricTypeMismatch {
    expected: MetricType,
    got: MetricType,
  },
  #[error("invalid pipeline: {0}")]
  InvalidPipeline(#[from] PipelineError),
}

//
// IdPrefixSuffix
//

// Whether flushed IDs get the type prefix and aggregation suffix applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IdPrefixSuffix {
  #[default]
  WithPrefixWithSuffix,
  NoPrefixNoSuffix,
}

//
// ForwardedAggregationKey
//

// Identifies where rolled up values are re-aggregated: the rolled up ID, its aggregation, and the
// pipeline left to apply at the next hop.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ForwardedAggregationKey {
  pub metric_type: MetricType,
  pub id: Bytes,
  pub aggregation_types: AggregationTypes,
  pub storage_policy: StoragePolicy,
  pub pipeline: Pipeline,
  pub num_forwarded_times: u32,
}

//
// LocalMetric
//

// A fully aggregated value emitted by this instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalMetric<'a> {
  pub prefix: &'a [u8],
  pub id: &'a [u8],
  pub suffix: &'a [u8],
  pub time_nanos: i64,
  pub value: f64,
  pub storage_policy: StoragePolicy,
}

//
// FlushHandler
//

// Receives consumed values. Implementations are called with no element or bucket lock held and
// should not block for long.
pub trait FlushHandler: Send + Sync {
  fn flush_local(&self, metric: LocalMetric<'_>);

  fn flush_forwarded(&self, key: &ForwardedAggregationKey, time_nanos: i64, value: f64);

  // Called once per consume of an element with a rollup, whether or not anything was flushed.
  fn on_forwarded_flushed(&self, key: &ForwardedAggregationKey);
}

//
// DiscardFlushHandler
//

// Drops everything. Used when a follower consumes windows that the leader already flushed.
#[derive(Default)]
pub struct DiscardFlushHandler {}

impl FlushHandler for DiscardFlushHandler {
  fn flush_local(&self, _metric: LocalMetric<'_>) {}

  fn flush_forwarded(&self, _key: &ForwardedAggregationKey, _time_nanos: i64, _value: f64) {}

  fn on_forwarded_flushed(&self, _key: &ForwardedAggregationKey) {}
}

//
// ConsumeTimeFns
//

// Decides which windows a consume covers and what timestamp their values are flushed with. Both
// receive the window start and resolution in nanoseconds.
#[derive(Clone, Copy)]
pub struct ConsumeTimeFns {
  pub is_earlier_than: fn(i64, i64, i64) -> bool,
  pub timestamp_nanos: fn(i64, i64) -> i64,
}

impl ConsumeTimeFns {
  // Locally aggregated windows are flushed at their end.
  pub const STANDARD: Self = Self {
    is_earlier_than: |start, _resolution, target| start < target,
    timestamp_nanos: |start, resolution| start + resolution,
  };

  // Forwarded values are already stamped with the end of the upstream window.
  pub const FORWARDED: Self = Self {
    is_earlier_than: |start, _resolution, target| start < target,
    timestamp_nanos: |start, _resolution| start,
  };
}

//
// ElemData
//

// Everything needed to bind a pooled element to an aggregation.
#[derive(Clone, Debug)]
pub struct ElemData {
  pub id: Bytes,
  pub storage_policy: StoragePolicy,
  pub aggregation_types: AggregationTypes,
  pub pipeline: Pipeline,
  pub num_forwarded_times: u32,
  pub id_prefix_suffix: IdPrefixSuffix,
}

//
// LockedAggregation
//

struct LockedAggregation {
  closed: bool,
  sources_seen: Option<HashSet<u32>>,
  aggregation: Option<Aggregation>,
}

//
// TimedAggregation
//

// One window of an element. The aggregation has its own lock so that writers to different windows
// do not contend.
#[derive(Clone)]
struct TimedAggregation {
  start_at_nanos: i64,
  aggregation: Arc<Mutex<LockedAggregation>>,
}

struct LockedElem {
  // Ascending by start time with at most one entry per window.
  values: Vec<TimedAggregation>,
  tombstoned: bool,
  closed: bool,
}

struct ConsumeState {
  // Last non-empty datapoint per resolved aggregation type, only used by derivative
  // transformations.
  last_consumed: Vec<Datapoint>,
  to_consume: Vec<TimedAggregation>,
}

//
// MetricElem
//

// The time bucketed aggregation state for one aggregation key of a metric.
pub struct MetricElem {
  metric_type: MetricType,
  options: Arc<ElemOptions>,

  id: Bytes,
  storage_policy: StoragePolicy,
  aggregation_types: AggregationTypes,
  resolved_types: Vec<AggregationType>,
  use_default_aggregation: bool,
  quantiles: Vec<f64>,
  parsed_pipeline: ParsedPipeline,
  num_forwarded_times: u32,
  id_prefix_suffix: IdPrefixSuffix,
  forwarded_key: Option<ForwardedAggregationKey>,

  locked: RwLock<LockedElem>,
  consume_state: Mutex<ConsumeState>,
  cached_source_sets: Mutex<Vec<HashSet<u32>>>,
}

impl MetricElem {
  #[must_use]
  pub fn new(metric_type: MetricType, options: Arc<ElemOptions>) -> Self {
    Self {
      metric_type,
      options,
      id: Bytes::new(),
      storage_policy: StoragePolicy::default(),
      aggregation_types: AggregationTypes::default(),
      resolved_types: Vec::new(),
      use_default_aggregation: true,
      quantiles: Vec::new(),
      parsed_pipeline: ParsedPipeline::default(),
      num_forwarded_times: 0,
      id_prefix_suffix: IdPrefixSuffix::default(),
      forwarded_key: None,
      locked: RwLock::new(LockedElem {
        values: Vec::new(),
        tombstoned: false,
        closed: false,
      }),
      consume_state: Mutex::new(ConsumeState {
        last_consumed: Vec::new(),
        to_consume: Vec::new(),
      }),
      cached_source_sets: Mutex::new(Vec::new()),
    }
  }

  // Binds the element to a new aggregation. On failure the element is left reset and unbound.
  pub fn reset_set_data(&mut self, data: ElemData) -> Result<(), ElemError> {
    self.reset();
    if !data.aggregation_types.is_valid_for(self.metric_type) {
      return Err(ElemError::InvalidAggregationTypes(self.metric_type));
    }
    let parsed_pipeline = ParsedPipeline::parse(&data.pipeline)?;

    self.resolved_types = data
      .aggregation_types
      .resolve(self.metric_type)
      .to_vec();
    self.use_default_aggregation = data.aggregation_types.is_default();
    self.quantiles = if self.metric_type == MetricType::Timer {
      data.aggregation_types.quantiles(self.metric_type)
    } else {
      Vec::new()
    };
    if parsed_pipeline.has_derivative_transform {
      let state = self.consume_state.get_mut();
      state.last_consumed.clear();
      state
        .last_consumed
        .resize(self.resolved_types.len(), Datapoint::empty());
    }
    self.forwarded_key = parsed_pipeline
      .rollup
      .as_ref()
      .map(|rollup| ForwardedAggregationKey {
        metric_type: self.metric_type,
        id: rollup.new_name.clone(),
        aggregation_types: rollup.aggregation_types.clone(),
        storage_policy: data.storage_policy,
        pipeline: parsed_pipeline.remainder.clone(),
        num_forwarded_times: data.num_forwarded_times + 1,
      });

    self.id = data.id;
    self.storage_policy = data.storage_policy;
    self.aggregation_types = data.aggregation_types;
    self.parsed_pipeline = parsed_pipeline;
    self.num_forwarded_times = data.num_forwarded_times;
    self.id_prefix_suffix = data.id_prefix_suffix;
    Ok(())
  }

  // Clears all identity and window state so the element can be pooled.
  pub fn reset(&mut self) {
    self.close();
    self.id = Bytes::new();
    self.storage_policy = StoragePolicy::default();
    self.aggregation_types = AggregationTypes::default();
    self.resolved_types.clear();
    self.use_default_aggregation = true;
    self.quantiles.clear();
    self.parsed_pipeline = ParsedPipeline::default();
    self.num_forwarded_times = 0;
    self.id_prefix_suffix = IdPrefixSuffix::default();
    self.forwarded_key = None;

    let locked = self.locked.get_mut();
    locked.tombstoned = false;
    locked.closed = false;
    let state = self.consume_state.get_mut();
    state.last_consumed.clear();
    state.to_consume.clear();
  }

  #[must_use]
  pub const fn metric_type(&self) -> MetricType {
    self.metric_type
  }

  #[must_use]
  pub const fn id(&self) -> &Bytes {
    &self.id
  }

  #[must_use]
  pub const fn storage_policy(&self) -> StoragePolicy {
    self.storage_policy
  }

  #[must_use]
  pub const fn aggregation_types(&self) -> &AggregationTypes {
    &self.aggregation_types
  }

  #[must_use]
  pub const fn num_forwarded_times(&self) -> u32 {
    self.num_forwarded_times
  }

  #[must_use]
  pub const fn forwarded_aggregation_key(&self) -> Option<&ForwardedAggregationKey> {
    self.forwarded_key.as_ref()
  }

  pub fn is_tombstoned(&self) -> bool {
    self.locked.read().tombstoned
  }

  pub fn is_closed(&self) -> bool {
    self.locked.read().closed
  }

  pub fn add_union(&self, time_nanos: i64, metric: &MetricUnion) -> Result<(), ElemError> {
    if metric.metric_type() != self.metric_type {
      return Err(ElemError::MetricTypeMismatch {
        expected: self.metric_type,
        got: metric.metric_type(),
      });
    }

    let aggregation = self.find_or_create(time_nanos, false)?;
    let mut locked = aggregation.lock();
    if locked.closed {
      return Err(ElemError::AggregationClosed);
    }
    if let Some(aggregation) = &mut locked.aggregation {
      aggregation.add_union(time_nanos, &metric.value);
    }
    Ok(())
  }

  pub fn add_value(&self, time_nanos: i64, value: f64) -> Result<(), ElemError> {
    let aggregation = self.find_or_create(time_nanos, false)?;
    let mut locked = aggregation.lock();
    if locked.closed {
      return Err(ElemError::AggregationClosed);
    }
    if let Some(aggregation) = &mut locked.aggregation {
      aggregation.add_value(time_nanos, value);
    }
    Ok(())
  }

  // Applies the values at most once per source within a window.
  pub fn add_unique(
    &self,
    time_nanos: i64,
    values: &[f64],
    source_id: u32,
  ) -> Result<(), ElemError> {
    let aggregation = self.find_or_create(time_nanos, true)?;
    let mut locked = aggregation.lock();
    let LockedAggregation {
      closed,
      sources_seen,
      aggregation,
    } = &mut *locked;
    if *closed {
      return Err(ElemError::AggregationClosed);
    }
    let sources_seen = sources_seen.get_or_insert_with(|| self.take_source_set());
    if !sources_seen.insert(source_id) {
      return Err(ElemError::DuplicateForwardingSource);
    }
    if let Some(aggregation) = aggregation {
      for value in values {
        aggregation.add_value(time_nanos, *value);
      }
    }
    Ok(())
  }

  fn find_or_create(
    &self,
    time_nanos: i64,
    track_sources: bool,
  ) -> Result<Arc<Mutex<LockedAggregation>>, ElemError> {
    let start_at_nanos = self.storage_policy.aligned_start(time_nanos);
    {
      let locked = self.locked.read();
      if locked.closed {
        return Err(ElemError::Closed);
      }
      if let Ok(index) = Self::index_of(&locked.values, start_at_nanos) {
        return Ok(locked.values[index].aggregation.clone());
      }
    }

    let mut locked = self.locked.write();
    if locked.closed {
      return Err(ElemError::Closed);
    }
    match Self::index_of(&locked.values, start_at_nanos) {
      Ok(index) => Ok(locked.values[index].aggregation.clone()),
      Err(index) => {
        let aggregation = Arc::new(Mutex::new(LockedAggregation {
          closed: false,
          sources_seen: track_sources.then(|| self.take_source_set()),
          aggregation: Some(self.new_aggregation()),
        }));
        locked.values.insert(
          index,
          TimedAggregation {
            start_at_nanos,
            aggregation: aggregation.clone(),
          },
        );
        Ok(aggregation)
      },
    }
  }

  // Most writes land in the latest window so it is checked before searching.
  fn index_of(values: &[TimedAggregation], start_at_nanos: i64) -> Result<usize, usize> {
    match values.last() {
      None => Err(0),
      Some(last) if last.start_at_nanos == start_at_nanos => Ok(values.len() - 1),
      Some(last) if last.start_at_nanos < start_at_nanos => Err(values.len()),
      Some(_) => values.binary_search_by_key(&start_at_nanos, |v| v.start_at_nanos),
    }
  }

  fn new_aggregation(&self) -> Aggregation {
    let stream = (!self.quantiles.is_empty()).then(|| self.options.new_stream(&self.quantiles));
    Aggregation::new(self.metric_type, stream)
  }

  fn take_source_set(&self) -> HashSet<u32> {
    self.cached_source_sets.lock().pop().unwrap_or_default()
  }

  fn return_source_set(&self, mut sources: HashSet<u32>) {
    let mut cached = self.cached_source_sets.lock();
    if cached.len() < self.options.max_num_cached_source_sets {
      sources.clear();
      cached.push(sources);
    }
  }

  // Removes every window that is earlier than the target and flushes its values. Windows are
  // detached under the element lock and processed after it is released so that slow flushes never
  // block writers. Returns true if the element is tombstoned and fully drained.
  pub fn consume(
    &self,
    target_nanos: i64,
    time_fns: ConsumeTimeFns,
    handler: &dyn FlushHandler,
  ) -> bool {
    let resolution_nanos = self.storage_policy.resolution_nanos();
    let mut state = self.consume_state.lock();
    let can_collect = {
      let mut locked = self.locked.write();
      let num_earlier = locked.values.partition_point(|v| {
        (time_fns.is_earlier_than)(v.start_at_nanos, resolution_nanos, target_nanos)
      });
      state.to_consume.extend(locked.values.drain(.. num_earlier));
      locked.values.is_empty() && locked.tombstoned
    };

    let mut to_consume = std::mem::take(&mut state.to_consume);
    for timed in to_consume.drain(..) {
      let (aggregation, sources_seen) = {
        let mut locked = timed.aggregation.lock();
        locked.closed = true;
        (locked.aggregation.take(), locked.sources_seen.take())
      };

      if let Some(mut aggregation) = aggregation {
        let time_nanos = (time_fns.timestamp_nanos)(timed.start_at_nanos, resolution_nanos);
        self.process_value(&mut state, time_nanos, &mut aggregation, handler);
        if let Some(stream) = aggregation.close() {
          self.options.release_stream(stream);
        }
      }
      if let Some(sources_seen) = sources_seen {
        self.return_source_set(sources_seen);
      }
    }
    state.to_consume = to_consume;

    if let Some(key) = &self.forwarded_key {
      handler.on_forwarded_flushed(key);
    }
    can_collect
  }

  fn process_value(
    &self,
    state: &mut ConsumeState,
    time_nanos: i64,
    aggregation: &mut Aggregation,
    handler: &dyn FlushHandler,
  ) {
    let resolution_nanos = self.storage_policy.resolution_nanos();
    for (index, aggregation_type) in self.resolved_types.iter().enumerate() {
      let mut datapoint = Datapoint {
        time_nanos,
        value: aggregation.value_of(*aggregation_type),
      };
      let mut extra = None;
      for transformation in &self.parsed_pipeline.transformations {
        match transformation.kind() {
          TransformKind::Unary => datapoint = transformation.apply_unary(datapoint),
          TransformKind::Binary => {
            let current = datapoint;
            datapoint = transformation.apply_binary(state.last_consumed[index], current);
            if !current.is_empty() {
              state.last_consumed[index] = current;
            }
          },
          TransformKind::UnaryMulti => {
            let (first, second) = transformation.apply_unary_multi(datapoint, resolution_nanos);
            datapoint = first;
            extra = second;
          },
        }
      }

      for datapoint in std::iter::once(datapoint).chain(extra) {
        if datapoint.is_empty() && self.options.discard_nan_aggregated_values {
          continue;
        }
        self.flush_datapoint(*aggregation_type, datapoint, handler);
      }
    }
  }

  fn flush_datapoint(
    &self,
    aggregation_type: AggregationType,
    datapoint: Datapoint,
    handler: &dyn FlushHandler,
  ) {
    if let Some(key) = &self.forwarded_key {
      handler.flush_forwarded(key, datapoint.time_nanos, datapoint.value);
      return;
    }

    let (prefix, suffix) = match self.id_prefix_suffix {
      IdPrefixSuffix::WithPrefixWithSuffix => (
        self.options.prefix(self.metric_type),
        flush_suffix(
          self.metric_type,
          aggregation_type,
          self.use_default_aggregation,
        )
        .as_bytes(),
      ),
      IdPrefixSuffix::NoPrefixNoSuffix => (&[][..], &[][..]),
    };
    handler.flush_local(LocalMetric {
      prefix,
      id: &self.id,
      suffix,
      time_nanos: datapoint.time_nanos,
      value: datapoint.value,
      storage_policy: self.storage_policy,
    });
  }

  // Stops accepting data for new keys. Existing windows keep draining through consume.
  pub fn mark_as_tombstoned(&self) {
    self.locked.write().tombstoned = true;
  }

  // Idempotent. Releases all windows without flushing them.
  pub fn close(&self) {
    let values = {
      let mut locked = self.locked.write();
      if locked.closed {
        return;
      }
      locked.closed = true;
      std::mem::take(&mut locked.values)
    };

    for timed in values {
      let mut locked = timed.aggregation.lock();
      locked.closed = true;
      if let Some(stream) = locked.aggregation.take().and_then(Aggregation::close) {
        self.options.release_stream(stream);
      }
      if let Some(sources_seen) = locked.sources_seen.take() {
        self.return_source_set(sources_seen);
      }
    }
  }

  #[cfg(test)]
  fn window_starts(&self) -> Vec<i64> {
    self
      .locked
      .read()
      .values
      .iter()
      .map(|v| v.start_at_nanos)
      .collect()
  }
}
