// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

use crate::element::{ElemData, ElemError, IdPrefixSuffix, MetricElem};
use crate::list::{ListError, MetricListId, MetricLists};
use crate::metric::aggregation_type::AggregationTypes;
use crate::metric::metadata::{
  ForwardMetadata,
  Metadata,
  StagedMetadata,
  StagedMetadatas,
  TimedMetadata,
};
use crate::metric::policy::StoragePolicy;
use crate::metric::{ForwardedMetric, MetricType, MetricUnion, TimedMetric};
use crate::options::Options;
use crate::pipeline::Pipeline;
use crate::rate_limiter::RateLimiter;
use crate::time::duration_nanos;
use bd_server_stats::stats::Scope;
use bit_set::BitSet;
use bytes::Bytes;
use itertools::Itertools;
use parking_lot::{RwLock, RwLockWriteGuard};
use prometheus::IntCounter;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum EntryError {
  #[error("entry is closed")]
  Closed,
  #[error("entry is rate limited")]
  RateLimited,
  #[error("no applicable metadata")]
  NoApplicableMetadata,
  #[error("no pipelines in metadata")]
  NoPipelines,
  #[error("arrived too late: timestamp {time_nanos} is before cutoff {cutoff_nanos}")]
  ArrivedTooLate { time_nanos: i64, cutoff_nanos: i64 },
  #[error("too far in past: timestamp {time_nanos} is before cutoff {cutoff_nanos}")]
  TooFarInPast { time_nanos: i64, cutoff_nanos: i64 },
  #[error("too far in future: timestamp {time_nanos} is after cutoff {cutoff_nanos}")]
  TooFarInFuture { time_nanos: i64, cutoff_nanos: i64 },
  #[error(transparent)]
  Elem(#[from] ElemError),
  #[error(transparent)]
  List(#[from] ListError),
  #[error("{0}")]
  Multiple(MultiError),
}

//
// MultiError
//

// Errors from writing one sample to several elements. A failing element never stops the others.
#[derive(Debug, PartialEq)]
pub struct MultiError(pub Vec<EntryError>);

impl MultiError {
  fn into_result(mut errors: Vec<EntryError>) -> Result<(), EntryError> {
    match errors.len() {
      0 => Ok(()),
      1 => Err(errors.remove(0)),
      _ => Err(EntryError::Multiple(Self(errors))),
    }
  }
}

impl fmt::Display for MultiError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} errors: [{}]", self.0.len(), self.0.iter().join(", "))
  }
}

//
// Stats
//

#[derive(Clone, Debug)]
pub(crate) struct Stats {
  rate_limited: IntCounter,
  no_applicable_metadata: IntCounter,
  tombstoned_metadata: IntCounter,
  no_pipelines: IntCounter,
  stale_metadata: IntCounter,
  metadata_updates: IntCounter,
  arrived_too_late: IntCounter,
  duplicate_sources: IntCounter,
  timed_too_far_in_past: IntCounter,
  timed_too_far_in_future: IntCounter,
}

impl Stats {
  pub(crate) fn new(scope: &Scope) -> Self {
    let scope = scope.scope("entry");
    Self {
      rate_limited: scope.counter("rate_limited"),
      no_applicable_metadata: scope.counter("no_applicable_metadata"),
      tombstoned_metadata: scope.counter("tombstoned_metadata"),
      no_pipelines: scope.counter("no_pipelines"),
      stale_metadata: scope.counter("stale_metadata"),
      metadata_updates: scope.counter("metadata_updates"),
      arrived_too_late: scope.counter("arrived_too_late"),
      duplicate_sources: scope.counter("duplicate_sources"),
      timed_too_far_in_past: scope.counter("timed_too_far_in_past"),
      timed_too_far_in_future: scope.counter("timed_too_far_in_future"),
    }
  }
}

//
// AggregationKey
//

// What an element of an entry aggregates: every distinct key gets its own element.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AggregationKey {
  pub aggregation_types: AggregationTypes,
  pub storage_policy: StoragePolicy,
  pub pipeline: Pipeline,
  pub num_forwarded_times: u32,
}

#[derive(Clone)]
struct BoundElem {
  key: AggregationKey,
  elem: Arc<MetricElem>,
}

struct LockedEntry {
  closed: bool,
  has_default_metadatas: bool,
  cutover_nanos: i64,
  aggregations: Vec<BoundElem>,
}

//
// Entry
//

// The aggregation state of one metric ID: which elements its samples go to, and the metadata
// version those bindings were built from.
pub struct Entry {
  options: Arc<Options>,
  lists: Arc<MetricLists>,
  rate_limiter: RateLimiter,
  num_writers: AtomicI32,
  last_access_nanos: AtomicI64,
  locked: RwLock<LockedEntry>,
}

impl Entry {
  #[must_use]
  pub fn new(lists: Arc<MetricLists>, options: Arc<Options>) -> Self {
    let now = options.time_provider.unix_nanos();
    Self {
      rate_limiter: RateLimiter::new(options.max_values_per_entry_per_second),
      num_writers: AtomicI32::new(0),
      last_access_nanos: AtomicI64::new(now),
      locked: RwLock::new(LockedEntry {
        closed: false,
        has_default_metadatas: false,
        cutover_nanos: 0,
        aggregations: Vec::new(),
      }),
      options,
      lists,
    }
  }

  pub fn inc_writer(&self) {
    self.num_writers.fetch_add(1, Ordering::AcqRel);
  }

  pub fn dec_writer(&self) {
    self.num_writers.fetch_sub(1, Ordering::AcqRel);
  }

  pub fn num_writers(&self) -> i32 {
    self.num_writers.load(Ordering::Acquire)
  }

  fn stats(&self) -> &Stats {
    &self.options.entry_stats
  }

  fn check_rate_limit(&self, num_values: usize, now_nanos: i64) -> Result<(), EntryError> {
    let units = i64::try_from(num_values).unwrap_or(i64::MAX);
    if self.rate_limiter.is_allowed(units, now_nanos) {
      return Ok(());
    }
    self.stats().rate_limited.inc();
    Err(EntryError::RateLimited)
  }

  // Adds a raw sample, stamped with the current time, to every element bound by the active
  // metadata.
  pub fn add_untimed(
    &self,
    metric: &MetricUnion,
    metadatas: &StagedMetadatas,
  ) -> Result<(), EntryError> {
    // Held until the sample is written so that no flusher can pick a horizon past its timestamp.
    let _time_lock = self.options.time_lock.read();
    let now = self.options.time_provider.unix_nanos();
    self.last_access_nanos.store(now, Ordering::Release);
    self.check_rate_limit(metric.num_values(), now)?;

    if metadatas.is_default() {
      let locked = self.locked.read();
      if locked.closed {
        return Err(EntryError::Closed);
      }
      if locked.has_default_metadatas {
        return Self::add_untimed_with_lock(&locked, now, metric);
      }
    }

    let Some(staged) = metadatas.active_at(now) else {
      self.stats().no_applicable_metadata.inc();
      return Err(EntryError::NoApplicableMetadata);
    };
    if staged.tombstoned {
      // The ID may still be written through another source, so this is not an error.
      self.stats().tombstoned_metadata.inc();
      return Ok(());
    }
    if staged.metadata.pipelines.is_empty() {
      self.stats().no_pipelines.inc();
      return Err(EntryError::NoPipelines);
    }

    {
      let locked = self.locked.read();
      if locked.closed {
        return Err(EntryError::Closed);
      }
      if !self.should_update(&locked, staged) {
        return Self::add_untimed_with_lock(&locked, now, metric);
      }
    }

    let mut locked = self.locked.write();
    if locked.closed {
      return Err(EntryError::Closed);
    }
    if self.should_update(&locked, staged) {
      self.update_staged_metadata(&mut locked, metric, metadatas.is_default(), staged)?;
    }
    Self::add_untimed_with_lock(&locked, now, metric)
  }

  fn add_untimed_with_lock(
    locked: &LockedEntry,
    now_nanos: i64,
    metric: &MetricUnion,
  ) -> Result<(), EntryError> {
    let errors = locked
      .aggregations
      .iter()
      .filter_map(|bound| bound.elem.add_union(now_nanos, metric).err())
      .map(EntryError::from)
      .collect();
    MultiError::into_result(errors)
  }

  // Whether the bindings must be rebuilt for the staged metadata. Stale metadata never is.
  fn should_update(&self, locked: &LockedEntry, staged: &StagedMetadata) -> bool {
    if staged.cutover_nanos < locked.cutover_nanos {
      self.stats().stale_metadata.inc();
      return false;
    }
    if staged.cutover_nanos > locked.cutover_nanos || locked.aggregations.is_empty() {
      return true;
    }

    let mut referenced = BitSet::with_capacity(locked.aggregations.len());
    for key in self.aggregation_keys(&staged.metadata) {
      let Some(index) = locked.aggregations.iter().position(|bound| bound.key == key) else {
        return true;
      };
      referenced.insert(index);
    }
    referenced.len() != locked.aggregations.len()
  }

  // The distinct keys described by the metadata. Pipelines without storage policies use the
  // configured defaults.
  fn aggregation_keys(&self, metadata: &Metadata) -> Vec<AggregationKey> {
    let mut keys: Vec<AggregationKey> = Vec::new();
    for pipeline in &metadata.pipelines {
      let storage_policies = if pipeline.storage_policies.is_empty() {
        &self.options.default_storage_policies
      } else {
        &pipeline.storage_policies
      };
      for storage_policy in storage_policies {
        let key = AggregationKey {
          aggregation_types: pipeline.aggregation_types.clone(),
          storage_policy: *storage_policy,
          pipeline: pipeline.pipeline.clone(),
          num_forwarded_times: 0,
        };
        if !keys.contains(&key) {
          keys.push(key);
        }
      }
    }
    keys
  }

  // Rebinds the entry to the staged metadata. Elements are reused for keys that did not change and
  // tombstoned for keys that went away. If any new element cannot be created the previous bindings
  // are kept.
  fn update_staged_metadata(
    &self,
    locked: &mut LockedEntry,
    metric: &MetricUnion,
    has_default_metadatas: bool,
    staged: &StagedMetadata,
  ) -> Result<(), EntryError> {
    let keys = self.aggregation_keys(&staged.metadata);
    let mut aggregations = Vec::with_capacity(keys.len());
    let mut created: Vec<Arc<MetricElem>> = Vec::new();
    for key in keys {
      if let Some(existing) = locked.aggregations.iter().find(|bound| bound.key == key) {
        aggregations.push(existing.clone());
        continue;
      }

      let list_id = MetricListId::Standard {
        resolution: key.storage_policy.resolution(),
      };
      match self.new_elem(
        metric.metric_type(),
        &metric.id,
        &key,
        IdPrefixSuffix::WithPrefixWithSuffix,
        list_id,
      ) {
        Ok(elem) => {
          created.push(elem.clone());
          aggregations.push(BoundElem { key, elem });
        },
        Err(e) => {
          log::debug!("failed to bind {:?} for {:?}: {e}", key, metric.id);
          for elem in created {
            elem.mark_as_tombstoned();
          }
          return Err(e);
        },
      }
    }

    for bound in &locked.aggregations {
      if !aggregations
        .iter()
        .any(|kept| Arc::ptr_eq(&kept.elem, &bound.elem))
      {
        bound.elem.mark_as_tombstoned();
      }
    }
    locked.aggregations = aggregations;
    locked.cutover_nanos = staged.cutover_nanos;
    locked.has_default_metadatas = has_default_metadatas;
    self.stats().metadata_updates.inc();
    Ok(())
  }

  // Takes an element from the pool, binds it to the key, and adds it to its list.
  fn new_elem(
    &self,
    metric_type: MetricType,
    id: &Bytes,
    key: &AggregationKey,
    id_prefix_suffix: IdPrefixSuffix,
    list_id: MetricListId,
  ) -> Result<Arc<MetricElem>, EntryError> {
    let mut elem = self.options.elem_pools.get(metric_type);
    if let Err(e) = elem.reset_set_data(ElemData {
      id: id.clone(),
      storage_policy: key.storage_policy,
      aggregation_types: key.aggregation_types.clone(),
      pipeline: key.pipeline.clone(),
      num_forwarded_times: key.num_forwarded_times,
      id_prefix_suffix,
    }) {
      self.options.elem_pools.put(elem);
      return Err(e.into());
    }

    let elem = Arc::new(elem);
    if let Err(e) = self.lists.find_or_create(list_id).push_back(elem.clone()) {
      elem.close();
      self.options.elem_pools.release(elem);
      return Err(e.into());
    }
    Ok(elem)
  }

  // Adds a value aggregated by an upstream hop. Forwarded entries are bound to exactly one key, the
  // one described by the latest forward metadata.
  pub fn add_forwarded(
    &self,
    metric: &ForwardedMetric,
    metadata: &ForwardMetadata,
  ) -> Result<(), EntryError> {
    let now = self.options.time_provider.unix_nanos();
    self.last_access_nanos.store(now, Ordering::Release);
    self.check_rate_limit(metric.values.len(), now)?;

    let max_delay = self.options.max_allowed_forwarding_delay(
      metadata.storage_policy.resolution(),
      metadata.num_forwarded_times,
    );
    let cutoff_nanos = now.saturating_sub(duration_nanos(max_delay));
    if metric.time_nanos < cutoff_nanos {
      self.stats().arrived_too_late.inc();
      return Err(EntryError::ArrivedTooLate {
        time_nanos: metric.time_nanos,
        cutoff_nanos,
      });
    }

    let key = AggregationKey {
      aggregation_types: metadata.aggregation_types.clone(),
      storage_policy: metadata.storage_policy,
      pipeline: metadata.pipeline.clone(),
      num_forwarded_times: metadata.num_forwarded_times,
    };
    let list_id = MetricListId::Forwarded {
      resolution: key.storage_policy.resolution(),
      num_forwarded_times: key.num_forwarded_times,
    };
    self.with_single_binding(
      key,
      metric.metric_type,
      &metric.id,
      IdPrefixSuffix::NoPrefixNoSuffix,
      list_id,
      |elem| self.add_forwarded_to(elem, metric, metadata.source_id),
    )
  }

  // Adds a sample carrying its own timestamp. The timestamp must fall within the timed buffer
  // around now. Timed entries are bound to exactly one key, the one from the latest metadata.
  pub fn add_timed(
    &self,
    metric: &TimedMetric,
    metadata: &TimedMetadata,
  ) -> Result<(), EntryError> {
    let now = self.options.time_provider.unix_nanos();
    self.last_access_nanos.store(now, Ordering::Release);
    self.check_rate_limit(1, now)?;

    let past_cutoff_nanos = now.saturating_sub(duration_nanos(self.options.timed_buffer_past));
    if metric.time_nanos < past_cutoff_nanos {
      self.stats().timed_too_far_in_past.inc();
      return Err(EntryError::TooFarInPast {
        time_nanos: metric.time_nanos,
        cutoff_nanos: past_cutoff_nanos,
      });
    }
    let future_cutoff_nanos = now.saturating_add(duration_nanos(self.options.timed_buffer_future));
    if metric.time_nanos > future_cutoff_nanos {
      self.stats().timed_too_far_in_future.inc();
      return Err(EntryError::TooFarInFuture {
        time_nanos: metric.time_nanos,
        cutoff_nanos: future_cutoff_nanos,
      });
    }

    let key = AggregationKey {
      aggregation_types: metadata.aggregation_types.clone(),
      storage_policy: metadata.storage_policy,
      pipeline: Pipeline::default(),
      num_forwarded_times: 0,
    };
    let list_id = MetricListId::Timed {
      resolution: key.storage_policy.resolution(),
    };
    self.with_single_binding(
      key,
      metric.metric_type,
      &metric.id,
      IdPrefixSuffix::WithPrefixWithSuffix,
      list_id,
      |elem| Ok(elem.add_value(metric.time_nanos, metric.value)?),
    )
  }

  // Finds the element bound to key, replacing any other binding when the key changed, and runs f
  // on it under the shared lock.
  fn with_single_binding(
    &self,
    key: AggregationKey,
    metric_type: MetricType,
    id: &Bytes,
    id_prefix_suffix: IdPrefixSuffix,
    list_id: MetricListId,
    f: impl FnOnce(&MetricElem) -> Result<(), EntryError>,
  ) -> Result<(), EntryError> {
    {
      let locked = self.locked.read();
      if locked.closed {
        return Err(EntryError::Closed);
      }
      if let Some(bound) = locked.aggregations.iter().find(|bound| bound.key == key) {
        return f(&bound.elem);
      }
    }

    let mut locked = self.locked.write();
    if locked.closed {
      return Err(EntryError::Closed);
    }
    if !locked.aggregations.iter().any(|bound| bound.key == key) {
      let elem = self.new_elem(metric_type, id, &key, id_prefix_suffix, list_id)?;
      for bound in locked.aggregations.drain(..) {
        bound.elem.mark_as_tombstoned();
      }
      locked.aggregations.push(BoundElem {
        key: key.clone(),
        elem,
      });
      locked.has_default_metadatas = false;
      self.stats().metadata_updates.inc();
    }
    let locked = RwLockWriteGuard::downgrade(locked);
    match locked.aggregations.iter().find(|bound| bound.key == key) {
      Some(bound) => f(&bound.elem),
      None => Err(EntryError::Closed),
    }
  }

  fn add_forwarded_to(
    &self,
    elem: &MetricElem,
    metric: &ForwardedMetric,
    source_id: u32,
  ) -> Result<(), EntryError> {
    match elem.add_unique(metric.time_nanos, &metric.values, source_id) {
      Ok(()) => Ok(()),
      Err(ElemError::DuplicateForwardingSource) => {
        self.stats().duplicate_sources.inc();
        Ok(())
      },
      Err(e) => Err(e.into()),
    }
  }

  fn is_expired(&self, now_nanos: i64) -> bool {
    let last_access_nanos = self.last_access_nanos.load(Ordering::Acquire);
    now_nanos - last_access_nanos > duration_nanos(self.options.entry_ttl)
  }

  // Unlocked check. Must be confirmed with try_expire.
  pub fn should_expire(&self, now_nanos: i64) -> bool {
    self.num_writers() == 0 && self.is_expired(now_nanos)
  }

  // Expires the entry if it is still idle, tombstoning every element it is bound to.
  pub fn try_expire(&self, now_nanos: i64) -> bool {
    let mut locked = self.locked.write();
    if locked.closed || !self.should_expire(now_nanos) {
      return false;
    }
    Self::close_with_lock(&mut locked);
    true
  }

  pub fn close(&self) {
    let mut locked = self.locked.write();
    if !locked.closed {
      Self::close_with_lock(&mut locked);
    }
  }

  fn close_with_lock(locked: &mut LockedEntry) {
    locked.closed = true;
    locked.has_default_metadatas = false;
    locked.cutover_nanos = 0;
    for bound in locked.aggregations.drain(..) {
      bound.elem.mark_as_tombstoned();
    }
  }

  pub fn is_closed(&self) -> bool {
    self.locked.read().closed
  }

  #[cfg(test)]
  fn bound_keys(&self) -> Vec<AggregationKey> {
    self
      .locked
      .read()
      .aggregations
      .iter()
      .map(|bound| bound.key.clone())
      .collect()
  }

  #[cfg(test)]
  fn bound_elems(&self) -> Vec<Arc<MetricElem>> {
    self
      .locked
      .read()
      .aggregations
      .iter()
      .map(|bound| bound.elem.clone())
      .collect()
  }
}
