// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use crate::element::{ConsumeTimeFns, DiscardFlushHandler, FlushHandler, MetricElem};
use crate::flush::{FlushBucket, Flusher};
use crate::options::Options;
use crate::time::{duration_nanos, truncate_nanos};
use bd_server_stats::stats::Scope;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use prometheus::{IntCounter, IntGauge};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use time::Duration;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ListError {
  #[error("metric list is closed")]
  Closed,
}

//
// MetricListId
//

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricListId {
  Standard {
    resolution: Duration,
  },
  Timed {
    resolution: Duration,
  },
  Forwarded {
    resolution: Duration,
    num_forwarded_times: u32,
  },
}

impl MetricListId {
  #[must_use]
  pub const fn resolution(&self) -> Duration {
    match self {
      Self::Standard { resolution }
      | Self::Timed { resolution }
      | Self::Forwarded { resolution, .. } => *resolution,
    }
  }

  const fn consume_time_fns(&self) -> ConsumeTimeFns {
    match self {
      Self::Standard { .. } | Self::Timed { .. } => ConsumeTimeFns::STANDARD,
      Self::Forwarded { .. } => ConsumeTimeFns::FORWARDED,
    }
  }
}

//
// Stats
//

#[derive(Clone, Debug)]
struct Stats {
  flushes: IntCounter,
  discards: IntCounter,
  stale_flushes: IntCounter,
  collected: IntCounter,
  elements: IntGauge,
}

impl Stats {
  fn new(scope: &Scope) -> Self {
    let scope = scope.scope("list");
    Self {
      flushes: scope.counter("flushes"),
      discards: scope.counter("discards"),
      stale_flushes: scope.counter("stale_flushes"),
      collected: scope.counter("collected"),
      elements: scope.gauge("elements"),
    }
  }
}

//
// MetricList
//

// The elements of one shard that are flushed together at one resolution.
pub struct MetricList {
  shard: u32,
  id: MetricListId,
  options: Arc<Options>,
  handler: Arc<dyn FlushHandler>,
  elems: Mutex<Vec<Arc<MetricElem>>>,
  closed: AtomicBool,
  last_flushed_nanos: AtomicI64,
  stats: Stats,
}

impl MetricList {
  fn new(
    shard: u32,
    id: MetricListId,
    options: Arc<Options>,
    handler: Arc<dyn FlushHandler>,
    stats: Stats,
  ) -> Self {
    Self {
      shard,
      id,
      options,
      handler,
      elems: Mutex::new(Vec::new()),
      closed: AtomicBool::new(false),
      last_flushed_nanos: AtomicI64::new(0),
      stats,
    }
  }

  #[must_use]
  pub const fn id(&self) -> MetricListId {
    self.id
  }

  pub fn last_flushed_nanos(&self) -> i64 {
    self.last_flushed_nanos.load(Ordering::Acquire)
  }

  pub fn len(&self) -> usize {
    self.elems.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn push_back(&self, elem: Arc<MetricElem>) -> Result<(), ListError> {
    let mut elems = self.elems.lock();
    if self.closed.load(Ordering::Acquire) {
      return Err(ListError::Closed);
    }
    elems.push(elem);
    self.stats.elements.inc();
    Ok(())
  }

  // Leader path: flushes every window that ended before now. The horizon is chosen while holding
  // the exclusive side of the time lock so that no writer can still stamp a sample into a window
  // that is being flushed. Timed lists lag by the timed buffer since their samples may be stamped
  // that far in the past.
  pub fn flush(&self) {
    let target_nanos = {
      let _time_lock = self.options.time_lock.write();
      let mut now = self.options.time_provider.unix_nanos();
      if matches!(self.id, MetricListId::Timed { .. }) {
        now = now.saturating_sub(duration_nanos(self.options.timed_buffer_past));
      }
      truncate_nanos(now, duration_nanos(self.id.resolution()))
    };
    self.flush_before(target_nanos);
  }

  pub fn flush_before(&self, target_nanos: i64) {
    self.stats.flushes.inc();
    self.consume_before(target_nanos, self.handler.as_ref());
  }

  pub fn discard_before(&self, target_nanos: i64) {
    self.stats.discards.inc();
    self.consume_before(target_nanos, &DiscardFlushHandler::default());
  }

  fn consume_before(&self, target_nanos: i64, handler: &dyn FlushHandler) {
    if target_nanos <= self.last_flushed_nanos() {
      self.stats.stale_flushes.inc();
      return;
    }

    // Consume runs against a snapshot so that pushes are not blocked by the flush.
    let elems = self.elems.lock().clone();
    let time_fns = self.id.consume_time_fns();
    let collected: Vec<Arc<MetricElem>> = elems
      .iter()
      .filter(|elem| elem.consume(target_nanos, time_fns, handler))
      .cloned()
      .collect();
    drop(elems);

    if !collected.is_empty() {
      let to_remove: HashSet<*const MetricElem> = collected.iter().map(Arc::as_ptr).collect();
      self
        .elems
        .lock()
        .retain(|elem| !to_remove.contains(&Arc::as_ptr(elem)));
      self.stats.collected.inc_by(u64::try_from(collected.len()).unwrap_or(u64::MAX));
      self.stats.elements.sub(i64::try_from(collected.len()).unwrap_or(i64::MAX));
      for elem in collected {
        elem.close();
        self.options.elem_pools.release(elem);
      }
    }

    self
      .last_flushed_nanos
      .fetch_max(target_nanos, Ordering::AcqRel);
  }

  // Closes the list and every element in it. Data that was not flushed is dropped.
  pub fn close(&self) {
    let elems = {
      let mut elems = self.elems.lock();
      if self.closed.swap(true, Ordering::AcqRel) {
        return;
      }
      std::mem::take(&mut *elems)
    };
    self.stats.elements.sub(i64::try_from(elems.len()).unwrap_or(i64::MAX));
    for elem in elems {
      elem.close();
      self.options.elem_pools.release(elem);
    }
  }
}

impl Flusher for MetricList {
  fn shard(&self) -> u32 {
    self.shard
  }

  fn list_id(&self) -> MetricListId {
    self.id
  }

  fn discard_before(&self, target_nanos: i64) {
    Self::discard_before(self, target_nanos);
  }
}

//
// MetricLists
//

// The metric lists of one shard, created on demand.
pub struct MetricLists {
  shard: u32,
  options: Arc<Options>,
  handler: Arc<dyn FlushHandler>,
  lists: RwLock<HashMap<MetricListId, Arc<MetricList>>>,
  stats: Stats,
}

impl MetricLists {
  #[must_use]
  pub fn new(shard: u32, options: Arc<Options>, handler: Arc<dyn FlushHandler>) -> Self {
    let stats = Stats::new(&options.scope);
    Self {
      shard,
      options,
      handler,
      lists: RwLock::new(HashMap::new()),
      stats,
    }
  }

  #[must_use]
  pub const fn shard(&self) -> u32 {
    self.shard
  }

  pub fn find_or_create(&self, id: MetricListId) -> Arc<MetricList> {
    if let Some(list) = self.lists.read().get(&id) {
      return list.clone();
    }

    self
      .lists
      .write()
      .entry(id)
      .or_insert_with(|| {
        log::debug!("creating metric list {id:?} for shard {}", self.shard);
        Arc::new(MetricList::new(
          self.shard,
          id,
          self.options.clone(),
          self.handler.clone(),
          self.stats.clone(),
        ))
      })
      .clone()
  }

  pub fn len(&self) -> usize {
    self.lists.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  // Groups the lists by resolution, in ascending resolution order.
  pub fn flush_buckets(&self) -> Vec<FlushBucket> {
    let mut by_interval: HashMap<Duration, Vec<Arc<dyn Flusher>>> = HashMap::new();
    for list in self.lists.read().values() {
      by_interval
        .entry(list.id().resolution())
        .or_default()
        .push(list.clone());
    }
    let mut buckets: Vec<FlushBucket> = by_interval
      .into_iter()
      .map(|(interval, flushers)| FlushBucket { interval, flushers })
      .collect();
    buckets.sort_by_key(|bucket| bucket.interval);
    buckets
  }

  // Leader path: flushes every list.
  pub fn flush(&self) {
    let lists: Vec<Arc<MetricList>> = self.lists.read().values().cloned().collect();
    for list in lists {
      list.flush();
    }
  }

  pub fn close(&self) {
    let lists: Vec<Arc<MetricList>> = self.lists.write().drain().map(|(_, list)| list).collect();
    for list in lists {
      list.close();
    }
  }
}
