// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use crate::entry::{Entry, EntryError};
use crate::list::MetricLists;
use crate::metric::metadata::{ForwardMetadata, StagedMetadatas, TimedMetadata};
use crate::metric::{ForwardedMetric, MetricType, MetricUnion, TimedMetric, hash_id};
use crate::num::{LossyFloatToInt, LossyIntToFloat};
use crate::options::Options;
use crate::rate_limiter::RateLimiter;
use crate::slab_list::{SlabHandle, SlabList};
use bd_server_stats::stats::Scope;
use bd_shutdown::ComponentShutdown;
use bd_time::TimeDurationExt;
use hashbrown::HashMap;
use parking_lot::RwLock;
use prometheus::{IntCounter, IntGauge};
use std::ops::Deref;
use std::sync::Arc;
use time::Duration;
use tokio::time::Instant;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum MapError {
  #[error("metric map is closed")]
  Closed,
  #[error("new entry is rate limited")]
  NewEntryRateLimited,
  #[error(transparent)]
  Entry(#[from] EntryError),
}

//
// EntryKey
//

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryCategory {
  Untimed,
  Timed,
  Forwarded,
}

// Identifies an entry within a map. Untimed, timed and forwarded writes for the same ID are kept
// apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntryKey {
  pub category: EntryCategory,
  pub metric_type: MetricType,
  pub id_hash: u128,
}

impl EntryKey {
  #[must_use]
  pub fn untimed(metric: &MetricUnion) -> Self {
    Self {
      category: EntryCategory::Untimed,
      metric_type: metric.metric_type(),
      id_hash: hash_id(&metric.id),
    }
  }

  #[must_use]
  pub fn timed(metric: &TimedMetric) -> Self {
    Self {
      category: EntryCategory::Timed,
      metric_type: metric.metric_type,
      id_hash: hash_id(&metric.id),
    }
  }

  #[must_use]
  pub fn forwarded(metric: &ForwardedMetric) -> Self {
    Self {
      category: EntryCategory::Forwarded,
      metric_type: metric.metric_type,
      id_hash: hash_id(&metric.id),
    }
  }
}

//
// ActiveEntry
//

// An entry with a registered writer. The writer is released on drop, after which the entry may be
// expired.
pub struct ActiveEntry {
  entry: Arc<Entry>,
}

impl ActiveEntry {
  fn new(entry: Arc<Entry>) -> Self {
    entry.inc_writer();
    Self { entry }
  }
}

impl Deref for ActiveEntry {
  type Target = Entry;

  fn deref(&self) -> &Entry {
    &self.entry
  }
}

impl Drop for ActiveEntry {
  fn drop(&mut self) {
    self.entry.dec_writer();
  }
}

//
// Stats
//

struct Stats {
  entries: IntGauge,
  new_entries: IntCounter,
  new_entries_rate_limited: IntCounter,
  expired: IntCounter,
}

impl Stats {
  fn new(scope: &Scope) -> Self {
    let scope = scope.scope("map");
    Self {
      entries: scope.gauge("entries"),
      new_entries: scope.counter("new_entries"),
      new_entries_rate_limited: scope.counter("new_entries_rate_limited"),
      expired: scope.counter("expired"),
    }
  }
}

//
// MapState
//

// The index and the eviction list always hold the same entries.
#[derive(Default)]
struct MapState {
  closed: bool,
  index: HashMap<EntryKey, SlabHandle>,
  entries: SlabList<(EntryKey, Arc<Entry>)>,
}

impl MapState {
  fn lookup(&self, key: &EntryKey) -> Option<&Arc<Entry>> {
    self
      .index
      .get(key)
      .and_then(|handle| self.entries.get(*handle))
      .map(|(_, entry)| entry)
  }

  // Checks up to batch_size entries starting at the cursor. Returns the expiry candidates and the
  // first entry after the batch, or None if the cursor no longer exists.
  fn scan(
    &self,
    cursor: SlabHandle,
    batch_size: usize,
    now_nanos: i64,
  ) -> Option<(Vec<SlabHandle>, Option<SlabHandle>)> {
    self.entries.get(cursor)?;

    let mut candidates = Vec::new();
    let mut next = Some(cursor);
    for _ in 0 .. batch_size {
      let Some(handle) = next else {
        break;
      };
      if self
        .entries
        .get(handle)
        .is_some_and(|(_, entry)| entry.should_expire(now_nanos))
      {
        candidates.push(handle);
      }
      next = self.entries.next(handle);
    }
    Some((candidates, next))
  }

  fn remove(&mut self, handle: SlabHandle) -> Option<Arc<Entry>> {
    let (key, entry) = self.entries.remove(handle)?;
    self.index.remove(&key);
    Some(entry)
  }
}

//
// MetricMap
//

// The entries of one shard, with idle entries expired in the background.
pub struct MetricMap {
  shard: u32,
  options: Arc<Options>,
  lists: Arc<MetricLists>,
  state: RwLock<MapState>,
  new_entry_limiter: RateLimiter,
  sweep: tokio::sync::Mutex<()>,
  stats: Stats,
}

impl MetricMap {
  #[must_use]
  pub fn new(shard: u32, lists: Arc<MetricLists>, options: Arc<Options>) -> Self {
    let stats = Stats::new(&options.scope);
    Self {
      shard,
      new_entry_limiter: RateLimiter::new(options.max_new_entries_per_second),
      options,
      lists,
      state: RwLock::new(MapState::default()),
      sweep: tokio::sync::Mutex::new(()),
      stats,
    }
  }

  #[must_use]
  pub const fn shard(&self) -> u32 {
    self.shard
  }

  pub fn len(&self) -> usize {
    self.state.read().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  // Returns the entry for the key, creating it if needed. The writer is registered before the map
  // lock is released so that a concurrent sweep can never expire the returned entry.
  pub fn find_or_create(&self, key: EntryKey) -> Result<ActiveEntry, MapError> {
    {
      let state = self.state.read();
      if state.closed {
        return Err(MapError::Closed);
      }
      if let Some(entry) = state.lookup(&key) {
        return Ok(ActiveEntry::new(entry.clone()));
      }
    }

    let mut state = self.state.write();
    if state.closed {
      return Err(MapError::Closed);
    }
    if let Some(entry) = state.lookup(&key) {
      return Ok(ActiveEntry::new(entry.clone()));
    }
    if !self
      .new_entry_limiter
      .is_allowed(1, self.options.time_provider.unix_nanos())
    {
      self.stats.new_entries_rate_limited.inc();
      return Err(MapError::NewEntryRateLimited);
    }

    let entry = Arc::new(Entry::new(self.lists.clone(), self.options.clone()));
    let active = ActiveEntry::new(entry.clone());
    let handle = state.entries.push_back((key, entry));
    state.index.insert(key, handle);
    self.stats.entries.inc();
    self.stats.new_entries.inc();
    Ok(active)
  }

  pub fn add_untimed(
    &self,
    metric: &MetricUnion,
    metadatas: &StagedMetadatas,
  ) -> Result<(), MapError> {
    let entry = self.find_or_create(EntryKey::untimed(metric))?;
    entry.add_untimed(metric, metadatas)?;
    Ok(())
  }

  pub fn add_timed(&self, metric: &TimedMetric, metadata: &TimedMetadata) -> Result<(), MapError> {
    let entry = self.find_or_create(EntryKey::timed(metric))?;
    entry.add_timed(metric, metadata)?;
    Ok(())
  }

  pub fn add_forwarded(
    &self,
    metric: &ForwardedMetric,
    metadata: &ForwardMetadata,
  ) -> Result<(), MapError> {
    let entry = self.find_or_create(EntryKey::forwarded(metric))?;
    entry.add_forwarded(metric, metadata)?;
    Ok(())
  }

  // Expires idle entries, spreading the work evenly over the target duration. Candidates are found
  // under the shared lock and confirmed and removed under the exclusive one, one batch at a time.
  // Returns the number of entries expired.
  pub async fn delete_expired(&self, target: Duration) -> usize {
    let _sweep = self.sweep.lock().await;

    let num_entries = self.len();
    if num_entries == 0 {
      return 0;
    }
    let batch_size = (num_entries.lossy_to_f64() * self.options.entry_check_batch_percentage)
      .ceil()
      .lossy_to_usize()
      .max(1);
    let num_batches = u32::try_from(num_entries.div_ceil(batch_size)).unwrap_or(u32::MAX);
    let per_batch = target / num_batches;

    let mut expired = 0;
    let mut cursor = self.state.read().entries.front();
    while let Some(start) = cursor {
      let batch_started = Instant::now();
      let now_nanos = self.options.time_provider.unix_nanos();

      let Some((candidates, next)) = self.state.read().scan(start, batch_size, now_nanos) else {
        break;
      };
      if !candidates.is_empty() {
        let mut state = self.state.write();
        for handle in candidates {
          let Some((_, entry)) = state.entries.get(handle) else {
            continue;
          };
          if entry.try_expire(now_nanos) {
            state.remove(handle);
            expired += 1;
          }
        }
      }

      cursor = next;
      let remaining = per_batch - batch_started.elapsed();
      if cursor.is_some() && remaining.is_positive() {
        remaining.sleep().await;
      }
    }

    if expired > 0 {
      log::debug!("shard {}: expired {} entries", self.shard, expired);
      self.stats.expired.inc_by(u64::try_from(expired).unwrap_or(u64::MAX));
      self.stats.entries.sub(i64::try_from(expired).unwrap_or(i64::MAX));
    }
    expired
  }

  // Sweeps for expired entries every check interval until shutdown.
  pub async fn run_expiry_loop(&self, mut shutdown: ComponentShutdown) {
    let interval = self.options.entry_check_interval;
    loop {
      let started = Instant::now();
      tokio::select! {
        () = shutdown.cancelled() => return,
        _ = self.delete_expired(interval) => {},
      }

      let remaining = interval - started.elapsed();
      if remaining.is_positive() {
        tokio::select! {
          () = shutdown.cancelled() => return,
          () = remaining.sleep() => {},
        }
      }
    }
  }

  // Closes every entry. The map rejects writes afterwards.
  pub fn close(&self) {
    let entries = {
      let mut state = self.state.write();
      if state.closed {
        return;
      }
      state.closed = true;
      state.index.clear();
      state.entries.drain()
    };
    for (_, entry) in entries {
      entry.close();
    }
    self.stats.entries.set(0);
  }
}
