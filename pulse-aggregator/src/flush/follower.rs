// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./follower_test.rs"]
mod follower_test;

use super::flush_times::ShardSetFlushTimes;
use super::worker_pool::WorkerPool;
use super::{ElectionManager, FlushBucket, FlushTimesManager, FlushTimesReceiver, Flusher};
use crate::config::FollowerFlushConfig;
use crate::list::MetricListId;
use crate::metric::policy::format_duration;
use crate::time::{TimeProvider, duration_nanos, truncate_nanos};
use bd_log::warn_every;
use bd_server_stats::stats::Scope;
use bd_shutdown::{ComponentShutdown, ComponentShutdownTrigger};
use bd_time::TimeDurationExt;
use parking_lot::Mutex;
use prometheus::{Histogram, IntCounter};
use std::collections::HashMap;
use std::sync::Arc;
use time::Duration;
use time::ext::NumericalDuration;
use tokio::task::JoinHandle;

const WATCH_RETRY_INTERVAL: Duration = Duration::SECOND;

//
// FlushTimesState
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushTimesState {
  Uninitialized,
  // A snapshot arrived that has not been turned into a flush plan yet.
  Updated,
  Processed,
}

//
// FollowerFlushMode
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowerFlushMode {
  Unknown,
  // Following the flush times replicated by the leader.
  KvUpdate,
  // No leader progress was seen for too long, flushing on our own to bound memory.
  Forced,
}

//
// FollowerFlushOptions
//

#[derive(Clone, Debug)]
pub struct FollowerFlushOptions {
  pub check_every: Duration,
  pub max_buffer_size: Duration,
  pub forced_flush_window_size: Duration,
}

impl FollowerFlushOptions {
  pub fn new(config: &FollowerFlushConfig) -> anyhow::Result<Self> {
    Ok(Self {
      check_every: config.check_every.try_into()?,
      max_buffer_size: config.max_buffer_size.try_into()?,
      forced_flush_window_size: config.forced_flush_window_size.try_into()?,
    })
  }
}

//
// Stats
//

struct Stats {
  scope: Scope,
  kv_update_flush: IntCounter,
  forced_flush: IntCounter,
  shard_not_found: IntCounter,
  resolution_not_found: IntCounter,
  num_forwarded_times_not_found: IntCounter,
  watch_create_errors: IntCounter,
  watch_updates: IntCounter,
  flush_failures: IntCounter,
  flush_duration: Mutex<HashMap<Duration, Histogram>>,
}

impl Stats {
  fn new(scope: &Scope) -> Self {
    let scope = scope.scope("follower_flush");
    Self {
      kv_update_flush: scope.counter("kv_update_flush"),
      forced_flush: scope.counter("forced_flush"),
      shard_not_found: scope.counter("shard_not_found"),
      resolution_not_found: scope.counter("resolution_not_found"),
      num_forwarded_times_not_found: scope.counter("num_forwarded_times_not_found"),
      watch_create_errors: scope.counter("watch_create_errors"),
      watch_updates: scope.counter("watch_updates"),
      flush_failures: scope.counter("flush_failures"),
      flush_duration: Mutex::new(HashMap::new()),
      scope,
    }
  }

  fn flush_duration(&self, interval: Duration) -> Histogram {
    self
      .flush_duration
      .lock()
      .entry(interval)
      .or_insert_with(|| {
        self
          .scope
          .histogram(&format!("flush_duration_{}ms", interval.whole_milliseconds()))
      })
      .clone()
  }
}

//
// State
//

struct State {
  flush_times_state: FlushTimesState,
  flush_mode: FollowerFlushMode,
  received: Option<Arc<ShardSetFlushTimes>>,
  processed: Option<Arc<ShardSetFlushTimes>>,
  opened_at_nanos: i64,
  last_flushed_nanos: i64,
}

impl State {
  fn on_flush_times(&mut self, flush_times: Option<Arc<ShardSetFlushTimes>>) {
    if let Some(flush_times) = flush_times {
      self.received = Some(flush_times);
      self.flush_times_state = FlushTimesState::Updated;
    }
  }
}

//
// FlushGroup
//

struct FlushGroup {
  interval: Duration,
  targets: Vec<(Arc<dyn Flusher>, i64)>,
}

//
// FollowerFlushTask
//

// A flush plan: every flusher discards the windows before its horizon, one interval group at a
// time.
pub struct FollowerFlushTask {
  groups: Vec<FlushGroup>,
  worker_pool: Arc<WorkerPool>,
  stats: Arc<Stats>,
}

impl FollowerFlushTask {
  pub async fn run(self) {
    for group in self.groups {
      let timer = self.stats.flush_duration(group.interval).start_timer();
      let jobs = group
        .targets
        .into_iter()
        .map(|(flusher, target_nanos)| move || flusher.discard_before(target_nanos));
      let failed = self.worker_pool.run_all(jobs).await;
      timer.observe_duration();
      if failed > 0 {
        warn_every!(
          15.seconds(),
          "{} follower flush jobs failed for interval {}",
          failed,
          format_duration(group.interval)
        );
        self.stats.flush_failures.inc_by(u64::try_from(failed).unwrap_or(u64::MAX));
      }
    }
  }

  // (shard, list, horizon) for every planned discard, in execution order.
  #[must_use]
  pub fn targets(&self) -> Vec<(u32, MetricListId, i64)> {
    self
      .groups
      .iter()
      .flat_map(|group| {
        group
          .targets
          .iter()
          .map(|(flusher, target)| (flusher.shard(), flusher.list_id(), *target))
      })
      .collect()
  }
}

//
// FollowerFlushManager
//

// Decides when an instance that is not the flush leader may drop its buffered windows, following
// the flush progress that the leader replicates through the flush times store.
pub struct FollowerFlushManager {
  options: FollowerFlushOptions,
  time_provider: Arc<dyn TimeProvider>,
  election_manager: Arc<dyn ElectionManager>,
  flush_times_manager: Arc<dyn FlushTimesManager>,
  worker_pool: Arc<WorkerPool>,
  state: Arc<Mutex<State>>,
  watcher: Mutex<Option<(ComponentShutdownTrigger, JoinHandle<()>)>>,
  stats: Arc<Stats>,
}

impl FollowerFlushManager {
  #[must_use]
  pub fn new(
    options: FollowerFlushOptions,
    time_provider: Arc<dyn TimeProvider>,
    election_manager: Arc<dyn ElectionManager>,
    flush_times_manager: Arc<dyn FlushTimesManager>,
    worker_pool: Arc<WorkerPool>,
    scope: &Scope,
  ) -> Self {
    Self {
      options,
      time_provider,
      election_manager,
      flush_times_manager,
      worker_pool,
      state: Arc::new(Mutex::new(State {
        flush_times_state: FlushTimesState::Uninitialized,
        flush_mode: FollowerFlushMode::Unknown,
        received: None,
        processed: None,
        opened_at_nanos: 0,
        last_flushed_nanos: 0,
      })),
      watcher: Mutex::new(None),
      stats: Arc::new(Stats::new(scope)),
    }
  }

  // Records the open time and starts watching the flush times store. Must be called from within a
  // tokio runtime.
  pub fn open(&self) {
    let mut watcher = self.watcher.lock();
    if watcher.is_some() {
      log::warn!("follower flush manager already open");
      return;
    }

    let now = self.time_provider.unix_nanos();
    {
      let mut state = self.state.lock();
      state.opened_at_nanos = now;
      state.last_flushed_nanos = now;
    }

    let trigger = ComponentShutdownTrigger::default();
    let handle = tokio::spawn(Self::watch_flush_times(
      self.flush_times_manager.clone(),
      self.state.clone(),
      self.stats.clone(),
      trigger.make_shutdown(),
    ));
    *watcher = Some((trigger, handle));
  }

  // Stops the watcher and waits for it to exit.
  pub async fn close(&self) {
    let Some((trigger, handle)) = self.watcher.lock().take() else {
      return;
    };
    trigger.shutdown().await;
    if let Err(e) = handle.await {
      log::warn!("flush times watcher failed: {e}");
    }
  }

  async fn watch_flush_times(
    flush_times_manager: Arc<dyn FlushTimesManager>,
    state: Arc<Mutex<State>>,
    stats: Arc<Stats>,
    mut shutdown: ComponentShutdown,
  ) {
    loop {
      match flush_times_manager.watch() {
        Ok(receiver) => {
          if Self::process_updates(receiver, &state, &stats, &mut shutdown).await {
            return;
          }
          log::debug!("flush times watch closed, resubscribing");
        },
        Err(e) => {
          warn_every!(15.seconds(), "error creating flush times watch: {}", e);
          stats.watch_create_errors.inc();
        },
      }

      tokio::select! {
        () = shutdown.cancelled() => return,
        () = WATCH_RETRY_INTERVAL.sleep() => {},
      }
    }
  }

  // Feeds snapshots into the state until the watch closes. Returns true on shutdown.
  async fn process_updates(
    mut receiver: FlushTimesReceiver,
    state: &Mutex<State>,
    stats: &Stats,
    shutdown: &mut ComponentShutdown,
  ) -> bool {
    state
      .lock()
      .on_flush_times(receiver.borrow_and_update().clone());
    loop {
      tokio::select! {
        () = shutdown.cancelled() => return true,
        result = receiver.changed() => {
          if result.is_err() {
            return false;
          }
          stats.watch_updates.inc();
          state.lock().on_flush_times(receiver.borrow_and_update().clone());
        },
      }
    }
  }

  // Bucket topology is picked up on the next prepare.
  pub fn init(&self, _buckets: &[FlushBucket]) {}

  pub fn on_bucket_added(&self, _bucket_index: usize, _bucket: &FlushBucket) {}

  pub fn flush_mode(&self) -> FollowerFlushMode {
    self.state.lock().flush_mode
  }

  pub fn flush_times_state(&self) -> FlushTimesState {
    self.state.lock().flush_times_state
  }

  // Builds the next flush plan, if there is one, and returns how long to wait before the next
  // call.
  pub fn prepare(&self, buckets: &[FlushBucket]) -> (Option<FollowerFlushTask>, Duration) {
    let now = self.time_provider.unix_nanos();
    let mut state = self.state.lock();

    if state.flush_times_state == FlushTimesState::Updated {
      state.flush_times_state = FlushTimesState::Processed;
      state.processed = state.received.clone();
      state.flush_mode = FollowerFlushMode::KvUpdate;
      state.last_flushed_nanos = now;
      self.stats.kv_update_flush.inc();
      let groups = state.processed.as_ref().map_or_else(Vec::new, |processed| {
        self.plan(buckets, |flusher| self.kv_update_target(processed, flusher))
      });
      return (Some(self.make_task(groups)), Duration::ZERO);
    }

    let since_last_flush = now - state.last_flushed_nanos;
    if since_last_flush > duration_nanos(self.options.max_buffer_size) {
      state.flush_mode = FollowerFlushMode::Forced;
    }
    if state.flush_mode == FollowerFlushMode::Forced
      && since_last_flush >= duration_nanos(self.options.forced_flush_window_size)
    {
      state.last_flushed_nanos = now;
      self.stats.forced_flush.inc();
      let target_nanos = now - duration_nanos(self.options.max_buffer_size);
      let groups = self.plan(buckets, |_| Some(target_nanos));
      return (Some(self.make_task(groups)), Duration::ZERO);
    }

    (None, self.options.check_every)
  }

  fn plan(
    &self,
    buckets: &[FlushBucket],
    target_for: impl Fn(&dyn Flusher) -> Option<i64>,
  ) -> Vec<FlushGroup> {
    buckets
      .iter()
      .map(|bucket| FlushGroup {
        interval: bucket.interval,
        targets: bucket
          .flushers
          .iter()
          .filter_map(|flusher| {
            target_for(flusher.as_ref()).map(|target| (flusher.clone(), target))
          })
          .collect(),
      })
      .collect()
  }

  fn make_task(&self, groups: Vec<FlushGroup>) -> FollowerFlushTask {
    FollowerFlushTask {
      groups,
      worker_pool: self.worker_pool.clone(),
      stats: self.stats.clone(),
    }
  }

  // The horizon a flusher may discard up to according to the replicated flush times. Missing
  // entries are counted and the flusher is skipped this round.
  fn kv_update_target(
    &self,
    flush_times: &ShardSetFlushTimes,
    flusher: &dyn Flusher,
  ) -> Option<i64> {
    let Some(shard_flush_times) = flush_times.by_shard.get(&flusher.shard()) else {
      self.stats.shard_not_found.inc();
      log::debug!("no flush times for shard {}", flusher.shard());
      return None;
    };

    match flusher.list_id() {
      MetricListId::Standard { resolution } => {
        let target = shard_flush_times
          .standard_by_resolution
          .get(&duration_nanos(resolution))
          .copied();
        if target.is_none() {
          self.stats.resolution_not_found.inc();
        }
        target
      },
      MetricListId::Timed { resolution } => {
        let target = shard_flush_times
          .timed_by_resolution
          .get(&duration_nanos(resolution))
          .copied();
        if target.is_none() {
          self.stats.resolution_not_found.inc();
        }
        target
      },
      MetricListId::Forwarded {
        resolution,
        num_forwarded_times,
      } => {
        let Some(forwarded) = shard_flush_times
          .forwarded_by_resolution
          .get(&duration_nanos(resolution))
        else {
          self.stats.resolution_not_found.inc();
          return None;
        };
        let target = forwarded
          .by_num_forwarded_times
          .get(&num_forwarded_times)
          .copied();
        if target.is_none() {
          self.stats.num_forwarded_times_not_found.inc();
        }
        target
      },
    }
  }

  // Leadership may only be taken once peers have flushed every window that was open when this
  // instance started, otherwise those windows would be lost.
  pub fn can_lead(&self) -> bool {
    if !self.election_manager.is_campaigning() {
      return false;
    }

    let state = self.state.lock();
    let Some(processed) = &state.processed else {
      return false;
    };
    processed
      .by_shard
      .values()
      .filter(|shard| !shard.tombstoned)
      .all(|shard| {
        let standard = shard
          .standard_by_resolution
          .iter()
          .chain(&shard.timed_by_resolution)
          .all(|(resolution, last_flushed)| {
            Self::window_flushed(state.opened_at_nanos, *resolution, *last_flushed)
          });
        let forwarded = shard
          .forwarded_by_resolution
          .iter()
          .all(|(resolution, forwarded)| {
            forwarded.by_num_forwarded_times.values().all(|last_flushed| {
              Self::window_flushed(state.opened_at_nanos, *resolution, *last_flushed)
            })
          });
        standard && forwarded
      })
  }

  // Only windows that started before the open time matter. When the open time is aligned, the
  // window starting at it was empty at startup.
  fn window_flushed(opened_at_nanos: i64, resolution_nanos: i64, last_flushed_nanos: i64) -> bool {
    let mut window_end_nanos = truncate_nanos(opened_at_nanos, resolution_nanos);
    if window_end_nanos < opened_at_nanos {
      window_end_nanos += resolution_nanos;
    }
    last_flushed_nanos >= window_end_nanos
  }
}
