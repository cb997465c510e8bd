// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod flush_times;
pub mod follower;
pub mod worker_pool;

use crate::list::MetricListId;
use flush_times::ShardSetFlushTimes;
use std::sync::Arc;
use time::Duration;
use tokio::sync::watch;

//
// ElectionManager
//

#[mockall::automock]
pub trait ElectionManager: Send + Sync {
  // Whether this instance is currently campaigning to become the flush leader.
  fn is_campaigning(&self) -> bool;
}

//
// FlushTimesManager
//

pub type FlushTimesReceiver = watch::Receiver<Option<Arc<ShardSetFlushTimes>>>;

#[mockall::automock]
pub trait FlushTimesManager: Send + Sync {
  // Subscribes to the cluster replicated flush times. The receiver yields the latest snapshot,
  // which is None until one has been loaded.
  fn watch(&self) -> anyhow::Result<FlushTimesReceiver>;
}

//
// Flusher
//

// Something that can drop buffered windows up to a horizon, identified by shard and list.
pub trait Flusher: Send + Sync {
  fn shard(&self) -> u32;

  fn list_id(&self) -> MetricListId;

  fn discard_before(&self, target_nanos: i64);
}

//
// FlushBucket
//

// Flushers that share a flush interval.
#[derive(Clone)]
pub struct FlushBucket {
  pub interval: Duration,
  pub flushers: Vec<Arc<dyn Flusher>>,
}
