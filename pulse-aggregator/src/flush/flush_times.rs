// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Flush progress replicated by the leader, keyed by resolution in nanoseconds. All times are the
// last flush horizon in nanoseconds.

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedFlushTimes {
  pub by_num_forwarded_times: HashMap<u32, i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardFlushTimes {
  pub standard_by_resolution: HashMap<i64, i64>,
  #[serde(default)]
  pub timed_by_resolution: HashMap<i64, i64>,
  pub forwarded_by_resolution: HashMap<i64, ForwardedFlushTimes>,
  pub tombstoned: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSetFlushTimes {
  pub by_shard: HashMap<u32, ShardFlushTimes>,
}
