// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::config::AggregatorConfig;
use crate::element::{FlushHandler, ForwardedAggregationKey, LocalMetric};
use crate::metric::policy::StoragePolicy;
use crate::options::Options;
use crate::time::{NANOS_PER_SECOND, TestTimeProvider};
use bd_server_stats::stats::Collector;
use parking_lot::Mutex;
use std::sync::Arc;

#[must_use]
pub const fn seconds(seconds: i64) -> i64 {
  seconds * NANOS_PER_SECOND
}

#[must_use]
pub fn storage_policy(policy: &str) -> StoragePolicy {
  policy.parse().unwrap()
}

//
// OptionsBuilder
//

pub struct OptionsBuilder {
  pub config: AggregatorConfig,
  pub time_provider: TestTimeProvider,
  pub collector: Collector,
}

impl Default for OptionsBuilder {
  fn default() -> Self {
    Self {
      config: AggregatorConfig {
        counter_prefix: "counters.".to_string(),
        timer_prefix: "timers.".to_string(),
        gauge_prefix: "gauges.".to_string(),
        default_storage_policies: vec![storage_policy("10s:2d")],
        ..Default::default()
      },
      time_provider: TestTimeProvider::new(0),
      collector: Collector::default(),
    }
  }
}

impl OptionsBuilder {
  #[must_use]
  pub fn config(mut self, f: impl FnOnce(&mut AggregatorConfig)) -> Self {
    f(&mut self.config);
    self
  }

  #[must_use]
  pub fn build(&self) -> Arc<Options> {
    Arc::new(
      Options::new(
        &self.config,
        Arc::new(self.time_provider.clone()),
        &self.collector.scope("test"),
      )
      .unwrap(),
    )
  }

  // Current value of a counter registered by the built options.
  #[must_use]
  pub fn counter(&self, scope: &str, name: &str) -> u64 {
    self.collector.scope("test").scope(scope).counter(name).get()
  }
}

//
// Flushed
//

#[derive(Clone, Debug, PartialEq)]
pub enum Flushed {
  Local {
    id: String,
    time_nanos: i64,
    value: f64,
    storage_policy: StoragePolicy,
  },
  Forwarded {
    key: ForwardedAggregationKey,
    time_nanos: i64,
    value: f64,
  },
  ForwardedFlushed(ForwardedAggregationKey),
}

impl Flushed {
  #[must_use]
  pub fn local(id: &str, time_nanos: i64, value: f64, storage_policy: StoragePolicy) -> Self {
    Self::Local {
      id: id.to_string(),
      time_nanos,
      value,
      storage_policy,
    }
  }
}

//
// CapturingFlushHandler
//

// Records everything flushed, with local IDs rendered as prefix + id + suffix.
#[derive(Default)]
pub struct CapturingFlushHandler {
  flushed: Mutex<Vec<Flushed>>,
}

impl CapturingFlushHandler {
  pub fn take(&self) -> Vec<Flushed> {
    std::mem::take(&mut *self.flushed.lock())
  }
}

impl FlushHandler for CapturingFlushHandler {
  fn flush_local(&self, metric: LocalMetric<'_>) {
    let id = [metric.prefix, metric.id, metric.suffix].concat();
    self.flushed.lock().push(Flushed::Local {
      id: String::from_utf8_lossy(&id).into_owned(),
      time_nanos: metric.time_nanos,
      value: metric.value,
      storage_policy: metric.storage_policy,
    });
  }

  fn flush_forwarded(&self, key: &ForwardedAggregationKey, time_nanos: i64, value: f64) {
    self.flushed.lock().push(Flushed::Forwarded {
      key: key.clone(),
      time_nanos,
      value,
    });
  }

  fn on_forwarded_flushed(&self, key: &ForwardedAggregationKey) {
    self
      .flushed
      .lock()
      .push(Flushed::ForwardedFlushed(key.clone()));
  }
}
