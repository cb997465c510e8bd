// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod aggregation_type;
pub mod metadata;
pub mod policy;

use bytes::Bytes;
use std::fmt::Display;
use xxhash_rust::xxh3::xxh3_128;

// Hash of a raw metric ID used to index entries.
#[must_use]
pub fn hash_id(id: &[u8]) -> u128 {
  xxh3_128(id)
}

//
// MetricType
//

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
  Counter,
  Timer,
  Gauge,
}

impl Display for MetricType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Counter => write!(f, "counter"),
      Self::Timer => write!(f, "timer"),
      Self::Gauge => write!(f, "gauge"),
    }
  }
}

//
// UntimedValue
//

#[derive(Clone, Debug, PartialEq)]
pub enum UntimedValue {
  Counter(i64),
  BatchTimer(Vec<f64>),
  Gauge(f64),
}

impl UntimedValue {
  #[must_use]
  pub const fn metric_type(&self) -> MetricType {
    match self {
      Self::Counter(_) => MetricType::Counter,
      Self::BatchTimer(_) => MetricType::Timer,
      Self::Gauge(_) => MetricType::Gauge,
    }
  }
}

//
// MetricUnion
//

// A raw metric without a timestamp. It is stamped with the current time when it is aggregated.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricUnion {
  pub id: Bytes,
  pub value: UntimedValue,
}

impl MetricUnion {
  pub fn counter(id: impl Into<Bytes>, value: i64) -> Self {
    Self {
      id: id.into(),
      value: UntimedValue::Counter(value),
    }
  }

  pub fn batch_timer(id: impl Into<Bytes>, values: Vec<f64>) -> Self {
    Self {
      id: id.into(),
      value: UntimedValue::BatchTimer(values),
    }
  }

  pub fn gauge(id: impl Into<Bytes>, value: f64) -> Self {
    Self {
      id: id.into(),
      value: UntimedValue::Gauge(value),
    }
  }

  #[must_use]
  pub const fn metric_type(&self) -> MetricType {
    self.value.metric_type()
  }

  // Number of raw values carried, which is what rate limits are counted in.
  #[must_use]
  pub fn num_values(&self) -> usize {
    match &self.value {
      UntimedValue::BatchTimer(values) => values.len(),
      UntimedValue::Counter(_) | UntimedValue::Gauge(_) => 1,
    }
  }
}

//
// TimedMetric
//

// A single value stamped by its producer rather than on arrival.
#[derive(Clone, Debug, PartialEq)]
pub struct TimedMetric {
  pub metric_type: MetricType,
  pub id: Bytes,
  pub time_nanos: i64,
  pub value: f64,
}

//
// ForwardedMetric
//

// A metric that already went through one aggregation hop. The timestamp is the end of the upstream
// window that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardedMetric {
  pub metric_type: MetricType,
  pub id: Bytes,
  pub time_nanos: i64,
  pub values: Vec<f64>,
}
