// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod counter;
pub mod gauge;
pub mod quantile;
pub mod timer;

use crate::metric::aggregation_type::AggregationType;
use crate::metric::{MetricType, UntimedValue};
use crate::num::{LossyFloatToInt, LossyIntToFloat};
use counter::CounterAggregation;
use gauge::GaugeAggregation;
use quantile::QuantileStream;
use timer::TimerAggregation;

// Sample standard deviation. Fewer than two values have no deviation.
#[must_use]
pub fn stdev(count: i64, sum_sq: f64, sum: f64) -> f64 {
  if count < 2 {
    return 0.0;
  }
  let n = count.lossy_to_f64();
  let variance = (n * sum_sq - sum * sum) / (n * (n - 1.0));
  // Rounding can push the variance of identical values slightly negative.
  variance.max(0.0).sqrt()
}

//
// Aggregation
//

// The numeric accumulator held by one time window of an element.
#[derive(Debug)]
pub enum Aggregation {
  Counter(CounterAggregation),
  Gauge(GaugeAggregation),
  Timer(TimerAggregation),
}

impl Aggregation {
  // Creates an empty accumulator. The quantile stream is only used by timers.
  #[must_use]
  pub fn new(metric_type: MetricType, stream: Option<QuantileStream>) -> Self {
    match metric_type {
      MetricType::Counter => Self::Counter(CounterAggregation::default()),
      MetricType::Gauge => Self::Gauge(GaugeAggregation::default()),
      MetricType::Timer => Self::Timer(TimerAggregation::new(stream)),
    }
  }

  #[must_use]
  pub const fn metric_type(&self) -> MetricType {
    match self {
      Self::Counter(_) => MetricType::Counter,
      Self::Gauge(_) => MetricType::Gauge,
      Self::Timer(_) => MetricType::Timer,
    }
  }

  // Folds an untimed value in. The caller guarantees the value matches the accumulator type;
  // a mismatched value is ignored.
  pub fn add_union(&mut self, time_nanos: i64, value: &UntimedValue) {
    match (self, value) {
      (Self::Counter(counter), UntimedValue::Counter(value)) => counter.add(*value),
      (Self::Gauge(gauge), UntimedValue::Gauge(value)) => gauge.add(time_nanos, *value),
      (Self::Timer(timer), UntimedValue::BatchTimer(values)) => timer.add_batch(values),
      (aggregation, value) => log::debug!(
        "ignoring {} value for {} aggregation",
        value.metric_type(),
        aggregation.metric_type()
      ),
    }
  }

  // Folds a single float value in. Counter values are truncated to integers.
  pub fn add_value(&mut self, time_nanos: i64, value: f64) {
    match self {
      Self::Counter(counter) => {
        if !value.is_nan() {
          counter.add(value.lossy_to_i64());
        }
      },
      Self::Gauge(gauge) => gauge.add(time_nanos, value),
      Self::Timer(timer) => timer.add(value),
    }
  }

  #[must_use]
  pub const fn count(&self) -> i64 {
    match self {
      Self::Counter(counter) => counter.count(),
      Self::Gauge(gauge) => gauge.count(),
      Self::Timer(timer) => timer.count(),
    }
  }

  pub fn value_of(&mut self, aggregation_type: AggregationType) -> f64 {
    match self {
      Self::Counter(counter) => counter.value_of(aggregation_type),
      Self::Gauge(gauge) => gauge.value_of(aggregation_type),
      Self::Timer(timer) => timer.value_of(aggregation_type),
    }
  }

  // Releases the accumulator, handing back any quantile stream for reuse.
  #[must_use]
  pub fn close(self) -> Option<QuantileStream> {
    match self {
      Self::Timer(mut timer) => timer.take_stream(),
      Self::Counter(_) | Self::Gauge(_) => None,
    }
  }
}
