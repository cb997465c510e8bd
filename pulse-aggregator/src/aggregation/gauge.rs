// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::stdev;
use crate::metric::aggregation_type::AggregationType;
use crate::num::LossyIntToFloat;

//
// GaugeAggregation
//

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GaugeAggregation {
  last: f64,
  last_at_nanos: Option<i64>,
  sum: f64,
  sum_sq: f64,
  count: i64,
  min: f64,
  max: f64,
}

impl GaugeAggregation {
  // NaN values are dropped. The last value is the one with the latest timestamp, ties going to
  // the most recent write.
  pub fn add(&mut self, time_nanos: i64, value: f64) {
    if value.is_nan() {
      return;
    }

    if self.last_at_nanos.is_none_or(|last_at| time_nanos >= last_at) {
      self.last = value;
      self.last_at_nanos = Some(time_nanos);
    }
    self.sum += value;
    self.sum_sq += value * value;
    if self.count == 0 {
      self.min = value;
      self.max = value;
    } else {
      self.min = self.min.min(value);
      self.max = self.max.max(value);
    }
    self.count += 1;
  }

  #[must_use]
  pub const fn count(&self) -> i64 {
    self.count
  }

  #[must_use]
  pub fn value_of(&self, aggregation_type: AggregationType) -> f64 {
    if self.count == 0 {
      return match aggregation_type {
        AggregationType::Sum
        | AggregationType::SumSq
        | AggregationType::Count
        | AggregationType::Mean
        | AggregationType::Stdev => 0.0,
        _ => f64::NAN,
      };
    }

    match aggregation_type {
      AggregationType::Last => self.last,
      AggregationType::Sum => self.sum,
      AggregationType::SumSq => self.sum_sq,
      AggregationType::Count => self.count.lossy_to_f64(),
      AggregationType::Min => self.min,
      AggregationType::Max => self.max,
      AggregationType::Mean => self.sum / self.count.lossy_to_f64(),
      AggregationType::Stdev => stdev(self.count, self.sum_sq, self.sum),
      _ => f64::NAN,
    }
  }
}
