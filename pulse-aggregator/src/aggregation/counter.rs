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
// CounterAggregation
//

// Integer accumulator for counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CounterAggregation {
  sum: i64,
  sum_sq: i64,
  count: i64,
  min: i64,
  max: i64,
}

impl CounterAggregation {
  pub fn add(&mut self, value: i64) {
    self.sum = self.sum.saturating_add(value);
    self.sum_sq = self.sum_sq.saturating_add(value.saturating_mul(value));
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
    match aggregation_type {
      AggregationType::Sum => self.sum.lossy_to_f64(),
      AggregationType::SumSq => self.sum_sq.lossy_to_f64(),
      AggregationType::Count => self.count.lossy_to_f64(),
      AggregationType::Min if self.count > 0 => self.min.lossy_to_f64(),
      AggregationType::Max if self.count > 0 => self.max.lossy_to_f64(),
      AggregationType::Mean if self.count > 0 => {
        self.sum.lossy_to_f64() / self.count.lossy_to_f64()
      },
      AggregationType::Mean => 0.0,
      AggregationType::Stdev => stdev(
        self.count,
        self.sum_sq.lossy_to_f64(),
        self.sum.lossy_to_f64(),
      ),
      _ => f64::NAN,
    }
  }
}
