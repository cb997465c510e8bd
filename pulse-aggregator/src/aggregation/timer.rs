// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::quantile::QuantileStream;
use super::stdev;
use crate::metric::aggregation_type::AggregationType;
use crate::num::LossyIntToFloat;

//
// TimerAggregation
//

// Accumulator for timers. The quantile stream is only present if a quantile aggregation was
// requested.
#[derive(Debug, Default)]
pub struct TimerAggregation {
  sum: f64,
  sum_sq: f64,
  count: i64,
  min: f64,
  max: f64,
  stream: Option<QuantileStream>,
}

impl TimerAggregation {
  #[must_use]
  pub fn new(stream: Option<QuantileStream>) -> Self {
    Self {
      stream,
      ..Default::default()
    }
  }

  pub fn add(&mut self, value: f64) {
    if value.is_nan() {
      return;
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
    if let Some(stream) = &mut self.stream {
      stream.add(value);
    }
  }

  pub fn add_batch(&mut self, values: &[f64]) {
    for value in values {
      self.add(*value);
    }
  }

  #[must_use]
  pub const fn count(&self) -> i64 {
    self.count
  }

  pub fn take_stream(&mut self) -> Option<QuantileStream> {
    self.stream.take()
  }

  pub fn value_of(&mut self, aggregation_type: AggregationType) -> f64 {
    if let Some(quantile) = aggregation_type.quantile() {
      return self.stream.as_mut().map_or(f64::NAN, |stream| {
        stream.flush();
        stream.query(quantile)
      });
    }

    match aggregation_type {
      AggregationType::Sum => self.sum,
      AggregationType::SumSq => self.sum_sq,
      AggregationType::Count => self.count.lossy_to_f64(),
      AggregationType::Min if self.count > 0 => self.min,
      AggregationType::Max if self.count > 0 => self.max,
      AggregationType::Mean if self.count > 0 => self.sum / self.count.lossy_to_f64(),
      AggregationType::Mean => 0.0,
      AggregationType::Stdev => stdev(self.count, self.sum_sq, self.sum),
      _ => f64::NAN,
    }
  }
}
