// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./aggregation_type_test.rs"]
mod aggregation_type_test;

use super::MetricType;
use serde::{Deserialize, Serialize};

//
// AggregationType
//

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
  Last,
  Min,
  Max,
  Mean,
  Median,
  Count,
  Sum,
  SumSq,
  Stdev,
  P10,
  P20,
  P30,
  P40,
  P50,
  P60,
  P70,
  P75,
  P80,
  P90,
  P95,
  P99,
  P999,
  P9999,
}

const DEFAULT_COUNTER_AGGREGATION_TYPES: &[AggregationType] = &[AggregationType::Sum];
const DEFAULT_GAUGE_AGGREGATION_TYPES: &[AggregationType] = &[AggregationType::Last];
const DEFAULT_TIMER_AGGREGATION_TYPES: &[AggregationType] = &[
  AggregationType::Sum,
  AggregationType::SumSq,
  AggregationType::Mean,
  AggregationType::Min,
  AggregationType::Max,
  AggregationType::Count,
  AggregationType::Stdev,
  AggregationType::Median,
  AggregationType::P50,
  AggregationType::P95,
  AggregationType::P99,
];

impl AggregationType {
  // Suffix appended to the metric ID when a non-default aggregation is flushed.
  #[must_use]
  pub const fn suffix(self) -> &'static str {
    match self {
      Self::Last => ".last",
      Self::Min => ".lower",
      Self::Max => ".upper",
      Self::Mean => ".mean",
      Self::Median => ".median",
      Self::Count => ".count",
      Self::Sum => ".sum",
      Self::SumSq => ".sum_sq",
      Self::Stdev => ".stdev",
      Self::P10 => ".p10",
      Self::P20 => ".p20",
      Self::P30 => ".p30",
      Self::P40 => ".p40",
      Self::P50 => ".p50",
      Self::P60 => ".p60",
      Self::P70 => ".p70",
      Self::P75 => ".p75",
      Self::P80 => ".p80",
      Self::P90 => ".p90",
      Self::P95 => ".p95",
      Self::P99 => ".p99",
      Self::P999 => ".p999",
      Self::P9999 => ".p9999",
    }
  }

  #[must_use]
  pub const fn quantile(self) -> Option<f64> {
    match self {
      Self::Median | Self::P50 => Some(0.5),
      Self::P10 => Some(0.1),
      Self::P20 => Some(0.2),
      Self::P30 => Some(0.3),
      Self::P40 => Some(0.4),
      Self::P60 => Some(0.6),
      Self::P70 => Some(0.7),
      Self::P75 => Some(0.75),
      Self::P80 => Some(0.8),
      Self::P90 => Some(0.9),
      Self::P95 => Some(0.95),
      Self::P99 => Some(0.99),
      Self::P999 => Some(0.999),
      Self::P9999 => Some(0.9999),
      Self::Last
      | Self::Min
      | Self::Max
      | Self::Mean
      | Self::Count
      | Self::Sum
      | Self::SumSq
      | Self::Stdev => None,
    }
  }

  #[must_use]
  pub const fn is_valid_for(self, metric_type: MetricType) -> bool {
    match self {
      Self::Min | Self::Max | Self::Mean | Self::Count | Self::Sum | Self::SumSq | Self::Stdev => {
        true
      },
      Self::Last => matches!(metric_type, MetricType::Gauge),
      _ => matches!(metric_type, MetricType::Timer),
    }
  }
}

//
// AggregationTypes
//

// An ordered set of aggregation types. An empty set selects the default aggregations for the
// metric type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregationTypes(Vec<AggregationType>);

impl AggregationTypes {
  #[must_use]
  pub fn new(types: Vec<AggregationType>) -> Self {
    Self(types)
  }

  #[must_use]
  pub fn is_default(&self) -> bool {
    self.0.is_empty()
  }

  #[must_use]
  pub fn as_slice(&self) -> &[AggregationType] {
    &self.0
  }

  // The aggregation types that are actually computed for a metric type.
  #[must_use]
  pub fn resolve(&self, metric_type: MetricType) -> &[AggregationType] {
    if !self.is_default() {
      return &self.0;
    }
    match metric_type {
      MetricType::Counter => DEFAULT_COUNTER_AGGREGATION_TYPES,
      MetricType::Gauge => DEFAULT_GAUGE_AGGREGATION_TYPES,
      MetricType::Timer => DEFAULT_TIMER_AGGREGATION_TYPES,
    }
  }

  #[must_use]
  pub fn is_valid_for(&self, metric_type: MetricType) -> bool {
    self.0.iter().all(|t| t.is_valid_for(metric_type))
  }

  // Distinct quantiles required by the resolved aggregation types, in ascending order.
  #[must_use]
  pub fn quantiles(&self, metric_type: MetricType) -> Vec<f64> {
    let mut quantiles: Vec<f64> = self
      .resolve(metric_type)
      .iter()
      .filter_map(|t| t.quantile())
      .collect();
    quantiles.sort_by(f64::total_cmp);
    quantiles.dedup();
    quantiles
  }
}

impl From<Vec<AggregationType>> for AggregationTypes {
  fn from(types: Vec<AggregationType>) -> Self {
    Self(types)
  }
}

// Suffix to flush an aggregation with. The default aggregation of counters and gauges is flushed
// under the bare ID.
#[must_use]
pub const fn flush_suffix(
  metric_type: MetricType,
  aggregation_type: AggregationType,
  use_default_aggregation: bool,
) -> &'static str {
  match metric_type {
    MetricType::Counter | MetricType::Gauge if use_default_aggregation => "",
    _ => aggregation_type.suffix(),
  }
}
