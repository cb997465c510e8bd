// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./transformation_test.rs"]
mod transformation_test;

use crate::num::LossyIntToFloat;
use crate::time::NANOS_PER_SECOND;

//
// Datapoint
//

// A single timestamped value. A NaN value marks an empty datapoint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Datapoint {
  pub time_nanos: i64,
  pub value: f64,
}

impl Datapoint {
  #[must_use]
  pub const fn empty() -> Self {
    Self {
      time_nanos: 0,
      value: f64::NAN,
    }
  }

  #[must_use]
  pub const fn is_empty(&self) -> bool {
    self.value.is_nan()
  }
}

//
// TransformKind
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransformKind {
  // f(curr)
  Unary,
  // f(prev, curr)
  Binary,
  // f(curr) producing an optional second datapoint.
  UnaryMulti,
}

//
// TransformationType
//

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformationType {
  Absolute,
  PerSecond,
  Increase,
  Reset,
}

impl TransformationType {
  #[must_use]
  pub const fn kind(self) -> TransformKind {
    match self {
      Self::Absolute => TransformKind::Unary,
      Self::PerSecond | Self::Increase => TransformKind::Binary,
      Self::Reset => TransformKind::UnaryMulti,
    }
  }

  // Number of previous values this transformation needs to look back over.
  #[must_use]
  pub const fn derivative_order(self) -> usize {
    match self.kind() {
      TransformKind::Binary => 1,
      TransformKind::Unary | TransformKind::UnaryMulti => 0,
    }
  }

  #[must_use]
  pub fn apply_unary(self, curr: Datapoint) -> Datapoint {
    match self {
      Self::Absolute => Datapoint {
        time_nanos: curr.time_nanos,
        value: curr.value.abs(),
      },
      Self::PerSecond | Self::Increase | Self::Reset => curr,
    }
  }

  #[must_use]
  pub fn apply_binary(self, prev: Datapoint, curr: Datapoint) -> Datapoint {
    match self {
      Self::PerSecond => per_second(prev, curr),
      Self::Increase => increase(prev, curr),
      Self::Absolute | Self::Reset => curr,
    }
  }

  // Reset emits the value and then a zero half a resolution later so that downstream consumers
  // see the series drop back to zero between windows.
  #[must_use]
  pub fn apply_unary_multi(
    self,
    curr: Datapoint,
    resolution_nanos: i64,
  ) -> (Datapoint, Option<Datapoint>) {
    match self {
      Self::Reset => {
        if curr.is_empty() {
          return (curr, None);
        }
        (
          curr,
          Some(Datapoint {
            time_nanos: curr.time_nanos + resolution_nanos / 2,
            value: 0.0,
          }),
        )
      },
      Self::Absolute | Self::PerSecond | Self::Increase => (curr, None),
    }
  }
}

fn per_second(prev: Datapoint, curr: Datapoint) -> Datapoint {
  if prev.time_nanos >= curr.time_nanos || prev.is_empty() || curr.is_empty() {
    return Datapoint::empty();
  }
  let diff = curr.value - prev.value;
  if diff < 0.0 {
    return Datapoint::empty();
  }
  let elapsed = (curr.time_nanos - prev.time_nanos).lossy_to_f64();
  Datapoint {
    time_nanos: curr.time_nanos,
    value: diff * NANOS_PER_SECOND.lossy_to_f64() / elapsed,
  }
}

fn increase(prev: Datapoint, curr: Datapoint) -> Datapoint {
  if curr.is_empty() {
    return Datapoint::empty();
  }
  if prev.is_empty() {
    return curr;
  }
  let diff = curr.value - prev.value;
  Datapoint {
    time_nanos: curr.time_nanos,
    // A negative delta means the source reset, count everything since the reset.
    value: if diff < 0.0 { curr.value } else { diff },
  }
}
