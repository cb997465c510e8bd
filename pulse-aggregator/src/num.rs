// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

// Numeric conversions used by the accumulators. All of these are intentionally lossy.

pub trait LossyIntToFloat {
  fn lossy_to_f64(self) -> f64;
}

impl LossyIntToFloat for i64 {
  #[allow(clippy::cast_precision_loss)]
  fn lossy_to_f64(self) -> f64 {
    self as f64
  }
}

impl LossyIntToFloat for u64 {
  #[allow(clippy::cast_precision_loss)]
  fn lossy_to_f64(self) -> f64 {
    self as f64
  }
}

impl LossyIntToFloat for usize {
  #[allow(clippy::cast_precision_loss)]
  fn lossy_to_f64(self) -> f64 {
    self as f64
  }
}

pub trait LossyFloatToInt {
  fn lossy_to_i64(self) -> i64;
  fn lossy_to_u64(self) -> u64;
  fn lossy_to_usize(self) -> usize;
}

impl LossyFloatToInt for f64 {
  #[allow(clippy::cast_possible_truncation)]
  fn lossy_to_i64(self) -> i64 {
    self as i64
  }

  #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
  fn lossy_to_u64(self) -> u64 {
    self as u64
  }

  #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
  fn lossy_to_usize(self) -> usize {
    self as usize
  }
}
