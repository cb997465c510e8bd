// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./quantile_test.rs"]
mod quantile_test;

// Targeted quantile estimation using the Cormode-Muthukrishnan algorithm from "Effective
// Computation of Biased Quantiles over Data Streams", following statsite's cm_quantile. Values are
// buffered in two heaps split at the insert cursor, and both insertion and compression advance
// incrementally through the sample list on every add.

use crate::num::{LossyFloatToInt, LossyIntToFloat};
use crate::slab_list::{SlabHandle, SlabList};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::collections::binary_heap::PeekMut;

//
// Sample
//

// A summary tuple: `width` is the difference between the lowest rank of this value and the
// previous one, `delta` is the uncertainty of the rank.
#[derive(Clone, Copy, Debug)]
struct Sample {
  value: f64,
  width: u64,
  delta: u64,
}

//
// Buffered
//

// A value waiting to be inserted. NaN never reaches the buffers.
#[derive(Clone, Copy, Debug)]
struct Buffered(f64);

impl PartialEq for Buffered {
  fn eq(&self, other: &Self) -> bool {
    self.cmp(other) == Ordering::Equal
  }
}

impl Eq for Buffered {}

impl PartialOrd for Buffered {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Buffered {
  fn cmp(&self, other: &Self) -> Ordering {
    self.0.total_cmp(&other.0)
  }
}

//
// QuantileStream
//

#[derive(Debug)]
pub struct QuantileStream {
  epsilon: f64,
  quantiles: Vec<f64>,

  num_samples: u64,
  num_values: u64,

  samples: SlabList<Sample>,
  // Values below the insert cursor wait for the next pass.
  buf_less: BinaryHeap<Reverse<Buffered>>,
  buf_more: BinaryHeap<Reverse<Buffered>>,

  insert_cursor: Option<SlabHandle>,
  compress_cursor: Option<SlabHandle>,
  compress_min_rank: u64,
}

impl QuantileStream {
  #[must_use]
  pub fn new(epsilon: f64, quantiles: Vec<f64>) -> Self {
    Self {
      epsilon,
      quantiles,
      num_samples: 0,
      num_values: 0,
      samples: SlabList::default(),
      buf_less: BinaryHeap::new(),
      buf_more: BinaryHeap::new(),
      insert_cursor: None,
      compress_cursor: None,
      compress_min_rank: 0,
    }
  }

  // Prepares a pooled stream for reuse. Allocations are retained.
  pub fn reset(&mut self, epsilon: f64, quantiles: &[f64]) {
    self.epsilon = epsilon;
    self.quantiles.clear();
    self.quantiles.extend_from_slice(quantiles);
    self.num_samples = 0;
    self.num_values = 0;
    self.samples.clear();
    self.buf_less.clear();
    self.buf_more.clear();
    self.insert_cursor = None;
    self.compress_cursor = None;
    self.compress_min_rank = 0;
  }

  pub fn add(&mut self, value: f64) {
    if value.is_nan() {
      return;
    }
    self.add_to_buffer(value);
    self.insert();
    self.compress();
  }

  // Values seen so far, including the ones still buffered.
  #[must_use]
  pub fn count(&self) -> u64 {
    let buffered = u64::try_from(self.buf_less.len() + self.buf_more.len()).unwrap_or(u64::MAX);
    self.num_values + buffered
  }

  fn sample(&self, handle: Option<SlabHandle>) -> Option<Sample> {
    handle.and_then(|handle| self.samples.get(handle)).copied()
  }

  fn add_to_buffer(&mut self, value: f64) {
    let cursor_value = self.sample(self.insert_cursor).map_or(0.0, |s| s.value);
    if self.num_values > 0 && value < cursor_value {
      self.buf_less.push(Reverse(Buffered(value)));
    } else {
      self.buf_more.push(Reverse(Buffered(value)));
    }
  }

  // Moves buffered values into the sample list, advancing the insert cursor by a bounded number of
  // samples per call.
  fn insert(&mut self) {
    if self.samples.is_empty() {
      if let Some(Reverse(Buffered(value))) = self.buf_more.pop() {
        let handle = self.samples.push_back(Sample {
          value,
          width: 1,
          delta: 0,
        });
        self.num_values += 1;
        self.num_samples += 1;
        self.insert_cursor = Some(handle);
      }
      return;
    }

    if self.insert_cursor.is_none() {
      self.insert_cursor = self.samples.front();
    }

    for _ in 0 .. self.cursor_increment() {
      let Some(cursor) = self.insert_cursor else {
        break;
      };
      let Some(at_cursor) = self.samples.get(cursor).copied() else {
        break;
      };
      while let Some(next) = self.buf_more.peek_mut() {
        if next.0.0 > at_cursor.value {
          break;
        }
        let Reverse(Buffered(value)) = PeekMut::pop(next);
        if self
          .compress_cursor
          .and_then(|handle| self.samples.get(handle))
          .is_some_and(|compress| compress.value >= value)
        {
          self.compress_min_rank += 1;
        }
        self.samples.insert_before(cursor, Sample {
          value,
          width: 1,
          delta: at_cursor.width + at_cursor.delta - 1,
        });
        self.num_values += 1;
        self.num_samples += 1;
      }
      self.insert_cursor = self.samples.next(cursor);
    }

    // The cursor walked off the end, so the remaining larger values are appended.
    if self.insert_cursor.is_none() {
      let mut last_value = self.sample(self.samples.back()).map_or(f64::MIN, |s| s.value);
      while let Some(next) = self.buf_more.peek_mut() {
        if next.0.0 <= last_value {
          break;
        }
        let Reverse(Buffered(value)) = PeekMut::pop(next);
        self.samples.push_back(Sample {
          value,
          width: 1,
          delta: 0,
        });
        self.num_values += 1;
        self.num_samples += 1;
        last_value = value;
      }
      self.reset_insert_cursor();
    }
  }

  fn reset_insert_cursor(&mut self) {
    std::mem::swap(&mut self.buf_less, &mut self.buf_more);
    self.insert_cursor = None;
  }

  // Number of samples each insert or compress pass advances over.
  fn cursor_increment(&self) -> u64 {
    (self.num_samples.lossy_to_f64() * self.epsilon)
      .ceil()
      .lossy_to_u64()
  }

  // Walks from the back of the list towards the front, folding each sample into its successor while
  // the combined tuple stays within the error bound.
  fn compress(&mut self) {
    if self.num_samples < 3 {
      return;
    }

    if self.compress_cursor.is_none() {
      let Some(before_last) = self.samples.back().and_then(|last| self.samples.prev(last)) else {
        return;
      };
      let width = self.sample(Some(before_last)).map_or(0, |s| s.width);
      self.compress_min_rank = (self.num_values - 1).saturating_sub(width);
      self.compress_cursor = self.samples.prev(before_last);
    }

    for _ in 0 .. self.cursor_increment() {
      let Some(cursor) = self.compress_cursor else {
        break;
      };
      if self.samples.front() == Some(cursor) {
        break;
      }
      let Some(next) = self.samples.next(cursor) else {
        break;
      };
      let (Some(current), Some(next_sample)) = (self.sample(Some(cursor)), self.sample(Some(next)))
      else {
        break;
      };

      let max_rank = self.compress_min_rank + current.width + current.delta;
      self.compress_min_rank = self.compress_min_rank.saturating_sub(current.width);
      let threshold = self.threshold(max_rank.lossy_to_f64());
      self.compress_cursor = self.samples.prev(cursor);
      if current.width + next_sample.width + next_sample.delta <= threshold {
        if let Some(next_sample) = self.samples.get_mut(next) {
          next_sample.width += current.width;
        }
        if self.insert_cursor == Some(cursor) {
          self.insert_cursor = Some(next);
        }
        self.samples.remove(cursor);
        self.num_samples -= 1;
      }
    }

    if self.compress_cursor.is_some() && self.compress_cursor == self.samples.front() {
      self.compress_cursor = None;
    }
  }

  // The allowable error at a rank, taken as the tightest bound across the targeted quantiles.
  fn threshold(&self, rank: f64) -> u64 {
    let num_values = self.num_values.lossy_to_f64();
    self
      .quantiles
      .iter()
      .map(|&quantile| {
        if rank >= quantile * num_values {
          2.0 * self.epsilon * rank / quantile
        } else {
          2.0 * self.epsilon * (num_values - rank) / (1.0 - quantile)
        }
      })
      .fold(f64::MAX, f64::min)
      .lossy_to_u64()
  }

  // Drains both buffers into the sample list for the most accurate queries.
  pub fn flush(&mut self) {
    while !self.buf_less.is_empty() || !self.buf_more.is_empty() {
      if self.buf_more.is_empty() {
        self.reset_insert_cursor();
      }
      self.insert();
      self.compress();
    }
  }

  // Estimates a quantile. Buffered values must have been flushed for them to be included. An empty
  // stream returns 0.
  #[must_use]
  pub fn query(&self, quantile: f64) -> f64 {
    let rank = (quantile * self.num_values.lossy_to_f64())
      .ceil()
      .lossy_to_u64();
    let threshold = (self.threshold(rank.lossy_to_f64()).lossy_to_f64() / 2.0)
      .ceil()
      .lossy_to_u64();
    let limit = rank.saturating_add(threshold);

    let mut min_rank = 0;
    let mut previous = None;
    for (_, sample) in self.samples.iter() {
      if min_rank + sample.width + sample.delta > limit {
        break;
      }
      min_rank += sample.width;
      previous = Some(sample);
    }
    previous
      .or_else(|| self.samples.iter().next().map(|(_, sample)| sample))
      .map_or(0.0, |sample| sample.value)
  }
}
