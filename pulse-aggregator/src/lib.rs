// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod aggregation;
pub mod config;
pub mod element;
pub mod entry;
pub mod flush;
pub mod list;
pub mod map;
pub mod metric;
pub mod num;
pub mod options;
pub mod pipeline;
pub mod pool;
pub mod rate_limiter;
pub mod slab_list;
#[cfg(test)]
pub mod test;
pub mod time;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  bd_log::SwapLogger::initialize();
}
