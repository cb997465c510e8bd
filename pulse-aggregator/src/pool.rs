// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./pool_test.rs"]
mod pool_test;

use parking_lot::Mutex;

//
// ObjectPool
//

// A bounded free list of reusable values. Values are owned by the pool while cached and are moved
// out on get(). Returning a value to a full pool drops it.
pub struct ObjectPool<T> {
  items: Mutex<Vec<T>>,
  capacity: usize,
}

impl<T> ObjectPool<T> {
  #[must_use]
  pub const fn new(capacity: usize) -> Self {
    Self {
      items: Mutex::new(Vec::new()),
      capacity,
    }
  }

  pub fn get(&self) -> Option<T> {
    self.items.lock().pop()
  }

  pub fn get_or_else(&self, f: impl FnOnce() -> T) -> T {
    self.get().unwrap_or_else(f)
  }

  // Returns false if the pool was full and the value was dropped.
  pub fn put(&self, item: T) -> bool {
    let mut items = self.items.lock();
    if items.len() >= self.capacity {
      return false;
    }
    items.push(item);
    true
  }

  pub fn len(&self) -> usize {
    self.items.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
