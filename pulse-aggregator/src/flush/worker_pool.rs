// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./worker_pool_test.rs"]
mod worker_pool_test;

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

//
// WorkerPool
//

// Runs blocking jobs with bounded parallelism.
pub struct WorkerPool {
  permits: Arc<Semaphore>,
}

impl WorkerPool {
  #[must_use]
  pub fn new(size: usize) -> Self {
    Self {
      permits: Arc::new(Semaphore::new(size.max(1))),
    }
  }

  // Runs every job and waits for all of them. Returns the number of jobs that failed to run or
  // panicked.
  pub async fn run_all<F>(&self, jobs: impl IntoIterator<Item = F>) -> usize
  where
    F: FnOnce() + Send + 'static,
  {
    let mut failed = 0;
    let mut join_set = JoinSet::new();
    for job in jobs {
      let Ok(permit) = self.permits.clone().acquire_owned().await else {
        failed += 1;
        continue;
      };
      join_set.spawn_blocking(move || {
        let _permit = permit;
        job();
      });
    }

    while let Some(result) = join_set.join_next().await {
      if let Err(e) = result {
        log::warn!("flush job failed: {e}");
        failed += 1;
      }
    }
    failed
  }
}
