//! Cached index statistics.
//!
//! Computing stats scans both tables, so concurrent callers share one
//! in-flight computation and the result is cached until the next write.

use std::future::Future;
use std::sync::Arc;

use ipc::StatsResult;
use moka::future::Cache;

const STATS_KEY: u8 = 0;

#[derive(Clone)]
pub struct StatsCache {
  cache: Cache<u8, StatsResult>,
}

impl StatsCache {
  pub fn new() -> Self {
    Self {
      cache: Cache::new(1),
    }
  }

  /// Return the cached stats, or run `compute` once and share the result
  /// with every concurrent caller.
  pub async fn get_or_compute<F, Fut>(&self, compute: F) -> Result<StatsResult, String>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StatsResult, String>>,
  {
    self
      .cache
      .try_get_with(STATS_KEY, compute())
      .await
      .map_err(|e: Arc<String>| (*e).clone())
  }

  /// Drop the cached value; called after any write to either table.
  pub fn invalidate(&self) {
    self.cache.invalidate_all();
  }
}

impl Default for StatsCache {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn stats(total: u64) -> StatsResult {
    StatsResult {
      total_chunks: total,
      indexed_files: 1,
      folder_stats: Vec::new(),
    }
  }

  #[tokio::test]
  async fn concurrent_callers_share_one_computation() {
    let cache = StatsCache::new();
    let computations = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
      let cache = cache.clone();
      let computations = computations.clone();
      tasks.push(tokio::spawn(async move {
        cache
          .get_or_compute(|| async move {
            computations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok(stats(42))
          })
          .await
      }));
    }

    for task in tasks {
      assert_eq!(task.await.unwrap().unwrap().total_chunks, 42);
    }
    assert_eq!(computations.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn invalidate_forces_recompute() {
    let cache = StatsCache::new();

    let first = cache.get_or_compute(|| async { Ok(stats(1)) }).await.unwrap();
    assert_eq!(first.total_chunks, 1);

    // Still cached: the new closure must not run.
    let cached = cache.get_or_compute(|| async { Ok(stats(2)) }).await.unwrap();
    assert_eq!(cached.total_chunks, 1);

    cache.invalidate();
    let fresh = cache.get_or_compute(|| async { Ok(stats(3)) }).await.unwrap();
    assert_eq!(fresh.total_chunks, 3);
  }

  #[tokio::test]
  async fn errors_are_not_cached() {
    let cache = StatsCache::new();
    let result = cache
      .get_or_compute(|| async { Err::<StatsResult, _>("boom".to_string()) })
      .await;
    assert!(result.is_err());

    let ok = cache.get_or_compute(|| async { Ok(stats(5)) }).await.unwrap();
    assert_eq!(ok.total_chunks, 5);
  }
}
