//! Transaction resolution
//!
//! Each payout message points at the contract transaction that emitted it.
//! Resolving that transaction reveals the join payment and the full reward
//! fan-out. Callers pass only hashes the cache has not resolved yet; they
//! are fetched in small concurrent chunks.

use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::Timing;
use crate::indexer::{IndexerApi, Transaction};

/// Run `f` over `items` in chunks of `batch_size`, concurrently within a
/// chunk, pausing `delay` between chunks. Results keep input order.
pub async fn process_batch<T, R, F, Fut>(
    items: Vec<T>,
    batch_size: usize,
    delay: Duration,
    f: F,
) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let batch_size = batch_size.max(1);
    let mut results = Vec::with_capacity(items.len());
    let mut items = items.into_iter().peekable();
    let mut first = true;

    while items.peek().is_some() {
        if !first {
            sleep(delay).await;
        }
        first = false;

        let chunk: Vec<Fut> = items.by_ref().take(batch_size).map(&f).collect();
        results.extend(join_all(chunk).await);
    }

    results
}

/// Outcome of resolving a set of hashes
#[derive(Debug, Default)]
pub struct Resolved {
    /// Newly fetched transactions by hash
    pub transactions: HashMap<String, Transaction>,
    /// Hashes the indexer had no record of, or that failed to fetch
    pub missing: Vec<String>,
}

#[derive(Clone)]
pub struct TransactionResolver {
    api: Arc<dyn IndexerApi>,
    batch_size: usize,
    batch_delay: Duration,
}

impl TransactionResolver {
    pub fn new(api: Arc<dyn IndexerApi>, batch_size: usize, batch_delay: Duration) -> Self {
        Self {
            api,
            batch_size,
            batch_delay,
        }
    }

    pub fn from_timing(api: Arc<dyn IndexerApi>, timing: &Timing) -> Self {
        Self::new(api, timing.batch_size, timing.batch_delay)
    }

    /// Fetch every distinct hash in `hashes`
    pub async fn resolve_batch(&self, hashes: &[String]) -> Resolved {
        let mut seen = HashSet::new();
        let pending: Vec<String> = hashes
            .iter()
            .filter(|h| seen.insert(*h))
            .cloned()
            .collect();

        if pending.is_empty() {
            return Resolved::default();
        }
        debug!(count = pending.len(), "resolving transactions");

        let results = process_batch(pending, self.batch_size, self.batch_delay, |hash| async move {
            let tx = self.fetch_one(&hash).await;
            (hash, tx)
        })
        .await;

        let mut resolved = Resolved::default();
        for (hash, tx) in results {
            match tx {
                Some(tx) => {
                    resolved.transactions.insert(hash, tx);
                }
                None => resolved.missing.push(hash),
            }
        }
        resolved
    }

    async fn fetch_one(&self, hash: &str) -> Option<Transaction> {
        match self.api.fetch_transaction(hash).await {
            Ok(Some(tx)) => Some(tx),
            Ok(None) => {
                warn!(hash, "transaction not found by indexer");
                None
            }
            Err(e) => {
                warn!(hash, "failed to resolve transaction: {}", e);
                None
            }
        }
    }
}
