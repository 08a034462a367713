//! Squad reconciliation
//!
//! [`SquadIndex`] ties the pieces together: it fetches an owner's payout
//! messages since the cached watermark, resolves their transactions,
//! classifies the fan-out and rebuilds the owner's tree from everything
//! cached. Reconciliations for the same owner are serialized; different
//! owners proceed independently, sharing the one request gateway.
//!
//! None of the public operations fail. Indexer or storage trouble is logged
//! and the caller gets cached (possibly empty) data.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

use crate::address::Address;
use crate::cache::{CacheService, CacheStats, is_fresh, now_millis};
use crate::classifier::{BandTable, RelationshipMaps};
use crate::config::{Config, Timing};
use crate::contract::{HierarchyGetter, HierarchyRow};
use crate::error::IndexerResult;
use crate::fetcher::MessageFetcher;
use crate::hierarchy::{self, CompleteHierarchy};
use crate::indexer::{IndexerApi, MessageFilter};
use crate::resolver::TransactionResolver;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub hierarchy: CompleteHierarchy,
    /// Messages not seen before this pass
    pub new_messages: usize,
    /// Whether the indexer was queried
    pub fetched: bool,
    /// False when the fetch stopped at the page ceiling or failed part way
    pub complete: bool,
}

#[derive(Clone)]
pub struct SquadIndex {
    api: Arc<dyn IndexerApi>,
    cache: Arc<Mutex<CacheService>>,
    fetcher: MessageFetcher,
    resolver: TransactionResolver,
    contract: Address,
    bands: BandTable,
    timing: Timing,
    owner_locks: Arc<std::sync::Mutex<HashMap<Address, Arc<Mutex<()>>>>>,
    /// Refreshes that outlived `update_wait`
    background: Arc<std::sync::Mutex<Vec<JoinHandle<Reconciliation>>>>,
    getter: Option<Arc<dyn HierarchyGetter>>,
}

impl SquadIndex {
    pub fn new(api: Arc<dyn IndexerApi>, cache: CacheService, config: &Config) -> Self {
        Self {
            fetcher: MessageFetcher::from_timing(&config.timing),
            resolver: TransactionResolver::from_timing(api.clone(), &config.timing),
            api,
            cache: Arc::new(Mutex::new(cache)),
            contract: config.contract,
            bands: config.bands.clone(),
            timing: config.timing.clone(),
            owner_locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
            background: Arc::new(std::sync::Mutex::new(Vec::new())),
            getter: None,
        }
    }

    pub fn with_hierarchy_getter(mut self, getter: Arc<dyn HierarchyGetter>) -> Self {
        self.getter = Some(getter);
        self
    }

    fn owner_lock(&self, owner: &Address) -> Arc<Mutex<()>> {
        let mut locks = self
            .owner_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(*owner).or_default().clone()
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Bring the owner's cache up to date and rebuild the tree.
    ///
    /// Without `force`, a reconciliation younger than the staleness window
    /// skips the indexer and rebuilds from cache.
    pub async fn reconcile(&self, owner: &Address, force: bool) -> Reconciliation {
        let lock = self.owner_lock(owner);
        let _guard = lock.lock().await;

        let now = now_millis();
        let (watermark, fresh) = {
            let cache = self.cache.lock().await;
            let entry = cache.messages(owner);
            (
                entry.and_then(|e| e.watermark),
                entry.is_some_and(|e| is_fresh(e.last_checked, now, self.timing.staleness)),
            )
        };

        let mut new_messages = 0;
        let mut fetched = false;
        let mut complete = fresh;

        if force || !fresh {
            let filter = MessageFilter::payouts(self.contract, *owner, watermark);
            match self.fetcher.fetch(self.api.as_ref(), &filter).await {
                Ok(result) => {
                    fetched = true;
                    complete = !result.has_more;
                    new_messages = self
                        .cache
                        .lock()
                        .await
                        .messages_mut(owner)
                        .merge(result.messages);

                    self.resolve_pending(owner).await;

                    if complete {
                        let mut cache = self.cache.lock().await;
                        let entry = cache.messages_mut(owner);
                        entry.advance_watermark();
                        entry.last_checked = Some(now);
                    }
                }
                Err(e) => {
                    warn!(owner = %owner, "payout fetch failed, using cached messages: {}", e);
                }
            }
        } else {
            debug!(owner = %owner, "reconciliation is fresh, skipping fetch");
        }

        let hierarchy = self.rebuild(owner).await;
        info!(
            owner = %owner,
            new_messages,
            captains = hierarchy.counts.captains,
            total = hierarchy.total_members,
            complete,
            "hierarchy rebuilt"
        );

        Reconciliation {
            hierarchy,
            new_messages,
            fetched,
            complete,
        }
    }

    /// Resolve every cached message whose transaction is still unknown,
    /// including ones that failed on earlier passes
    async fn resolve_pending(&self, owner: &Address) {
        let pending = self.cache.lock().await.unresolved_hashes(owner);
        if pending.is_empty() {
            return;
        }

        let resolved = self.resolver.resolve_batch(&pending).await;
        if !resolved.missing.is_empty() {
            warn!(
                owner = %owner,
                missing = resolved.missing.len(),
                "some payout transactions could not be resolved"
            );
        }

        self.cache
            .lock()
            .await
            .insert_transactions(resolved.transactions);
    }

    /// Recompute the tree from every cached transaction and persist it.
    ///
    /// The stored tree and member lists carry the time of the owner's last
    /// complete reconciliation, so a partial or failed fetch never makes
    /// them look fresh.
    async fn rebuild(&self, owner: &Address) -> CompleteHierarchy {
        let mut cache = self.cache.lock().await;
        let checked_at = cache.messages(owner).and_then(|m| m.last_checked);

        let maps = RelationshipMaps::from_transactions(
            cache.owner_transactions(owner),
            &self.bands,
            &self.contract,
        );
        let hierarchy = hierarchy::build(*owner, &maps);

        cache.store_hierarchy(hierarchy.clone(), checked_at);
        if let Err(e) = cache.flush().await {
            error!(owner = %owner, "failed to persist cache: {:#}", e);
        }

        hierarchy
    }

    fn cached_or_empty(cache: &CacheService, owner: &Address) -> CompleteHierarchy {
        cache
            .hierarchy(owner)
            .map(|entry| entry.hierarchy.clone())
            .unwrap_or_else(|| CompleteHierarchy::empty(*owner))
    }

    async fn cached_hierarchy(&self, owner: &Address) -> CompleteHierarchy {
        Self::cached_or_empty(&*self.cache.lock().await, owner)
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Fetch new payouts and rebuild the owner's tree
    pub async fn build_complete_hierarchy(&self, owner: &Address) -> CompleteHierarchy {
        self.reconcile(owner, true).await.hierarchy
    }

    /// Cached tree when fresh, otherwise reconcile first
    pub async fn get_or_refresh(&self, owner: &Address) -> CompleteHierarchy {
        {
            let cache = self.cache.lock().await;
            let fresh = cache
                .messages(owner)
                .is_some_and(|m| is_fresh(m.last_checked, now_millis(), self.timing.staleness));
            if fresh {
                if let Some(entry) = cache.hierarchy(owner) {
                    debug!(owner = %owner, "serving cached hierarchy");
                    return entry.hierarchy.clone();
                }
            }
        }

        self.reconcile(owner, false).await.hierarchy
    }

    /// Direct children of `address` as of the last rebuild that saw it.
    ///
    /// Works for any node of a tree: owners, captains and caporals all get
    /// their member list recorded when an owner's tree is rebuilt.
    pub async fn get_squad_members(&self, address: &Address, force_refresh: bool) -> Vec<Address> {
        let stale = {
            let cache = self.cache.lock().await;
            cache.squad_members(address).is_none_or(|entry| {
                !is_fresh(entry.last_updated, now_millis(), self.timing.staleness)
            })
        };

        if force_refresh || stale {
            self.reconcile(address, true).await;
        }

        self.cache
            .lock()
            .await
            .squad_members(address)
            .map(|entry| entry.members.clone())
            .unwrap_or_default()
    }

    /// Refresh in the background, waiting at most `update_wait` for it.
    ///
    /// If the refresh finishes in time its tree is returned. Otherwise the
    /// cached tree is returned and the refresh keeps running so the next
    /// call sees its result. Short-lived callers should await
    /// [`finish_background`](Self::finish_background) before exiting.
    pub async fn fetch_payouts_and_update_hierarchy(&self, owner: &Address) -> CompleteHierarchy {
        let this = self.clone();
        let target = *owner;
        let mut task = tokio::spawn(async move { this.reconcile(&target, true).await });

        let waited = timeout(self.timing.update_wait, &mut task).await;
        match waited {
            Ok(Ok(result)) => {
                if result.new_messages > 0 {
                    info!(
                        owner = %owner,
                        new_messages = result.new_messages,
                        "hierarchy updated with new payouts"
                    );
                }
                result.hierarchy
            }
            Ok(Err(e)) => {
                error!(owner = %owner, "refresh task failed: {}", e);
                self.cached_hierarchy(owner).await
            }
            Err(_) => {
                debug!(
                    owner = %owner,
                    wait = ?self.timing.update_wait,
                    "refresh still running, serving cached hierarchy"
                );
                self.background
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(task);
                self.cached_hierarchy(owner).await
            }
        }
    }

    /// Wait for every refresh that outlived its caller's wait
    pub async fn finish_background(&self) -> Vec<Reconciliation> {
        let tasks: Vec<_> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut finished = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(result) => finished.push(result),
                Err(e) => error!("background refresh failed: {}", e),
            }
        }
        finished
    }

    /// Whether `address` ever paid the join amount to the contract
    pub async fn is_enlisted(&self, address: &Address) -> IndexerResult<bool> {
        let filter = MessageFilter::joins(*address, self.contract, self.bands.join_payment().base());
        let page = self.api.fetch_message_page(&filter, 1, 0).await?;
        Ok(!page.is_empty())
    }

    /// Reconcile every `refresh_interval` once the owner is enlisted, until
    /// `shutdown` resolves
    pub async fn watch<S, F>(&self, owner: &Address, shutdown: S, mut on_update: F)
    where
        S: Future<Output = ()>,
        F: FnMut(&Reconciliation),
    {
        let period = self.timing.refresh_interval.max(Duration::from_millis(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut enlisted = false;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(owner = %owner, "watch stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if !enlisted {
                        match self.is_enlisted(owner).await {
                            Ok(true) => {
                                info!(owner = %owner, "owner is enlisted, starting refreshes");
                                enlisted = true;
                            }
                            Ok(false) => {
                                debug!(owner = %owner, "owner not enlisted yet");
                                continue;
                            }
                            Err(e) => {
                                warn!(owner = %owner, "enlistment check failed: {}", e);
                                continue;
                            }
                        }
                    }

                    let result = self.reconcile(owner, true).await;
                    on_update(&result);
                }
            }
        }
    }

    /// The account's own row from the contract getter, when one is configured
    pub async fn own_row(&self, address: &Address) -> Option<HierarchyRow> {
        let getter = self.getter.as_ref()?;
        match getter.get_hierarchy(address).await {
            Ok(row) => row,
            Err(e) => {
                warn!(address = %address, "hierarchy getter failed: {:#}", e);
                None
            }
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.lock().await.stats()
    }
}
