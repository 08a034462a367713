//! Typed caches over the key-value store
//!
//! Layout in the store:
//! - `messages:<owner>`: the owner's payout messages plus the fetch watermark
//! - `transactions`: resolved transactions by hash
//! - `squad_members`: direct children of every tree node seen in a rebuild
//! - `hierarchy:<owner>`: the last rebuilt tree
//!
//! Everything here can be rebuilt from the message log; a corrupt entry is
//! logged and treated as missing.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::address::Address;
use crate::hierarchy::CompleteHierarchy;
use crate::indexer::{Message, Transaction};
use crate::store::CacheStore;

const MESSAGES_PREFIX: &str = "messages:";
const HIERARCHY_PREFIX: &str = "hierarchy:";
const TRANSACTIONS_KEY: &str = "transactions";
const SQUAD_MEMBERS_KEY: &str = "squad_members";

/// Current time as unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Whether `last` (unix ms) lies less than `window` before `now`
pub fn is_fresh(last: Option<i64>, now: i64, window: Duration) -> bool {
    let window = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    last.is_some_and(|t| now.saturating_sub(t) < window)
}

// =============================================================================
// Entries
// =============================================================================

/// Payout messages for one owner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCache {
    /// Newest first, unique by hash
    pub messages: Vec<Message>,
    /// Newest timestamp covered by a complete fetch
    pub watermark: Option<u64>,
    /// Unix ms of the last complete reconciliation
    pub last_checked: Option<i64>,
}

impl MessageCache {
    /// Merge fetched messages, returning how many were new
    pub fn merge(&mut self, fetched: Vec<Message>) -> usize {
        let before = self.messages.len();
        let mut seen: HashSet<String> = self.messages.iter().map(|m| m.hash.clone()).collect();

        for message in fetched {
            if seen.insert(message.hash.clone()) {
                self.messages.push(message);
            }
        }

        self.messages.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.hash.cmp(&b.hash))
        });

        self.messages.len() - before
    }

    /// Move the watermark up to the newest cached message
    pub fn advance_watermark(&mut self) {
        if let Some(newest) = self.messages.first() {
            let newest = newest.created_at;
            self.watermark = Some(self.watermark.map_or(newest, |w| w.max(newest)));
        }
    }

    /// Transaction hashes referenced by the cached messages
    pub fn transaction_hashes(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().filter_map(|m| m.transaction_hash())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquadMembersEntry {
    pub members: Vec<Address>,
    /// Unix ms of the complete reconciliation this came from, if any
    pub last_updated: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyEntry {
    pub hierarchy: CompleteHierarchy,
    /// Unix ms of the complete reconciliation this came from, if any
    pub last_updated: Option<i64>,
}

// =============================================================================
// Service
// =============================================================================

/// In-memory view of the cache with explicit load/flush against a store
pub struct CacheService {
    store: Arc<dyn CacheStore>,
    messages: HashMap<Address, MessageCache>,
    transactions: HashMap<String, Transaction>,
    squad_members: BTreeMap<Address, SquadMembersEntry>,
    hierarchies: HashMap<Address, HierarchyEntry>,
    dirty: BTreeSet<String>,
}

impl CacheService {
    /// Empty service; call [`load`](Self::load) to read the store
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            messages: HashMap::new(),
            transactions: HashMap::new(),
            squad_members: BTreeMap::new(),
            hierarchies: HashMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Construct and load in one step
    pub async fn open(store: Arc<dyn CacheStore>) -> Result<Self> {
        let mut service = Self::new(store);
        service.load().await?;
        Ok(service)
    }

    /// Replace in-memory state with what the store holds
    pub async fn load(&mut self) -> Result<()> {
        let keys = self.store.keys().await.context("Failed to list cache keys")?;

        self.transactions = self.read_json(TRANSACTIONS_KEY).await?.unwrap_or_default();
        self.squad_members = self.read_json(SQUAD_MEMBERS_KEY).await?.unwrap_or_default();
        self.messages.clear();
        self.hierarchies.clear();
        self.dirty.clear();

        for key in &keys {
            if let Some(owner) = key.strip_prefix(MESSAGES_PREFIX) {
                let Some(owner) = parse_owner_key(key, owner) else {
                    continue;
                };
                if let Some(entry) = self.read_json(key).await? {
                    self.messages.insert(owner, entry);
                }
            } else if let Some(owner) = key.strip_prefix(HIERARCHY_PREFIX) {
                let Some(owner) = parse_owner_key(key, owner) else {
                    continue;
                };
                if let Some(entry) = self.read_json(key).await? {
                    self.hierarchies.insert(owner, entry);
                }
            }
        }

        debug!(
            owners = self.messages.len(),
            transactions = self.transactions.len(),
            "cache loaded"
        );
        Ok(())
    }

    /// Write every modified entry back to the store
    pub async fn flush(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }

        let mut entries = Vec::with_capacity(self.dirty.len());
        for key in &self.dirty {
            if let Some(value) = self.serialize_entry(key)? {
                entries.push((key.clone(), value));
            }
        }

        self.store
            .set_many(&entries)
            .await
            .context("Failed to write cache entries")?;

        debug!(entries = entries.len(), "cache flushed");
        self.dirty.clear();
        Ok(())
    }

    fn serialize_entry(&self, key: &str) -> Result<Option<String>> {
        let value = if key == TRANSACTIONS_KEY {
            Some(serde_json::to_string(&self.transactions)?)
        } else if key == SQUAD_MEMBERS_KEY {
            Some(serde_json::to_string(&self.squad_members)?)
        } else if let Some(owner) = key.strip_prefix(MESSAGES_PREFIX) {
            let owner: Address = owner.parse()?;
            self.messages
                .get(&owner)
                .map(serde_json::to_string)
                .transpose()?
        } else if let Some(owner) = key.strip_prefix(HIERARCHY_PREFIX) {
            let owner: Address = owner.parse()?;
            self.hierarchies
                .get(&owner)
                .map(serde_json::to_string)
                .transpose()?
        } else {
            None
        };
        Ok(value)
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(text) = self
            .store
            .get(key)
            .await
            .with_context(|| format!("Failed to read cache entry {}", key))?
        else {
            return Ok(None);
        };

        match serde_json::from_str(&text) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, "corrupt cache entry, treating as empty: {}", e);
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Messages
    // =========================================================================

    pub fn messages(&self, owner: &Address) -> Option<&MessageCache> {
        self.messages.get(owner)
    }

    /// Mutable access; the entry is written on the next flush
    pub fn messages_mut(&mut self, owner: &Address) -> &mut MessageCache {
        self.dirty.insert(messages_key(owner));
        self.messages.entry(*owner).or_default()
    }

    /// Transaction hashes of the owner's messages that are not resolved yet
    pub fn unresolved_hashes(&self, owner: &Address) -> Vec<String> {
        let Some(cache) = self.messages.get(owner) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        cache
            .transaction_hashes()
            .filter(|h| !self.transactions.contains_key(*h) && seen.insert(*h))
            .map(str::to_string)
            .collect()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn transactions(&self) -> &HashMap<String, Transaction> {
        &self.transactions
    }

    pub fn insert_transactions(&mut self, transactions: impl IntoIterator<Item = (String, Transaction)>) {
        let before = self.transactions.len();
        self.transactions.extend(transactions);
        if self.transactions.len() != before {
            self.dirty.insert(TRANSACTIONS_KEY.to_string());
        }
    }

    /// Resolved transactions for the owner's cached messages
    pub fn owner_transactions(&self, owner: &Address) -> Vec<&Transaction> {
        let Some(cache) = self.messages.get(owner) else {
            return Vec::new();
        };
        cache
            .transaction_hashes()
            .filter_map(|h| self.transactions.get(h))
            .collect()
    }

    // =========================================================================
    // Hierarchies and squad members
    // =========================================================================

    pub fn hierarchy(&self, owner: &Address) -> Option<&HierarchyEntry> {
        self.hierarchies.get(owner)
    }

    pub fn squad_members(&self, address: &Address) -> Option<&SquadMembersEntry> {
        self.squad_members.get(address)
    }

    /// Store a rebuilt tree and fan its member lists out to every node.
    ///
    /// `checked_at` is the owner's last complete reconciliation; `None`
    /// leaves the lists stale.
    pub fn store_hierarchy(&mut self, hierarchy: CompleteHierarchy, checked_at: Option<i64>) {
        for (address, members) in hierarchy.member_lists() {
            self.squad_members.insert(
                address,
                SquadMembersEntry {
                    members,
                    last_updated: checked_at,
                },
            );
        }
        self.dirty.insert(SQUAD_MEMBERS_KEY.to_string());

        let owner = hierarchy.owner;
        self.hierarchies.insert(
            owner,
            HierarchyEntry {
                hierarchy,
                last_updated: checked_at,
            },
        );
        self.dirty.insert(hierarchy_key(&owner));
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            owners: self.messages.len() as u64,
            messages: self.messages.values().map(|c| c.messages.len() as u64).sum(),
            transactions: self.transactions.len() as u64,
            squad_members: self.squad_members.len() as u64,
            hierarchies: self.hierarchies.len() as u64,
        }
    }
}

fn messages_key(owner: &Address) -> String {
    format!("{}{}", MESSAGES_PREFIX, owner.to_raw())
}

fn hierarchy_key(owner: &Address) -> String {
    format!("{}{}", HIERARCHY_PREFIX, owner.to_raw())
}

fn parse_owner_key(key: &str, owner: &str) -> Option<Address> {
    match owner.parse() {
        Ok(address) => Some(address),
        Err(e) => {
            warn!(key, "ignoring cache entry with bad owner: {}", e);
            None
        }
    }
}

/// Cache statistics
#[derive(Debug)]
pub struct CacheStats {
    pub owners: u64,
    pub messages: u64,
    pub transactions: u64,
    pub squad_members: u64,
    pub hierarchies: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} owners, {} messages, {} transactions, {} squad member lists, {} hierarchies",
            self.owners, self.messages, self.transactions, self.squad_members, self.hierarchies
        )
    }
}
