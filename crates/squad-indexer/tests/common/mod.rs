//! In-memory indexer for end-to-end tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use squad_indexer::config::Timing;
use squad_indexer::gateway::RetryPolicy;
use squad_indexer::{
    Address, BandTable, CacheService, CacheStore, Config, IndexerApi, IndexerError, IndexerResult,
    MemoryStore, Message, MessageFilter, SquadIndex, Transaction, TransferMessage,
};

pub const JOIN: u64 = 2_100_000_000;
pub const DIRECT: u64 = 299_600_000;
pub const GRAND: u64 = 599_600_000;
pub const GREAT: u64 = 899_600_000;

pub fn addr(byte: u8) -> Address {
    Address::new(0, [byte; 32])
}

pub fn contract() -> Address {
    addr(0xcc)
}

#[derive(Default)]
struct State {
    messages: Vec<Message>,
    transactions: HashMap<String, Transaction>,
    hidden: HashSet<String>,
    page_calls: Vec<MessageFilter>,
    tx_calls: usize,
    offline: bool,
    next_id: usize,
}

/// Serves the contract's join transactions and the payout messages they emit
#[derive(Default)]
pub struct FakeIndexer {
    state: Mutex<State>,
}

impl FakeIndexer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record `recruit` joining at `created_at`, paying each `(payee, amount)`
    pub fn add_join(&self, recruit: Address, created_at: u64, payouts: &[(Address, u64)]) -> String {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.next_id += 1;
        let id = state.next_id;
        let tx_hash = format!("tx-{}", id);

        let out_msgs = payouts
            .iter()
            .map(|(payee, amount)| TransferMessage {
                source: Some(contract().to_raw()),
                destination: Some(payee.to_raw()),
                value: Some(amount.to_string()),
            })
            .collect();
        state.transactions.insert(
            tx_hash.clone(),
            Transaction {
                hash: tx_hash.clone(),
                in_msg: Some(TransferMessage {
                    source: Some(recruit.to_raw()),
                    destination: Some(contract().to_raw()),
                    value: Some(JOIN.to_string()),
                }),
                out_msgs,
            },
        );

        state.messages.push(Message {
            hash: format!("join-{}", id),
            source: Some(recruit.to_raw()),
            destination: Some(contract().to_raw()),
            value: Some(JOIN.to_string()),
            created_at,
            created_lt: None,
            in_msg_tx_hash: Some(tx_hash.clone()),
            out_msg_tx_hash: None,
        });
        for (i, (payee, amount)) in payouts.iter().enumerate() {
            state.messages.push(Message {
                hash: format!("payout-{}-{}", id, i),
                source: Some(contract().to_raw()),
                destination: Some(payee.to_raw()),
                value: Some(amount.to_string()),
                created_at,
                created_lt: None,
                in_msg_tx_hash: None,
                out_msg_tx_hash: Some(tx_hash.clone()),
            });
        }

        tx_hash
    }

    /// Make a transaction invisible to lookups until revealed
    pub fn hide_transaction(&self, hash: &str) {
        self.state.lock().unwrap().hidden.insert(hash.to_string());
    }

    pub fn reveal_transaction(&self, hash: &str) {
        self.state.lock().unwrap().hidden.remove(hash);
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn page_calls(&self) -> Vec<MessageFilter> {
        self.state.lock().unwrap().page_calls.clone()
    }

    pub fn tx_calls(&self) -> usize {
        self.state.lock().unwrap().tx_calls
    }
}

fn matches(field: &Option<String>, wanted: &Option<Address>) -> bool {
    match wanted {
        None => true,
        Some(wanted) => field
            .as_deref()
            .and_then(|s| s.parse::<Address>().ok())
            .is_some_and(|a| a == *wanted),
    }
}

#[async_trait]
impl IndexerApi for FakeIndexer {
    async fn fetch_message_page(
        &self,
        filter: &MessageFilter,
        limit: usize,
        offset: usize,
    ) -> IndexerResult<Vec<Message>> {
        let mut state = self.state.lock().unwrap();
        state.page_calls.push(filter.clone());
        if state.offline {
            return Err(IndexerError::Transport("connection refused".into()));
        }

        let mut found: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| matches(&m.source, &filter.source))
            .filter(|m| matches(&m.destination, &filter.destination))
            .filter(|m| filter.value.is_none() || m.value == filter.value)
            .filter(|m| filter.since.is_none_or(|since| m.created_at >= since))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.hash.cmp(&b.hash)));

        Ok(found.into_iter().skip(offset).take(limit).collect())
    }

    async fn fetch_transaction(&self, hash: &str) -> IndexerResult<Option<Transaction>> {
        let mut state = self.state.lock().unwrap();
        state.tx_calls += 1;
        if state.offline {
            return Err(IndexerError::Transport("connection refused".into()));
        }
        if state.hidden.contains(hash) {
            return Ok(None);
        }
        Ok(state.transactions.get(hash).cloned())
    }
}

pub fn config() -> Config {
    Config {
        base_url: String::new(),
        api_key: None,
        contract: contract(),
        bands: BandTable::default(),
        timing: Timing {
            request_delay: Duration::ZERO,
            page_delay: Duration::ZERO,
            batch_size: 5,
            batch_delay: Duration::ZERO,
            page_limit: 100,
            max_pages: 4,
            staleness: Duration::from_secs(300),
            refresh_interval: Duration::from_secs(300),
            update_wait: Duration::from_secs(3),
        },
        retry: RetryPolicy::default(),
    }
}

pub fn index_with(api: Arc<FakeIndexer>, store: Arc<dyn CacheStore>, config: &Config) -> SquadIndex {
    SquadIndex::new(api, CacheService::new(store), config)
}

pub fn index(api: Arc<FakeIndexer>) -> SquadIndex {
    index_with(api, Arc::new(MemoryStore::new()), &config())
}
