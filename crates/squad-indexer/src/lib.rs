//! Army of 7 squad indexer
//!
//! Reconstructs the Captain → Caporal → Soldier tree under an owner by
//! classifying the reward payouts the slot contract sends on every join, as
//! seen through a rate-limited blockchain indexer. Results are cached in
//! SQLite and refreshed incrementally.

pub mod address;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod constants;
pub mod contract;
pub mod error;
pub mod fetcher;
pub mod gateway;
pub mod hierarchy;
pub mod indexer;
pub mod reports;
pub mod resolver;
pub mod squad;
pub mod store;

pub use address::{Address, AddressError};
pub use cache::{CacheService, CacheStats};
pub use classifier::{BandTable, PaymentCategory, RelationshipMaps, ValueBand};
pub use config::{Config, FileConfig};
pub use error::{IndexerError, IndexerResult};
pub use hierarchy::{CompleteHierarchy, HierarchyCounts, Role, SquadMember};
pub use indexer::{IndexerApi, Message, MessageFilter, TonIndexClient, Transaction, TransferMessage};
pub use squad::{Reconciliation, SquadIndex};
pub use store::{CacheStore, MemoryStore, SqliteStore};
