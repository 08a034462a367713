//! Centralized constants for the squad indexer
//!
//! Defaults for everything that config.toml may override, plus the fixed
//! payout amounts the slot contract fans out on every join.

// =============================================================================
// API Endpoints
// =============================================================================

/// Toncenter indexer v3 base URL
pub const TONCENTER_API_V3_BASE: &str = "https://toncenter.com/api/v3";

/// Message query endpoint
pub const MESSAGES_ENDPOINT: &str = "/messages";

/// Transaction query endpoint
pub const TRANSACTIONS_ENDPOINT: &str = "/transactions";

// =============================================================================
// Payout Value Bands (nanotons)
// =============================================================================

/// Inbound join payment (2.1 TON)
pub const JOIN_PAYMENT_BASE: u64 = 2_100_000_000;

/// Reward forwarded to the recruit's direct superior
pub const DIRECT_PARENT_BASE: u64 = 299_600_000;

/// Reward forwarded to the second-level superior
pub const GRANDPARENT_BASE: u64 = 599_600_000;

/// Reward forwarded to the third-level superior
pub const GREAT_GRANDPARENT_BASE: u64 = 899_600_000;

/// Tolerance around each base value, in basis points (1000 = 10%)
pub const TOLERANCE_BPS: u32 = 1_000;

/// Basis points in 100%
pub const BPS_DENOMINATOR: u32 = 10_000;

// =============================================================================
// Rate Limiting
// =============================================================================

/// Delay between requests drained from the gateway queue (ms)
pub const REQUEST_DELAY_MS: u64 = 500;

/// Delay between message pages (ms)
pub const PAGE_DELAY_MS: u64 = 300;

/// Transactions resolved concurrently per chunk
pub const RESOLVE_BATCH_SIZE: usize = 5;

/// Delay between transaction resolution chunks (ms)
pub const RESOLVE_BATCH_DELAY_MS: u64 = 300;

/// Messages requested per page
pub const PAGE_LIMIT: usize = 100;

/// Page ceiling for one message fetch
pub const MAX_PAGES: usize = 4;

// =============================================================================
// Retry
// =============================================================================

pub const MAX_RETRIES: u32 = 5;

pub const RETRY_INITIAL_DELAY_MS: u64 = 1_500;

pub const RETRY_MAX_DELAY_MS: u64 = 15_000;

pub const RETRY_FACTOR: f64 = 2.0;

/// Jitter applied to each backoff delay (0.15 = ±15%)
pub const RETRY_JITTER: f64 = 0.15;

// =============================================================================
// Staleness
// =============================================================================

/// A reconciliation younger than this is served from cache (5 minutes)
pub const STALENESS_SECS: u64 = 300;

/// Background refresh period while an owner is enlisted (5 minutes)
pub const REFRESH_INTERVAL_SECS: u64 = 300;

/// How long fetch-and-update waits for new messages before serving cache (ms)
pub const UPDATE_WAIT_MS: u64 = 3_000;

// =============================================================================
// File Names
// =============================================================================

/// Cache database filename
pub const CACHE_FILENAME: &str = "cache.sqlite";

/// Default config file path
pub const CONFIG_FILENAME: &str = "config.toml";
