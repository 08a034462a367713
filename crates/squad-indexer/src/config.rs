//! Configuration for the squad indexer

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::address::Address;
use crate::classifier::{BandTable, ValueBand};
use crate::constants;
use crate::gateway::RetryPolicy;

// =============================================================================
// File-based Configuration (config.toml)
// =============================================================================

/// Configuration loaded from config.toml
#[derive(Debug, Deserialize)]
pub struct FileConfig {
    pub indexer: IndexerSection,
    #[serde(default)]
    pub bands: BandsSection,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub retry: RetrySection,
}

/// Indexer endpoint and the contract whose payouts we follow
#[derive(Debug, Deserialize)]
pub struct IndexerSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Slot contract address (either encoding)
    pub contract_address: String,
}

/// Payout value bands, in nanotons
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BandsSection {
    pub join_payment: u64,
    pub direct_parent: u64,
    pub grandparent: u64,
    pub great_grandparent: u64,
    /// Tolerance in basis points (1000 = 10%)
    pub tolerance_bps: u32,
}

impl Default for BandsSection {
    fn default() -> Self {
        Self {
            join_payment: constants::JOIN_PAYMENT_BASE,
            direct_parent: constants::DIRECT_PARENT_BASE,
            grandparent: constants::GRANDPARENT_BASE,
            great_grandparent: constants::GREAT_GRANDPARENT_BASE,
            tolerance_bps: constants::TOLERANCE_BPS,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub request_delay_ms: u64,
    pub page_delay_ms: u64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub page_limit: usize,
    pub max_pages: usize,
    pub staleness_secs: u64,
    pub refresh_interval_secs: u64,
    pub update_wait_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            request_delay_ms: constants::REQUEST_DELAY_MS,
            page_delay_ms: constants::PAGE_DELAY_MS,
            batch_size: constants::RESOLVE_BATCH_SIZE,
            batch_delay_ms: constants::RESOLVE_BATCH_DELAY_MS,
            page_limit: constants::PAGE_LIMIT,
            max_pages: constants::MAX_PAGES,
            staleness_secs: constants::STALENESS_SECS,
            refresh_interval_secs: constants::REFRESH_INTERVAL_SECS,
            update_wait_ms: constants::UPDATE_WAIT_MS,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: constants::MAX_RETRIES,
            initial_delay_ms: constants::RETRY_INITIAL_DELAY_MS,
            max_delay_ms: constants::RETRY_MAX_DELAY_MS,
            factor: constants::RETRY_FACTOR,
            jitter: constants::RETRY_JITTER,
        }
    }
}

fn default_base_url() -> String {
    constants::TONCENTER_API_V3_BASE.to_string()
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| {
            "Failed to parse config.toml. Check for:\n\
             - Missing required fields (indexer.contract_address)\n\
             - Invalid TOML syntax (missing quotes, brackets, etc.)\n\
             - Incorrect data types (strings vs numbers)\n\n\
             See config.toml.example for the expected format."
        })
    }
}

// =============================================================================
// Runtime Configuration
// =============================================================================

/// Pacing and paging knobs, resolved to durations
#[derive(Debug, Clone)]
pub struct Timing {
    /// Gap the gateway leaves between two wire requests
    pub request_delay: Duration,
    /// Gap between message pages
    pub page_delay: Duration,
    /// Transactions resolved concurrently per chunk
    pub batch_size: usize,
    /// Gap between resolution chunks
    pub batch_delay: Duration,
    /// Messages per page
    pub page_limit: usize,
    /// Page ceiling per fetch
    pub max_pages: usize,
    /// Age after which a reconciliation is stale
    pub staleness: Duration,
    /// Background refresh period
    pub refresh_interval: Duration,
    /// Wait for new messages in fetch-and-update
    pub update_wait: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self::from_section(&TimingSection::default())
    }
}

impl Timing {
    fn from_section(section: &TimingSection) -> Self {
        Self {
            request_delay: Duration::from_millis(section.request_delay_ms),
            page_delay: Duration::from_millis(section.page_delay_ms),
            batch_size: section.batch_size,
            batch_delay: Duration::from_millis(section.batch_delay_ms),
            page_limit: section.page_limit,
            max_pages: section.max_pages,
            staleness: Duration::from_secs(section.staleness_secs),
            refresh_interval: Duration::from_secs(section.refresh_interval_secs),
            update_wait: Duration::from_millis(section.update_wait_ms),
        }
    }
}

/// Main configuration struct with parsed values
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Slot contract; its own address is never a superior
    pub contract: Address,
    pub bands: BandTable,
    pub timing: Timing,
    pub retry: RetryPolicy,
}

impl Config {
    /// Create config from file config and optional base URL override
    pub fn from_file(file_config: &FileConfig, base_url: Option<String>) -> Result<Self> {
        let indexer = &file_config.indexer;
        let timing = &file_config.timing;
        let retry = &file_config.retry;

        if timing.request_delay_ms < constants::REQUEST_DELAY_MS {
            anyhow::bail!(
                "timing.request_delay_ms must be at least {} (got {})",
                constants::REQUEST_DELAY_MS,
                timing.request_delay_ms
            );
        }
        if timing.page_limit == 0 || timing.max_pages == 0 || timing.batch_size == 0 {
            anyhow::bail!("timing.page_limit, timing.max_pages and timing.batch_size must be non-zero");
        }
        if retry.max_retries == 0 || retry.factor < 1.0 || !(0.0..1.0).contains(&retry.jitter) {
            anyhow::bail!("retry.max_retries must be non-zero, retry.factor >= 1 and 0 <= retry.jitter < 1");
        }

        let bands = &file_config.bands;
        let band_table = BandTable::new(
            ValueBand::new(bands.join_payment, bands.tolerance_bps),
            ValueBand::new(bands.direct_parent, bands.tolerance_bps),
            ValueBand::new(bands.grandparent, bands.tolerance_bps),
            ValueBand::new(bands.great_grandparent, bands.tolerance_bps),
        )
        .context("Invalid [bands] section")?;

        Ok(Self {
            base_url: base_url
                .unwrap_or_else(|| indexer.base_url.clone())
                .trim_end_matches('/')
                .to_string(),
            api_key: indexer.api_key.clone().filter(|k| !k.is_empty()),
            contract: indexer
                .contract_address
                .parse()
                .with_context(|| "Invalid indexer.contract_address")?,
            bands: band_table,
            timing: Timing::from_section(timing),
            retry: RetryPolicy {
                max_retries: retry.max_retries,
                initial_delay: Duration::from_millis(retry.initial_delay_ms),
                max_delay: Duration::from_millis(retry.max_delay_ms),
                factor: retry.factor,
                jitter: retry.jitter,
            },
        })
    }
}

/// Mask an API key for safe logging ("abcd****")
pub fn mask_api_key(key: &str) -> String {
    let visible: String = key.chars().take(4).collect();
    format!("{}****", visible)
}
