//! Direct reads of the slot contract's hierarchy getter
//!
//! Only used for an account's own row. Relationship inference never goes
//! through here.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::address::Address;

/// One account's row as stored by the contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyRow {
    pub owner: Address,
    pub parent: Option<Address>,
    pub grandparent: Option<Address>,
    pub great_grandparent: Option<Address>,
    pub available_slots: u64,
}

#[async_trait]
pub trait HierarchyGetter: Send + Sync {
    /// `Ok(None)` when the account has never joined
    async fn get_hierarchy(&self, address: &Address) -> Result<Option<HierarchyRow>>;
}
