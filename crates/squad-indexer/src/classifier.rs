//! Payment classification
//!
//! Every join fans out a fixed set of rewards from the slot contract: one to
//! the recruit's direct superior, one to the second level and one to the
//! third. Amounts drift slightly with fees, so each reward is matched against
//! a tolerance band around its base value rather than exactly.

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::address::Address;
use crate::constants::{self, BPS_DENOMINATOR};
use crate::indexer::Transaction;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BandError {
    #[error("tolerance of {0} bps must be below 100%")]
    Tolerance(u32),

    #[error("{0:?} and {1:?} bands overlap")]
    Overlap(PaymentCategory, PaymentCategory),
}

/// What a transfer amount means
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PaymentCategory {
    JoinPayment,
    DirectParent,
    Grandparent,
    GreatGrandparent,
}

/// Inclusive range `base ± tolerance`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueBand {
    base: u64,
    tolerance_bps: u32,
}

impl ValueBand {
    pub fn new(base: u64, tolerance_bps: u32) -> Self {
        Self {
            base,
            tolerance_bps,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn tolerance_bps(&self) -> u32 {
        self.tolerance_bps
    }

    /// Bounds scaled by `BPS_DENOMINATOR` so no division is needed
    fn scaled_bounds(&self) -> (u128, u128) {
        let base = self.base as u128;
        let denominator = BPS_DENOMINATOR as u128;
        let tolerance = (self.tolerance_bps as u128).min(denominator);
        (base * (denominator - tolerance), base * (denominator + tolerance))
    }

    pub fn contains(&self, amount: u128) -> bool {
        let Some(scaled) = amount.checked_mul(BPS_DENOMINATOR as u128) else {
            return false;
        };
        let (low, high) = self.scaled_bounds();
        scaled >= low && scaled <= high
    }

    fn overlaps(&self, other: &ValueBand) -> bool {
        let (a_low, a_high) = self.scaled_bounds();
        let (b_low, b_high) = other.scaled_bounds();
        a_low <= b_high && b_low <= a_high
    }
}

/// The four bands, validated so that reward bands never overlap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandTable {
    join_payment: ValueBand,
    direct_parent: ValueBand,
    grandparent: ValueBand,
    great_grandparent: ValueBand,
}

impl Default for BandTable {
    fn default() -> Self {
        let tolerance = constants::TOLERANCE_BPS;
        Self {
            join_payment: ValueBand::new(constants::JOIN_PAYMENT_BASE, tolerance),
            direct_parent: ValueBand::new(constants::DIRECT_PARENT_BASE, tolerance),
            grandparent: ValueBand::new(constants::GRANDPARENT_BASE, tolerance),
            great_grandparent: ValueBand::new(constants::GREAT_GRANDPARENT_BASE, tolerance),
        }
    }
}

impl BandTable {
    pub fn new(
        join_payment: ValueBand,
        direct_parent: ValueBand,
        grandparent: ValueBand,
        great_grandparent: ValueBand,
    ) -> Result<Self, BandError> {
        for band in [&join_payment, &direct_parent, &grandparent, &great_grandparent] {
            if band.tolerance_bps >= BPS_DENOMINATOR {
                return Err(BandError::Tolerance(band.tolerance_bps));
            }
        }

        let rewards = [
            (PaymentCategory::DirectParent, &direct_parent),
            (PaymentCategory::Grandparent, &grandparent),
            (PaymentCategory::GreatGrandparent, &great_grandparent),
        ];
        for (i, (first, a)) in rewards.iter().enumerate() {
            for (second, b) in &rewards[i + 1..] {
                if a.overlaps(b) {
                    return Err(BandError::Overlap(*first, *second));
                }
            }
        }

        Ok(Self {
            join_payment,
            direct_parent,
            grandparent,
            great_grandparent,
        })
    }

    pub fn join_payment(&self) -> &ValueBand {
        &self.join_payment
    }

    pub fn direct_parent(&self) -> &ValueBand {
        &self.direct_parent
    }

    pub fn grandparent(&self) -> &ValueBand {
        &self.grandparent
    }

    pub fn great_grandparent(&self) -> &ValueBand {
        &self.great_grandparent
    }

    pub fn is_join_payment(&self, amount: u128) -> bool {
        self.join_payment.contains(amount)
    }

    /// Reward category of an outbound amount; first match wins
    pub fn reward_category(&self, amount: u128) -> Option<PaymentCategory> {
        if self.direct_parent.contains(amount) {
            Some(PaymentCategory::DirectParent)
        } else if self.grandparent.contains(amount) {
            Some(PaymentCategory::Grandparent)
        } else if self.great_grandparent.contains(amount) {
            Some(PaymentCategory::GreatGrandparent)
        } else {
            None
        }
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Superiors revealed by a single join transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedJoin {
    pub recruit: Address,
    pub direct_parent: Option<Address>,
    pub grandparent: Option<Address>,
    pub great_grandparent: Option<Address>,
}

/// Classify one resolved transaction.
///
/// Returns `None` unless the inbound message carries a join payment from a
/// parseable sender. Outbound transfers back to the contract are ignored.
pub fn classify(tx: &Transaction, bands: &BandTable, contract: &Address) -> Option<ClassifiedJoin> {
    let in_msg = tx.in_msg.as_ref()?;
    let amount = in_msg.amount()?;
    if !bands.is_join_payment(amount) {
        return None;
    }

    let recruit = match in_msg.source.as_deref().map(str::parse::<Address>) {
        Some(Ok(address)) => address,
        Some(Err(e)) => {
            warn!(tx = %tx.hash, "unparseable join sender: {}", e);
            return None;
        }
        None => return None,
    };

    let mut join = ClassifiedJoin {
        recruit,
        direct_parent: None,
        grandparent: None,
        great_grandparent: None,
    };

    for out in &tx.out_msgs {
        let Some(destination) = out.destination.as_deref() else {
            continue;
        };
        let destination: Address = match destination.parse() {
            Ok(address) => address,
            Err(e) => {
                debug!(tx = %tx.hash, "skipping transfer to unparseable address: {}", e);
                continue;
            }
        };
        if destination == *contract {
            continue;
        }

        match out.amount().and_then(|a| bands.reward_category(a)) {
            Some(PaymentCategory::DirectParent) => join.direct_parent = Some(destination),
            Some(PaymentCategory::Grandparent) => join.grandparent = Some(destination),
            Some(PaymentCategory::GreatGrandparent) => {
                join.great_grandparent = Some(destination)
            }
            Some(PaymentCategory::JoinPayment) | None => {}
        }
    }

    Some(join)
}

/// recruit → superior, one map per level
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationshipMaps {
    pub direct_parent: BTreeMap<Address, Address>,
    pub grandparent: BTreeMap<Address, Address>,
    pub great_grandparent: BTreeMap<Address, Address>,
}

impl RelationshipMaps {
    pub fn record(&mut self, join: &ClassifiedJoin) {
        if let Some(parent) = join.direct_parent {
            self.direct_parent.insert(join.recruit, parent);
        }
        if let Some(grandparent) = join.grandparent {
            self.grandparent.insert(join.recruit, grandparent);
        }
        if let Some(great) = join.great_grandparent {
            self.great_grandparent.insert(join.recruit, great);
        }
    }

    /// Classify every transaction and collect the relationships.
    ///
    /// The result depends only on the set of transactions, not their order
    /// or multiplicity.
    pub fn from_transactions<'a>(
        transactions: impl IntoIterator<Item = &'a Transaction>,
        bands: &BandTable,
        contract: &Address,
    ) -> Self {
        let mut maps = Self::default();
        for tx in transactions {
            if let Some(join) = classify(tx, bands, contract) {
                maps.record(&join);
            }
        }
        maps
    }

    pub fn is_empty(&self) -> bool {
        self.direct_parent.is_empty()
            && self.grandparent.is_empty()
            && self.great_grandparent.is_empty()
    }
}
