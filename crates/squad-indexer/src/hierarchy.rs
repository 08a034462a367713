//! Hierarchy reconstruction
//!
//! Relationship maps are inverted into a parent → children adjacency, then
//! the owner's subtree is read three levels deep: captains, their caporals,
//! and the caporals' soldiers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::address::Address;
use crate::classifier::RelationshipMaps;

/// parent → direct children, in insertion order without duplicates
pub type Adjacency = BTreeMap<Address, Vec<Address>>;

fn push_child(adjacency: &mut Adjacency, parent: Address, child: Address) {
    let children = adjacency.entry(parent).or_default();
    if !children.contains(&child) {
        children.push(child);
    }
}

/// Invert the relationship maps into forward adjacency.
///
/// Grandparent and great-grandparent signals only contribute when the
/// intervening links resolve through the direct-parent map; orphaned signals
/// are dropped with a warning.
pub fn build_adjacency(maps: &RelationshipMaps) -> Adjacency {
    let mut adjacency = Adjacency::new();

    for (recruit, parent) in &maps.direct_parent {
        push_child(&mut adjacency, *parent, *recruit);
    }

    for (recruit, grandparent) in &maps.grandparent {
        match maps.direct_parent.get(recruit) {
            Some(parent) => push_child(&mut adjacency, *grandparent, *parent),
            None => warn!(
                recruit = %recruit,
                grandparent = %grandparent,
                "grandparent reward without a direct parent, dropping"
            ),
        }
    }

    for (recruit, great) in &maps.great_grandparent {
        let grandparent = maps
            .direct_parent
            .get(recruit)
            .and_then(|parent| maps.direct_parent.get(parent));
        match grandparent {
            Some(grandparent) => push_child(&mut adjacency, *great, *grandparent),
            None => warn!(
                recruit = %recruit,
                great_grandparent = %great,
                "great-grandparent reward with a broken chain, dropping"
            ),
        }
    }

    adjacency
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Captain,
    Caporal,
    Soldier,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Captain => "captain",
            Role::Caporal => "caporal",
            Role::Soldier => "soldier",
        }
    }
}

/// A member together with their own direct children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquadMember {
    pub address: Address,
    pub members: Vec<Address>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyCounts {
    pub captains: usize,
    pub caporals: usize,
    pub soldiers: usize,
}

/// Owner-rooted tree, always rebuilt wholesale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteHierarchy {
    pub owner: Address,
    pub captains: Vec<SquadMember>,
    /// captain → caporals
    pub caporals: BTreeMap<Address, Vec<SquadMember>>,
    /// caporal → soldiers
    pub soldiers: BTreeMap<Address, Vec<Address>>,
    pub counts: HierarchyCounts,
    pub total_members: usize,
}

impl CompleteHierarchy {
    pub fn empty(owner: Address) -> Self {
        Self {
            owner,
            captains: Vec::new(),
            caporals: BTreeMap::new(),
            soldiers: BTreeMap::new(),
            counts: HierarchyCounts::default(),
            total_members: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_members == 0
    }

    /// Each node of the tree with its direct children: the owner, every
    /// captain and every caporal
    pub fn member_lists(&self) -> Vec<(Address, Vec<Address>)> {
        let mut lists = Vec::with_capacity(1 + self.captains.len() + self.counts.caporals);
        lists.push((
            self.owner,
            self.captains.iter().map(|c| c.address).collect(),
        ));
        for captain in &self.captains {
            lists.push((captain.address, captain.members.clone()));
        }
        for caporals in self.caporals.values() {
            for caporal in caporals {
                lists.push((caporal.address, caporal.members.clone()));
            }
        }
        lists
    }

    /// Flattened rows of (role, member, superior) in tree order
    pub fn rows(&self) -> Vec<(Role, Address, Address)> {
        let mut rows = Vec::with_capacity(self.total_members);
        for captain in &self.captains {
            rows.push((Role::Captain, captain.address, self.owner));
            for caporal in self.caporals.get(&captain.address).into_iter().flatten() {
                rows.push((Role::Caporal, caporal.address, captain.address));
                for soldier in self.soldiers.get(&caporal.address).into_iter().flatten() {
                    rows.push((Role::Soldier, *soldier, caporal.address));
                }
            }
        }
        rows
    }
}

/// Build the owner's three-level tree from relationship maps
pub fn build(owner: Address, maps: &RelationshipMaps) -> CompleteHierarchy {
    build_from_adjacency(owner, &build_adjacency(maps))
}

pub fn build_from_adjacency(owner: Address, adjacency: &Adjacency) -> CompleteHierarchy {
    let Some(captain_addresses) = adjacency.get(&owner) else {
        return CompleteHierarchy::empty(owner);
    };

    let children = |address: &Address| adjacency.get(address).cloned().unwrap_or_default();

    let mut hierarchy = CompleteHierarchy::empty(owner);
    for captain in captain_addresses {
        let caporal_addresses = children(captain);

        let mut caporals = Vec::with_capacity(caporal_addresses.len());
        for caporal in &caporal_addresses {
            let soldier_addresses = children(caporal);
            hierarchy.counts.soldiers += soldier_addresses.len();
            hierarchy.soldiers.insert(*caporal, soldier_addresses.clone());
            caporals.push(SquadMember {
                address: *caporal,
                members: soldier_addresses,
            });
        }

        hierarchy.counts.caporals += caporals.len();
        hierarchy.caporals.insert(*captain, caporals);
        hierarchy.captains.push(SquadMember {
            address: *captain,
            members: caporal_addresses,
        });
    }

    hierarchy.counts.captains = hierarchy.captains.len();
    hierarchy.total_members =
        hierarchy.counts.captains + hierarchy.counts.caporals + hierarchy.counts.soldiers;
    hierarchy
}
