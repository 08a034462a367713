//! Hierarchy output (CSV export and console tree)

use anyhow::{Context, Result};
use csv::Writer;
use std::io;
use std::path::Path;

use crate::address::Address;
use crate::hierarchy::CompleteHierarchy;

/// Write hierarchy.csv style output to `path`
pub fn export_hierarchy_csv(path: &Path, hierarchy: &CompleteHierarchy) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    write_hierarchy_csv(file, hierarchy)
}

/// One row per member: role, canonical and friendly address, superior
pub fn write_hierarchy_csv<W: io::Write>(out: W, hierarchy: &CompleteHierarchy) -> Result<()> {
    let mut wtr = Writer::from_writer(out);

    // Header
    wtr.write_record(["Role", "Address", "Friendly", "Superior", "Members"])?;

    for (role, address, superior) in hierarchy.rows() {
        let members = direct_member_count(hierarchy, &address);
        wtr.write_record([
            role.as_str().to_string(),
            address.to_raw(),
            address.to_friendly(false, false),
            superior.to_raw(),
            members.to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

fn direct_member_count(hierarchy: &CompleteHierarchy, address: &Address) -> usize {
    if let Some(caporals) = hierarchy.caporals.get(address) {
        return caporals.len();
    }
    hierarchy.soldiers.get(address).map_or(0, Vec::len)
}

/// Print the tree to the console
pub fn print_hierarchy(hierarchy: &CompleteHierarchy) {
    println!("\n============================================================");
    println!("  SQUAD OF {}", hierarchy.owner.to_friendly(false, false));
    println!("============================================================\n");

    if hierarchy.is_empty() {
        println!("No squad members yet.");
        return;
    }

    for captain in &hierarchy.captains {
        println!("Captain  {}", captain.address.to_friendly(false, false));
        for caporal in hierarchy.caporals.get(&captain.address).into_iter().flatten() {
            println!("  Caporal  {}", caporal.address.to_friendly(false, false));
            for soldier in hierarchy.soldiers.get(&caporal.address).into_iter().flatten() {
                println!("    Soldier  {}", soldier.to_friendly(false, false));
            }
        }
    }

    println!("\n{}", "-".repeat(60));
    println!(
        "{} captains, {} caporals, {} soldiers ({} total)",
        hierarchy.counts.captains,
        hierarchy.counts.caporals,
        hierarchy.counts.soldiers,
        hierarchy.total_members
    );
}
