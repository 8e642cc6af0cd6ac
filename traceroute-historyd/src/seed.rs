use anyhow::{Context, Result};
use crate::config::SeedDestination;
use crate::error::HistoryError;
use crate::store::{timestamp_now, HistoryDb, Key};

/// Register configured destinations (and their groups) that are not in the
/// store yet. Existing destinations are left as they are.
pub fn seed_destinations(db: &HistoryDb, seeds: &[SeedDestination]) -> Result<usize> {
    let mut created = 0;

    for seed in seeds {
        match db.get_destination(Key::Name(seed.name.trim())) {
            Ok(existing) => {
                if existing.address != seed.address.trim() {
                    tracing::warn!(
                        "Destination {} is stored with address {}, ignoring configured {}",
                        existing.name,
                        existing.address,
                        seed.address
                    );
                }
                continue;
            }
            Err(HistoryError::NotFound(_)) => {}
            Err(e) => return Err(e).context("Failed to look up configured destination"),
        }

        let group_id = match &seed.group {
            Some(name) => Some(group_id(db, name)?),
            None => None,
        };

        let destination = db
            .create_destination(&seed.name, &seed.address, group_id, timestamp_now())
            .with_context(|| format!("Failed to register configured destination {}", seed.name))?;

        tracing::info!("Registered configured destination {} ({})", destination.name, destination.address);
        created += 1;
    }

    Ok(created)
}

fn group_id(db: &HistoryDb, name: &str) -> Result<i64> {
    match db.get_group(Key::Name(name.trim())) {
        Ok(group) => Ok(group.id),
        Err(HistoryError::NotFound(_)) => {
            let group = db
                .create_group(name, timestamp_now())
                .with_context(|| format!("Failed to register configured group {}", name))?;
            tracing::info!("Registered configured group {}", group.name);
            Ok(group.id)
        }
        Err(e) => Err(e).context("Failed to look up configured group"),
    }
}
