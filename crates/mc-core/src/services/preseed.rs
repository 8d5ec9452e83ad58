use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{BootstrapError, Result};
use crate::models::{Preseed, SessionConfig};

pub fn load(path: &Path) -> Result<Preseed> {
    if !path.exists() {
        return Err(BootstrapError::PreseedNotFound(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path)?;
    parse(&contents)
}

pub fn parse(contents: &str) -> Result<Preseed> {
    let preseed: Preseed = serde_yaml::from_str(contents)
        .map_err(|e| BootstrapError::Config(format!("invalid preseed: {e}")))?;
    validate(&preseed)?;
    Ok(preseed)
}

fn validate(preseed: &Preseed) -> Result<()> {
    let mut names = BTreeSet::new();
    for system in &preseed.systems {
        if system.name.trim().is_empty() {
            return Err(BootstrapError::Config("preseed system with empty name".into()));
        }
        if !names.insert(system.name.as_str()) {
            return Err(BootstrapError::Config(format!(
                "system '{}' is listed more than once",
                system.name
            )));
        }
        let mut paths = BTreeSet::new();
        for disk in &system.disks {
            if !paths.insert(disk.path.as_str()) {
                return Err(BootstrapError::Config(format!(
                    "disk '{}' is listed more than once for '{}'",
                    disk.path, system.name
                )));
            }
        }
    }
    if let Some(external) = &preseed.network.external {
        external
            .validate()
            .map_err(|e| BootstrapError::Config(format!("external network: {e}")))?;
    }
    Ok(())
}

/// Fold the document's session-level answers into `config`.
pub fn apply(preseed: &Preseed, config: &mut SessionConfig) {
    if let Some(subnet) = preseed.lookup_subnet {
        config.subnet = subnet;
    }
    if let Some(interface) = &preseed.lookup_interface {
        config.interface = interface.clone();
    }
    if let Some(secs) = preseed.lookup_timeout.filter(|secs| *secs > 0) {
        config.lookup_timeout = Some(Duration::from_secs(secs));
    }
    let disk_wipe = preseed
        .systems
        .iter()
        .flat_map(|s| &s.disks)
        .any(|d| d.wipe);
    config.wipe_allowed |= preseed.storage.wipe || disk_wipe;
    config.storage_mandatory |= preseed.storage.mandatory;
}
