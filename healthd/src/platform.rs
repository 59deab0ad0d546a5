//! Platform call seams
//!
//! Recovery-unit activation and BMC inventory discovery are external
//! collaborators; the daemon depends on the traits here and ships one
//! process-local implementation of each.

use std::process::{Command, Stdio};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::error::PlatformError;

/// Targets that must not be interrupted once queued.
const IRREVERSIBLE_TARGETS: &[&str] = &[
    "poweroff.target",
    "reboot.target",
    "halt.target",
    "obmc-chassis-hard-poweroff@0.target",
    "obmc-host-shutdown@0.target",
];

/// Job mode for a unit start request: irreversible power and reboot
/// targets may not be replaced by later jobs.
pub fn start_mode(unit: &str) -> &'static str {
    if IRREVERSIBLE_TARGETS.contains(&unit) {
        "replace-irreversibly"
    } else {
        "replace"
    }
}

/// Seam for starting a recovery unit. Fire-and-forget; callers never wait
/// on the result of the started job.
pub trait UnitStarter: Send + Sync {
    fn start_unit(&self, unit: &str) -> Result<(), PlatformError>;
}

/// Starts units through systemctl without waiting for job completion.
pub struct SystemctlStarter;

impl UnitStarter for SystemctlStarter {
    fn start_unit(&self, unit: &str) -> Result<(), PlatformError> {
        if unit.is_empty() {
            return Ok(());
        }
        let mode = start_mode(unit);
        info!(unit, mode, "requesting recovery unit start");
        Command::new("systemctl")
            .arg("start")
            .arg("--no-block")
            .arg(format!("--job-mode={mode}"))
            .arg(unit)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
            .map_err(|e| PlatformError::UnitStartFailed {
                unit: unit.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Records unit start requests without touching the system. Used when
/// activation is disabled and by tests.
pub struct LoggingStarter {
    requested: Mutex<Vec<String>>,
}

impl LoggingStarter {
    pub fn new() -> Self {
        Self {
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Default for LoggingStarter {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitStarter for LoggingStarter {
    fn start_unit(&self, unit: &str) -> Result<(), PlatformError> {
        if unit.is_empty() {
            return Ok(());
        }
        warn!(unit, mode = start_mode(unit), "unit activation disabled, request dropped");
        self.requested
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(unit.to_string());
        Ok(())
    }
}

/// Seam for discovering the BMC inventory objects this daemon measures.
pub trait InventorySource: Send + Sync {
    fn bmc_inventory_paths(&self) -> Vec<String>;
}

/// Default BMC inventory object path used when discovery is not wired up.
pub const DEFAULT_BMC_INVENTORY_PATH: &str = "/xyz/openbmc_project/inventory/bmc";

/// Inventory paths supplied by daemon configuration.
pub struct StaticInventory {
    paths: Vec<String>,
}

impl StaticInventory {
    pub fn new(paths: Vec<String>) -> Self {
        if paths.is_empty() {
            debug!("no inventory paths configured, using default BMC path");
            return Self {
                paths: vec![DEFAULT_BMC_INVENTORY_PATH.to_string()],
            };
        }
        Self { paths }
    }
}

impl InventorySource for StaticInventory {
    fn bmc_inventory_paths(&self) -> Vec<String> {
        self.paths.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_mode_selection() {
        assert_eq!(start_mode("reboot.target"), "replace-irreversibly");
        assert_eq!(start_mode("poweroff.target"), "replace-irreversibly");
        assert_eq!(start_mode("some-recovery.service"), "replace");
    }

    #[test]
    fn test_logging_starter_records_requests() {
        let starter = LoggingStarter::new();
        starter.start_unit("cleanup.service").unwrap();
        starter.start_unit("").unwrap();
        assert_eq!(starter.requested(), vec!["cleanup.service".to_string()]);
    }

    #[test]
    fn test_static_inventory_defaults() {
        let inventory = StaticInventory::new(Vec::new());
        assert_eq!(
            inventory.bmc_inventory_paths(),
            vec![DEFAULT_BMC_INVENTORY_PATH.to_string()]
        );

        let inventory = StaticInventory::new(vec!["/inv/bmc0".to_string()]);
        assert_eq!(inventory.bmc_inventory_paths(), vec!["/inv/bmc0".to_string()]);
    }
}
