use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{daemon::Daemon, SnapshotterError, SnapshotterResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The live daemons of one manager, keyed by daemon id.
#[derive(Debug, Default)]
pub struct DaemonTable {
    daemons: RwLock<HashMap<String, Arc<Daemon>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DaemonTable {
    /// Adds a daemon. Fails if one with the same id is already there.
    pub fn add(&self, daemon: Arc<Daemon>) -> SnapshotterResult<()> {
        let id = daemon.id();
        let mut daemons = self.daemons.write().unwrap_or_else(|e| e.into_inner());
        if daemons.contains_key(&id) {
            return Err(SnapshotterError::AlreadyExists(format!("daemon {id}")));
        }

        daemons.insert(id, daemon);
        Ok(())
    }

    /// Adds or replaces a daemon.
    pub fn replace(&self, daemon: Arc<Daemon>) -> Option<Arc<Daemon>> {
        self.daemons
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(daemon.id(), daemon)
    }

    /// Removes the daemon `daemon_id`.
    pub fn remove(&self, daemon_id: &str) -> Option<Arc<Daemon>> {
        self.daemons
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(daemon_id)
    }

    /// Returns the daemon `daemon_id`.
    pub fn get(&self, daemon_id: &str) -> Option<Arc<Daemon>> {
        self.daemons
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(daemon_id)
            .cloned()
    }

    /// All daemons.
    pub fn list(&self) -> Vec<Arc<Daemon>> {
        self.daemons
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Number of daemons.
    pub fn len(&self) -> usize {
        self.daemons.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns `true` if there are no daemons.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::{
        config::{DaemonMode, FsDriver},
        daemon::{DaemonStates, FakeConnector},
    };

    use super::*;

    #[test]
    fn test_duplicate_daemon_rejected() {
        let table = DaemonTable::default();
        let states = DaemonStates::builder()
            .id("d1")
            .fs_driver(FsDriver::Fusedev)
            .daemon_mode(DaemonMode::Dedicated)
            .api_socket("/run/d1/api.sock")
            .config_dir("/etc/d1")
            .log_dir("/var/log/d1")
            .build();
        let connector = Arc::new(FakeConnector::default());

        table
            .add(Arc::new(Daemon::new(states.clone(), connector.clone())))
            .unwrap();
        let err = table
            .add(Arc::new(Daemon::new(states, connector)))
            .unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(table.len(), 1);

        assert!(table.remove("d1").is_some());
        assert!(table.get("d1").is_none());
    }
}
