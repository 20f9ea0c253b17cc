// Reconnect-enabled sessions and connected network interfaces

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::reconnect::ReconnectWrapper;

struct EnabledSession {
    wrapper: Weak<ReconnectWrapper>,
    /// Interfaces that were up when the session registered
    interfaces: Vec<String>,
}

/// Coordination state shared by all reconnect wrappers
///
/// A session is reconnect-enabled once it registered, until the user
/// unregisters it or it is removed.
#[derive(Default)]
pub struct ReconnectRegistry {
    connected_interfaces: RwLock<HashSet<String>>,
    enabled: Mutex<HashMap<String, EnabledSession>>,
}

impl ReconnectRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether any interface is up
    pub fn any_connected_interfaces(&self) -> bool {
        !self.connected_interfaces.read().is_empty()
    }

    /// Interfaces currently up, sorted by name
    pub fn connected_interfaces(&self) -> Vec<String> {
        let mut interfaces: Vec<String> = self.connected_interfaces.read().iter().cloned().collect();
        interfaces.sort();
        interfaces
    }

    /// Record an interface as up, returning false if it already was
    pub fn interface_up(&self, interface: &str) -> bool {
        self.connected_interfaces.write().insert(interface.to_string())
    }

    /// Record an interface as down, returning false if it was not up
    pub fn interface_down(&self, interface: &str) -> bool {
        self.connected_interfaces.write().remove(interface)
    }

    /// Enable reconnect for a session, recording the interfaces currently up
    pub fn add_enabled(&self, wrapper: &Arc<ReconnectWrapper>) {
        let interfaces = self.connected_interfaces();
        self.enabled.lock().insert(
            wrapper.unique_id().to_string(),
            EnabledSession {
                wrapper: Arc::downgrade(wrapper),
                interfaces,
            },
        );
    }

    /// Disable reconnect for a session
    pub fn remove_enabled(&self, unique_id: &str) -> bool {
        self.enabled.lock().remove(unique_id).is_some()
    }

    /// Check whether a session is reconnect-enabled
    pub fn is_enabled(&self, unique_id: &str) -> bool {
        self.enabled.lock().contains_key(unique_id)
    }

    /// Interfaces recorded when the session registered
    pub fn interfaces_of(&self, unique_id: &str) -> Option<Vec<String>> {
        self.enabled.lock().get(unique_id).map(|entry| entry.interfaces.clone())
    }

    /// Every reconnect-enabled session still alive
    pub fn enabled_sessions(&self) -> Vec<Arc<ReconnectWrapper>> {
        self.enabled
            .lock()
            .values()
            .filter_map(|entry| entry.wrapper.upgrade())
            .collect()
    }

    /// Reconnect-enabled sessions that registered while `interface` was up
    pub fn sessions_using(&self, interface: &str) -> Vec<Arc<ReconnectWrapper>> {
        self.enabled
            .lock()
            .values()
            .filter(|entry| entry.interfaces.iter().any(|name| name == interface))
            .filter_map(|entry| entry.wrapper.upgrade())
            .collect()
    }

    /// Number of reconnect-enabled sessions
    pub fn enabled_count(&self) -> usize {
        self.enabled.lock().len()
    }

    /// Log the registry contents
    pub fn trace_state(&self) {
        let enabled = self.enabled.lock();
        trace!(
            "Reconnect state: interfaces {:?}, {} enabled session(s)",
            self.connected_interfaces(),
            enabled.len()
        );
        for (unique_id, entry) in enabled.iter() {
            trace!("  {} registered over {:?}", unique_id, entry.interfaces);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_interfaces() {
        let registry = ReconnectRegistry::new();
        assert!(!registry.any_connected_interfaces());

        assert!(registry.interface_up("eth0"));
        assert!(!registry.interface_up("eth0"));
        assert!(registry.interface_up("wlan0"));
        assert_eq!(registry.connected_interfaces(), vec!["eth0", "wlan0"]);

        assert!(registry.interface_down("eth0"));
        assert!(!registry.interface_down("eth0"));
        assert!(registry.any_connected_interfaces());

        registry.interface_down("wlan0");
        assert!(!registry.any_connected_interfaces());
    }
}
