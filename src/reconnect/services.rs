// Configuration store and notifier collaborators

use std::{collections::HashMap, fmt};

use parking_lot::RwLock;

/// Configuration key prefix for the per-account "connected at least once" flag
pub const AT_LEAST_ONE_CONNECTION_PROP: &str = "rtp_transform.reconnect.AT_LEAST_ONE_SUCCESSFUL_CONNECTION";

/// Notification event type for connectivity messages
pub const NETWORK_NOTIFICATIONS: &str = "NetworkNotifications";

/// Persistent string key-value store
pub trait ConfigurationStore: Send + Sync {
    /// Get a value
    fn get(&self, key: &str) -> Option<String>;

    /// Set a value
    fn set(&self, key: &str, value: String);

    /// Remove a value
    fn remove(&self, key: &str);
}

/// In-memory configuration store
#[derive(Debug, Default)]
pub struct MemoryConfigurationStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryConfigurationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigurationStore for MemoryConfigurationStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.values.write().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.values.write().remove(key);
    }
}

/// User-facing connectivity notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A session that never connected failed to connect
    ConnectionFailed {
        /// User identifier
        user_id: String,
        /// Service name
        service: String,
    },
    /// The server does not know the account
    NonExistingUserId {
        /// Service name
        service: String,
    },
    /// Every network interface went down
    NetworkDown,
}

impl Notification {
    /// Notification title
    pub fn title(&self) -> &str {
        match self {
            Notification::ConnectionFailed { .. } | Notification::NonExistingUserId { .. } => "Error",
            Notification::NetworkDown => "",
        }
    }

    /// Notification body
    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::ConnectionFailed { user_id, service } => {
                write!(f, "Failed to connect {} to {}. Check the account settings.", user_id, service)
            }
            Notification::NonExistingUserId { service } => {
                write!(f, "The account is not known to {}.", service)
            }
            Notification::NetworkDown => write!(f, "The network is down."),
        }
    }
}

/// Fire-and-forget user notifications
pub trait Notifier: Send + Sync {
    /// Show a notification
    fn fire_notification(&self, event_type: &str, notification: &Notification);
}

/// Notifier writing notifications to the log
#[derive(Debug, Default)]
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn fire_notification(&self, event_type: &str, notification: &Notification) {
        tracing::warn!("[{}] {} {}", event_type, notification.title(), notification.message());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryConfigurationStore::new();
        assert_eq!(store.get("a"), None);

        store.set("a", "true".to_string());
        assert_eq!(store.get("a").as_deref(), Some("true"));

        store.remove("a");
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn notifications_name_the_account() {
        let failed = Notification::ConnectionFailed {
            user_id: "alice".to_string(),
            service: "example.org".to_string(),
        };

        assert_eq!(failed.title(), "Error");
        assert!(failed.message().contains("alice"));
        assert!(failed.message().contains("example.org"));
        assert_eq!(Notification::NetworkDown.title(), "");
    }
}
