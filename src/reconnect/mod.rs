// Reconnect state machine for network registrations
//
// This module watches the registration state of long-lived network sessions
// and schedules backed-off reconnect attempts when a registration drops,
// taking network interface availability into account.

pub mod session;
pub mod services;
pub mod scheduler;
pub mod registry;
pub mod wrapper;
pub mod coordinator;

use std::sync::Arc;

use crate::config::ReconnectConfig;

pub use coordinator::{InterfaceChange, NetworkChangeEvent, ReconnectCoordinator};
pub use registry::ReconnectRegistry;
pub use scheduler::ReconnectScheduler;
pub use services::{
    ConfigurationStore, LoggingNotifier, MemoryConfigurationStore, Notification, Notifier, AT_LEAST_ONE_CONNECTION_PROP,
    NETWORK_NOTIFICATIONS,
};
pub use session::{AccountId, RegistrationReason, RegistrationSession, RegistrationState, RegistrationStateChangeEvent};
pub use wrapper::ReconnectWrapper;

/// Collaborators shared by every reconnect wrapper of one coordinator
pub struct ReconnectContext {
    /// Reconnect timing
    pub config: ReconnectConfig,
    /// Reconnect-enabled sessions and connected interfaces
    pub registry: ReconnectRegistry,
    /// Shared reconnect timer
    pub scheduler: Arc<ReconnectScheduler>,
    /// Persistent configuration
    pub store: Arc<dyn ConfigurationStore>,
    /// User-facing notifications
    pub notifier: Arc<dyn Notifier>,
}

impl ReconnectContext {
    /// Create a context with an empty registry and scheduler
    pub fn new(config: ReconnectConfig, store: Arc<dyn ConfigurationStore>, notifier: Arc<dyn Notifier>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: ReconnectRegistry::new(),
            scheduler: Arc::new(ReconnectScheduler::new()),
            store,
            notifier,
        })
    }

    /// Check whether the account ever registered successfully
    pub fn has_at_least_one_successful_connection(&self, account: &AccountId) -> bool {
        self.store
            .get(&successful_connection_key(account))
            .map_or(false, |value| value == "true")
    }

    /// Persist whether the account ever registered successfully
    pub fn set_at_least_one_successful_connection(&self, account: &AccountId, value: bool) {
        self.store.set(&successful_connection_key(account), value.to_string());
    }

    /// Tell the user a session failed to connect
    pub fn notify_connection_failed(&self, account: &AccountId, event: &RegistrationStateChangeEvent) {
        if event.new_state != RegistrationState::ConnectionFailed {
            return;
        }

        let notification = if event.reason == RegistrationReason::NonExistingUserId {
            Notification::NonExistingUserId {
                service: account.service.clone(),
            }
        } else {
            Notification::ConnectionFailed {
                user_id: account.user_id.clone(),
                service: account.service.clone(),
            }
        };

        self.notifier.fire_notification(NETWORK_NOTIFICATIONS, &notification);
    }
}

fn successful_connection_key(account: &AccountId) -> String {
    format!("{}.{}", AT_LEAST_ONE_CONNECTION_PROP, account.unique_id)
}
