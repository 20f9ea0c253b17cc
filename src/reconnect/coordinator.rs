// Reconnect coordinator
//
// Owns the wrappers of every added session and turns network interface
// changes into reconnects, unregistrations and network-down notifications.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::reconnect::{
    Notification, ReconnectContext, ReconnectWrapper, RegistrationSession, NETWORK_NOTIFICATIONS,
};

/// Direction of an interface change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceChange {
    /// The interface came up
    Up,
    /// The interface went down
    Down,
}

/// Network interface change reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkChangeEvent {
    /// Interface name
    pub interface: String,
    /// What happened to it
    pub change: InterfaceChange,
}

impl NetworkChangeEvent {
    /// Interface came up
    pub fn up(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            change: InterfaceChange::Up,
        }
    }

    /// Interface went down
    pub fn down(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            change: InterfaceChange::Down,
        }
    }
}

impl fmt::Display for NetworkChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let change = match self.change {
            InterfaceChange::Up => "up",
            InterfaceChange::Down => "down",
        };
        write!(f, "{} {}", self.interface, change)
    }
}

/// Coordinates reconnect wrappers across network changes
pub struct ReconnectCoordinator {
    ctx: Arc<ReconnectContext>,
    wrappers: Mutex<HashMap<String, Arc<ReconnectWrapper>>>,
    /// Serializes network changes
    changes: Mutex<()>,
    network_down_timer: Mutex<Option<JoinHandle<()>>>,
    network_watch: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectCoordinator {
    /// Create a coordinator with no sessions and no interface up
    pub fn new(ctx: Arc<ReconnectContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            wrappers: Mutex::new(HashMap::new()),
            changes: Mutex::new(()),
            network_down_timer: Mutex::new(None),
            network_watch: Mutex::new(None),
        })
    }

    /// Shared reconnect context
    pub fn context(&self) -> &Arc<ReconnectContext> {
        &self.ctx
    }

    /// Start watching a session's registration
    ///
    /// Adding a session that is already watched returns its wrapper. A
    /// wrapper torn down by a user-initiated unregistration is replaced.
    pub fn add_session(&self, session: Arc<dyn RegistrationSession>) -> Arc<ReconnectWrapper> {
        let unique_id = session.account_id().unique_id.clone();
        let mut wrappers = self.wrappers.lock();

        if let Some(existing) = wrappers.get(&unique_id) {
            if !existing.is_cleared() {
                return existing.clone();
            }
        }

        let wrapper = ReconnectWrapper::new(session, self.ctx.clone());
        wrapper.start();
        wrappers.insert(unique_id.clone(), wrapper.clone());

        debug!("Watching registration of {}", unique_id);
        wrapper
    }

    /// Stop watching a session and forget that it ever connected
    pub fn remove_session(&self, unique_id: &str) -> bool {
        let Some(wrapper) = self.wrappers.lock().remove(unique_id) else {
            return false;
        };

        let account = wrapper.account_id();
        if self.ctx.has_at_least_one_successful_connection(account) {
            self.ctx.set_at_least_one_successful_connection(account, false);
        }

        self.ctx.registry.remove_enabled(unique_id);
        wrapper.clear();

        debug!("Stopped watching registration of {}", unique_id);
        true
    }

    /// Wrapper of a watched session
    pub fn wrapper(&self, unique_id: &str) -> Option<Arc<ReconnectWrapper>> {
        self.wrappers.lock().get(unique_id).cloned()
    }

    /// Number of watched sessions
    pub fn session_count(&self) -> usize {
        self.wrappers.lock().len()
    }

    /// Apply a network interface change
    pub fn configuration_changed(&self, event: &NetworkChangeEvent) {
        let _guard = self.changes.lock();
        info!("Network change: {}", event);

        match event.change {
            InterfaceChange::Up => self.interface_up(&event.interface),
            InterfaceChange::Down => self.interface_down(&event.interface),
        }

        self.ctx.registry.trace_state();
    }

    /// Apply interface changes from a channel until it closes
    pub fn watch_network(self: &Arc<Self>, mut events: broadcast::Receiver<NetworkChangeEvent>) {
        let coordinator = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match coordinator.upgrade() {
                        Some(coordinator) => coordinator.configuration_changed(&event),
                        None => break,
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Network watcher skipped {} interface changes", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.network_watch.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Tear down every wrapper and timer
    pub fn shutdown(&self) {
        if let Some(watch) = self.network_watch.lock().take() {
            watch.abort();
        }
        if let Some(timer) = self.network_down_timer.lock().take() {
            timer.abort();
        }

        let wrappers: Vec<_> = self.wrappers.lock().drain().map(|(_, wrapper)| wrapper).collect();
        for wrapper in wrappers {
            wrapper.clear();
        }
        self.ctx.scheduler.cancel_all();
    }

    fn interface_up(&self, interface: &str) {
        let was_down = !self.ctx.registry.any_connected_interfaces();
        self.ctx.registry.interface_up(interface);

        if !was_down {
            return;
        }

        if let Some(timer) = self.network_down_timer.lock().take() {
            timer.abort();
        }

        for wrapper in self.ctx.registry.enabled_sessions() {
            wrapper.reconnect();
        }
    }

    fn interface_down(&self, interface: &str) {
        self.ctx.registry.interface_down(interface);

        if self.ctx.registry.any_connected_interfaces() {
            for wrapper in self.ctx.registry.sessions_using(interface) {
                wrapper.reconnect();
            }
            return;
        }

        for wrapper in self.ctx.registry.enabled_sessions() {
            wrapper.unregister();
        }
        self.network_down();
    }

    fn network_down(&self) {
        if !self.ctx.config.delay_network_down_notification {
            fire_network_down(&self.ctx);
            return;
        }

        let mut timer = self.network_down_timer.lock();
        if timer.is_some() {
            return;
        }

        let ctx = self.ctx.clone();
        let threshold = self.ctx.config.network_down_threshold();
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            if !ctx.registry.any_connected_interfaces() {
                fire_network_down(&ctx);
            }
        }));
    }
}

fn fire_network_down(ctx: &ReconnectContext) {
    ctx.notifier.fire_notification(NETWORK_NOTIFICATIONS, &Notification::NetworkDown);
}

impl Drop for ReconnectCoordinator {
    fn drop(&mut self) {
        if let Some(watch) = self.network_watch.get_mut().take() {
            watch.abort();
        }
        if let Some(timer) = self.network_down_timer.get_mut().take() {
            timer.abort();
        }
    }
}
