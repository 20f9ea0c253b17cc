// Per-session reconnect state machine
//
// The wrapper listens to one session's registration events. A dropped
// registration is followed by a reconnect after a randomized delay that
// doubles with every consecutive failure. When the session is still
// registered, it is unregistered first and the reconnect is scheduled once
// the unregistration completes.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, error, info, trace, warn};

use crate::reconnect::{
    AccountId, ReconnectContext, RegistrationReason, RegistrationSession, RegistrationState,
    RegistrationStateChangeEvent,
};

#[derive(Debug, Default)]
struct WrapperState {
    /// Last state seen from the session's events
    local_state: Option<RegistrationState>,
    /// An unregistration issued by this wrapper is in flight
    currently_unregistering: bool,
    /// Reconnect delay to schedule once the in-flight unregistration completes
    reconnect_on_next_unregistered_delay: Option<Duration>,
    /// Delay of the last reconnect, reset on a successful registration
    last_delay: Option<Duration>,
    /// Listener and timers are torn down
    cleared: bool,
}

/// Reconnect state machine wrapping one registration session
pub struct ReconnectWrapper {
    me: Weak<ReconnectWrapper>,
    session: Arc<dyn RegistrationSession>,
    ctx: Arc<ReconnectContext>,
    state: Mutex<WrapperState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectWrapper {
    /// Create a wrapper; call `start` to begin listening
    pub fn new(session: Arc<dyn RegistrationSession>, ctx: Arc<ReconnectContext>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            session,
            ctx,
            state: Mutex::new(WrapperState::default()),
            listener: Mutex::new(None),
        })
    }

    /// Listen to the session's registration events
    pub fn start(&self) {
        if self.state.lock().cleared {
            return;
        }

        let mut listener = self.listener.lock();
        if listener.is_some() {
            return;
        }

        let me = self.me.clone();
        let mut events = self.session.subscribe();
        let unique_id = self.unique_id().to_string();

        *listener = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match me.upgrade() {
                        Some(wrapper) => wrapper.registration_state_changed(&event),
                        None => break,
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Reconnect listener for {} skipped {} registration events", unique_id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            trace!("Reconnect listener for {} stopped", unique_id);
        }));
    }

    /// Wrapped session
    pub fn session(&self) -> &Arc<dyn RegistrationSession> {
        &self.session
    }

    /// Account of the wrapped session
    pub fn account_id(&self) -> &AccountId {
        self.session.account_id()
    }

    /// Session key
    pub fn unique_id(&self) -> &str {
        &self.session.account_id().unique_id
    }

    /// Check for an outstanding reconnect task
    pub fn is_reconnect_scheduled(&self) -> bool {
        self.ctx.scheduler.is_scheduled(self.unique_id())
    }

    /// Delay of the last reconnect since the last successful registration
    pub fn last_reconnect_delay(&self) -> Option<Duration> {
        self.state.lock().last_delay
    }

    /// Check whether the wrapper was torn down
    pub fn is_cleared(&self) -> bool {
        self.state.lock().cleared
    }

    /// Handle a registration state change of the wrapped session
    pub fn registration_state_changed(&self, event: &RegistrationStateChangeEvent) {
        let mut state = self.state.lock();
        if state.cleared {
            return;
        }

        if state.local_state == Some(event.new_state) {
            trace!("{} repeated state {}, ignoring", self.unique_id(), event.new_state);
            return;
        }
        state.local_state = Some(event.new_state);

        debug!(
            "{} changed from {} to {} ({:?})",
            self.unique_id(),
            event.old_state,
            event.new_state,
            event.reason
        );

        let erroneous_input = event.new_state == RegistrationState::ConnectionFailed
            && event.reason == RegistrationReason::ServerReturnedErroneousInput;

        match event.new_state {
            RegistrationState::ConnectionFailed if !erroneous_input => self.on_connection_failed(&mut state, event),
            RegistrationState::Registered => self.on_registered(&mut state),
            RegistrationState::Unregistered | RegistrationState::ConnectionFailed => {
                self.on_unregistered(&mut state, event, erroneous_input)
            }
            _ => {}
        }

        drop(state);
        self.ctx.registry.trace_state();
    }

    /// Reconnect the session after the next backoff delay
    ///
    /// Rejected while a reconnect is already scheduled or waiting on an
    /// unregistration.
    pub fn reconnect(&self) {
        let mut state = self.state.lock();
        if state.cleared {
            return;
        }
        self.reconnect_locked(&mut state);
    }

    /// Unregister the session and drop any scheduled reconnect
    pub fn unregister(&self) {
        let mut state = self.state.lock();
        if state.cleared {
            return;
        }

        state.reconnect_on_next_unregistered_delay = None;
        self.ctx.scheduler.cancel(self.unique_id());

        if self.spawn_unregister() {
            state.currently_unregistering = true;
        }
    }

    /// Stop listening, cancel timers and leave the reconnect-enabled set
    pub fn clear(&self) {
        let mut state = self.state.lock();
        self.clear_locked(&mut state);
    }

    fn on_registered(&self, state: &mut WrapperState) {
        let account = self.account_id();
        if !self.ctx.has_at_least_one_successful_connection(account) {
            self.ctx.set_at_least_one_successful_connection(account, true);
        }

        if let Some(me) = self.me.upgrade() {
            self.ctx.registry.add_enabled(&me);
        }

        self.ctx.scheduler.cancel(self.unique_id());
        state.last_delay = None;
        state.currently_unregistering = false;
        state.reconnect_on_next_unregistered_delay = None;
    }

    fn on_connection_failed(&self, state: &mut WrapperState, event: &RegistrationStateChangeEvent) {
        if !self.ctx.has_at_least_one_successful_connection(self.account_id()) {
            // Never connected, most likely a configuration problem
            info!("{} failed before ever connecting, not reconnecting", self.unique_id());
            self.ctx.notify_connection_failed(self.account_id(), event);
            return;
        }

        if state.currently_unregistering {
            state.currently_unregistering = false;
            match state.reconnect_on_next_unregistered_delay.take() {
                Some(delay) => self.schedule_reconnect(delay),
                None => debug!("{} failed while unregistering", self.unique_id()),
            }
            return;
        }

        self.reconnect_locked(state);
    }

    fn on_unregistered(&self, state: &mut WrapperState, event: &RegistrationStateChangeEvent, erroneous_input: bool) {
        let was_unregistering = std::mem::replace(&mut state.currently_unregistering, false);
        let pending = state.reconnect_on_next_unregistered_delay.take();

        if event.user_request || erroneous_input {
            info!("{} unregistered for good, disabling reconnect", self.unique_id());
            self.clear_locked(state);
            return;
        }

        self.ctx.scheduler.cancel(self.unique_id());

        if let Some(delay) = pending {
            if was_unregistering {
                self.schedule_reconnect(delay);
            }
        }
    }

    fn reconnect_locked(&self, state: &mut WrapperState) {
        if self.ctx.scheduler.is_scheduled(self.unique_id()) || state.reconnect_on_next_unregistered_delay.is_some() {
            warn!("Reconnect for {} already pending, ignoring", self.unique_id());
            return;
        }

        if !self.ctx.registry.any_connected_interfaces() {
            debug!("No interface up, {} waits for the network", self.unique_id());
            return;
        }

        let delay = self.ctx.config.next_delay(state.last_delay);
        state.last_delay = Some(delay);

        match self.session.registration_state() {
            RegistrationState::Unregistered | RegistrationState::ConnectionFailed => self.schedule_reconnect(delay),
            RegistrationState::Unregistering => {
                state.reconnect_on_next_unregistered_delay = Some(delay);
                state.currently_unregistering = true;
            }
            _ => {
                state.reconnect_on_next_unregistered_delay = Some(delay);
                state.currently_unregistering = true;
                self.spawn_unregister();
            }
        }
    }

    fn schedule_reconnect(&self, delay: Duration) {
        if !self.ctx.registry.any_connected_interfaces() {
            debug!("No interface up, not scheduling reconnect for {}", self.unique_id());
            return;
        }

        let session = self.session.clone();
        let unique_id = self.unique_id().to_string();
        let task = move || async move {
            info!("Reconnecting {}", unique_id);
            if let Err(e) = session.register().await {
                error!("Failed to re-register {}: {}", unique_id, e);
            }
        };

        if self.ctx.scheduler.schedule(self.unique_id(), delay, task) {
            info!("Reconnect for {} in {:?}", self.unique_id(), delay);
        } else {
            warn!("Reconnect for {} already scheduled, ignoring", self.unique_id());
        }
    }

    /// Spawn an unregistration unless the session is already on its way out
    fn spawn_unregister(&self) -> bool {
        match self.session.registration_state() {
            RegistrationState::Unregistering | RegistrationState::Unregistered | RegistrationState::ConnectionFailed => {
                false
            }
            _ => {
                let session = self.session.clone();
                let unique_id = self.unique_id().to_string();
                tokio::spawn(async move {
                    if let Err(e) = session.unregister().await {
                        error!("Failed to unregister {}: {}", unique_id, e);
                    }
                });
                true
            }
        }
    }

    fn clear_locked(&self, state: &mut WrapperState) {
        if state.cleared {
            return;
        }
        state.cleared = true;
        state.currently_unregistering = false;
        state.reconnect_on_next_unregistered_delay = None;

        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.ctx.scheduler.cancel(self.unique_id());
        self.ctx.registry.remove_enabled(self.unique_id());
    }
}

impl Drop for ReconnectWrapper {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}
