// Registration model consumed by the reconnect machine

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Registration states a session moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    /// Created, never registered
    Init,
    /// Registration in progress
    Registering,
    /// Server asked for credentials
    ChallengedForAuthentication,
    /// Credentials were rejected
    AuthenticationFailed,
    /// Registration refresh in progress
    UpdatePending,
    /// Registered with the server
    Registered,
    /// Unregistration in progress
    Unregistering,
    /// Not registered
    Unregistered,
    /// The connection dropped or could not be established
    ConnectionFailed,
    /// Registration expired without a refresh
    Expired,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrationState::Init => "Init",
            RegistrationState::Registering => "Registering",
            RegistrationState::ChallengedForAuthentication => "Challenged for authentication",
            RegistrationState::AuthenticationFailed => "Authentication failed",
            RegistrationState::UpdatePending => "Update pending",
            RegistrationState::Registered => "Registered",
            RegistrationState::Unregistering => "Unregistering",
            RegistrationState::Unregistered => "Unregistered",
            RegistrationState::ConnectionFailed => "Connection failed",
            RegistrationState::Expired => "Expired",
        };
        f.write_str(name)
    }
}

/// Reason attached to a registration state change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RegistrationReason {
    /// No reason given
    #[default]
    NotSpecified,
    /// Local error
    InternalError,
    /// Credentials were rejected
    AuthenticationFailed,
    /// Another client logged in with the same account
    MultipleLoginsDetected,
    /// The server limits the number of clients
    ClientLimitReached,
    /// The server throttles reconnection attempts
    ReconnectionRateLimitExceeded,
    /// The server could not be found
    ServerNotFound,
    /// The account does not exist on the server
    NonExistingUserId,
    /// The user asked for the change
    UserRequest,
    /// The server requires TLS
    TlsRequired,
    /// The server answered with data the session could not process
    ServerReturnedErroneousInput,
}

/// Registration state change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationStateChangeEvent {
    /// State before the change
    pub old_state: RegistrationState,
    /// State after the change
    pub new_state: RegistrationState,
    /// Reason code
    pub reason: RegistrationReason,
    /// Human readable reason
    pub reason_text: Option<String>,
    /// Whether the user initiated the change
    pub user_request: bool,
}

impl RegistrationStateChangeEvent {
    /// Create an event with no reason that was not user initiated
    pub fn new(old_state: RegistrationState, new_state: RegistrationState) -> Self {
        Self {
            old_state,
            new_state,
            reason: RegistrationReason::NotSpecified,
            reason_text: None,
            user_request: false,
        }
    }

    /// Attach a reason code
    pub fn with_reason(mut self, reason: RegistrationReason) -> Self {
        self.reason = reason;
        self
    }

    /// Attach a human readable reason
    pub fn with_reason_text(mut self, text: impl Into<String>) -> Self {
        self.reason_text = Some(text.into());
        self
    }

    /// Mark the change as user initiated
    pub fn user_requested(mut self) -> Self {
        self.user_request = true;
        self
    }
}

/// Account a session registers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountId {
    /// User identifier on the service
    pub user_id: String,
    /// Service or server name
    pub service: String,
    /// Identifier unique across all accounts, used as the session key
    pub unique_id: String,
}

impl AccountId {
    /// Create an account identifier keyed by `user_id@service`
    pub fn new(user_id: impl Into<String>, service: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let service = service.into();
        let unique_id = format!("{}@{}", user_id, service);

        Self { user_id, service, unique_id }
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unique_id)
    }
}

/// Network session able to register with a server
///
/// The session owns its credentials. State changes are published on the
/// channel returned by `subscribe`; dropping the receiver unsubscribes.
#[async_trait]
pub trait RegistrationSession: Send + Sync {
    /// Account this session registers
    fn account_id(&self) -> &AccountId;

    /// Current registration state
    fn registration_state(&self) -> RegistrationState;

    /// Start registering
    async fn register(&self) -> Result<()>;

    /// Start unregistering
    async fn unregister(&self) -> Result<()>;

    /// Subscribe to registration state changes
    fn subscribe(&self) -> broadcast::Receiver<RegistrationStateChangeEvent>;
}
