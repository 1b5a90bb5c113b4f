use crate::ids::ClientId;

/// Failures reported by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The native client could not be created
    #[error("failed to create native client: {0}")]
    Create(String),

    /// A request could not be handed to the native client
    #[error("failed to send request: {0}")]
    Send(String),

    /// Polling the event stream failed
    #[error("failed to receive events: {0}")]
    Receive(String),

    /// The native side is gone; receivers stop polling
    #[error("transport disconnected")]
    Disconnected,
}

/// Misuse and lifecycle errors surfaced to callers of the dispatch core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("can't send a request before calling initialize")]
    NotInitialized,

    #[error("can't initialize the same client twice")]
    AlreadyInitialized,

    #[error("client initialization failed earlier; create a new client")]
    InitializationFailed,

    #[error("client {0} already registered")]
    ClientAlreadyRegistered(ClientId),

    #[error("client manager has been shut down")]
    ManagerShutDown,

    #[error("request was dropped before a response arrived")]
    ResponseDropped,

    #[error("failed to spawn receiver thread: {0}")]
    Spawn(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DispatchError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::AlreadyInitialized => "already_initialized",
            Self::InitializationFailed => "initialization_failed",
            Self::ClientAlreadyRegistered(_) => "client_already_registered",
            Self::ManagerShutDown => "manager_shut_down",
            Self::ResponseDropped => "response_dropped",
            Self::Spawn(_) => "spawn",
            Self::Transport(_) => "transport",
            Self::Config(_) => "config",
        }
    }
}
