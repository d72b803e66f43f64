//! Error types for tunnelhub

use std::net::Ipv4Addr;

use thiserror::Error;

/// Main error type for tunnelhub
#[derive(Error, Debug)]
pub enum TunnelHubError {
    /// Caller supplied something unusable (blank identifier, bad address, ...)
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Hub configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Address pool errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Peer store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Route advertisement errors
    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    /// Config rendering errors
    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// Key generation or live tunnel state failures
    #[error("Collaborator failure: {0}")]
    Collaborator(#[from] CollaboratorError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Hub configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid hub config: {message}")]
    Parse { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Address pool errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("Invalid address pool: {value}")]
    InvalidPool { value: String },

    #[error("No available addresses in pool {cidr}")]
    PoolExhausted { cidr: String },

    #[error("Address {address} is not a usable host in pool {cidr}")]
    OutOfPool { address: Ipv4Addr, cidr: String },
}

/// Peer store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Peer already exists: {user_id}")]
    DuplicateIdentifier { user_id: String },

    #[error("Address already assigned: {ip}")]
    DuplicateAddress { ip: Ipv4Addr },

    #[error("Peer not found: {user_id}")]
    NotFound { user_id: String },

    #[error("Corrupt peer store: {message}")]
    Corrupt { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Route advertisement errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouteError {
    #[error("Route {route} is already advertised by {owner}")]
    Conflict { route: String, owner: String },
}

/// Config rendering errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RenderError {
    #[error("Hub {field} is not set")]
    MissingHubKey { field: String },
}

/// Failures reported by external collaborators, passed through verbatim
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("Key generation failed: {reason}")]
    KeyGeneration { reason: String },

    #[error("Reading live tunnel state failed: {reason}")]
    LiveState { reason: String },
}

impl TunnelHubError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Hub config not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Pool(PoolError::PoolExhausted { cidr }) => {
                format!(
                    "Address pool {} is full.\n  Remove unused peers or widen ip_pool in the hub config.",
                    cidr
                )
            }

            Self::Render(RenderError::MissingHubKey { field }) => {
                format!(
                    "Hub {} is empty.\n  Set it in the hub config before rendering peer configs.",
                    field
                )
            }

            Self::Collaborator(CollaboratorError::KeyGeneration { reason }) => {
                format!(
                    "Key generation failed: {}\n  Is wireguard-tools installed and on PATH?",
                    reason
                )
            }

            Self::Collaborator(CollaboratorError::LiveState { reason }) => {
                format!(
                    "Could not read interface state: {}\n  Reading counters usually needs root or CAP_NET_ADMIN.",
                    reason
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Whether the caller may retry the same request unchanged
    ///
    /// Only the allocate-then-commit race qualifies: a concurrent writer took the
    /// proposed address and a fresh allocation will pick another.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(StoreError::DuplicateAddress { .. }))
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::InvalidInput { .. } => 2,
            Self::Pool(_) => 3,
            Self::Store(StoreError::NotFound { .. }) => 4,
            Self::Store(StoreError::DuplicateIdentifier { .. })
            | Self::Store(StoreError::DuplicateAddress { .. })
            | Self::Route(_) => 5,
            Self::Store(_) => 6,
            Self::Render(_) => 7,
            Self::Collaborator(_) => 8,
            Self::System(_) => 9,
        }
    }
}

/// Result type alias for tunnelhub operations
pub type Result<T> = std::result::Result<T, TunnelHubError>;
