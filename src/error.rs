//! Error types shared across the agent.

use thiserror::Error;

/// Errors raised while building the static configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting was not provided.
    #[error("Missing required configuration '{key}': {hint}")]
    MissingRequired {
        /// Flag or environment variable name.
        key: String,
        /// How to provide it.
        hint: String,
    },

    /// A setting was provided but could not be used.
    #[error("Invalid value for '{key}': {message}")]
    InvalidValue {
        /// Flag or environment variable name.
        key: String,
        /// What was wrong with it.
        message: String,
    },
}

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// No container with that name or ID exists.
    #[error("No such container: {name}")]
    NotFound {
        /// Container name or ID that was looked up.
        name: String,
    },

    /// The container exists but does not publish the requested port.
    #[error("Container '{name}' has no public port for {private_port}/tcp")]
    NoPublicPort {
        /// Container name.
        name: String,
        /// Port inside the container.
        private_port: u16,
    },

    /// Failed to connect to the runtime.
    #[error("Docker not available: {reason}")]
    Unavailable {
        /// Reason for failure.
        reason: String,
    },

    /// The runtime rejected or failed an API call.
    #[error("Docker API error during {operation}: {reason}")]
    Api {
        /// Which call failed.
        operation: &'static str,
        /// Reason for failure.
        reason: String,
    },
}

impl ContainerError {
    /// True when the container is simply absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContainerError::NotFound { .. })
    }
}

/// Errors from the distributed configuration store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key does not exist.
    #[error("Key not found: {key}")]
    NotFound {
        /// Key that was requested.
        key: String,
    },

    /// An exclusive create found the key already present.
    #[error("Key already exists: {key}")]
    AlreadyExists {
        /// Key that was requested.
        key: String,
    },

    /// Every endpoint failed at the transport level.
    #[error("Store unreachable: {reason}")]
    Unreachable {
        /// Last transport error.
        reason: String,
    },

    /// The store answered with an error we do not special-case.
    #[error("Store error {code} on {key}: {message}")]
    Api {
        /// Store-specific error code (HTTP status when none was given).
        code: u64,
        /// Key that was requested.
        key: String,
        /// Message returned by the store.
        message: String,
    },

    /// The store answered with something we could not decode.
    #[error("Malformed store response: {0}")]
    Malformed(String),

    /// Invalid client configuration.
    #[error("Store configuration error: {reason}")]
    Config {
        /// Reason for error.
        reason: String,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}
