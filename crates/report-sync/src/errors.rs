//! Error types for report synchronization.
//!
//! None of these are fatal. Each one is absorbed at the component boundary
//! closest to its source and turned into observable state (`is_connected`,
//! `error`) or a log line.

use thiserror::Error;

/// Result type alias for report sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while coordinating report synchronization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The upstream change feed for a resource could not be established.
    #[error("Failed to open change feed for '{resource}': {message}")]
    FeedOpen { resource: String, message: String },

    /// The membership channel for a report could not be established.
    #[error("Presence channel '{room}' unavailable: {message}")]
    PresenceChannel { room: String, message: String },

    /// The identity collaborator could not resolve the current user.
    #[error("Identity resolution failed: {0}")]
    IdentityResolution(String),

    /// A consumer-supplied callback panicked.
    #[error("Callback '{name}' panicked: {message}")]
    Callback { name: String, message: String },

    /// A configuration value was missing or malformed.
    #[error("Invalid configuration value: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// Creates a FeedOpen error.
    pub fn feed_open(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FeedOpen {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Creates a PresenceChannel error.
    pub fn presence_channel(room: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PresenceChannel {
            room: room.into(),
            message: message.into(),
        }
    }

    /// Creates an IdentityResolution error.
    pub fn identity(message: impl Into<String>) -> Self {
        Self::IdentityResolution(message.into())
    }

    /// Creates a Callback error.
    pub fn callback(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Callback {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates an InvalidConfig error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}
