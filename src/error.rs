//! Error types for credit gating

use thiserror::Error;
use uuid::Uuid;

use crate::credits::DenialReason;

/// Errors surfaced by the credit gate
#[derive(Error, Debug)]
pub enum CreditError {
    /// The action was denied by a quota check
    #[error("{0}")]
    QuotaExceeded(DenialReason),

    /// SQLite failure
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Local storage file failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Local storage contents could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No profile exists for this uid
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    /// Caller tried an admin-only operation
    #[error("user {0} is not an admin")]
    NotAdmin(String),

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// The consumption was refunded before
    #[error("consumption {0} was already refunded")]
    AlreadyRefunded(Uuid),

    /// The upstream AI provider call failed
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl CreditError {
    /// Whether the user can resolve this by upgrading or waiting for the daily reset
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }

    /// Short message suitable for a toast notification
    pub fn user_message(&self) -> String {
        match self {
            Self::QuotaExceeded(reason) => reason.to_string(),
            Self::Upstream(_) => "Generation failed, please try again".to_string(),
            Self::NotAdmin(_) => "Only admins can change this setting".to_string(),
            Self::ProfileNotFound(_) => "Please sign in again".to_string(),
            Self::AlreadyRefunded(_) => "These credits were already returned".to_string(),
            Self::Storage(_) | Self::Io(_) | Self::Serialization(_) | Self::Config(_) => {
                "Something went wrong saving your credits".to_string()
            }
        }
    }
}

impl From<CreditError> for String {
    fn from(err: CreditError) -> Self {
        err.to_string()
    }
}

pub type CreditResult<T> = Result<T, CreditError>;
