use std::time::Duration;

use mbot_channels::{ChannelError, Failure};

/// Core error type for the bot.
///
/// Collaborators (transports, authorization strategies) report `anyhow` errors; by the time
/// they reach this type they are wrapped as [`Failure`] so every recorded cause is kept.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The authorization strategy failed; `collected` holds the login failures seen
    /// before it gave up, oldest first.
    #[error("authorization failed: {cause}")]
    Authorization {
        #[source]
        cause: Failure,
        collected: Vec<Failure>,
    },

    #[error("authorization strategy offered no login method")]
    NoAuthMethod { collected: Vec<Failure> },

    #[error("login failed after {attempts} attempts, last error: {last}")]
    AttemptsExhausted {
        attempts: u32,
        #[source]
        last: Failure,
        collected: Vec<Failure>,
    },

    #[error("timed out after {0:?} waiting for an authorization method")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, Error>;
