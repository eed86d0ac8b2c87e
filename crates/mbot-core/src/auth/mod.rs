//! Bot authorization: the strategy that decides how to log in, and the control loop that
//! lets the login driver pull its decisions one at a time.

pub mod control;
pub mod session;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use mbot_channels::{ChannelError, Failure};

use crate::{
    config::BotConfig,
    device::DeviceInfo,
    domain::{BotId, Protocol},
    Result,
};

pub use control::AuthControl;
pub use session::AuthSession;

/// A credential that keeps itself out of logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// The strategy's decision for one login round.
#[derive(Clone, Debug)]
pub enum AuthMethod {
    Password(Secret),
    QrCode,
    /// The strategy ended without offering a method.
    NotAvailable,
    /// The strategy itself failed.
    Error(Failure),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodKind {
    Password,
    QrCode,
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password => f.write_str("password"),
            Self::QrCode => f.write_str("qr-code"),
        }
    }
}

/// Returned to the strategy once a method it offered was accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthResult {
    pub method: MethodKind,
}

/// What the strategy knows about the account being logged in.
#[derive(Clone, Debug)]
pub struct BotAuthInfo {
    pub id: BotId,
    pub device: DeviceInfo,
    pub protocol: Protocol,
}

impl BotAuthInfo {
    /// Loads (or creates) the device identity configured for the bot.
    pub fn from_config(cfg: &BotConfig) -> Result<Self> {
        Ok(Self {
            id: cfg.bot_id,
            device: DeviceInfo::load_or_create(&cfg.device_file, cfg.bot_id)?,
            protocol: cfg.protocol,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The login driver tried the method and it failed; the strategy may retry.
    #[error("login rejected: {0}")]
    Rejected(#[source] Failure),

    #[error("protocol {0} does not support QR code login")]
    QrNotSupported(Protocol),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// User-supplied authorization strategy.
///
/// `authorize` runs as a background task. Each `session.auth_by_*` call hands one method
/// to the login driver and returns once the driver reports back, so retries and fallbacks
/// are plain control flow:
///
/// ```ignore
/// match session.auth_by_qr_code().await {
///     Ok(done) => Ok(done),
///     Err(AuthError::Rejected(_)) => Ok(session.auth_by_password(pw).await?),
///     Err(e) => Err(e.into()),
/// }
/// ```
#[async_trait]
pub trait BotAuthorization: Send + Sync {
    async fn authorize(
        &self,
        session: &mut AuthSession,
        info: &BotAuthInfo,
    ) -> anyhow::Result<AuthResult>;
}

/// Logs in with a fixed password; gives up on the first rejection.
pub struct PasswordAuthorization {
    password: Secret,
}

#[async_trait]
impl BotAuthorization for PasswordAuthorization {
    async fn authorize(
        &self,
        session: &mut AuthSession,
        _info: &BotAuthInfo,
    ) -> anyhow::Result<AuthResult> {
        Ok(session.auth_by_password(self.password.clone()).await?)
    }
}

/// Logs in by QR code; requires a protocol that supports it.
pub struct QrCodeAuthorization;

#[async_trait]
impl BotAuthorization for QrCodeAuthorization {
    async fn authorize(
        &self,
        session: &mut AuthSession,
        info: &BotAuthInfo,
    ) -> anyhow::Result<AuthResult> {
        if !info.protocol.supports_qr_login() {
            return Err(AuthError::QrNotSupported(info.protocol).into());
        }
        Ok(session.auth_by_qr_code().await?)
    }
}

pub fn by_password(password: impl Into<Secret>) -> Arc<dyn BotAuthorization> {
    Arc::new(PasswordAuthorization {
        password: password.into(),
    })
}

pub fn by_qr_code() -> Arc<dyn BotAuthorization> {
    Arc::new(QrCodeAuthorization)
}
