use mbot_channels::{ChannelError, Failure, ProducerScope, StateKind};

use super::{AuthError, AuthMethod, AuthResult, MethodKind, Secret};

/// Handle through which a [`BotAuthorization`](super::BotAuthorization) offers login
/// methods.
pub struct AuthSession {
    decisions: ProducerScope<Option<Failure>, AuthMethod>,
}

impl AuthSession {
    pub(crate) fn new(decisions: ProducerScope<Option<Failure>, AuthMethod>) -> Self {
        Self { decisions }
    }

    pub async fn auth_by_password(
        &mut self,
        password: impl Into<Secret>,
    ) -> Result<AuthResult, AuthError> {
        self.submit(AuthMethod::Password(password.into()), MethodKind::Password)
            .await
    }

    pub async fn auth_by_qr_code(&mut self) -> Result<AuthResult, AuthError> {
        self.submit(AuthMethod::QrCode, MethodKind::QrCode).await
    }

    /// True once the login was abandoned (session shutdown, timeout).
    pub fn is_cancelled(&self) -> bool {
        self.decisions.is_cancelled()
    }

    async fn submit(
        &mut self,
        method: AuthMethod,
        kind: MethodKind,
    ) -> Result<AuthResult, AuthError> {
        match self.decisions.emit(method).await {
            Ok(Some(failure)) => Err(AuthError::Rejected(failure)),
            Ok(None) => Ok(AuthResult { method: kind }),
            // The driver took this method and closed the channel: it worked.
            Err(ChannelError::AlreadyFinished {
                previous: StateKind::Consumed,
                suppressed: None,
                ..
            }) => Ok(AuthResult { method: kind }),
            Err(e) => Err(AuthError::Channel(e)),
        }
    }
}
