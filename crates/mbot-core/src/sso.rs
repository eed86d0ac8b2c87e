use std::sync::Arc;

use async_trait::async_trait;
use mbot_channels::{ChannelError, Failure};
use tokio_util::sync::CancellationToken;

use crate::{
    auth::{AuthControl, AuthMethod, BotAuthInfo, BotAuthorization, MethodKind, Secret},
    config::BotConfig,
    Error, Result,
};

/// Network side of a login attempt.
#[async_trait]
pub trait LoginTransport: Send + Sync {
    async fn login_with_password(
        &self,
        info: &BotAuthInfo,
        password: &Secret,
    ) -> anyhow::Result<()>;

    async fn login_with_qr_code(&self, info: &BotAuthInfo) -> anyhow::Result<()>;
}

/// Login driver: pulls methods out of the authorization strategy and tries them until one
/// succeeds, the strategy runs out, or the attempt budget is spent.
pub struct SsoProcessor {
    cfg: Arc<BotConfig>,
    transport: Arc<dyn LoginTransport>,
}

impl SsoProcessor {
    pub fn new(cfg: Arc<BotConfig>, transport: Arc<dyn LoginTransport>) -> Self {
        Self { cfg, transport }
    }

    pub async fn login(
        &self,
        info: BotAuthInfo,
        authorization: Arc<dyn BotAuthorization>,
        parent: &CancellationToken,
    ) -> Result<MethodKind> {
        let control = AuthControl::new(
            info.clone(),
            authorization,
            self.cfg.auth_debug_logging,
            parent,
        );
        control.start()?;

        let mut attempts = 0u32;
        loop {
            let deadline = self.cfg.auth_timeout;
            let method = match tokio::time::timeout(deadline, control.acquire_auth()).await {
                Ok(method) => method?,
                Err(_) => {
                    tracing::warn!(
                        bot = %info.id,
                        timeout = ?deadline,
                        "no authorization method in time"
                    );
                    control.cancel();
                    return Err(Error::Timeout(deadline));
                }
            };

            let kind = match &method {
                AuthMethod::Password(_) => MethodKind::Password,
                AuthMethod::QrCode => MethodKind::QrCode,
                AuthMethod::NotAvailable => {
                    return Err(Error::NoAuthMethod {
                        collected: control.take_failures(),
                    });
                }
                AuthMethod::Error(cause) => {
                    return Err(Error::Authorization {
                        cause: cause.clone(),
                        collected: control.take_failures(),
                    });
                }
            };

            attempts += 1;
            tracing::info!(bot = %info.id, method = %kind, attempt = attempts, "logging in");

            let outcome = tokio::select! {
                r = self.attempt(&info, &method) => r,
                _ = parent.cancelled() => {
                    control.cancel();
                    return Err(ChannelError::Cancelled.into());
                }
            };

            match outcome {
                Ok(()) => {
                    control.act_complete()?;
                    tracing::info!(bot = %info.id, method = %kind, "login succeeded");
                    return Ok(kind);
                }
                Err(e) => {
                    let cause = Failure::from(e);
                    tracing::warn!(
                        bot = %info.id,
                        method = %kind,
                        error = %cause,
                        "login attempt failed"
                    );

                    if attempts >= self.cfg.max_auth_attempts {
                        if let Err(e) = control.act_abandon(cause.clone()) {
                            tracing::debug!(
                                bot = %info.id,
                                error = %e,
                                "authorization already stopped"
                            );
                        }
                        return Err(Error::AttemptsExhausted {
                            attempts,
                            last: cause,
                            collected: control.take_failures(),
                        });
                    }
                    control.act_method_failed(cause)?;
                }
            }
        }
    }

    async fn attempt(&self, info: &BotAuthInfo, method: &AuthMethod) -> anyhow::Result<()> {
        match method {
            AuthMethod::Password(pw) => self.transport.login_with_password(info, pw).await,
            AuthMethod::QrCode => self.transport.login_with_qr_code(info).await,
            AuthMethod::NotAvailable | AuthMethod::Error(_) => {
                anyhow::bail!("not a login method: {method:?}")
            }
        }
    }
}
