use std::sync::{Arc, Mutex, PoisonError};

use mbot_channels::{ChannelError, ChannelOptions, Failure, OnDemandChannel, ProducerScope};
use tokio_util::sync::CancellationToken;

use crate::{domain::BotId, exceptions::ExceptionCollector};

use super::{AuthMethod, AuthSession, BotAuthInfo, BotAuthorization};

/// Drives a [`BotAuthorization`] on behalf of the login driver.
///
/// Event sequence:
///
/// 1. [`start`](Self::start) launches `authorize` as a background task.
/// 2. [`acquire_auth`](Self::acquire_auth) waits for the strategy's next method.
/// 3. The driver tries it and reports back with [`act_method_failed`](Self::act_method_failed)
///    (strategy resumes with the failure, back to 2) or [`act_complete`](Self::act_complete).
pub struct AuthControl {
    bot: BotId,
    exceptions: Mutex<ExceptionCollector>,
    decisions: OnDemandChannel<Option<Failure>, AuthMethod>,
}

impl AuthControl {
    pub fn new(
        info: BotAuthInfo,
        authorization: Arc<dyn BotAuthorization>,
        debug_logging: bool,
        parent: &CancellationToken,
    ) -> Self {
        let bot = info.id;
        let opts = ChannelOptions {
            name: format!("AuthControl/UserDecisions/{bot}"),
            verbose: debug_logging,
        };
        let decisions = OnDemandChannel::new(parent, opts, move |scope, _first_hint| {
            run_authorization(scope, authorization, info)
        });

        Self {
            bot,
            exceptions: Mutex::new(ExceptionCollector::new()),
            decisions,
        }
    }

    pub fn start(&self) -> Result<(), ChannelError> {
        self.decisions.expect_more(None)
    }

    /// Waits for the strategy's next method.
    ///
    /// A failing strategy is reported as [`AuthMethod::Error`] and a strategy that ended
    /// without offering anything as [`AuthMethod::NotAvailable`]; `Err` is reserved for
    /// misuse of the control and for cancellation.
    pub async fn acquire_auth(&self) -> Result<AuthMethod, ChannelError> {
        tracing::debug!(bot = %self.bot, "[AuthControl/acquire] Acquiring auth method");

        let rsp = match self.decisions.receive_or_null().await {
            Ok(Some(method)) => method,
            Ok(None) => AuthMethod::NotAvailable,
            Err(ChannelError::ProducerFailure(cause)) => AuthMethod::Error(cause),
            Err(e) => return Err(e),
        };

        tracing::debug!(
            bot = %self.bot,
            method = ?rsp,
            "[AuthControl/acquire] Authorization responded"
        );
        Ok(rsp)
    }

    /// Reports that the last method failed; the strategy resumes with `cause`.
    pub fn act_method_failed(&self, cause: Failure) -> Result<(), ChannelError> {
        tracing::debug!(bot = %self.bot, error = %cause, "[AuthControl/resume] Fire auth failed");
        self.collect(cause.clone());
        self.decisions.expect_more(Some(cause))
    }

    /// Reports that the last method succeeded. No further rounds.
    pub fn act_complete(&self) -> Result<(), ChannelError> {
        tracing::debug!(bot = %self.bot, "[AuthControl/resume] Fire auth completed");
        self.decisions.close()
    }

    /// Stops the strategy after a final failure the driver will not retry.
    pub fn act_abandon(&self, cause: Failure) -> Result<(), ChannelError> {
        tracing::debug!(
            bot = %self.bot,
            error = %cause,
            "[AuthControl/resume] Fire auth abandoned"
        );
        self.collect(cause.clone());
        self.decisions.finish_exceptionally(cause)
    }

    pub fn cancel(&self) {
        self.decisions.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.decisions.is_finished()
    }

    /// Failures reported through [`act_method_failed`](Self::act_method_failed) and
    /// [`act_abandon`](Self::act_abandon), oldest first.
    pub fn take_failures(&self) -> Vec<Failure> {
        self.exceptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
    }

    fn collect(&self, cause: Failure) {
        self.exceptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .collect(cause);
    }
}

async fn run_authorization(
    scope: ProducerScope<Option<Failure>, AuthMethod>,
    authorization: Arc<dyn BotAuthorization>,
    info: BotAuthInfo,
) -> anyhow::Result<()> {
    let mut session = AuthSession::new(scope);
    // Failures are carried to the driver by the channel.
    let result = authorization.authorize(&mut session, &info).await?;
    tracing::debug!(bot = %info.id, method = %result.method, "authorization finished");
    Ok(())
}
