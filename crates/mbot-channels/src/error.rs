use std::{fmt, sync::Arc};

use crate::state::StateKind;

/// Marker cause recorded when a channel's scope is cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("channel scope was cancelled")]
pub struct Cancelled;

/// A failure that crossed the producer/consumer boundary.
///
/// Producers are user code and report `anyhow::Error`; the channel has to hand the same
/// cause to the consumer, record it in the terminal state and attach it to later
/// "already finished" errors, so it is shared behind an `Arc`.
#[derive(Clone)]
pub struct Failure(Arc<anyhow::Error>);

impl Failure {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn cancelled() -> Self {
        Self::new(Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.downcast_ref::<Cancelled>().is_some()
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Whether both handles refer to the same recorded failure.
    pub fn ptr_eq(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn as_anyhow(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&**self.0)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

/// Errors reported by [`crate::OnDemandChannel`] and [`crate::ProducerScope`].
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChannelError {
    /// An operation was invoked from a state that does not permit it.
    #[error("illegal channel state for `{operation}`: {state}")]
    IllegalState {
        operation: &'static str,
        state: String,
    },

    /// The producer ended with an error before emitting the awaited value.
    #[error("producer failed to produce a value, see cause: {0}")]
    ProducerFailure(#[source] Failure),

    /// The channel is terminal.
    ///
    /// `previous` is the last state before `Finished`. `suppressed` is the failure the
    /// channel finished with, if any. `cause` is set when the rejected operation was itself
    /// an attempt to finish with a failure.
    #[error("{message}")]
    AlreadyFinished {
        message: String,
        previous: StateKind,
        suppressed: Option<Failure>,
        #[source]
        cause: Option<Failure>,
    },

    #[error("channel scope was cancelled")]
    Cancelled,
}

impl ChannelError {
    pub(crate) fn illegal(operation: &'static str, state: impl fmt::Display) -> Self {
        Self::IllegalState {
            operation,
            state: state.to_string(),
        }
    }

    /// Returns the failure a producer ended with, consuming the wrapper.
    ///
    /// Any other variant is returned unchanged in `Err`.
    pub fn unwrap_cause(self) -> std::result::Result<Failure, ChannelError> {
        match self {
            Self::ProducerFailure(cause) => Ok(cause),
            other => Err(other),
        }
    }

    /// True for an "already finished" error on a channel that was closed without failure.
    pub fn is_finished_normally(&self) -> bool {
        matches!(
            self,
            Self::AlreadyFinished {
                suppressed: None,
                ..
            }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::ProducerFailure(f) => f.is_cancelled(),
            Self::AlreadyFinished { suppressed, .. } => {
                suppressed.as_ref().is_some_and(Failure::is_cancelled)
            }
            Self::IllegalState { .. } => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
