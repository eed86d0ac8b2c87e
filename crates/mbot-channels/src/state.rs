//! States of an [`OnDemandChannel`](crate::OnDemandChannel).
//!
//! ```text
//!  JustInitialized
//!        | expect_more
//!        v
//!  ProducerReady  <-------------------------------+
//!        | (producer started at most once)         |
//!        v                                        |
//!    Producing ---- emit ----> Consuming           |
//!        |                        |               |
//!  receive_or_null waits    receive_or_null       |
//!        |                        v               |
//!        +-------------------> Consumed -- expect_more (resumes emit)
//! ```
//!
//! `finish`/`finish_exceptionally`/cancellation move any non-terminal state to `Finished`.
//! Anything not drawn above is an illegal transition.

use std::fmt;

use tokio::{sync::oneshot, task::AbortHandle};

use crate::error::{ChannelError, Failure};

/// Handle to the spawned producer task.
#[derive(Debug)]
pub(crate) struct ProducerHandle {
    abort: AbortHandle,
}

impl ProducerHandle {
    pub(crate) fn new(abort: AbortHandle) -> Self {
        Self { abort }
    }

    pub(crate) fn abort(&self) {
        self.abort.abort();
    }
}

/// Field-less copy of a state, kept by `Finished` for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateKind {
    JustInitialized,
    ProducerReady,
    Producing,
    Consuming,
    Consumed,
    Finished,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::JustInitialized => "JustInitialized",
            Self::ProducerReady => "ProducerReady",
            Self::Producing => "Producing",
            Self::Consuming => "Consuming",
            Self::Consumed => "Consumed",
            Self::Finished => "Finished",
        };
        f.write_str(s)
    }
}

pub(crate) enum ChannelState<H, V> {
    /// No producer exists yet.
    JustInitialized,

    /// Producer deferred (`None`) or about to be resumed (`Some`).
    ProducerReady { producer: Option<ProducerHandle> },

    /// Producer running; the value slot is open.
    ///
    /// `value_rx` is `None` while a consumer is waiting on it.
    Producing {
        producer: ProducerHandle,
        value_tx: Option<oneshot::Sender<V>>,
        value_rx: Option<oneshot::Receiver<V>>,
    },

    /// Producer emitted and is suspended on `latch`.
    Consuming {
        producer: ProducerHandle,
        value_rx: Option<oneshot::Receiver<V>>,
        latch: oneshot::Sender<H>,
    },

    /// Value taken; producer still suspended on `latch`.
    Consumed {
        producer: ProducerHandle,
        latch: oneshot::Sender<H>,
    },

    Finished {
        previous: StateKind,
        exception: Option<Failure>,
        /// The producer ended while a value was owed to the consumer and nobody was waiting
        /// for it yet; the next `receive_or_null` observes the outcome instead of "already
        /// finished".
        owed: bool,
    },
}

impl<H, V> ChannelState<H, V> {
    pub(crate) fn producing(producer: ProducerHandle) -> Self {
        let (tx, rx) = oneshot::channel();
        Self::Producing {
            producer,
            value_tx: Some(tx),
            value_rx: Some(rx),
        }
    }

    pub(crate) fn kind(&self) -> StateKind {
        match self {
            Self::JustInitialized => StateKind::JustInitialized,
            Self::ProducerReady { .. } => StateKind::ProducerReady,
            Self::Producing { .. } => StateKind::Producing,
            Self::Consuming { .. } => StateKind::Consuming,
            Self::Consumed { .. } => StateKind::Consumed,
            Self::Finished { .. } => StateKind::Finished,
        }
    }

    pub(crate) fn producer(&self) -> Option<&ProducerHandle> {
        match self {
            Self::ProducerReady { producer } => producer.as_ref(),
            Self::Producing { producer, .. }
            | Self::Consuming { producer, .. }
            | Self::Consumed { producer, .. } => Some(producer),
            Self::JustInitialized | Self::Finished { .. } => None,
        }
    }

    /// Terminal state for a cancelled scope. Aborts the producer, if one runs.
    ///
    /// Already-finished states are returned unchanged.
    pub(crate) fn into_cancelled(self) -> Self {
        if let Self::Finished { .. } = self {
            return self;
        }
        if let Some(producer) = self.producer() {
            producer.abort();
        }
        Self::Finished {
            previous: self.kind(),
            exception: Some(Failure::cancelled()),
            owed: false,
        }
    }

    /// Builds the error for an operation attempted on a `Finished` state.
    ///
    /// `attempted` is the failure a rejected second finish tried to record.
    pub(crate) fn already_finished(&self, attempted: Option<Failure>) -> ChannelError {
        let Self::Finished {
            previous,
            exception,
            ..
        } = self
        else {
            return ChannelError::illegal("already_finished", self);
        };

        let attempt = match &attempted {
            Some(cause) => format!(", but attempting to finish with the cause {cause}"),
            None => String::new(),
        };
        let message = match exception {
            None => format!(
                "producer has already finished normally{attempt}. Previous state was: {previous}"
            ),
            Some(e) => format!(
                "producer has already finished with the suppressed exception `{e}`{attempt}. Previous state was: {previous}"
            ),
        };

        ChannelError::AlreadyFinished {
            message,
            previous: *previous,
            suppressed: exception.clone(),
            cause: attempted,
        }
    }
}

impl<H, V> fmt::Display for ChannelState<H, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JustInitialized => write!(f, "JustInitialized"),
            Self::ProducerReady { producer } => {
                write!(f, "ProducerReady(started={})", producer.is_some())
            }
            Self::Producing { value_rx, .. } => {
                write!(f, "Producing(receiver_waiting={})", value_rx.is_none())
            }
            Self::Consuming { value_rx, .. } => {
                write!(f, "Consuming(value_taken={})", value_rx.is_none())
            }
            Self::Consumed { .. } => write!(f, "Consumed"),
            Self::Finished {
                previous,
                exception,
                ..
            } => match exception {
                Some(e) => write!(f, "Finished({previous}, {e})"),
                None => write!(f, "Finished({previous})"),
            },
        }
    }
}
