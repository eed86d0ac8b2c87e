use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::{runtime::Handle, sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ChannelError, Failure, Result},
    state::{ChannelState, ProducerHandle, StateKind},
};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type Launcher<H, V> =
    Box<dyn FnOnce(ProducerScope<H, V>, H) -> BoxFuture<anyhow::Result<()>> + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Producer,
    Consumer,
}

#[derive(Clone, Debug)]
pub struct ChannelOptions {
    /// Label used in log lines.
    pub name: String,
    /// Log every state transition at debug level.
    pub verbose: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            name: "on-demand".to_string(),
            verbose: false,
        }
    }
}

struct Cell<H, V> {
    state: ChannelState<H, V>,
    launcher: Option<Launcher<H, V>>,
    started: bool,
}

struct Shared<H, V> {
    cell: Mutex<Cell<H, V>>,
    scope: CancellationToken,
    opts: ChannelOptions,
}

impl<H, V> Shared<H, V> {
    /// Locks the state cell. A cancelled scope is settled to `Finished` first, so every
    /// caller after `cancel()` observes the terminal state.
    fn lock(&self) -> MutexGuard<'_, Cell<H, V>> {
        let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        if self.scope.is_cancelled() && cell.state.kind() != StateKind::Finished {
            let current = std::mem::replace(&mut cell.state, ChannelState::JustInitialized);
            let from = current.kind();
            cell.state = current.into_cancelled();
            if self.opts.verbose {
                tracing::debug!(channel = %self.opts.name, %from, "channel cancelled");
            }
        }
        cell
    }

    /// Runs `f` with exclusive ownership of the current state; the returned state replaces it.
    fn transition<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut Cell<H, V>, ChannelState<H, V>) -> (ChannelState<H, V>, R),
    ) -> R {
        let mut cell = self.lock();
        let current = std::mem::replace(&mut cell.state, ChannelState::JustInitialized);
        let from = current.kind();
        let (next, out) = f(&mut cell, current);
        if self.opts.verbose && next.kind() != from {
            tracing::debug!(channel = %self.opts.name, op, %from, to = %next, "channel transition");
        }
        cell.state = next;
        out
    }

    fn finish(&self, cause: Option<Failure>, side: Side) -> Result<()> {
        self.transition("finish", |_cell, state| match state {
            st @ ChannelState::Finished { .. } => {
                let err = st.already_finished(cause);
                (st, Err(err))
            }
            st => {
                let previous = st.kind();
                if cause.as_ref().is_some_and(Failure::is_cancelled) {
                    if let Some(producer) = st.producer() {
                        producer.abort();
                    }
                }
                // Dropping the old state drops its senders, which wakes a waiting
                // `receive_or_null` or `emit`.
                drop(st);
                let finished = ChannelState::Finished {
                    previous,
                    exception: cause,
                    owed: side == Side::Producer && previous == StateKind::Producing,
                };
                (finished, Ok(()))
            }
        })
    }

    fn finished_error(&self, op: &'static str) -> ChannelError {
        let cell = self.lock();
        match &cell.state {
            st @ ChannelState::Finished { .. } => st.already_finished(None),
            st => ChannelError::illegal(op, st),
        }
    }
}

fn outcome<V>(exception: Option<Failure>) -> Result<Option<V>> {
    match exception {
        None => Ok(None),
        Some(cause) if cause.is_cancelled() => Err(ChannelError::Cancelled),
        Some(cause) => Err(ChannelError::ProducerFailure(cause)),
    }
}

impl<H, V> Shared<H, V>
where
    H: Send + 'static,
    V: Send + 'static,
{
    /// Starts the producer task. Runs under the state lock; `started` makes it at-most-once.
    fn launch(self: &Arc<Self>, cell: &mut Cell<H, V>, hint: H) -> Result<ProducerHandle> {
        if cell.started {
            return Err(ChannelError::illegal("start_producer", "producer already started"));
        }
        let runtime = Handle::try_current().map_err(|_| {
            ChannelError::illegal("start_producer", "no tokio runtime to run the producer on")
        })?;
        let launcher = cell.launcher.take().ok_or_else(|| {
            ChannelError::illegal("start_producer", "producer launcher missing")
        })?;
        cell.started = true;

        let scope = ProducerScope {
            shared: Arc::clone(self),
        };
        let task = runtime.spawn(launcher(scope, hint));
        let handle = ProducerHandle::new(task.abort_handle());
        runtime.spawn(supervise(Arc::clone(self), task));
        Ok(handle)
    }

    fn resume(
        self: &Arc<Self>,
        cell: &mut Cell<H, V>,
        ready: ChannelState<H, V>,
        hint: Option<H>,
    ) -> (ChannelState<H, V>, Result<()>) {
        let producer = match ready {
            ChannelState::ProducerReady { producer } => producer,
            st => {
                let err = ChannelError::illegal("expect_more", &st);
                return (st, Err(err));
            }
        };
        let producer = match (producer, hint) {
            (Some(producer), _) => producer,
            (None, Some(hint)) => match self.launch(cell, hint) {
                Ok(producer) => producer,
                Err(e) => return (ChannelState::ProducerReady { producer: None }, Err(e)),
            },
            (None, None) => {
                let st = ChannelState::ProducerReady { producer: None };
                let err = ChannelError::illegal("expect_more", &st);
                return (st, Err(err));
            }
        };
        (ChannelState::producing(producer), Ok(()))
    }
}

/// Waits for the producer task and records how it ended.
async fn supervise<H, V>(shared: Arc<Shared<H, V>>, mut task: JoinHandle<anyhow::Result<()>>) {
    let cause = tokio::select! {
        joined = &mut task => match joined {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(Failure::from(e)),
            Err(e) if e.is_cancelled() => Some(Failure::cancelled()),
            Err(e) => Some(Failure::msg(format!("producer task panicked: {e}"))),
        },
        _ = shared.scope.cancelled() => {
            task.abort();
            Some(Failure::cancelled())
        }
    };

    match &cause {
        None => tracing::debug!(channel = %shared.opts.name, "producer finished"),
        Some(c) if c.is_cancelled() => {
            tracing::debug!(channel = %shared.opts.name, "producer cancelled")
        }
        Some(c) => tracing::debug!(channel = %shared.opts.name, error = %c, "producer failed"),
    }

    if let Err(e) = shared.finish(cause, Side::Producer) {
        // Consumer closed or cancelled first; the producer's own outcome is moot.
        tracing::trace!(
            channel = %shared.opts.name,
            error = %e,
            "producer ended after channel finished"
        );
    }
}

/// Holds the value receiver while a consumer waits, and returns it to the channel if the
/// wait is abandoned.
struct PendingReceive<'a, H, V> {
    shared: &'a Shared<H, V>,
    rx: Option<oneshot::Receiver<V>>,
}

enum Delivery<V> {
    Value(V),
    Closed,
}

impl<H, V> PendingReceive<'_, H, V> {
    async fn recv(&mut self) -> Delivery<V> {
        let Some(rx) = self.rx.as_mut() else {
            return Delivery::Closed;
        };
        let received = rx.await;
        self.rx = None;
        match received {
            Ok(value) => Delivery::Value(value),
            Err(_) => Delivery::Closed,
        }
    }
}

impl<H, V> Drop for PendingReceive<'_, H, V> {
    fn drop(&mut self) {
        let Some(rx) = self.rx.take() else {
            return;
        };
        let mut cell = self.shared.lock();
        match &mut cell.state {
            ChannelState::Producing { value_rx, .. } | ChannelState::Consuming { value_rx, .. }
                if value_rx.is_none() =>
            {
                *value_rx = Some(rx);
            }
            _ => {}
        }
    }
}

enum Receive<V> {
    Wait(oneshot::Receiver<V>),
    Done(Option<V>),
}

/// Single-slot, alternating-turn rendezvous between a lazily started producer task and
/// one consumer.
///
/// The consumer asks for a value with [`expect_more`](Self::expect_more) (passing a hint to
/// the producer) and takes it with [`receive_or_null`](Self::receive_or_null). The producer
/// hands each value over with [`ProducerScope::emit`] and stays suspended until the next
/// hint arrives. At most one value is ever in flight.
pub struct OnDemandChannel<H, V> {
    shared: Arc<Shared<H, V>>,
}

impl<H, V> OnDemandChannel<H, V>
where
    H: Send + 'static,
    V: Send + 'static,
{
    /// Creates a channel whose producer runs `producer` once the first hint is supplied.
    ///
    /// The channel's scope is a child of `parent`: cancelling `parent` cancels the producer
    /// and wakes any suspended call with [`ChannelError::Cancelled`].
    pub fn new<F, Fut>(parent: &CancellationToken, opts: ChannelOptions, producer: F) -> Self
    where
        F: FnOnce(ProducerScope<H, V>, H) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let launcher: Launcher<H, V> = Box::new(move |scope, hint| Box::pin(producer(scope, hint)));
        Self {
            shared: Arc::new(Shared {
                cell: Mutex::new(Cell {
                    state: ChannelState::JustInitialized,
                    launcher: Some(launcher),
                    started: false,
                }),
                scope: parent.child_token(),
                opts,
            }),
        }
    }

    /// Requests the next value, starting the producer on first use. Never blocks.
    pub fn expect_more(&self, hint: H) -> Result<()> {
        let shared = &self.shared;
        shared.transition("expect_more", |cell, state| match state {
            ChannelState::JustInitialized => {
                shared.resume(cell, ChannelState::ProducerReady { producer: None }, Some(hint))
            }
            ready @ ChannelState::ProducerReady { .. } => shared.resume(cell, ready, Some(hint)),
            ChannelState::Consumed { producer, latch } => {
                if latch.send(hint).is_err() {
                    tracing::debug!(
                        channel = %shared.opts.name,
                        "producer stopped waiting for a hint"
                    );
                }
                let ready = ChannelState::ProducerReady {
                    producer: Some(producer),
                };
                shared.resume(cell, ready, None)
            }
            st @ ChannelState::Finished { .. } => {
                let err = st.already_finished(None);
                (st, Err(err))
            }
            // One demand at a time: the previous value has not been taken yet.
            st @ (ChannelState::Producing { .. } | ChannelState::Consuming { .. }) => {
                let err = ChannelError::illegal("expect_more", &st);
                (st, Err(err))
            }
        })
    }

    /// Waits for the value requested by the last [`expect_more`](Self::expect_more).
    ///
    /// Returns `Ok(None)` when the producer ended without emitting, and
    /// [`ChannelError::ProducerFailure`] when it failed. Dropping the returned future before
    /// it completes leaves the channel as it was.
    pub async fn receive_or_null(&self) -> Result<Option<V>> {
        let step = self
            .shared
            .transition("receive_or_null", |_cell, state| match state {
                ChannelState::Producing {
                    producer,
                    value_tx,
                    value_rx: Some(rx),
                } => {
                    let st = ChannelState::Producing {
                        producer,
                        value_tx,
                        value_rx: None,
                    };
                    (st, Ok(Receive::Wait(rx)))
                }
                ChannelState::Consuming {
                    producer,
                    value_rx: Some(mut rx),
                    latch,
                } => match rx.try_recv() {
                    Ok(value) => (
                        ChannelState::Consumed { producer, latch },
                        Ok(Receive::Done(Some(value))),
                    ),
                    Err(_) => {
                        let st = ChannelState::Consuming {
                            producer,
                            value_rx: Some(rx),
                            latch,
                        };
                        let err = ChannelError::illegal("receive_or_null", &st);
                        (st, Err(err))
                    }
                },
                ChannelState::Finished {
                    previous,
                    exception,
                    owed: true,
                } => {
                    let out = outcome(exception.clone()).map(Receive::Done);
                    let st = ChannelState::Finished {
                        previous,
                        exception,
                        owed: false,
                    };
                    (st, out)
                }
                st @ ChannelState::Finished { .. } => {
                    let err = st.already_finished(None);
                    (st, Err(err))
                }
                st => {
                    let err = ChannelError::illegal("receive_or_null", &st);
                    (st, Err(err))
                }
            })?;

        let rx = match step {
            Receive::Done(value) => return Ok(value),
            Receive::Wait(rx) => rx,
        };

        let mut pending = PendingReceive {
            shared: &self.shared,
            rx: Some(rx),
        };
        let received = tokio::select! {
            biased;
            r = pending.recv() => r,
            _ = self.shared.scope.cancelled() => {
                let _ = self.shared.finish(Some(Failure::cancelled()), Side::Consumer);
                return Err(ChannelError::Cancelled);
            }
        };
        drop(pending);

        match received {
            Delivery::Value(value) => self
                .shared
                .transition("receive_or_null", |_cell, state| match state {
                    ChannelState::Consuming {
                        producer,
                        value_rx: None,
                        latch,
                    } => (ChannelState::Consumed { producer, latch }, Ok(Some(value))),
                    // Emitted before the channel finished: still delivered.
                    st @ ChannelState::Finished { .. } => (st, Ok(Some(value))),
                    st => {
                        let err = ChannelError::illegal("receive_or_null", &st);
                        (st, Err(err))
                    }
                }),
            Delivery::Closed => self
                .shared
                .transition("receive_or_null", |_cell, state| match state {
                    ChannelState::Finished {
                        previous,
                        exception,
                        ..
                    } => {
                        let out = outcome(exception.clone());
                        let st = ChannelState::Finished {
                            previous,
                            exception,
                            owed: false,
                        };
                        (st, out)
                    }
                    st => {
                        let err = ChannelError::illegal("receive_or_null", &st);
                        (st, Err(err))
                    }
                }),
        }
    }

    /// Ends the channel normally without delivering another hint.
    pub fn close(&self) -> Result<()> {
        self.shared.finish(None, Side::Consumer)
    }

    pub fn finish(&self) -> Result<()> {
        self.shared.finish(None, Side::Consumer)
    }

    pub fn finish_exceptionally(&self, cause: Failure) -> Result<()> {
        self.shared.finish(Some(cause), Side::Consumer)
    }
}

impl<H, V> OnDemandChannel<H, V> {
    /// Cancels the channel's scope (not the parent).
    pub fn cancel(&self) {
        self.shared.scope.cancel();
    }

    pub fn state(&self) -> StateKind {
        self.shared.lock().state.kind()
    }

    pub fn is_finished(&self) -> bool {
        self.state() == StateKind::Finished
    }

    /// Human-readable description of the current state.
    pub fn describe(&self) -> String {
        self.shared.lock().state.to_string()
    }
}

impl<H, V> Drop for OnDemandChannel<H, V> {
    fn drop(&mut self) {
        self.shared.scope.cancel();
    }
}

/// Producer side of an [`OnDemandChannel`], handed to the producer task.
pub struct ProducerScope<H, V> {
    shared: Arc<Shared<H, V>>,
}

impl<H, V> ProducerScope<H, V>
where
    H: Send + 'static,
    V: Send + 'static,
{
    /// Hands `value` to the consumer and waits for the next hint.
    ///
    /// If the channel finishes while waiting, resumes with the "already finished" error;
    /// callers can tell a normal close apart with [`ChannelError::is_finished_normally`].
    pub async fn emit(&mut self, value: V) -> Result<H> {
        let latch = self.shared.transition("emit", |_cell, state| match state {
            ChannelState::Producing {
                producer,
                value_tx: Some(tx),
                value_rx,
            } => {
                if tx.send(value).is_err() {
                    let st = ChannelState::Producing {
                        producer,
                        value_tx: None,
                        value_rx,
                    };
                    let err = ChannelError::illegal("emit", &st);
                    return (st, Err(err));
                }
                let (latch_tx, latch_rx) = oneshot::channel();
                let st = ChannelState::Consuming {
                    producer,
                    value_rx,
                    latch: latch_tx,
                };
                (st, Ok(latch_rx))
            }
            st @ ChannelState::Finished { .. } => {
                let err = st.already_finished(None);
                (st, Err(err))
            }
            st => {
                let err = ChannelError::illegal("emit", &st);
                (st, Err(err))
            }
        })?;

        tokio::select! {
            biased;
            hint = latch => match hint {
                Ok(hint) => Ok(hint),
                Err(_) => Err(self.shared.finished_error("emit")),
            },
            _ = self.shared.scope.cancelled() => Err(ChannelError::Cancelled),
        }
    }

    pub fn finish(&self) -> Result<()> {
        self.shared.finish(None, Side::Producer)
    }

    pub fn finish_exceptionally(&self, cause: Failure) -> Result<()> {
        self.shared.finish(Some(cause), Side::Producer)
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.scope.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn opts() -> ChannelOptions {
        ChannelOptions {
            name: "test".to_string(),
            verbose: true,
        }
    }

    /// Emits hint * 10 for every hint it is given.
    async fn multiply(mut scope: ProducerScope<u32, u32>, first: u32) -> anyhow::Result<()> {
        let mut hint = first;
        loop {
            hint = scope.emit(hint * 10).await?;
        }
    }

    fn multiplier(parent: &CancellationToken) -> OnDemandChannel<u32, u32> {
        OnDemandChannel::new(parent, opts(), multiply)
    }

    async fn explode(_scope: ProducerScope<(), u8>, _hint: ()) -> anyhow::Result<()> {
        panic!("strategy exploded");
    }

    async fn recv<H, V>(ch: &OnDemandChannel<H, V>) -> Result<Option<V>>
    where
        H: Send + 'static,
        V: Send + 'static,
    {
        tokio::time::timeout(WAIT, ch.receive_or_null())
            .await
            .expect("receive_or_null hung")
    }

    #[tokio::test]
    async fn alternating_rounds_deliver_each_value_once() {
        let parent = CancellationToken::new();
        let ch = multiplier(&parent);

        for i in 1..=5u32 {
            ch.expect_more(i).unwrap();
            assert_eq!(recv(&ch).await.unwrap(), Some(i * 10));
            assert_eq!(ch.state(), StateKind::Consumed);
        }

        ch.close().unwrap();
        assert!(ch.is_finished());
    }

    #[tokio::test]
    async fn producer_starts_lazily() {
        let parent = CancellationToken::new();
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let ch: OnDemandChannel<(), u8> =
            OnDemandChannel::new(&parent, opts(), move |mut scope, ()| async move {
                flag.store(true, Ordering::SeqCst);
                scope.emit(7).await?;
                Ok::<(), anyhow::Error>(())
            });

        tokio::task::yield_now().await;
        assert!(!started.load(Ordering::SeqCst));
        assert_eq!(ch.state(), StateKind::JustInitialized);

        ch.expect_more(()).unwrap();
        assert_eq!(recv(&ch).await.unwrap(), Some(7));
        assert!(started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn receive_twice_in_a_row_is_illegal() {
        let parent = CancellationToken::new();
        let ch = multiplier(&parent);
        ch.expect_more(1).unwrap();
        assert_eq!(recv(&ch).await.unwrap(), Some(10));

        let err = recv(&ch).await.unwrap_err();
        assert!(
            matches!(err, ChannelError::IllegalState { operation: "receive_or_null", .. }),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn receive_before_expect_more_is_illegal() {
        let parent = CancellationToken::new();
        let ch = multiplier(&parent);
        let err = recv(&ch).await.unwrap_err();
        assert!(matches!(err, ChannelError::IllegalState { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn expect_more_twice_in_a_row_is_illegal() {
        let parent = CancellationToken::new();
        let ch = multiplier(&parent);
        ch.expect_more(1).unwrap();

        let err = ch.expect_more(2).unwrap_err();
        assert!(
            matches!(err, ChannelError::IllegalState { operation: "expect_more", .. }),
            "{err:?}"
        );

        // The first demand is still served.
        assert_eq!(recv(&ch).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn producer_failure_before_emit_reaches_waiting_consumer() {
        let parent = CancellationToken::new();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let ch: OnDemandChannel<(), u8> =
            OnDemandChannel::new(&parent, opts(), move |_scope, ()| async move {
                let _ = gate_rx.await;
                Err::<(), anyhow::Error>(io::Error::new(io::ErrorKind::Other, "net down").into())
            });

        ch.expect_more(()).unwrap();
        let waiter = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = gate_tx.send(());
        };
        let (res, ()) = tokio::join!(recv(&ch), waiter);

        let cause = res.unwrap_err().unwrap_cause().unwrap();
        assert_eq!(cause.to_string(), "net down");
        assert!(cause.downcast_ref::<io::Error>().is_some());
        assert!(ch.is_finished());
    }

    #[tokio::test]
    async fn producer_failure_is_kept_for_a_late_consumer_exactly_once() {
        let parent = CancellationToken::new();
        let ch: OnDemandChannel<(), u8> =
            OnDemandChannel::new(&parent, opts(), |_scope, ()| async move {
                Err::<(), anyhow::Error>(anyhow::anyhow!("boom"))
            });

        ch.expect_more(()).unwrap();
        tokio::time::timeout(WAIT, async {
            while !ch.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let first = recv(&ch).await.unwrap_err();
        assert!(matches!(first, ChannelError::ProducerFailure(_)), "{first:?}");

        let second = recv(&ch).await.unwrap_err();
        match second {
            ChannelError::AlreadyFinished { message, suppressed, .. } => {
                assert!(message.contains("boom"), "{message}");
                assert!(suppressed.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn producer_ending_without_value_yields_none() {
        let parent = CancellationToken::new();
        let ch: OnDemandChannel<(), u8> =
            OnDemandChannel::new(&parent, opts(), |_scope, ()| async move {
                Ok::<(), anyhow::Error>(())
            });
        ch.expect_more(()).unwrap();
        assert_eq!(recv(&ch).await.unwrap(), None);
    }

    #[tokio::test]
    async fn producer_panic_is_reported_as_failure() {
        let parent = CancellationToken::new();
        let ch: OnDemandChannel<(), u8> = OnDemandChannel::new(&parent, opts(), explode);
        ch.expect_more(()).unwrap();
        let err = recv(&ch).await.unwrap_err();
        let cause = err.unwrap_cause().unwrap();
        assert!(cause.to_string().contains("panicked"), "{cause}");
    }

    #[tokio::test]
    async fn finish_exceptionally_rejects_every_later_operation() {
        let parent = CancellationToken::new();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let (report_tx, report_rx) = oneshot::channel::<Result<()>>();
        let ch: OnDemandChannel<(), u8> =
            OnDemandChannel::new(&parent, opts(), move |mut scope, ()| async move {
                let _ = gate_rx.await;
                let res = scope.emit(1).await.map(|_| ());
                let _ = report_tx.send(res);
                Ok::<(), anyhow::Error>(())
            });

        ch.expect_more(()).unwrap();
        ch.finish_exceptionally(Failure::msg("auth aborted")).unwrap();
        gate_tx.send(()).unwrap();

        let emitted = tokio::time::timeout(WAIT, report_rx).await.unwrap().unwrap();
        for err in [
            emitted.unwrap_err(),
            ch.expect_more(()).unwrap_err(),
            recv(&ch).await.unwrap_err(),
        ] {
            assert!(matches!(err, ChannelError::AlreadyFinished { .. }), "{err:?}");
            assert!(err.to_string().contains("auth aborted"), "{err}");
        }

        let again = ch.finish_exceptionally(Failure::msg("second")).unwrap_err();
        assert!(again.to_string().contains("attempting to finish with the cause second"));
    }

    #[tokio::test]
    async fn close_resumes_suspended_emit_with_failure() {
        let parent = CancellationToken::new();
        let (report_tx, report_rx) = oneshot::channel::<ChannelError>();
        let ch: OnDemandChannel<(), u8> =
            OnDemandChannel::new(&parent, opts(), move |mut scope, ()| async move {
                if let Err(e) = scope.emit(1).await {
                    let _ = report_tx.send(e);
                }
                Ok::<(), anyhow::Error>(())
            });

        ch.expect_more(()).unwrap();
        assert_eq!(recv(&ch).await.unwrap(), Some(1));
        ch.close().unwrap();

        let err = tokio::time::timeout(WAIT, report_rx).await.unwrap().unwrap();
        assert!(err.is_finished_normally(), "{err:?}");
        assert!(recv(&ch).await.unwrap_err().is_finished_normally());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelling_parent_wakes_pending_receive() {
        let parent = CancellationToken::new();
        let ch: OnDemandChannel<(), u8> =
            OnDemandChannel::new(&parent, opts(), |_scope, ()| async move {
                std::future::pending::<()>().await;
                Ok::<(), anyhow::Error>(())
            });
        ch.expect_more(()).unwrap();

        let cancel = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = recv(&ch).await.unwrap_err();
        assert!(matches!(err, ChannelError::Cancelled), "{err:?}");
        assert!(ch.is_finished());

        let late = ch.expect_more(()).unwrap_err();
        assert!(late.is_cancelled(), "{late:?}");
    }

    #[tokio::test]
    async fn abandoned_receive_leaves_channel_usable() {
        let parent = CancellationToken::new();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let ch: OnDemandChannel<(), u8> =
            OnDemandChannel::new(&parent, opts(), move |mut scope, ()| async move {
                let _ = gate_rx.await;
                scope.emit(42).await?;
                Ok::<(), anyhow::Error>(())
            });
        ch.expect_more(()).unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(10), ch.receive_or_null()).await;
        assert!(timed_out.is_err());
        assert_eq!(ch.state(), StateKind::Producing);

        gate_tx.send(()).unwrap();
        assert_eq!(recv(&ch).await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn dropping_the_channel_cancels_the_producer() {
        let parent = CancellationToken::new();
        let (report_tx, report_rx) = oneshot::channel::<ChannelError>();
        let ch: OnDemandChannel<(), u8> =
            OnDemandChannel::new(&parent, opts(), move |mut scope, ()| async move {
                scope.emit(1).await?;
                // Second round is never requested.
                if let Err(e) = scope.emit(2).await {
                    let _ = report_tx.send(e);
                }
                Ok::<(), anyhow::Error>(())
            });
        ch.expect_more(()).unwrap();
        assert_eq!(recv(&ch).await.unwrap(), Some(1));
        ch.expect_more(()).unwrap();
        drop(ch);

        // Either the emit observed the cancellation or the task was aborted first.
        match tokio::time::timeout(WAIT, report_rx).await.unwrap() {
            Ok(err) => assert!(
                err.is_cancelled() || matches!(err, ChannelError::AlreadyFinished { .. }),
                "{err:?}"
            ),
            Err(_closed) => {}
        }
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_before_start_never_launches_producer() {
        let parent = CancellationToken::new();
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let ch: OnDemandChannel<(), u8> =
            OnDemandChannel::new(&parent, opts(), move |_scope, ()| async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            });

        parent.cancel();
        assert_eq!(ch.state(), StateKind::Finished);

        let err = ch.expect_more(()).unwrap_err();
        assert!(
            matches!(
                err,
                ChannelError::AlreadyFinished { previous: StateKind::JustInitialized, .. }
            ),
            "{err:?}"
        );
        assert!(err.is_cancelled());
        assert!(recv(&ch).await.unwrap_err().is_cancelled());

        tokio::task::yield_now().await;
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_between_rounds_rejects_next_demand() {
        let parent = CancellationToken::new();
        let ch = multiplier(&parent);
        ch.expect_more(1).unwrap();
        assert_eq!(recv(&ch).await.unwrap(), Some(10));

        parent.cancel();
        let err = ch.expect_more(2).unwrap_err();
        assert!(
            matches!(err, ChannelError::AlreadyFinished { previous: StateKind::Consumed, .. }),
            "{err:?}"
        );
        assert!(err.is_cancelled());
        assert_eq!(ch.state(), StateKind::Finished);
        assert!(recv(&ch).await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn producer_can_finish_the_channel_itself() {
        let parent = CancellationToken::new();
        let ch: OnDemandChannel<(), u8> =
            OnDemandChannel::new(&parent, opts(), |scope, ()| async move {
                scope.finish()?;
                Ok::<(), anyhow::Error>(())
            });

        ch.expect_more(()).unwrap();
        assert_eq!(recv(&ch).await.unwrap(), None);
        assert!(recv(&ch).await.unwrap_err().is_finished_normally());
    }

    #[tokio::test]
    async fn producer_can_fail_the_channel_with_its_own_cause() {
        let parent = CancellationToken::new();
        let ch: OnDemandChannel<(), u8> =
            OnDemandChannel::new(&parent, opts(), |scope, ()| async move {
                scope.finish_exceptionally(Failure::msg("gave up"))?;
                Ok::<(), anyhow::Error>(())
            });

        ch.expect_more(()).unwrap();
        let cause = recv(&ch).await.unwrap_err().unwrap_cause().unwrap();
        assert_eq!(cause.to_string(), "gave up");

        let again = recv(&ch).await.unwrap_err();
        assert!(matches!(again, ChannelError::AlreadyFinished { .. }), "{again:?}");
        assert!(again.to_string().contains("gave up"), "{again}");
    }

    /// Yields to the scheduler, then echoes every hint back.
    async fn echo(mut scope: ProducerScope<u32, u32>, first: u32) -> anyhow::Result<()> {
        let mut hint = first;
        loop {
            tokio::task::yield_now().await;
            hint = scope.emit(hint).await?;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rounds_stay_in_order_across_threads() {
        const ROUNDS: u32 = 500;
        let parent = CancellationToken::new();
        let ch = Arc::new(OnDemandChannel::new(&parent, opts(), echo));

        let consumer = {
            let ch = Arc::clone(&ch);
            tokio::spawn(async move {
                let mut seen = Vec::with_capacity(ROUNDS as usize);
                for i in 1..=ROUNDS {
                    ch.expect_more(i)?;
                    seen.push(ch.receive_or_null().await?);
                }
                Ok::<_, ChannelError>(seen)
            })
        };

        let seen = tokio::time::timeout(Duration::from_secs(30), consumer)
            .await
            .expect("rounds hung")
            .unwrap()
            .unwrap();
        let expected: Vec<Option<u32>> = (1..=ROUNDS).map(Some).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_expect_more_admits_exactly_one_demand() {
        let parent = CancellationToken::new();
        let ch = Arc::new(multiplier(&parent));

        for round in 1..=50u32 {
            let racers: Vec<_> = (0..8)
                .map(|_| {
                    let ch = Arc::clone(&ch);
                    tokio::spawn(async move { ch.expect_more(round).is_ok() })
                })
                .collect();

            let mut admitted = 0;
            for racer in racers {
                if racer.await.unwrap() {
                    admitted += 1;
                }
            }
            assert_eq!(admitted, 1, "round {round}");
            assert_eq!(recv(&*ch).await.unwrap(), Some(round * 10));
        }
    }
}
