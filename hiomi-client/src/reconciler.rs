//! Result Reconciler
//!
//! Owns the single pending request and the delivery task serving it.
//!
//! ```text
//! Idle ──start_waiting──▶ Analyzing ──matching payload──▶ Resolved
//!   ▲                        │  │
//!   └───────cancel───────────┘  └──polling exhausted──▶ Failed
//! ```
//!
//! Guarantees:
//! - A payload resolves the request only if both user id and filename match.
//! - The pending request is a consumed-once token: whichever delivery
//!   mechanism takes it first produces the one transition, later arrivals see
//!   [`Acceptance::Stale`].
//! - Replacing a request is release-then-acquire. The previous delivery task
//!   is cancelled and joined before the next channel opens.
//! - A [`Reservation`] taken before an upload only turns into a pending
//!   request if nothing cancelled or replaced it while the upload ran.
//! - Push delivery is bounded by the same budget as polling
//!   (`interval * max_attempts`) and fails with a timeout when it runs out.
//! - Every exit path (acceptance, cancel, exhaustion, drop) cancels the
//!   delivery token, which closes the push subscription and stops the poller.

use crate::channel::{Acceptance, ChannelSignal, PollOutcome, PollSettings, Poller, PushChannel, ResultFetcher};
use crate::error::ClientError;
use crate::summary::AnalysisSummary;
use hiomi_common::{InferenceResult, PendingRequest};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Buffered push signals between the stream reader and the reconciler
const SIGNAL_BUFFER: usize = 16;

/// Which mechanism is currently serving the pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Push,
    Pull,
}

/// UI-visible state derived from the pending request and its result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DisplayState {
    Idle,
    Analyzing {
        pending: PendingRequest,
        via: DeliveryMode,
    },
    Resolved {
        pending: PendingRequest,
        result: InferenceResult,
        summary: AnalysisSummary,
    },
    Failed {
        pending: PendingRequest,
        message: String,
    },
}

impl DisplayState {
    pub fn is_analyzing(&self) -> bool {
        matches!(self, DisplayState::Analyzing { .. })
    }

    /// Resolved or Failed
    pub fn is_outcome(&self) -> bool {
        matches!(self, DisplayState::Resolved { .. } | DisplayState::Failed { .. })
    }

    pub fn result(&self) -> Option<&InferenceResult> {
        match self {
            DisplayState::Resolved { result, .. } => Some(result),
            _ => None,
        }
    }
}

struct Delivery {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Delivery {
    /// Cancel and wait for the task to release its channel
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!("Result delivery task panicked: {}", e);
            }
        }
    }
}

struct Inner {
    generation: u64,
    pending: Option<PendingRequest>,
    delivery: Option<Delivery>,
}

struct Shared {
    inner: Mutex<Inner>,
    state: watch::Sender<DisplayState>,
}

impl Shared {
    /// The acceptance check
    async fn offer(&self, generation: u64, result: InferenceResult) -> Acceptance {
        let mut inner = self.inner.lock().await;

        let pending = match inner.pending.as_ref() {
            Some(pending) if inner.generation == generation => pending,
            _ => return Acceptance::Stale,
        };

        if !pending.matches(&result) {
            debug!(
                %pending,
                user_id = %result.user_id,
                filename = %result.filename,
                "Ignoring result for another request"
            );
            return Acceptance::Ignored;
        }

        let Some(pending) = inner.pending.take() else {
            return Acceptance::Stale;
        };

        if let Err(e) = result.validate() {
            warn!(%pending, error = %e, "Accepting result that fails consistency check");
        }

        // Release the channel in the same critical section as the transition.
        // The handle stays so a later start_waiting still joins the task.
        if let Some(delivery) = inner.delivery.as_ref() {
            delivery.cancel.cancel();
        }

        info!(%pending, prediction = %result.prediction, confidence = result.confidence, "Result resolved");

        let summary = AnalysisSummary::from_result(&result);
        self.state.send_replace(DisplayState::Resolved {
            pending,
            result,
            summary,
        });

        Acceptance::Accepted
    }

    async fn fail(&self, generation: u64, err: ClientError) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        let Some(pending) = inner.pending.take() else {
            return;
        };
        if let Some(delivery) = inner.delivery.as_ref() {
            delivery.cancel.cancel();
        }

        error!(%pending, error = %err, "Result delivery failed");
        self.state.send_replace(DisplayState::Failed {
            pending,
            message: err.user_message(),
        });
    }

    async fn switch_to_pull(&self, generation: u64) {
        let inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        if let Some(pending) = inner.pending.clone() {
            self.state.send_replace(DisplayState::Analyzing {
                pending,
                via: DeliveryMode::Pull,
            });
        }
    }
}

/// Claim on the next pending request, see [`Reconciler::begin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    generation: u64,
}

/// Result Reconciler
///
/// Construct one per consumer (page, session) and share it by reference.
pub struct Reconciler {
    shared: Arc<Shared>,
    /// Serializes start/cancel so replacement is release-then-acquire
    ops: Mutex<()>,
    push: Option<Arc<dyn PushChannel>>,
    fetcher: Arc<dyn ResultFetcher>,
    poll: PollSettings,
    root: CancellationToken,
}

impl Reconciler {
    /// `push: None` bypasses the push channel and polls straight away
    pub fn new(
        push: Option<Arc<dyn PushChannel>>,
        fetcher: Arc<dyn ResultFetcher>,
        poll: PollSettings,
    ) -> Self {
        let (state, _) = watch::channel(DisplayState::Idle);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    generation: 0,
                    pending: None,
                    delivery: None,
                }),
                state,
            }),
            ops: Mutex::new(()),
            push,
            fetcher,
            poll,
            root: CancellationToken::new(),
        }
    }

    /// Start waiting for the result of `pending`
    ///
    /// Any request already pending is cancelled and its channel released
    /// before the new channel opens.
    pub async fn start_waiting(&self, pending: PendingRequest) {
        let _op = self.ops.lock().await;

        if let Some(old) = self.release().await {
            info!(%old, "Replacing pending request");
        }

        let mut inner = self.shared.inner.lock().await;
        self.spawn_delivery(&mut inner, pending);
    }

    /// Reserve the next request before its upload starts
    ///
    /// Releases whatever is pending and returns to Idle. The reservation is
    /// invalidated by any later `begin`, `start_waiting` or `cancel`.
    pub async fn begin(&self) -> Reservation {
        let _op = self.ops.lock().await;

        if let Some(old) = self.release().await {
            info!(%old, "Pending request superseded by a new upload");
        }
        self.set_idle();

        Reservation {
            generation: self.shared.inner.lock().await.generation,
        }
    }

    /// Start waiting for `pending` if `reservation` is still current
    ///
    /// Returns `false`, leaving the state untouched, when the reservation was
    /// cancelled, superseded or already used.
    pub async fn start_waiting_if(&self, reservation: Reservation, pending: PendingRequest) -> bool {
        let _op = self.ops.lock().await;

        let mut inner = self.shared.inner.lock().await;
        if inner.generation != reservation.generation || inner.pending.is_some() || inner.delivery.is_some() {
            info!(%pending, "Reservation no longer current, not waiting");
            return false;
        }

        self.spawn_delivery(&mut inner, pending);
        true
    }

    /// Cancel the pending request, if any, and return to Idle
    ///
    /// Returns `true` when a pending request was cancelled. Calling it again
    /// does nothing.
    pub async fn cancel(&self) -> bool {
        let _op = self.ops.lock().await;

        let cancelled = self.release().await;
        self.set_idle();

        match cancelled {
            Some(pending) => {
                info!(%pending, "Pending request cancelled");
                true
            }
            None => false,
        }
    }

    /// Invalidate the current generation and join its delivery task
    ///
    /// Caller holds `ops`.
    async fn release(&self) -> Option<PendingRequest> {
        let (previous, delivery) = {
            let mut inner = self.shared.inner.lock().await;
            inner.generation += 1;
            (inner.pending.take(), inner.delivery.take())
        };

        if let Some(delivery) = delivery {
            delivery.shutdown().await;
        }
        previous
    }

    fn set_idle(&self) {
        self.shared.state.send_if_modified(|state| {
            if *state == DisplayState::Idle {
                false
            } else {
                *state = DisplayState::Idle;
                true
            }
        });
    }

    fn spawn_delivery(&self, inner: &mut Inner, pending: PendingRequest) {
        let generation = inner.generation;
        let cancel = self.root.child_token();
        let via = if self.push.is_some() {
            DeliveryMode::Push
        } else {
            DeliveryMode::Pull
        };

        let task = tokio::spawn(run_delivery(DeliveryContext {
            shared: self.shared.clone(),
            generation,
            pending: pending.clone(),
            push: self.push.clone(),
            fetcher: self.fetcher.clone(),
            poll: self.poll,
            cancel: cancel.clone(),
        }));

        info!(%pending, ?via, "Waiting for result");
        inner.pending = Some(pending.clone());
        inner.delivery = Some(Delivery { cancel, task });
        self.shared
            .state
            .send_replace(DisplayState::Analyzing { pending, via });
    }

    /// Offer a payload obtained outside the reconciler's own channels
    pub async fn deliver(&self, result: InferenceResult) -> Acceptance {
        let generation = self.shared.inner.lock().await.generation;
        self.shared.offer(generation, result).await
    }

    pub async fn pending(&self) -> Option<PendingRequest> {
        self.shared.inner.lock().await.pending.clone()
    }

    /// Current display state
    pub fn state(&self) -> DisplayState {
        self.shared.state.borrow().clone()
    }

    /// Watch display state changes
    pub fn subscribe(&self) -> watch::Receiver<DisplayState> {
        self.shared.state.subscribe()
    }

    /// Wait until the current request is Resolved or Failed
    ///
    /// Returns Idle if the request is cancelled first.
    pub async fn wait_for_outcome(&self) -> DisplayState {
        let mut rx = self.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            if state.is_outcome() || state == DisplayState::Idle {
                return state;
            }
            if rx.changed().await.is_err() {
                return state;
            }
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        // Teardown: every delivery token is a child of root
        self.root.cancel();
    }
}

struct DeliveryContext {
    shared: Arc<Shared>,
    generation: u64,
    pending: PendingRequest,
    push: Option<Arc<dyn PushChannel>>,
    fetcher: Arc<dyn ResultFetcher>,
    poll: PollSettings,
    cancel: CancellationToken,
}

enum PushOutcome {
    Finished,
    Fallback(ClientError),
    Expired,
}

async fn run_delivery(ctx: DeliveryContext) {
    if let Some(push) = ctx.push.clone() {
        match deliver_push(&ctx, push.as_ref()).await {
            PushOutcome::Finished => return,
            PushOutcome::Expired => {
                let attempts = ctx.poll.max_attempts;
                ctx.shared.fail(ctx.generation, ClientError::Timeout { attempts }).await;
                return;
            }
            PushOutcome::Fallback(reason) => {
                warn!(pending = %ctx.pending, error = %reason, "Push channel failed, falling back to polling");
            }
        }
        if ctx.cancel.is_cancelled() {
            return;
        }
        ctx.shared.switch_to_pull(ctx.generation).await;
    }

    deliver_pull(&ctx).await;
}

async fn deliver_push(ctx: &DeliveryContext, push: &dyn PushChannel) -> PushOutcome {
    let (tx, mut rx) = mpsc::channel(SIGNAL_BUFFER);
    let budget = ctx
        .poll
        .interval
        .checked_mul(ctx.poll.max_attempts)
        .unwrap_or(Duration::MAX);
    let deadline = tokio::time::sleep(budget);
    tokio::pin!(deadline);

    let subscription = tokio::select! {
        _ = ctx.cancel.cancelled() => return PushOutcome::Finished,
        _ = &mut deadline => return PushOutcome::Expired,
        opened = push.subscribe(tx, ctx.cancel.child_token()) => match opened {
            Ok(subscription) => subscription,
            Err(e) => return PushOutcome::Fallback(e),
        },
    };

    // A result published before the subscription opened is never pushed
    let fetched = tokio::select! {
        _ = ctx.cancel.cancelled() => return PushOutcome::Finished,
        fetched = ctx.fetcher.fetch(&ctx.pending) => fetched,
    };
    match fetched {
        Ok(Some(result)) => match ctx.shared.offer(ctx.generation, result).await {
            Acceptance::Accepted | Acceptance::Stale => return PushOutcome::Finished,
            Acceptance::Ignored => {}
        },
        Ok(None) => {}
        Err(e) => debug!(pending = %ctx.pending, error = %e, "Catch-up fetch failed"),
    }

    loop {
        let signal = tokio::select! {
            _ = ctx.cancel.cancelled() => return PushOutcome::Finished,
            _ = &mut deadline => {
                subscription.close();
                warn!(pending = %ctx.pending, ?budget, "No pushed result in time");
                return PushOutcome::Expired;
            }
            signal = rx.recv() => signal,
        };

        match signal {
            Some(ChannelSignal::Result(result)) => {
                match ctx.shared.offer(ctx.generation, result).await {
                    Acceptance::Accepted | Acceptance::Stale => return PushOutcome::Finished,
                    Acceptance::Ignored => {}
                }
            }
            Some(ChannelSignal::Malformed(detail)) => {
                warn!(pending = %ctx.pending, detail = %detail, "Dropping malformed result event");
            }
            Some(ChannelSignal::Error(e)) => {
                subscription.close();
                return PushOutcome::Fallback(e);
            }
            None => {
                subscription.close();
                return PushOutcome::Fallback(ClientError::ChannelClosed);
            }
        }
    }
}

async fn deliver_pull(ctx: &DeliveryContext) {
    let poller = Poller::new(ctx.fetcher.clone(), ctx.poll);
    let shared = ctx.shared.clone();
    let generation = ctx.generation;

    let outcome = poller
        .run(&ctx.pending, &ctx.cancel, |result| {
            let shared = shared.clone();
            async move { shared.offer(generation, result).await }
        })
        .await;

    match outcome {
        Ok(PollOutcome::Accepted { attempt }) => {
            debug!(pending = %ctx.pending, attempt, "Pull delivery finished");
        }
        Ok(PollOutcome::Stopped) => {
            debug!(pending = %ctx.pending, "Pull delivery stopped");
        }
        Err(e) => ctx.shared.fail(generation, e).await,
    }
}
