//! Result Channel
//!
//! Two interchangeable ways of obtaining an inference result:
//! - [`push::SsePushChannel`]: a live `text/event-stream` subscription
//! - [`pull::Poller`]: fixed-interval polling of the results endpoint
//!
//! Neither mechanism decides whether a payload belongs to the pending request.
//! They hand payloads to an acceptance check and act on its [`Acceptance`].

pub mod pull;
pub mod push;

use crate::error::ClientResult;
use async_trait::async_trait;
use hiomi_common::{InferenceResult, PendingRequest};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use pull::{HttpResultFetcher, PollOutcome, PollSettings, Poller};
pub use push::SsePushChannel;

/// What the acceptance check made of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Payload resolved the pending request
    Accepted,
    /// Payload belongs to some other request; keep listening
    Ignored,
    /// The request this channel serves is no longer pending; stop
    Stale,
}

/// Signal delivered by a push subscription
#[derive(Debug)]
pub enum ChannelSignal {
    /// A well-formed result event (not yet matched)
    Result(InferenceResult),
    /// Event carried a payload that did not parse
    Malformed(String),
    /// Transport failed; the subscription is finished
    Error(crate::ClientError),
}

/// Handle to an open push subscription
///
/// Closing is idempotent and also happens on drop, so every exit path
/// releases the connection.
#[derive(Debug)]
pub struct Subscription {
    token: CancellationToken,
    closed: AtomicBool,
    label: &'static str,
}

impl Subscription {
    pub fn new(token: CancellationToken, label: &'static str) -> Self {
        Self {
            token,
            closed: AtomicBool::new(false),
            label,
        }
    }

    /// Close the subscription
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        tracing::debug!(channel = self.label, "Subscription closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.token.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Push delivery mechanism
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Open a subscription
    ///
    /// Signals go to `signals` until `cancel` fires or the transport fails.
    /// An error here means the channel could not be opened at all.
    async fn subscribe(
        &self,
        signals: mpsc::Sender<ChannelSignal>,
        cancel: CancellationToken,
    ) -> ClientResult<Subscription>;
}

/// Single fetch of the pull mechanism
#[async_trait]
pub trait ResultFetcher: Send + Sync {
    /// `Ok(None)` when the result has not been produced yet
    async fn fetch(&self, pending: &PendingRequest) -> ClientResult<Option<InferenceResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_is_idempotent() {
        let token = CancellationToken::new();
        let subscription = Subscription::new(token.clone(), "test");

        assert!(!subscription.is_closed());
        assert!(subscription.close());
        assert!(!subscription.close());
        assert!(subscription.is_closed());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_drop_closes() {
        let token = CancellationToken::new();
        drop(Subscription::new(token.clone(), "test"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_parent_cancel_counts_as_closed() {
        let parent = CancellationToken::new();
        let subscription = Subscription::new(parent.child_token(), "test");
        parent.cancel();
        assert!(subscription.is_closed());
        // Still safe to close explicitly afterwards
        subscription.close();
    }
}
