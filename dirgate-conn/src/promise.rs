//! Single-assignment promises for operation outcomes.
//!
//! [`pending`] creates the two halves: a [`ResultPromise`] that the submitter awaits, and a
//! [`PromiseResolver`] that lives in the connection's pending table.  The resolver accepts
//! exactly one terminal value; every later attempt is a no-op.  That property is what lets a
//! worker delivering a real result race safely against a disconnect cancelling everything.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use pin_project::pin_project;
use tokio::sync::{mpsc, oneshot};

use crate::types::{MessageId, OperationKind, OperationResult, SearchItem};
use crate::{DirError, Result};

/// Create the promise/resolver pair for a new operation.
///
/// Searches also get a [`SearchResultStream`], available from
/// [`ResultPromise::take_search_results`].
pub(crate) fn pending(message_id: MessageId, kind: OperationKind) -> (ResultPromise, PromiseResolver) {
    let (tx, rx) = oneshot::channel();
    let resolved = Arc::new(AtomicBool::new(false));

    let (items_tx, search_results) = if kind == OperationKind::Search {
        let (items_tx, items_rx) = mpsc::unbounded_channel();
        (Some(items_tx), Some(SearchResultStream { receiver: items_rx }))
    } else {
        (None, None)
    };

    let promise = ResultPromise {
        message_id,
        kind,
        receiver: rx,
        resolved: resolved.clone(),
        search_results,
    };

    let resolver = PromiseResolver {
        message_id,
        resolved,
        inner: Mutex::new(Some(ResolverInner {
            result_tx: tx,
            items_tx,
        })),
    };

    (promise, resolver)
}

struct ResolverInner {
    result_tx: oneshot::Sender<Result<OperationResult>>,
    items_tx: Option<mpsc::UnboundedSender<SearchItem>>,
}

/// The write side of a [`ResultPromise`].
///
/// Owned by the operation's pending record.
pub(crate) struct PromiseResolver {
    message_id: MessageId,
    resolved: Arc<AtomicBool>,
    inner: Mutex<Option<ResolverInner>>,
}

impl PromiseResolver {
    /// Deliver the terminal outcome.
    ///
    /// First write wins.  Returns `false` if the promise was already resolved, in which case
    /// `outcome` is discarded.  Resolution also closes the search result stream, if there is one,
    /// so the stream ends after the last item pushed before resolution.
    pub(crate) fn resolve(&self, outcome: Result<OperationResult>) -> bool {
        let Some(inner) = self.inner.lock().take() else {
            tracing::trace!(message_id = %self.message_id,
                outcome = ?outcome,
                "Ignoring redundant resolution of an already-resolved promise");
            return false;
        };

        self.resolved.store(true, Ordering::Release);

        // The receiver may well have been dropped if the caller lost interest.  That's fine, the
        // operation is still resolved as far as the lifecycle is concerned.
        if inner.result_tx.send(outcome).is_err() {
            tracing::trace!(message_id = %self.message_id,
                "Promise was dropped before its outcome was delivered");
        }

        true
    }

    /// Push an intermediate search item.  Returns `false` if the item was dropped because the
    /// promise is already resolved, this isn't a search, or the consumer has gone away.
    pub(crate) fn push(&self, item: SearchItem) -> bool {
        let inner = self.inner.lock();
        match inner.as_ref().and_then(|inner| inner.items_tx.as_ref()) {
            Some(items_tx) => items_tx.send(item).is_ok(),
            None => false,
        }
    }
}

/// The eventual outcome of a submitted operation.
///
/// Await it to get the result.  It resolves exactly once, to one of:
///
/// - `Ok(result)`: the backend completed the operation (possibly with a non-success code)
/// - `Err(DirError::OperationCancelled { .. })`: the operation was swept by an abandon, bind,
///   unbind, or disconnect
/// - `Err(_)`: any other error, either from the backend or from admission/submission
#[pin_project]
pub struct ResultPromise {
    message_id: MessageId,
    kind: OperationKind,
    #[pin]
    receiver: oneshot::Receiver<Result<OperationResult>>,
    resolved: Arc<AtomicBool>,
    search_results: Option<SearchResultStream>,
}

impl ResultPromise {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Whether a terminal outcome has been delivered.  Doesn't consume anything.
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Take the stream of intermediate search results.
    ///
    /// Only searches have one, and it can only be taken once.  The stream ends when the search
    /// resolves, so consume it before (or concurrently with) awaiting the promise.
    pub fn take_search_results(&mut self) -> Option<SearchResultStream> {
        self.search_results.take()
    }

    /// Block the current thread until the promise resolves.
    ///
    /// For callers that aren't async.  Like [`oneshot::Receiver::blocking_recv`], this panics if
    /// called from within an async execution context.
    pub fn blocking_wait(self) -> Result<OperationResult> {
        let message_id = self.message_id;
        self.receiver
            .blocking_recv()
            .unwrap_or_else(|_| Err(Self::resolver_dropped(message_id)))
    }

    fn resolver_dropped(message_id: MessageId) -> DirError {
        // Every path that removes a record from the pending table resolves it, so this means a
        // record was leaked somewhere
        tracing::error!(%message_id,
            "BUG: Promise resolver was dropped without resolving the promise");
        DirError::Bug {
            message: format!("operation {message_id} was dropped without a result"),
        }
    }
}

impl Future for ResultPromise {
    type Output = Result<OperationResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match futures::ready!(this.receiver.poll(cx)) {
            Ok(outcome) => Poll::Ready(outcome),
            Err(_) => Poll::Ready(Err(Self::resolver_dropped(*this.message_id))),
        }
    }
}

/// Intermediate entries and references produced by a search, in the order the backend sent them.
pub struct SearchResultStream {
    receiver: mpsc::UnboundedReceiver<SearchItem>,
}

impl SearchResultStream {
    /// The next item, or `None` once the search has resolved and every item has been consumed
    pub async fn next_item(&mut self) -> Option<SearchItem> {
        self.receiver.recv().await
    }

    /// Items already received, without waiting for more
    pub fn drain_ready(&mut self) -> Vec<SearchItem> {
        std::iter::from_fn(|| self.receiver.try_recv().ok()).collect()
    }
}

impl futures::Stream for SearchResultStream {
    type Item = SearchItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::CancelReason;
    use crate::types::{Dn, ResultCode, SearchEntry};
    use assert_matches::assert_matches;
    use futures::{FutureExt, StreamExt};

    fn entry(dn: &str) -> SearchItem {
        SearchItem::Entry(SearchEntry {
            dn: Dn::new(dn),
            attributes: vec![],
        })
    }

    #[tokio::test]
    async fn first_resolution_wins() {
        let (promise, resolver) = pending(MessageId(1), OperationKind::Modify);
        assert!(!promise.is_resolved());

        assert!(resolver.resolve(Ok(OperationResult::success())));
        assert!(!resolver.resolve(Err(CancelReason::Abandon.into())));
        assert!(!resolver.resolve(Ok(OperationResult::new(ResultCode::Other))));

        assert!(promise.is_resolved());
        assert_eq!(promise.await.unwrap().code, ResultCode::Success);
    }

    #[tokio::test]
    async fn unresolved_promise_is_pending() {
        let (mut promise, resolver) = pending(MessageId(1), OperationKind::Delete);

        assert!((&mut promise).now_or_never().is_none());

        resolver.resolve(Err(CancelReason::Unbind.into()));
        assert_matches!(
            promise.await,
            Err(DirError::OperationCancelled {
                reason: CancelReason::Unbind
            })
        );
    }

    #[tokio::test]
    async fn dropped_resolver_is_reported_as_bug() {
        let (promise, resolver) = pending(MessageId(3), OperationKind::Add);
        drop(resolver);

        let error = promise.await.unwrap_err();
        assert_matches!(&error, DirError::Bug { message } if message.contains("operation 3"));
        assert_eq!(error.result_code(), ResultCode::OperationsError);
    }

    #[tokio::test]
    async fn search_stream_ends_at_resolution() {
        let (mut promise, resolver) = pending(MessageId(2), OperationKind::Search);
        let mut items = promise.take_search_results().unwrap();
        assert!(promise.take_search_results().is_none());

        assert!(resolver.push(entry("cn=a")));
        assert!(resolver.push(entry("cn=b")));
        resolver.resolve(Ok(OperationResult::success()));

        // Pushes after the terminal resolution go nowhere
        assert!(!resolver.push(entry("cn=c")));

        let received: Vec<_> = (&mut items).collect().await;
        assert_eq!(received, vec![entry("cn=a"), entry("cn=b")]);
        assert!(promise.await.is_ok());
    }

    #[test]
    fn drain_ready_does_not_wait() {
        let (mut promise, resolver) = pending(MessageId(5), OperationKind::Search);
        let mut items = promise.take_search_results().unwrap();

        assert!(items.drain_ready().is_empty());
        resolver.push(entry("cn=a"));
        assert_eq!(items.drain_ready(), vec![entry("cn=a")]);
        assert!(items.drain_ready().is_empty());
    }

    #[test]
    fn non_search_has_no_stream() {
        let (mut promise, resolver) = pending(MessageId(4), OperationKind::Compare);
        assert!(promise.take_search_results().is_none());
        assert!(!resolver.push(entry("cn=a")));
    }

    /// Many threads race to resolve the same promise; exactly one wins and the value observed is
    /// the winner's
    #[test]
    fn concurrent_resolution_has_one_winner() {
        for _ in 0..50 {
            let (promise, resolver) = pending(MessageId(1), OperationKind::Modify);
            let resolver = Arc::new(resolver);

            let writers: Vec<_> = (0..8)
                .map(|i| {
                    let resolver = resolver.clone();
                    std::thread::spawn(move || {
                        let outcome = if i % 2 == 0 {
                            Ok(OperationResult::success().with_message(format!("writer {i}")))
                        } else {
                            Err(DirError::from(CancelReason::Abandon))
                        };
                        resolver.resolve(outcome).then_some(i)
                    })
                })
                .collect();

            let winners: Vec<_> = writers
                .into_iter()
                .filter_map(|handle| handle.join().unwrap())
                .collect();

            assert_eq!(winners.len(), 1);
            let winner = winners[0];

            match promise.blocking_wait() {
                Ok(result) => {
                    assert_eq!(winner % 2, 0);
                    assert_eq!(result.diagnostic_message, Some(format!("writer {winner}")));
                }
                Err(e) => {
                    assert_eq!(winner % 2, 1);
                    assert_matches!(e, DirError::OperationCancelled { .. });
                }
            }
        }
    }
}
