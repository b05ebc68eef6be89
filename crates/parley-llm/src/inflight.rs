use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use parley_core::ids::RequestId;
use parley_core::stream::{ResponseEvent, ResponseStream};

/// Cancel handles for requests whose stream is still open, keyed by id.
#[derive(Clone, Default)]
pub(crate) struct InFlight(Arc<DashMap<RequestId, CancellationToken>>);

impl InFlight {
    /// Track `id` until the returned guard is dropped.
    pub(crate) fn register(&self, id: &RequestId) -> (InFlightGuard, CancellationToken) {
        let token = CancellationToken::new();
        self.0.insert(id.clone(), token.clone());
        let guard = InFlightGuard {
            map: self.clone(),
            id: id.clone(),
        };
        (guard, token)
    }

    /// Cancel and forget `id`. Returns false if it was not in flight.
    pub(crate) fn cancel(&self, id: &RequestId) -> bool {
        match self.0.remove(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

/// Removes the in-flight entry once the request's stream is gone.
pub(crate) struct InFlightGuard {
    map: InFlight,
    id: RequestId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.0.remove(&self.id);
    }
}

/// Stream wrapper that releases its in-flight entry as soon as the inner
/// stream ends, or when dropped early.
struct Tracked {
    inner: ResponseStream,
    guard: Option<InFlightGuard>,
}

impl Stream for Tracked {
    type Item = ResponseEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.guard.take();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

pub(crate) fn track(inner: ResponseStream, guard: InFlightGuard) -> ResponseStream {
    Box::pin(Tracked {
        inner,
        guard: Some(guard),
    })
}
