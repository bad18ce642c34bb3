//! Awaitable placeholders for asynchronously loaded relationships.

use crate::error::{Result, StoreError};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::IntoFuture;
use std::sync::Arc;

/// Settlement state of a [`PromiseProxy`].
#[derive(Clone, Debug)]
pub enum PromiseState<T> {
    Pending,
    Resolved(T),
    Rejected(StoreError),
}

/// Handle to a relationship value that may still be loading.
///
/// The underlying fetch starts when the proxy is first awaited. Clones share
/// one fetch and one settlement state, so `current()` on any clone reflects a
/// resolution observed through another.
#[derive(Clone)]
pub struct PromiseProxy<T: Clone + Send + Sync + 'static> {
    state: Arc<Mutex<PromiseState<T>>>,
    future: Shared<BoxFuture<'static, Result<T>>>,
}

impl<T: Clone + Send + Sync + 'static> PromiseProxy<T> {
    pub(crate) fn new(future: BoxFuture<'static, Result<T>>) -> Self {
        let state = Arc::new(Mutex::new(PromiseState::Pending));
        let settle = Arc::clone(&state);
        let future = async move {
            let result = future.await;
            *settle.lock() = match &result {
                Ok(value) => PromiseState::Resolved(value.clone()),
                Err(e) => PromiseState::Rejected(e.clone()),
            };
            result
        }
        .boxed()
        .shared();
        Self { state, future }
    }

    /// A proxy that is already settled with `value`.
    pub(crate) fn resolved(value: T) -> Self {
        let ready = value.clone();
        Self {
            state: Arc::new(Mutex::new(PromiseState::Resolved(value))),
            future: futures::future::ready(Ok(ready)).boxed().shared(),
        }
    }

    pub(crate) fn rejected(error: StoreError) -> Self {
        let ready = error.clone();
        Self {
            state: Arc::new(Mutex::new(PromiseState::Rejected(error))),
            future: futures::future::ready(Err(ready)).boxed().shared(),
        }
    }

    pub fn state(&self) -> PromiseState<T> {
        self.state.lock().clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), PromiseState::Pending)
    }

    /// Best-effort synchronous value: `Some` only once resolved.
    pub fn current(&self) -> Option<T> {
        match &*self.state.lock() {
            PromiseState::Resolved(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<StoreError> {
        match &*self.state.lock() {
            PromiseState::Rejected(e) => Some(e.clone()),
            _ => None,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for PromiseProxy<T> {
    type Output = Result<T>;
    type IntoFuture = Shared<BoxFuture<'static, Result<T>>>;

    fn into_future(self) -> Self::IntoFuture {
        self.future
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_then_resolved() {
        let proxy = PromiseProxy::new(async { Ok(3usize) }.boxed());
        assert!(proxy.is_pending());
        assert_eq!(proxy.current(), None);

        let observer = proxy.clone();
        assert_eq!(proxy.await.unwrap(), 3);
        assert_eq!(observer.current(), Some(3));
    }

    #[tokio::test]
    async fn test_rejected() {
        let proxy: PromiseProxy<usize> =
            PromiseProxy::new(async { Err(StoreError::Adapter("offline".into())) }.boxed());
        let observer = proxy.clone();
        assert!(proxy.await.is_err());
        assert!(matches!(observer.state(), PromiseState::Rejected(_)));
        assert!(observer.error().is_some());
    }

    #[test]
    fn test_settled_constructors() {
        let resolved = PromiseProxy::resolved(vec![1, 2]);
        assert_eq!(resolved.current(), Some(vec![1, 2]));
        let rejected: PromiseProxy<u8> = PromiseProxy::rejected(StoreError::Assertion("x".into()));
        assert!(rejected.current().is_none());
        assert!(!rejected.is_pending());
    }
}
