//! Broadcast a single in-flight future's result to any number of listeners
//! that asked for it while it was running. Used by [`crate::async_lru_cache`]
//! so concurrent misses on the same key collapse into one fetch.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};
use futures::future::{self, Either, FutureExt};
use tokio::sync::oneshot;

#[derive(Default)]
struct BroadcastData<T> {
    result: Option<Result<T, String>>,
    listeners: Vec<oneshot::Sender<Result<T, Error>>>,
}

impl<T: Clone> BroadcastData<T> {
    fn new() -> Self {
        Self {
            result: None,
            listeners: vec![],
        }
    }

    fn notify_listeners(&mut self, result: Result<T, String>) {
        self.result = Some(result.clone());
        while let Some(ch) = self.listeners.pop() {
            match &result {
                Ok(value) => {
                    let _ = ch.send(Ok(value.clone()));
                }
                Err(err) => {
                    let _ = ch.send(Err(format_err!("{}", err)));
                }
            }
        }
    }

    fn listen(&mut self) -> impl Future<Output = Result<T, Error>> {
        match &self.result {
            None => {}
            Some(Ok(value)) => return Either::Left(future::ok(value.clone())),
            Some(Err(err)) => return Either::Left(future::err(format_err!("{}", err))),
        }

        let (tx, rx) = oneshot::channel::<Result<T, Error>>();
        self.listeners.push(tx);
        Either::Right(rx.map(|res| match res {
            Ok(Ok(t)) => Ok(t),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::from(e)),
        }))
    }
}

type SourceFuture<T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send>>;

struct BroadcastFutureBinding<T> {
    broadcast: BroadcastData<T>,
    future: Option<SourceFuture<T>>,
}

/// Drives a single source future to completion and broadcasts its result to
/// every `listen()` caller, including ones that join after it finished.
pub struct BroadcastFuture<T> {
    inner: Arc<Mutex<BroadcastFutureBinding<T>>>,
}

impl<T: Clone + Send + 'static> BroadcastFuture<T> {
    pub fn new(source: Box<dyn Future<Output = Result<T, Error>> + Send>) -> Self {
        let inner = BroadcastFutureBinding {
            broadcast: BroadcastData::new(),
            future: Some(Pin::from(source)),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn notify_listeners(inner: Arc<Mutex<BroadcastFutureBinding<T>>>, result: Result<T, String>) {
        let mut data = inner.lock().unwrap();
        data.broadcast.notify_listeners(result);
    }

    fn spawn(inner: Arc<Mutex<BroadcastFutureBinding<T>>>) -> impl Future<Output = Result<T, Error>> {
        let mut data = inner.lock().unwrap();

        if let Some(source) = data.future.take() {
            let inner1 = inner.clone();
            let task = source.map(move |value| match value {
                Ok(value) => Self::notify_listeners(inner1, Ok(value)),
                Err(err) => Self::notify_listeners(inner1, Err(err.to_string())),
            });
            tokio::spawn(task);
        }

        data.broadcast.listen()
    }

    /// Register as a listener for the source future's result (joining an
    /// in-flight fetch, or replaying an already-completed one).
    pub fn listen(&self) -> impl Future<Output = Result<T, Error>> {
        let inner2 = self.inner.clone();
        async move { Self::spawn(inner2).await }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn joins_concurrent_listeners_into_one_fetch() {
        static FETCHES: AtomicUsize = AtomicUsize::new(0);

        let fut: Box<dyn Future<Output = Result<i32, Error>> + Send> = Box::new(async {
            FETCHES.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(42)
        });
        let broadcast = BroadcastFuture::new(fut);

        let a = broadcast.listen();
        let b = broadcast.listen();
        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra.unwrap(), 42);
        assert_eq!(rb.unwrap(), 42);
        assert_eq!(FETCHES.load(Ordering::SeqCst), 1);

        // a listener joining after completion replays the cached result
        assert_eq!(broadcast.listen().await.unwrap(), 42);
    }
}
