// Copyright 2025 LiveKit, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use parking_lot::Mutex;
use std::{fmt::Debug, future::Future};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ObservableError {
    #[error("observable was closed")]
    Closed,
}

/// Observable state shared between a producer and any number of consumers.
///
/// Consumers can read the current value, wait for the value to satisfy a
/// predicate, or receive every published value in order through
/// [`Observable::updates`].
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Mutex<Inner<T>>,
    rx: watch::Receiver<T>,
}

struct Inner<T> {
    watch_tx: Option<watch::Sender<T>>,
    senders: Vec<mpsc::UnboundedSender<T>>,
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        let (watch_tx, rx) = watch::channel(value);
        Self { inner: Mutex::new(Inner { watch_tx: Some(watch_tx), senders: Vec::new() }), rx }
    }

    /// Returns a clone of the current value.
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Replaces the current value and publishes it to all subscribers.
    pub fn set(&self, value: T) {
        let mut inner = self.inner.lock();
        inner.publish(value);
    }

    /// Mutates the current value in place and publishes the result.
    ///
    /// The read-modify-write is atomic with respect to other writers.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut inner = self.inner.lock();
        let mut value = self.rx.borrow().clone();
        let result = f(&mut value);
        inner.publish(value);
        result
    }

    /// Publishes the value only if it differs from the current one.
    pub fn set_if_changed(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        let mut inner = self.inner.lock();
        if *self.rx.borrow() == value {
            return false;
        }
        inner.publish(value);
        true
    }

    /// Returns a receiver yielding the current value followed by every
    /// subsequently published value. The receiver ends when the observable is
    /// closed or dropped.
    pub fn updates(&self) -> mpsc::UnboundedReceiver<T> {
        let mut inner = self.inner.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        if inner.watch_tx.is_some() && tx.send(self.rx.borrow().clone()).is_ok() {
            inner.senders.push(tx);
        }
        rx
    }

    /// Returns a receiver that only tracks the latest value.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }

    /// Waits until the value satisfies `predicate`.
    ///
    /// The returned future does not borrow the observable, dropping it
    /// unsubscribes. It resolves with [`ObservableError::Closed`] once the
    /// observable is closed without the predicate being satisfied.
    pub fn wait_until<F>(&self, predicate: F) -> impl Future<Output = Result<T, ObservableError>>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        let mut rx = self.rx.clone();
        let mut predicate = predicate;
        async move {
            let value = rx.wait_for(|v| predicate(v)).await.map_err(|_| ObservableError::Closed)?;
            Ok(value.clone())
        }
    }

    /// Ends every update stream and wakes all pending waits.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.watch_tx = None;
        inner.senders.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().watch_tx.is_none()
    }
}

impl<T> Inner<T>
where
    T: Clone,
{
    fn publish(&mut self, value: T) {
        let Some(watch_tx) = &self.watch_tx else {
            log::debug!("dropping value published to a closed observable");
            return;
        };
        self.senders.retain(|sender| sender.send(value.clone()).is_ok());
        watch_tx.send_replace(value);
    }
}

impl<T> Default for Observable<T>
where
    T: Clone + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Debug for Observable<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable").field("value", &*self.rx.borrow()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_updates_are_not_coalesced() {
        let observable = Observable::new(0);
        let mut rx = observable.updates();
        observable.set(1);
        observable.set(2);
        observable.update(|v| *v += 1);

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_wait_until_current_value() {
        let observable = Observable::new(5);
        assert_eq!(observable.wait_until(|v| *v == 5).await, Ok(5));
    }

    #[tokio::test]
    async fn test_wait_until_later_value() {
        let observable = std::sync::Arc::new(Observable::new(false));
        let wait = observable.wait_until(|v| *v);
        let producer = observable.clone();
        tokio::spawn(async move { producer.set(true) });
        assert_eq!(timeout(Duration::from_secs(1), wait).await.unwrap(), Ok(true));
    }

    #[tokio::test]
    async fn test_wait_until_closed() {
        let observable = Observable::new(0);
        let wait = observable.wait_until(|v| *v == 1);
        observable.close();
        assert_eq!(
            timeout(Duration::from_secs(1), wait).await.unwrap(),
            Err(ObservableError::Closed)
        );
    }

    #[tokio::test]
    async fn test_close_ends_updates() {
        let observable = Observable::new(0);
        let mut rx = observable.updates();
        assert_eq!(rx.recv().await, Some(0));
        observable.close();
        assert_eq!(rx.recv().await, None);

        observable.set(1);
        assert!(observable.is_closed());
    }

    #[test]
    fn test_set_if_changed() {
        let observable = Observable::new("a");
        assert!(!observable.set_if_changed("a"));
        assert!(observable.set_if_changed("b"));
        assert_eq!(observable.get(), "b");
    }
}
