//! One-shot completion signal with any number of waiters.
//!
//! The [`Completer`] is consumed when it fires, so an outcome is set at most
//! once. Dropping it unfired wakes every waiter with [`Error::Cancelled`].

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::sync::watch;

pub struct Completer<T> {
    tx: watch::Sender<Option<Result<T>>>,
}

#[derive(Clone)]
pub struct Completion<T> {
    rx: watch::Receiver<Option<Result<T>>>,
}

pub fn completion<T: Clone>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = watch::channel(None);
    (Completer { tx }, Completion { rx })
}

impl<T: Clone> Completer<T> {
    pub fn complete(self, outcome: Result<T>) {
        self.tx.send_replace(Some(outcome));
    }
}

impl<T: Clone> Completion<T> {
    /// Wait for the outcome.
    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(v) => (*v).clone(),
            Err(_) => self.peek(),
        };
        outcome.unwrap_or(Err(Error::Cancelled))
    }

    /// Wait at most `d`; `None` if still pending.
    pub async fn wait_timeout(&self, d: Duration) -> Option<Result<T>> {
        tokio::time::timeout(d, self.wait()).await.ok()
    }

    pub fn peek(&self) -> Option<Result<T>> {
        self.rx.borrow().clone()
    }

    /// Set, or abandoned by its completer.
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some() || self.rx.has_changed().is_err()
    }
}
