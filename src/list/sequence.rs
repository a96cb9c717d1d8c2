//! Result sequence
//!
//! A single-producer, single-consumer channel with room for one item. The
//! producer runs ahead of the consumer by at most one item, so pages are
//! fetched lazily as the consumer drains them. Cancellation is observed at
//! every hand-off.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Why the producer must stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// The consumer asked for cancellation
    Cancelled,
    /// The consumer dropped the sequence
    Closed,
}

/// Create a connected producer/consumer pair
pub fn channel<T>(cancel: CancellationToken) -> (Emitter<T>, ResultSequence<T>) {
    let (tx, rx) = mpsc::channel(1);
    (
        Emitter {
            tx,
            cancel: cancel.clone(),
        },
        ResultSequence { rx, cancel },
    )
}

/// Producer half
pub struct Emitter<T> {
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
}

impl<T> Emitter<T> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the consumer asks for cancellation
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Hand one item to the consumer, waiting while the slot is full
    pub async fn emit(&self, item: T) -> Result<(), Halt> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
            sent = self.tx.send(item) => sent.map_err(|_| Halt::Closed),
        }
    }

    /// Wait until the consumer has taken everything emitted so far
    pub async fn ready(&self) -> Result<(), Halt> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
            permit = self.tx.reserve() => permit.map(drop).map_err(|_| Halt::Closed),
        }
    }

    /// Deliver a final item regardless of cancellation, then close
    pub async fn finish_with(self, item: T) {
        // The consumer may already be gone; nothing left to do then.
        let _ = self.tx.send(item).await;
    }
}

/// Consumer half; also usable as a [`Stream`]
///
/// Dropping the sequence stops the producer at its next hand-off.
pub struct ResultSequence<T> {
    rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
}

impl<T> ResultSequence<T> {
    /// Next item, or `None` once the producer has finished
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Ask the producer to stop
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain every remaining item
    pub async fn collect_all(mut self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = self.rx.recv().await {
            items.push(item);
        }
        items
    }
}

impl<T> Stream for ResultSequence<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
