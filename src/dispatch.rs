//! Bounded dispatch queue.
//!
//! Items enter through a single-slot channel. One dispatch loop pulls them
//! out, waits for a free permit and spawns the handler with the permit
//! attached. When every permit is taken the loop stops pulling, the slot
//! stays full and `submit` suspends: excess work waits, it is never dropped.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tracing::trace;

use crate::error::{Error, Result};

/// Admission-controlled task runner capping in-flight handlers.
pub struct DispatchQueue<T> {
    tx: mpsc::Sender<T>,
    capacity: usize,
}

impl<T> Clone for DispatchQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Send + 'static> DispatchQueue<T> {
    /// Start the dispatch loop. At most `capacity` handlers run at once.
    ///
    /// Must be called from within a tokio runtime. The loop exits once every
    /// clone of the queue is dropped and in-flight handlers finish on their own.
    pub fn new<F, Fut>(capacity: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let capacity = capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<T>(1);
        let permits = Arc::new(Semaphore::new(capacity));

        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let work = handler(item);
                tokio::spawn(async move {
                    work.await;
                    drop(permit);
                });
            }
            trace!("dispatch loop finished");
        });

        Self { tx, capacity }
    }

    /// Queue an item, waiting while the queue is saturated.
    pub async fn submit(&self, item: T) -> Result<()> {
        self.tx.send(item).await.map_err(|_| Error::QueueClosed)
    }

    /// Queue an item only if the admission slot is free right now.
    ///
    /// Returns the item back when the queue is saturated or closed.
    pub fn try_submit(&self, item: T) -> std::result::Result<(), T> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(item) | mpsc::error::TrySendError::Closed(item) => item,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
