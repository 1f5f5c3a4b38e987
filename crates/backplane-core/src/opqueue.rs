//! Per-entity serialized operation queue
//!
//! At most one protocol operation per entity is in flight; later submissions
//! wait their turn in FIFO order. Closing the queue (entity destruction)
//! fails every queued submission with exactly one `Canceled`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::EntityError;

pub(crate) struct OpQueue {
    // tokio's mutex queues waiters fairly, which gives the FIFO guarantee.
    gate: tokio::sync::Mutex<()>,
    pending: AtomicUsize,
    closed: AtomicBool,
}

impl OpQueue {
    pub fn new() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Run `op` once every earlier submission has finished. Returns
    /// `Canceled` without running it if the queue was closed first.
    pub async fn run<T, F>(&self, op: F) -> Result<T, EntityError>
    where
        F: Future<Output = Result<T, EntityError>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(EntityError::Canceled);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        let guard = self.gate.lock().await;
        let result = if self.closed.load(Ordering::Acquire) {
            Err(EntityError::Canceled)
        } else {
            op.await
        };
        drop(guard);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = Arc::new(OpQueue::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(async {
                        order.lock().unwrap().push(i);
                        Ok(())
                    })
                    .await
            }));
            // Give each submission time to enqueue before the next.
            tokio::task::yield_now().await;
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_close_cancels_queued_ops() {
        let queue = Arc::new(OpQueue::new());

        // Occupy the queue so the next submission has to wait.
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let q = queue.clone();
        let blocker = tokio::spawn(async move {
            q.run(async {
                let _ = release_rx.await;
                Ok(())
            })
            .await
        });
        tokio::task::yield_now().await;

        let q = queue.clone();
        let queued = tokio::spawn(async move { q.run(async { Ok(42) }).await });
        tokio::task::yield_now().await;

        queue.close();
        let _ = release_tx.send(());
        blocker.await.unwrap().unwrap();
        assert!(matches!(queued.await.unwrap(), Err(EntityError::Canceled)));
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_close() {
        let queue = OpQueue::new();
        queue.close();
        let res: Result<(), _> = queue.run(async { Ok(()) }).await;
        assert!(matches!(res, Err(EntityError::Canceled)));
    }
}
