//! The public entry point: opening a queue directory and starting sessions against it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::QueueOptions;
use crate::core::QueueCore;
use crate::error::QueueError;
use crate::session::Session;

/// Minimum backoff between retries in [`Queue::wait_for`].
const WAIT_FOR_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// A handle to an open, exclusively-locked queue directory.
pub struct Queue {
    core: Arc<QueueCore>,
}

impl Queue {
    /// Opens the queue directory named by `options`, recovering its state from the transaction
    /// log and acquiring the directory's exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LockContention`] if another live process already holds the
    /// directory's lock; use [`Queue::wait_for`] to retry instead of failing immediately.
    pub async fn open(options: QueueOptions) -> Result<Queue, QueueError> {
        let core = QueueCore::open(options).await?;
        Ok(Queue { core })
    }

    /// Like [`Queue::open`], but retries on lock contention until `timeout` elapses instead of
    /// failing on the first attempt -- for callers that expect a previous owner to shut down
    /// shortly (e.g. a supervisor restarting a worker process).
    ///
    /// # Errors
    ///
    /// Returns the last [`QueueError`] encountered once `timeout` has elapsed. Any error other
    /// than [`QueueError::LockContention`] is returned immediately without retrying.
    pub async fn wait_for(options: QueueOptions, timeout: Duration) -> Result<Queue, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            match Queue::open(options.clone()).await {
                Ok(queue) => return Ok(queue),
                Err(QueueError::LockContention) if Instant::now() < deadline => {
                    tokio::time::sleep(WAIT_FOR_RETRY_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Opens a new transactional session against this queue. Multiple sessions may be open at
    /// once; each buffers its own enqueues and tentative dequeues independently.
    pub fn open_session(&self) -> Session {
        self.core.open_session()
    }

    /// Snapshot count of entries available for dequeue right now (committed enqueues minus
    /// committed and in-flight tentative dequeues).
    pub fn estimated_count(&self) -> u64 {
        self.core.estimated_count()
    }

    /// Snapshot total byte size of entries available for dequeue right now.
    pub fn estimated_total_size_bytes(&self) -> u64 {
        self.core.estimated_total_size_bytes()
    }

    /// Releases the queue directory's lock, allowing another process to open it. Any sessions
    /// still holding buffered work should be flushed or disposed first.
    pub async fn dispose(self) {
        self.core.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_twice_without_dispose_is_lock_contention() {
        let dir = tempdir().unwrap();
        let options = QueueOptions::from_path(dir.path()).build().unwrap();
        let first = Queue::open(options.clone()).await.unwrap();

        let second = Queue::open(options).await;
        assert!(matches!(second, Err(QueueError::LockContention)));

        first.dispose().await;
    }

    #[tokio::test]
    async fn wait_for_succeeds_after_dispose() {
        let dir = tempdir().unwrap();
        let options = QueueOptions::from_path(dir.path()).build().unwrap();
        let first = Queue::open(options.clone()).await.unwrap();

        let waiter = tokio::spawn(Queue::wait_for(options, Duration::from_secs(2)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        first.dispose().await;

        let second = waiter.await.unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn empty_queue_reports_zero_counts() {
        let dir = tempdir().unwrap();
        let options = QueueOptions::from_path(dir.path()).build().unwrap();
        let queue = Queue::open(options).await.unwrap();
        assert_eq!(queue.estimated_count(), 0);
        assert_eq!(queue.estimated_total_size_bytes(), 0);
        queue.dispose().await;
    }
}
