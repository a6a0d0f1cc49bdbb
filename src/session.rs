//! A transactional session: buffers enqueues and tentative dequeues locally and only makes them
//! visible to the rest of the queue on an explicit [`Session::flush`]. Mirrors the teacher's
//! `Writer`/buffered-record pattern, generalized from a single append stream to the five-step
//! commit protocol this queue's transaction log requires.

use std::mem;
use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;

use crate::config::PENDING_WRITE_BATCH_SIZE;
use crate::core::{CoreError, Entry, QueueCore};
use crate::error::QueueError;
use crate::txlog::Operation;

/// A buffered unit of work against a [`crate::Queue`]. Not `Send`-shared across tasks; open one
/// per concurrent writer/reader.
pub struct Session {
    core: Arc<QueueCore>,
    buffer: Vec<Vec<u8>>,
    buffer_size: usize,
    ops: Vec<Operation>,
    dequeued: Vec<Entry>,
    pending_writes: Vec<JoinHandle<Result<Vec<Operation>, CoreError>>>,
}

impl Session {
    pub(crate) fn new(core: Arc<QueueCore>) -> Self {
        Session {
            core,
            buffer: Vec::new(),
            buffer_size: 0,
            ops: Vec::new(),
            dequeued: Vec::new(),
            pending_writes: Vec::new(),
        }
    }

    /// Buffers `bytes` for enqueue on the next [`Session::flush`]. Once the buffer crosses
    /// `write_buffer_size`, it is written to the current data file in the background -- the bytes
    /// land on disk ahead of commit, but the transaction log entry (and therefore visibility to
    /// other sessions) still waits for `flush`.
    pub async fn enqueue(&mut self, bytes: Vec<u8>) -> Result<(), QueueError> {
        self.buffer_size += bytes.len();
        self.buffer.push(bytes);

        if self.buffer_size >= self.core.options().write_buffer_size() {
            self.spawn_opportunistic_write();
        }
        Ok(())
    }

    /// Removes and returns the head entry's payload. The dequeue is tentative: invisible to other
    /// sessions immediately, but reinstated at the head of the queue if this session is disposed
    /// instead of flushed.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be read back from its data file.
    pub async fn dequeue(&mut self) -> Result<Option<Vec<u8>>, QueueError> {
        match self.core.dequeue().await.map_err(QueueError::from)? {
            Some((entry, bytes)) => {
                self.dequeued.push(entry);
                self.ops
                    .push(Operation::dequeue(entry.file_number, entry.start, entry.length));
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    fn spawn_opportunistic_write(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let elements = mem::take(&mut self.buffer);
        self.buffer_size = 0;
        let core = Arc::clone(&self.core);
        self.pending_writes.push(tokio::spawn(async move {
            let ops = write_elements(&core, elements).await?;
            // Not required for durability (only the log append on `flush` is), so this fsync is
            // rate-limited by `flush_interval` rather than unconditional.
            core.maybe_sync_write_file().await?;
            Ok(ops)
        }));
    }

    /// Commits this session's buffered work: waits for any outstanding opportunistic writes,
    /// writes whatever remains buffered, syncs the data file, and appends a single transaction
    /// record covering every enqueue and dequeue performed since the last flush.
    ///
    /// On any failure, nothing is committed: the transaction log is untouched and the session's
    /// buffered state is left in place so the caller may retry the flush or dispose instead.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PendingWriteFailure`] (wrapped) if one or more opportunistic writes
    /// failed, or any error from the final write/sync/commit.
    pub async fn flush(&mut self) -> Result<(), QueueError> {
        self.await_pending_writes().await?;

        if !self.buffer.is_empty() {
            let elements = mem::take(&mut self.buffer);
            self.buffer_size = 0;
            let new_ops = write_elements(&self.core, elements)
                .await
                .map_err(QueueError::from)?;
            self.ops.extend(new_ops);
        }

        self.core.sync_write_file().await.map_err(QueueError::from)?;
        self.core
            .commit_transaction(&self.ops)
            .await
            .map_err(QueueError::from)?;

        self.ops.clear();
        self.dequeued.clear();
        Ok(())
    }

    /// Awaits outstanding opportunistic writes in batches of `PENDING_WRITE_BATCH_SIZE`,
    /// concurrently within a batch, each bounded by `timeout_limit` -- a write that hangs past
    /// that bound is treated as failed rather than blocking `flush` indefinitely.
    async fn await_pending_writes(&mut self) -> Result<(), QueueError> {
        let mut handles = mem::take(&mut self.pending_writes).into_iter();
        let timeout = self.core.options().timeout_limit();
        let mut attempted = 0usize;
        let mut failed = 0usize;
        let mut first_error: Option<String> = None;

        loop {
            let batch: Vec<JoinHandle<Result<Vec<Operation>, CoreError>>> =
                (&mut handles).take(PENDING_WRITE_BATCH_SIZE).collect();
            if batch.is_empty() {
                break;
            }
            attempted += batch.len();

            let awaited = join_all(batch.into_iter().map(|handle| async move {
                match tokio::time::timeout(timeout, handle).await {
                    Ok(Ok(Ok(new_ops))) => Ok(new_ops),
                    Ok(Ok(Err(core_err))) => Err(core_err.to_string()),
                    Ok(Err(join_err)) => Err(join_err.to_string()),
                    Err(_elapsed) => Err(format!(
                        "opportunistic write timed out after {:?}",
                        timeout
                    )),
                }
            }))
            .await;

            for result in awaited {
                match result {
                    Ok(new_ops) => self.ops.extend(new_ops),
                    Err(message) => {
                        failed += 1;
                        first_error.get_or_insert(message);
                    }
                }
            }
        }

        if failed > 0 {
            return Err(QueueError::from(CoreError::PendingWriteFailure {
                failed,
                attempted,
                first_error: first_error.unwrap_or_default(),
            }));
        }
        Ok(())
    }

    /// Abandons this session: any tentatively-dequeued entries are reinstated at the head of the
    /// queue, in their original order, and buffered enqueues are discarded. Bytes already written
    /// by an opportunistic write are simply left orphaned in the data file -- they were never
    /// logged, so they are never visible and never retired against.
    pub fn dispose(mut self) {
        self.core.reinstate(&self.dequeued);
        self.dequeued.clear();
        self.ops.clear();
        self.buffer.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.ops.is_empty()
            || !self.dequeued.is_empty()
            || !self.buffer.is_empty()
            || !self.pending_writes.is_empty()
        {
            warn!("session dropped with unflushed operations; call flush() or dispose() explicitly");
        }
    }
}

async fn write_elements(core: &QueueCore, elements: Vec<Vec<u8>>) -> Result<Vec<Operation>, CoreError> {
    let mut lengths = Vec::with_capacity(elements.len());
    let mut concatenated = Vec::new();
    for el in &elements {
        lengths.push(el.len() as u32);
        concatenated.extend_from_slice(el);
    }

    let entry = core.write_chunk(&concatenated).await?;
    let mut offset = entry.start;
    let mut ops = Vec::with_capacity(lengths.len());
    for len in lengths {
        ops.push(Operation::enqueue(entry.file_number, offset, len));
        offset += len as u64;
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOptions;
    use tempfile::tempdir;

    #[tokio::test]
    async fn enqueue_flush_dequeue_round_trips() {
        let dir = tempdir().unwrap();
        let options = QueueOptions::from_path(dir.path()).build().unwrap();
        let core = QueueCore::open(options).await.unwrap();

        let mut writer = core.open_session();
        writer.enqueue(b"hello".to_vec()).await.unwrap();
        writer.flush().await.unwrap();

        let mut reader = core.open_session();
        let payload = reader.dequeue().await.unwrap().unwrap();
        assert_eq!(payload, b"hello");
        reader.flush().await.unwrap();

        assert_eq!(core.estimated_count(), 0);
    }

    #[tokio::test]
    async fn empty_enqueue_round_trips() {
        let dir = tempdir().unwrap();
        let options = QueueOptions::from_path(dir.path()).build().unwrap();
        let core = QueueCore::open(options).await.unwrap();

        let mut writer = core.open_session();
        writer.enqueue(Vec::new()).await.unwrap();
        writer.flush().await.unwrap();

        let mut reader = core.open_session();
        let payload = reader.dequeue().await.unwrap().unwrap();
        assert!(payload.is_empty());
        reader.flush().await.unwrap();
    }

    #[tokio::test]
    async fn dispose_reinstates_dequeue_at_head() {
        let dir = tempdir().unwrap();
        let options = QueueOptions::from_path(dir.path()).build().unwrap();
        let core = QueueCore::open(options).await.unwrap();

        let mut writer = core.open_session();
        writer.enqueue(b"first".to_vec()).await.unwrap();
        writer.enqueue(b"second".to_vec()).await.unwrap();
        writer.flush().await.unwrap();

        let mut reader = core.open_session();
        let first = reader.dequeue().await.unwrap().unwrap();
        assert_eq!(first, b"first");
        reader.dispose();

        let mut reader2 = core.open_session();
        let replayed = reader2.dequeue().await.unwrap().unwrap();
        assert_eq!(replayed, b"first");
    }
}
