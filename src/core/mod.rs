//! `QueueCore`: the central, shared state of an open queue. Owns the [`crate::fs::FileDriver`],
//! the transaction log handle, the checkpoint store, the in-memory live-entry FIFO, and the
//! per-file live-range map used to detect when a data file can be retired.
//!
//! Orchestration mirrors the teacher's `Buffer::from_config_inner` (load checkpoint, replay log,
//! reconcile, open for writing) and `Writer::ensure_ready_for_write` (roll to the next data file
//! when the current one is full), adapted from a zero-copy mmap'd ledger to this spec's
//! transaction-log-is-source-of-truth model.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use snafu::{ResultExt, Snafu};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;

use crate::checkpoint::{CheckpointError, CheckpointStore, FileLiveRanges, MetaState};
use crate::config::QueueOptions;
use crate::fs::FileDriver;
use crate::lock::{self, LockError, QueueLock};
use crate::session::Session;
use crate::txlog::{self, CodecError, Operation, OperationKind};

/// An immutable reference to a stored payload: the byte range `[start, start+length)` of
/// `data.{file_number}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub file_number: u32,
    pub start: u64,
    pub length: u32,
}

/// Lifecycle state of one `data.NNNN` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFileState {
    /// Currently the write target.
    Active,
    /// No longer written to, but still has live ranges.
    Sealed,
    /// No live ranges, awaiting deletion.
    Retired,
    /// Deleted from disk.
    Deleted,
}

/// Errors produced by [`QueueCore`] during recovery or runtime operation.
#[derive(Debug, Snafu)]
pub enum CoreError {
    #[snafu(display("queue I/O error: {}", source))]
    Io { source: io::Error },

    #[snafu(display("failed to acquire queue lock: {}", source))]
    Lock { source: LockError },

    #[snafu(display("transaction log error: {}", source))]
    Codec { source: CodecError },

    #[snafu(display("checkpoint error: {}", source))]
    Checkpoint { source: CheckpointError },

    /// Recovery found the log and the queue directory in a state that cannot be safely resolved:
    /// a double-free of a live range, or the checkpoint disagreeing with the log in a way that is
    /// not a simple lag.
    #[snafu(display("unrecoverable inconsistency: {}", reason))]
    Unrecoverable { reason: String },

    /// One or more opportunistic async writes failed; surfaced at flush time.
    #[snafu(display(
        "{} of {} pending writes failed; first error: {}",
        failed,
        attempted,
        first_error
    ))]
    PendingWriteFailure {
        failed: usize,
        attempted: usize,
        first_error: String,
    },
}

impl From<io::Error> for CoreError {
    fn from(source: io::Error) -> Self {
        CoreError::Io { source }
    }
}

impl From<LockError> for CoreError {
    fn from(source: LockError) -> Self {
        CoreError::Lock { source }
    }
}

impl From<CodecError> for CoreError {
    fn from(source: CodecError) -> Self {
        CoreError::Codec { source }
    }
}

impl From<CheckpointError> for CoreError {
    fn from(source: CheckpointError) -> Self {
        CoreError::Checkpoint { source }
    }
}

fn data_file_name(file_number: u32) -> String {
    format!("data.{:04}", file_number)
}

fn parse_data_file_number(name: &str) -> Option<u32> {
    name.strip_prefix("data.").and_then(|s| s.parse().ok())
}

/// State protected by the entry-queue mutex. Kept free of anything that requires awaiting, per
/// the concurrency contract: writers never suspend while holding this lock.
struct EntryQueueState {
    /// FIFO of currently dequeue-able entries. `dequeue()` pops the front; `reinstate()` pushes
    /// back to the front in original order; `commit_transaction` pushes new enqueues to the back.
    live_entries: VecDeque<Entry>,
    /// Per-file set of byte ranges still referenced by some live entry (live or tentatively
    /// dequeued), used only to detect when a data file can be retired.
    live_ranges: BTreeMap<u32, Vec<(u64, u32)>>,
    file_states: BTreeMap<u32, DataFileState>,
    transaction_id: u64,
}

/// State protected by the writer mutex: the currently-open write handle and its position.
struct WriterState {
    current_write_file: u32,
    current_write_position: u64,
    handle: Option<File>,
    /// Last time the write file was fsync'd, used to rate-limit opportunistic-write fsyncs
    /// against `flush_interval`. Reset on every sync, throttled or explicit.
    last_data_fsync: std::time::Instant,
}

pub struct QueueCore {
    root: PathBuf,
    options: QueueOptions,
    driver: Arc<FileDriver>,
    checkpoint: CheckpointStore,
    log_file: AsyncMutex<File>,
    entry_state: SyncMutex<EntryQueueState>,
    writer_state: AsyncMutex<WriterState>,
    lock: AsyncMutex<Option<QueueLock>>,
}

impl QueueCore {
    /// Opens the queue directory, recovering in-memory state from the transaction log and
    /// reconciling it against the (advisory) checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Lock`] if another live process holds the directory, or
    /// [`CoreError::Unrecoverable`] if the log is corrupt and the truncation policy is strict.
    pub async fn open(options: QueueOptions) -> Result<Arc<QueueCore>, CoreError> {
        let root = options.root().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        let driver = Arc::new(FileDriver::new());
        let lock_path = root.join(lock::LOCK_FILE_NAME);
        let queue_lock = lock::acquire(&driver, &lock_path).await?;

        let checkpoint = CheckpointStore::new(&root);
        let cached = checkpoint.load(&driver).await?;

        let log_path = root.join("transaction.log");
        let log_bytes = read_whole_file_if_exists(&log_path).await?;

        let (live_ranges, file_high_water, transaction_id) =
            replay_log(&log_bytes, &log_path, &options, &driver).await?;

        let current_write_file = file_high_water.keys().max().copied().unwrap_or(0);
        let current_write_position = file_high_water
            .get(&current_write_file)
            .copied()
            .unwrap_or(0);

        if let Some(cached) = &cached {
            if cached.current_transaction_id > transaction_id {
                return Err(CoreError::Unrecoverable {
                    reason: format!(
                        "checkpoint transaction id {} is ahead of log-replayed id {}",
                        cached.current_transaction_id, transaction_id
                    ),
                });
            }
        }

        let mut live_entries: Vec<Entry> = live_ranges
            .iter()
            .flat_map(|(&file_number, ranges)| {
                ranges.iter().map(move |&(start, length)| Entry {
                    file_number,
                    start,
                    length,
                })
            })
            .collect();
        live_entries.sort_by_key(|e| (e.file_number, e.start));

        let mut file_states = BTreeMap::new();
        for &file_number in live_ranges.keys() {
            let state = if file_number == current_write_file {
                DataFileState::Active
            } else if live_ranges.get(&file_number).map_or(false, |r| !r.is_empty()) {
                DataFileState::Sealed
            } else {
                DataFileState::Retired
            };
            file_states.insert(file_number, state);
        }
        file_states.insert(current_write_file, DataFileState::Active);

        let log_file = tokio::fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)
            .await?;

        let write_file_path = root.join(data_file_name(current_write_file));
        let write_handle = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .append(true)
            .create(true)
            .open(&write_file_path)
            .await?;

        // A session that wrote opportunistically and then disposed without committing leaves
        // bytes on disk past the log's high-water mark. Since the file is opened in append mode,
        // the OS always writes at the true end of file regardless of our tracked position; taking
        // the max here keeps `current_write_position` from ever lagging behind reality after a
        // restart, which would otherwise make a freshly-committed entry's recorded offset wrong.
        let on_disk_len = write_handle.metadata().await?.len();
        let current_write_position = current_write_position.max(on_disk_len);

        let core = Arc::new(QueueCore {
            root: root.clone(),
            options,
            driver,
            checkpoint,
            log_file: AsyncMutex::new(log_file),
            entry_state: SyncMutex::new(EntryQueueState {
                live_entries: VecDeque::from(live_entries),
                live_ranges,
                file_states,
                transaction_id,
            }),
            writer_state: AsyncMutex::new(WriterState {
                current_write_file,
                current_write_position,
                handle: Some(write_handle),
                last_data_fsync: std::time::Instant::now(),
            }),
            lock: AsyncMutex::new(Some(queue_lock)),
        });

        core.rewrite_checkpoint().await?;
        core.sweep_retired_files().await?;

        info!(
            root = %core.root.display(),
            entries = core.entry_state.lock().live_entries.len(),
            write_file = current_write_file,
            "queue opened"
        );

        Ok(core)
    }

    /// Opens a new transactional session against this queue.
    pub fn open_session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self))
    }

    pub(crate) fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Snapshot count of live entries minus in-flight tentative dequeues, per invariant 6.
    pub fn estimated_count(&self) -> u64 {
        let live = self.entry_state.lock().live_entries.len() as u64;
        live
    }

    /// Total byte size of unread entries (supplemental to `estimated_count`).
    pub fn estimated_total_size_bytes(&self) -> u64 {
        self.entry_state
            .lock()
            .live_entries
            .iter()
            .map(|e| e.length as u64)
            .sum()
    }

    /// Writes `bytes` to the current write file, rolling over to the next `data.NNNN` file first
    /// if `bytes` would not fit in the remaining space of the current file. A single rollover
    /// always suffices: `bytes` is rejected up front if it alone exceeds `max_file_size`, and a
    /// freshly rolled file always starts empty, so it necessarily has room.
    ///
    /// This is the simplified `acquire_writer`: each chunk a session writes (one per opportunistic
    /// write, plus one for whatever remains buffered at `flush`) gets its own `write_chunk` call,
    /// so a session that crosses a file boundary over the course of several chunks ends up with a
    /// transaction whose operations reference more than one `file_number` -- without ever holding
    /// the writer mutex across more than one chunk at a time.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Unrecoverable`] if `bytes` alone exceeds `max_file_size` (no rollover
    /// could ever make room for it), or an I/O error from the underlying write.
    pub async fn write_chunk(&self, bytes: &[u8]) -> Result<Entry, CoreError> {
        let len = bytes.len() as u64;
        if len > self.options.max_file_size() {
            return Err(CoreError::Unrecoverable {
                reason: format!(
                    "record of {} bytes exceeds max_file_size of {} bytes",
                    len,
                    self.options.max_file_size()
                ),
            });
        }

        let mut state = self.writer_state.lock().await;

        if state.current_write_position + len > self.options.max_file_size() {
            self.roll_to_next_file(&mut state).await?;
        }

        let handle = state
            .handle
            .as_mut()
            .expect("writer state always holds an open handle between rollovers");
        handle.write_all(bytes).await?;

        let entry = Entry {
            file_number: state.current_write_file,
            start: state.current_write_position,
            length: bytes.len() as u32,
        };
        state.current_write_position += len;

        Ok(entry)
    }

    /// Flushes and syncs the current write file to disk unconditionally. Called once per
    /// `Session::flush`, ahead of the transaction log append, so invariant 4 (durability on
    /// successful flush) always holds regardless of `flush_interval`.
    pub async fn sync_write_file(&self) -> Result<(), CoreError> {
        let mut state = self.writer_state.lock().await;
        if let Some(handle) = state.handle.as_mut() {
            handle.flush().await?;
            handle.sync_all().await?;
        }
        state.last_data_fsync = std::time::Instant::now();
        Ok(())
    }

    /// Fsyncs the current write file only if `flush_interval` has elapsed since the last sync,
    /// the way the teacher's `Ledger::should_flush` rate-limits ledger fsyncs. Used after an
    /// opportunistic write, which is not itself required to be durable before commit -- only the
    /// transaction log append on `Session::flush` is. Returns whether a sync actually happened.
    pub async fn maybe_sync_write_file(&self) -> Result<bool, CoreError> {
        let mut state = self.writer_state.lock().await;
        if state.last_data_fsync.elapsed() < self.options.flush_interval() {
            return Ok(false);
        }
        if let Some(handle) = state.handle.as_mut() {
            handle.flush().await?;
            handle.sync_all().await?;
        }
        state.last_data_fsync = std::time::Instant::now();
        Ok(true)
    }

    async fn roll_to_next_file(&self, state: &mut WriterState) -> Result<(), CoreError> {
        if let Some(handle) = state.handle.take() {
            let mut handle = handle;
            handle.flush().await?;
            handle.sync_all().await?;
            state.last_data_fsync = std::time::Instant::now();
        }

        {
            let mut entries = self.entry_state.lock();
            entries
                .file_states
                .insert(state.current_write_file, DataFileState::Sealed);
        }

        let next_file = state.current_write_file + 1;
        let path = self.root.join(data_file_name(next_file));
        let handle = self
            .driver
            .open_write_stream(&path, true)
            .await
            .or_else(|err| {
                if err.kind() == io::ErrorKind::AlreadyExists {
                    Err(CoreError::Unrecoverable {
                        reason: format!(
                            "data file {} already exists; concurrent writer detected",
                            path.display()
                        ),
                    })
                } else {
                    Err(CoreError::from(err))
                }
            })?;

        state.current_write_file = next_file;
        state.current_write_position = 0;
        state.handle = Some(handle);

        self.entry_state
            .lock()
            .file_states
            .insert(next_file, DataFileState::Active);

        Ok(())
    }

    /// Removes the head entry from the live FIFO and reads its payload. Returns `None` if the
    /// queue is empty. The entry is *tentatively* dequeued: it is invisible to other sessions
    /// immediately, but must be reinstated via [`Self::reinstate`] if the caller disposes without
    /// committing.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the payload cannot be read back from its data file.
    pub async fn dequeue(&self) -> Result<Option<(Entry, Vec<u8>)>, CoreError> {
        let entry = {
            let mut state = self.entry_state.lock();
            state.live_entries.pop_front()
        };

        let entry = match entry {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let path = self.root.join(data_file_name(entry.file_number));
        let mut file = self.driver.open_read_stream(&path).await?;
        file.seek(io::SeekFrom::Start(entry.start)).await?;
        let mut reader = BufReader::with_capacity(self.options.suggested_read_buffer(), file);
        let mut buf = vec![0u8; entry.length as usize];
        reader.read_exact(&mut buf).await?;

        Ok(Some((entry, buf)))
    }

    /// Re-adds tentatively-dequeued entries to the head of the live FIFO, in their original
    /// order (the open question resolved in `DESIGN.md`: the *head*, not the tail).
    pub fn reinstate(&self, dequeued: &[Entry]) {
        let mut state = self.entry_state.lock();
        for entry in dequeued.iter().rev() {
            state.live_entries.push_front(*entry);
        }
    }

    /// Commits a batch of operations: appends and flushes the transaction log record, applies the
    /// operations to the live-range map, makes new enqueues visible for dequeue, rewrites the
    /// checkpoint, and retires any data file that just became fully free.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the log append fails; in that case no in-memory state is touched
    /// and the transaction is not committed.
    pub async fn commit_transaction(&self, ops: &[Operation]) -> Result<(), CoreError> {
        if ops.is_empty() {
            return Ok(());
        }

        let record = txlog::encode_transaction(ops);
        {
            let mut log_file = self.log_file.lock().await;
            log_file.write_all(&record).await?;
            log_file.flush().await?;
            log_file.sync_all().await?;
        }

        // Read before taking the entry-queue lock: writers never suspend while holding it.
        let current_write_file = self.writer_state.lock().await.current_write_file;

        let (retirable, transaction_id) = {
            let mut state = self.entry_state.lock();
            state.transaction_id += 1;

            for op in ops {
                match op.kind {
                    OperationKind::Enqueue => {
                        state
                            .live_ranges
                            .entry(op.file_number)
                            .or_default()
                            .push((op.start, op.length));
                        state.live_entries.push_back(Entry {
                            file_number: op.file_number,
                            start: op.start,
                            length: op.length,
                        });
                    }
                    OperationKind::Dequeue => {
                        if let Some(ranges) = state.live_ranges.get_mut(&op.file_number) {
                            if let Some(pos) = ranges
                                .iter()
                                .position(|&(s, l)| s == op.start && l == op.length)
                            {
                                ranges.remove(pos);
                            }
                        }
                    }
                }
            }

            let retirable: Vec<u32> = state
                .live_ranges
                .iter()
                .filter(|(&file_number, ranges)| {
                    ranges.is_empty()
                        && file_number < current_write_file
                        && state
                            .file_states
                            .get(&file_number)
                            .map_or(true, |s| *s != DataFileState::Retired && *s != DataFileState::Deleted)
                })
                .map(|(&file_number, _)| file_number)
                .collect();

            for &file_number in &retirable {
                state
                    .file_states
                    .insert(file_number, DataFileState::Retired);
            }

            (retirable, state.transaction_id)
        };

        if let Err(err) = self.rewrite_checkpoint_at(transaction_id).await {
            // Per §4.4 failure semantics: the transaction is already committed (the log is
            // authoritative); a checkpoint write failure is logged, not surfaced, and the
            // checkpoint will be rebuilt from the log on next open.
            warn!(error = %err, "failed to rewrite checkpoint after commit; will rebuild on next open");
        }

        for file_number in retirable {
            let path = self.root.join(data_file_name(file_number));
            if let Err(err) = self.driver.prepare_delete(&path).await {
                warn!(path = %path.display(), error = %err, "failed to stage retired data file for deletion");
            }
        }
        let failures = self.driver.finalise().await;
        if !failures.is_empty() {
            let first_error = failures[0].1.to_string();
            return Err(CoreError::PendingWriteFailure {
                failed: failures.len(),
                attempted: failures.len(),
                first_error,
            });
        }

        Ok(())
    }

    async fn rewrite_checkpoint(&self) -> Result<(), CoreError> {
        let state = self.entry_state.lock();
        let transaction_id = state.transaction_id;
        drop(state);
        self.rewrite_checkpoint_at(transaction_id).await
    }

    async fn rewrite_checkpoint_at(&self, transaction_id: u64) -> Result<(), CoreError> {
        let writer = self.writer_state.lock().await;
        let current_write_file = writer.current_write_file;
        let current_write_position = writer.current_write_position;
        drop(writer);

        let live_ranges = {
            let state = self.entry_state.lock();
            state
                .live_ranges
                .iter()
                .map(|(&file_number, ranges)| FileLiveRanges {
                    file_number,
                    live_ranges: ranges.clone(),
                })
                .collect()
        };

        let meta = MetaState {
            current_write_file,
            current_write_position,
            current_transaction_id: transaction_id,
            live_ranges,
        };

        self.checkpoint
            .save(&self.driver, &meta)
            .await
            .context(CheckpointSnafu)?;
        Ok(())
    }

    /// Sweeps data files that carry no live ranges, whether they're *behind* the recovered write
    /// file (fully drained by dequeues already in the log) or *ahead* of it: a session can roll
    /// over to `data.{N+1}` via an opportunistic write and then crash or dispose before any
    /// transaction referencing it commits, in which case recovery's log-derived write file
    /// reverts to `N` and the orphaned `data.{N+1}` is never mentioned by `live_ranges` at all.
    /// Left alone, that orphan would collide with the next legitimate rollover's `create_new`
    /// open and be mistaken for a concurrent writer.
    async fn sweep_retired_files(&self) -> Result<(), CoreError> {
        let current_write_file = self.writer_state.lock().await.current_write_file;

        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(dir_entry) = dir.next_entry().await? {
            let name = dir_entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            let Some(file_number) = parse_data_file_number(name) else {
                continue;
            };
            if file_number == current_write_file {
                continue;
            }

            let has_live = {
                let state = self.entry_state.lock();
                state
                    .live_ranges
                    .get(&file_number)
                    .map_or(false, |r| !r.is_empty())
            };

            if !has_live {
                let path = self.root.join(name);
                if let Err(err) = self.driver.prepare_delete(&path).await {
                    warn!(path = %path.display(), error = %err, "failed to stage stale data file for deletion");
                } else {
                    self.entry_state
                        .lock()
                        .file_states
                        .insert(file_number, DataFileState::Retired);
                }
            }
        }

        let failures = self.driver.finalise().await;
        if !failures.is_empty() {
            let first_error = failures[0].1.to_string();
            return Err(CoreError::PendingWriteFailure {
                failed: failures.len(),
                attempted: failures.len(),
                first_error,
            });
        }
        Ok(())
    }

    /// Releases the queue lock, allowing another process to open this directory.
    pub async fn dispose(&self) {
        let mut lock = self.lock.lock().await;
        if let Some(held) = lock.take() {
            let lock_path = self.root.join(lock::LOCK_FILE_NAME);
            lock::release(&self.driver, &lock_path, held).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn file_state(&self, file_number: u32) -> Option<DataFileState> {
        self.entry_state.lock().file_states.get(&file_number).copied()
    }
}

async fn read_whole_file_if_exists(path: &Path) -> io::Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

type LiveRanges = BTreeMap<u32, Vec<(u64, u32)>>;
type HighWaterMarks = BTreeMap<u32, u64>;

/// Replays the transaction log from offset 0, returning the reconstructed live-range map, the
/// per-file high-water mark (the highest byte ever written, live or not -- this is what the next
/// write must continue from), and the transaction counter.
async fn replay_log(
    log_bytes: &[u8],
    log_path: &Path,
    options: &QueueOptions,
    driver: &FileDriver,
) -> Result<(LiveRanges, HighWaterMarks, u64), CoreError> {
    let mut live_ranges: LiveRanges = BTreeMap::new();
    let mut high_water: HighWaterMarks = BTreeMap::new();
    let mut offset = 0usize;
    let mut index = 0u64;

    loop {
        match txlog::decode_next(log_bytes, offset, index + 1) {
            Ok(None) => break,
            Ok(Some(decoded)) => {
                index += 1;
                for op in &decoded.operations {
                    apply_operation(&mut live_ranges, &mut high_water, op);
                }
                offset = decoded.next_offset;
            }
            Err(err) => {
                use crate::config::TruncationPolicy;
                match options.truncation_policy() {
                    TruncationPolicy::Strict => {
                        return Err(CoreError::Unrecoverable {
                            reason: err.to_string(),
                        });
                    }
                    TruncationPolicy::AllowTruncatedEntries => {
                        warn!(
                            transaction = index + 1,
                            error = %err,
                            "truncating transaction log at last good boundary"
                        );
                        let truncated = log_bytes[..offset].to_vec();
                        driver.atomic_write(log_path, &truncated).await?;
                        break;
                    }
                }
            }
        }
    }

    Ok((live_ranges, high_water, index))
}

fn apply_operation(live_ranges: &mut LiveRanges, high_water: &mut HighWaterMarks, op: &Operation) {
    match op.kind {
        OperationKind::Enqueue => {
            live_ranges
                .entry(op.file_number)
                .or_default()
                .push((op.start, op.length));
            let hw = high_water.entry(op.file_number).or_insert(0);
            *hw = (*hw).max(op.start + op.length as u64);
        }
        OperationKind::Dequeue => {
            if let Some(ranges) = live_ranges.get_mut(&op.file_number) {
                if let Some(pos) = ranges
                    .iter()
                    .position(|&(s, l)| s == op.start && l == op.length)
                {
                    ranges.remove(pos);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
