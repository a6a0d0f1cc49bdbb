//! Lock file content and stale-lock detection.
//!
//! Unlike an OS advisory range lock, the `lock` file's *contents* are the source of truth:
//! `{process_id, thread_id, process_start_time_ms}`. Opening the queue inspects an existing
//! lock file's payload and decides whether its owner is still alive before treating the
//! directory as contended.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use sysinfo::{Pid, System};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::fs::FileDriver;

pub const LOCK_FILE_NAME: &str = "lock";

/// Errors produced while acquiring or inspecting the queue directory's exclusive lock.
#[derive(Debug, Snafu)]
pub enum LockError {
    #[snafu(display("lock file I/O error: {}", source))]
    Io { source: io::Error },

    #[snafu(display("queue directory already locked by this thread"))]
    AlreadyLockedByThisThread,

    #[snafu(display("queue directory already locked by another thread in this process"))]
    AlreadyLockedByThisProcess,

    #[snafu(display("queue directory already locked by running process {}", pid))]
    AlreadyLockedByOtherProcess { pid: i32 },

    #[snafu(display("lock file contents are corrupt: {}", reason))]
    Corrupt { reason: String },
}

/// On-disk payload of the `lock` file: `{process_id, thread_id, process_start_time_ms}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockFileData {
    pub process_id: i32,
    pub thread_id: i32,
    pub process_start_time_ms: i64,
}

impl LockFileData {
    /// Builds the payload describing the current process/thread.
    pub fn current() -> Self {
        LockFileData {
            process_id: std::process::id() as i32,
            thread_id: current_thread_id(),
            process_start_time_ms: current_process_start_time_ms(),
        }
    }

    fn encode(self) -> Vec<u8> {
        bincode::serialize(&self).expect("LockFileData encoding is infallible")
    }

    fn decode(bytes: &[u8]) -> Result<Self, LockError> {
        bincode::deserialize(bytes).map_err(|e| LockError::Corrupt {
            reason: e.to_string(),
        })
    }
}

/// Rust has no stable, portable numeric thread id; a process-local counter assigned once per
/// thread is enough to distinguish "this thread" from "another thread in this process" for
/// lock-contention classification.
fn current_thread_id() -> i32 {
    use std::cell::Cell;

    static NEXT: AtomicI32 = AtomicI32::new(1);
    thread_local! {
        static ID: Cell<i32> = const { Cell::new(0) };
    }

    ID.with(|id| {
        let current = id.get();
        if current != 0 {
            return current;
        }
        let assigned = NEXT.fetch_add(1, Ordering::Relaxed);
        id.set(assigned);
        assigned
    })
}

fn current_process_start_time_ms() -> i64 {
    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    let pid = Pid::from_u32(std::process::id());
    system
        .process(pid)
        .map(|p| (p.start_time() as i64) * 1000)
        .unwrap_or(0)
}

fn process_is_alive(pid: i32, expected_start_time_ms: i64) -> bool {
    if pid <= 0 {
        return false;
    }
    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    match system.process(Pid::from_u32(pid as u32)) {
        Some(process) => (process.start_time() as i64) * 1000 == expected_start_time_ms,
        None => false,
    }
}

/// Outcome of inspecting an existing lock file.
enum Disposition {
    SameThread,
    SameProcessOtherThread,
    OtherLiveProcess { pid: i32 },
    Stale,
}

fn classify(existing: LockFileData, current: LockFileData) -> Disposition {
    if existing.process_id == current.process_id && existing.thread_id == current.thread_id {
        return Disposition::SameThread;
    }
    if existing.process_id == current.process_id {
        return Disposition::SameProcessOtherThread;
    }
    if process_is_alive(existing.process_id, existing.process_start_time_ms) {
        return Disposition::OtherLiveProcess {
            pid: existing.process_id,
        };
    }
    Disposition::Stale
}

/// A held lock on the queue directory. Dropping it does not remove the file -- the queue
/// explicitly deletes it on dispose so that a process killed without unwinding leaves a lock
/// file behind for the next opener's staleness check.
pub struct QueueLock {
    _file: tokio::fs::File,
}

/// Acquires the queue directory's lock file, replacing it if its recorded owner is no longer
/// running.
///
/// # Errors
///
/// Returns [`LockError::AlreadyLockedByOtherProcess`] (and friends) if a live owner holds the
/// lock, or an I/O error if the file cannot be created or read.
pub async fn acquire(
    driver: &FileDriver,
    lock_path: &std::path::Path,
) -> Result<QueueLock, LockError> {
    let current = LockFileData::current();
    match driver.create_lock_file(lock_path).await {
        Ok(mut file) => {
            file.write_all(&current.encode()).await.context(IoSnafu)?;
            file.sync_all().await.context(IoSnafu)?;
            Ok(QueueLock { _file: file })
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let mut existing_file = tokio::fs::File::open(lock_path)
                .await
                .context(IoSnafu)?;
            let mut buf = Vec::new();
            existing_file
                .read_to_end(&mut buf)
                .await
                .context(IoSnafu)?;
            let existing = LockFileData::decode(&buf)?;

            match classify(existing, current) {
                Disposition::SameThread => Err(LockError::AlreadyLockedByThisThread),
                Disposition::SameProcessOtherThread => Err(LockError::AlreadyLockedByThisProcess),
                Disposition::OtherLiveProcess { pid } => {
                    Err(LockError::AlreadyLockedByOtherProcess { pid })
                }
                Disposition::Stale => {
                    warn!(pid = existing.process_id, "replacing stale lock file");
                    let file = driver
                        .replace_stale_lock_file(lock_path, &current.encode())
                        .await
                        .context(IoSnafu)?;
                    Ok(QueueLock { _file: file })
                }
            }
        }
        Err(err) => Err(LockError::Io { source: err }),
    }
}

/// Releases the lock by removing the lock file, called on explicit queue dispose.
pub async fn release(driver: &FileDriver, lock_path: &std::path::Path, lock: QueueLock) {
    drop(lock);
    if let Err(err) = driver.delete_file(lock_path).await {
        warn!(error = %err, "failed to remove lock file on dispose");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_same_thread_same_process() {
        let data = LockFileData {
            process_id: 42,
            thread_id: 7,
            process_start_time_ms: 1000,
        };
        assert!(matches!(classify(data, data), Disposition::SameThread));
    }

    #[test]
    fn classify_same_process_other_thread() {
        let existing = LockFileData {
            process_id: 42,
            thread_id: 7,
            process_start_time_ms: 1000,
        };
        let current = LockFileData {
            process_id: 42,
            thread_id: 8,
            process_start_time_ms: 1000,
        };
        assert!(matches!(
            classify(existing, current),
            Disposition::SameProcessOtherThread
        ));
    }

    #[test]
    fn classify_dead_process_is_stale() {
        let existing = LockFileData {
            process_id: i32::MAX,
            thread_id: 1,
            process_start_time_ms: 123,
        };
        let current = LockFileData {
            process_id: 99,
            thread_id: 1,
            process_start_time_ms: 456,
        };
        assert!(matches!(classify(existing, current), Disposition::Stale));
    }

    #[test]
    fn round_trip_encode_decode() {
        let data = LockFileData {
            process_id: 1234,
            thread_id: 5,
            process_start_time_ms: 999_999,
        };
        let encoded = data.encode();
        let decoded = LockFileData::decode(&encoded).expect("decodes");
        assert_eq!(data, decoded);
    }
}
