//! Filesystem primitives the rest of the crate builds on: atomic read/write of small files via
//! the `.old_copy` two-phase rename protocol, exclusive lock-file creation, and a two-phase
//! prepare/finalise delete so that irreversible actions are deferred until after a transaction
//! commits.
//!
//! All mutating operations serialize on a single process-wide async mutex (`FileDriver::guard`).
//! Public methods take the guard at their entry point; private `*_locked` helpers assume it is
//! already held, so nested calls never need a re-entrancy flag.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
    sync::Mutex,
};

const RETRY_ATTEMPTS: u32 = 10;
const RETRY_BACKOFF_UNIT: Duration = Duration::from_millis(100);

fn old_copy_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".old_copy");
    PathBuf::from(s)
}

async fn retry_io<F, Fut, T>(mut op: F) -> io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = io::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                warn!(attempt, error = %err, "transient I/O error, retrying");
                tokio::time::sleep(RETRY_BACKOFF_UNIT * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Like [`retry_io`], but treats [`io::ErrorKind::AlreadyExists`] as terminal instead of
/// transient: an exclusive-create racing another live holder is an expected outcome the caller
/// branches on (lock contention), not a transient failure worth a ~4.5s backoff before reporting.
async fn retry_io_unless_exists<F, Fut, T>(mut op: F) -> io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = io::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Err(err),
            Err(err) if attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                warn!(attempt, error = %err, "transient I/O error, retrying");
                tokio::time::sleep(RETRY_BACKOFF_UNIT * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Owns the process-wide filesystem mutex and the pending-delete list. One `FileDriver` is
/// created by `QueueCore::open` and held for the lifetime of the queue; it is never a global
/// singleton.
pub struct FileDriver {
    guard: Mutex<()>,
    pending_deletes: Mutex<Vec<PathBuf>>,
}

impl FileDriver {
    pub fn new() -> Self {
        Self {
            guard: Mutex::new(()),
            pending_deletes: Mutex::new(Vec::new()),
        }
    }

    /// Opens `path` for sequential read, first reconciling any stale `.old_copy` backup left
    /// behind by a torn `atomic_write`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error after exhausting the retry budget.
    pub async fn atomic_read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let _permit = self.guard.lock().await;
        self.atomic_read_locked(path).await
    }

    async fn atomic_read_locked(&self, path: &Path) -> io::Result<Vec<u8>> {
        let backup = old_copy_path(path);
        if fs::metadata(&backup).await.is_ok() {
            // The primary survived the last write; the backup is stale.
            let _ = fs::remove_file(&backup).await;
        }

        retry_io(|| async {
            let mut file = File::open(path).await?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).await?;
            Ok(buf)
        })
        .await
    }

    /// Atomically replaces the contents of `path`.
    ///
    /// (1) if `path` exists and `<path>.old_copy` does not, rename `path` to the backup; (2)
    /// create the parent directory if missing; (3) create `path` fresh; (4) invoke `writer` with
    /// the open file; (5) flush to disk; (6) delete the backup.
    ///
    /// # Errors
    ///
    /// Returns an I/O error after exhausting the retry budget. A crash between steps (1) and (6)
    /// leaves both files on disk; the next `atomic_read` or `atomic_write` treats `path` as
    /// authoritative and deletes the backup.
    pub async fn atomic_write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let _permit = self.guard.lock().await;
        self.atomic_write_locked(path, contents).await
    }

    async fn atomic_write_locked(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let backup = old_copy_path(path);

        retry_io(|| async {
            let primary_exists = fs::metadata(path).await.is_ok();
            let backup_exists = fs::metadata(&backup).await.is_ok();
            if primary_exists && !backup_exists {
                fs::rename(path, &backup).await?;
            }

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }

            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .await?;
            file.write_all(contents).await?;
            file.sync_all().await?;

            if fs::metadata(&backup).await.is_ok() {
                fs::remove_file(&backup).await?;
            }

            Ok(())
        })
        .await
    }

    /// Creates the lock file at `path` with exclusive-create semantics, returning the open
    /// handle. Stale-lock detection (content inspection, not OS range locking) lives in
    /// [`crate::lock`]; this method only performs the bare create-or-fail.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::AlreadyExists`] if the file is already present.
    pub async fn create_lock_file(&self, path: &Path) -> io::Result<File> {
        let _permit = self.guard.lock().await;
        self.create_lock_file_locked(path).await
    }

    async fn create_lock_file_locked(&self, path: &Path) -> io::Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // AlreadyExists here means "lock contention", a normal outcome the caller branches on,
        // not a transient failure -- retry everything else, but return that one immediately.
        retry_io_unless_exists(|| async {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)
                .await
        })
        .await
    }

    /// Removes an existing lock file whose contents identified a dead process, then retries the
    /// exclusive create.
    pub async fn replace_stale_lock_file(&self, path: &Path, contents: &[u8]) -> io::Result<File> {
        let _permit = self.guard.lock().await;
        let _ = fs::remove_file(path).await;
        let mut file = self.create_lock_file_locked(path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        Ok(file)
    }

    /// Renames `path` to a uniquely-suffixed neighbor and defers the actual delete until the
    /// next [`Self::finalise`] call, so that irreversible deletion only happens after the
    /// enclosing transaction has committed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the rename fails.
    pub async fn prepare_delete(&self, path: &Path) -> io::Result<()> {
        let _permit = self.guard.lock().await;
        let suffix = format!(".deleting.{}", std::process::id());
        let mut staged = path.as_os_str().to_owned();
        staged.push(suffix);
        let staged = PathBuf::from(staged);

        if fs::metadata(path).await.is_ok() {
            fs::rename(path, &staged).await?;
            self.pending_deletes.lock().await.push(staged);
        }
        Ok(())
    }

    /// Deletes every path staged by [`Self::prepare_delete`], in order. Failures are retried
    /// with linear backoff; paths that still fail remain pending so the next call retries them.
    ///
    /// # Errors
    ///
    /// Returns the accumulated list of `(path, error)` pairs that failed even after retrying.
    pub async fn finalise(&self) -> Vec<(PathBuf, io::Error)> {
        let mut pending = self.pending_deletes.lock().await;
        let staged = std::mem::take(&mut *pending);
        let mut still_pending = Vec::new();
        let mut failures = Vec::new();

        for path in staged {
            match retry_io(|| async { fs::remove_file(&path).await }).await {
                Ok(()) => {}
                Err(err) => {
                    error!(path = %path.display(), error = %err, "failed to finalise delete");
                    still_pending.push(path.clone());
                    failures.push((path, err));
                }
            }
        }

        *pending = still_pending;
        failures
    }

    /// Opens the transaction log for append-only, write-through access.
    pub async fn open_transaction_log(&self, path: &Path) -> io::Result<File> {
        let _permit = self.guard.lock().await;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        retry_io(|| async {
            OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(path)
                .await
        })
        .await
    }

    /// Opens a data file for sequential read.
    pub async fn open_read_stream(&self, path: &Path) -> io::Result<File> {
        let _permit = self.guard.lock().await;
        retry_io(|| File::open(path)).await
    }

    /// Opens the given data file for append-only write, creating it atomically (failing if it
    /// already exists) when `create_new` is set -- used when rolling over to the next data file
    /// so two sessions can never race to create the same file number.
    pub async fn open_write_stream(&self, path: &Path, create_new: bool) -> io::Result<File> {
        let _permit = self.guard.lock().await;
        retry_io(|| async {
            let mut options = OpenOptions::new();
            options.read(true).write(true).append(true);
            if create_new {
                options.create_new(true);
            } else {
                options.create(true);
            }
            options.open(path).await
        })
        .await
    }

    /// Removes a file outright, with no staging. Used for files that never had live entries
    /// (e.g. cleaning up a partially created data file from a crashed writer).
    pub async fn delete_file(&self, path: &Path) -> io::Result<()> {
        let _permit = self.guard.lock().await;
        retry_io(|| async { fs::remove_file(path).await }).await
    }
}

impl Default for FileDriver {
    fn default() -> Self {
        Self::new()
    }
}
