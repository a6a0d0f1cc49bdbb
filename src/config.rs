use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Default rollover size for a single `data.NNNN` file.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 128 * 1024 * 1024;
/// Default opportunistic-flush threshold for a session's enqueue buffer.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 128 * 1024;
/// Session buffers are never allowed to flush more eagerly than this floor.
pub const MIN_WRITE_BUFFER_SIZE: usize = 64 * 1024;
/// Default wait, per batch of pending writes, during `Session::flush`.
pub const DEFAULT_TIMEOUT_LIMIT_MS: u64 = 5_000;
/// Default read-stream buffer size hint.
pub const DEFAULT_SUGGESTED_READ_BUFFER: usize = 64 * 1024;
/// Default minimum spacing between data-file fsyncs triggered by opportunistic writes.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 500;
/// Maximum number of pending-write handles awaited per batch during flush.
pub const PENDING_WRITE_BATCH_SIZE: usize = 32;

/// Recovery policy applied when the transaction log's tail is truncated or corrupted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TruncationPolicy {
    /// Refuse to open; recovery fails with an `Unrecoverable` error naming the bad transaction.
    Strict,
    /// Truncate the log at the last good transaction boundary and continue.
    AllowTruncatedEntries,
}

impl Default for TruncationPolicy {
    fn default() -> Self {
        TruncationPolicy::Strict
    }
}

/// Runtime configuration for a [`crate::Queue`].
#[derive(Clone, Debug)]
pub struct QueueOptions {
    pub(crate) root: PathBuf,
    pub(crate) max_file_size: u64,
    pub(crate) write_buffer_size: usize,
    pub(crate) truncation_policy: TruncationPolicy,
    pub(crate) timeout_limit: Duration,
    pub(crate) suggested_read_buffer: usize,
    pub(crate) flush_interval: Duration,
}

impl QueueOptions {
    /// Starts building options for a queue rooted at `root`.
    pub fn from_path<P: AsRef<Path>>(root: P) -> QueueOptionsBuilder {
        QueueOptionsBuilder {
            root: root.as_ref().to_path_buf(),
            max_file_size: None,
            write_buffer_size: None,
            allow_truncated_entries: None,
            timeout_limit_ms: None,
            suggested_read_buffer: None,
            flush_interval_ms: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn write_buffer_size(&self) -> usize {
        self.write_buffer_size
    }

    pub fn truncation_policy(&self) -> TruncationPolicy {
        self.truncation_policy
    }

    pub fn timeout_limit(&self) -> Duration {
        self.timeout_limit
    }

    pub fn suggested_read_buffer(&self) -> usize {
        self.suggested_read_buffer
    }

    /// Minimum spacing between data-file fsyncs triggered by opportunistic writes. Does not
    /// affect the transaction log append on commit, which is always synced.
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }
}

/// Fluent builder for [`QueueOptions`], mirroring the clamp-and-validate pattern used
/// throughout this crate's ancestry for buffer configuration.
#[derive(Clone, Debug)]
pub struct QueueOptionsBuilder {
    root: PathBuf,
    max_file_size: Option<u64>,
    write_buffer_size: Option<usize>,
    allow_truncated_entries: Option<bool>,
    timeout_limit_ms: Option<u64>,
    suggested_read_buffer: Option<usize>,
    flush_interval_ms: Option<u64>,
}

impl QueueOptionsBuilder {
    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = Some(bytes);
        self
    }

    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = Some(bytes);
        self
    }

    pub fn allow_truncated_entries(mut self, allow: bool) -> Self {
        self.allow_truncated_entries = Some(allow);
        self
    }

    pub fn timeout_limit_ms(mut self, ms: u64) -> Self {
        self.timeout_limit_ms = Some(ms);
        self
    }

    pub fn suggested_read_buffer(mut self, bytes: usize) -> Self {
        self.suggested_read_buffer = Some(bytes);
        self
    }

    pub fn flush_interval_ms(mut self, ms: u64) -> Self {
        self.flush_interval_ms = Some(ms);
        self
    }

    /// Validates and clamps the configured values, producing an immutable [`QueueOptions`].
    ///
    /// # Errors
    ///
    /// Returns an `InvalidArgument` error if `max_file_size` is zero.
    pub fn build(self) -> Result<QueueOptions, crate::error::QueueError> {
        let max_file_size = self.max_file_size.unwrap_or(DEFAULT_MAX_FILE_SIZE);
        if max_file_size == 0 {
            return Err(crate::error::QueueError::InvalidArgument {
                message: "max_file_size must be greater than zero".to_string(),
            });
        }

        let write_buffer_size = self
            .write_buffer_size
            .unwrap_or(DEFAULT_WRITE_BUFFER_SIZE)
            .max(MIN_WRITE_BUFFER_SIZE);

        let truncation_policy = if self.allow_truncated_entries.unwrap_or(false) {
            TruncationPolicy::AllowTruncatedEntries
        } else {
            TruncationPolicy::Strict
        };

        let timeout_limit =
            Duration::from_millis(self.timeout_limit_ms.unwrap_or(DEFAULT_TIMEOUT_LIMIT_MS));
        let suggested_read_buffer = self
            .suggested_read_buffer
            .unwrap_or(DEFAULT_SUGGESTED_READ_BUFFER);
        let flush_interval =
            Duration::from_millis(self.flush_interval_ms.unwrap_or(DEFAULT_FLUSH_INTERVAL_MS));

        Ok(QueueOptions {
            root: self.root,
            max_file_size,
            write_buffer_size,
            truncation_policy,
            timeout_limit,
            suggested_read_buffer,
            flush_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_buffer_size_is_clamped_to_floor() {
        let opts = QueueOptions::from_path("/tmp/whatever")
            .write_buffer_size(1024)
            .build()
            .expect("valid options");
        assert_eq!(opts.write_buffer_size(), MIN_WRITE_BUFFER_SIZE);
    }

    #[test]
    fn zero_max_file_size_is_rejected() {
        let result = QueueOptions::from_path("/tmp/whatever")
            .max_file_size(0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn defaults_apply_when_unset() {
        let opts = QueueOptions::from_path("/tmp/whatever")
            .build()
            .expect("valid options");
        assert_eq!(opts.max_file_size(), DEFAULT_MAX_FILE_SIZE);
        assert_eq!(opts.truncation_policy(), TruncationPolicy::Strict);
        assert_eq!(
            opts.flush_interval(),
            Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS)
        );
    }

    #[test]
    fn flush_interval_is_configurable() {
        let opts = QueueOptions::from_path("/tmp/whatever")
            .flush_interval_ms(10)
            .build()
            .expect("valid options");
        assert_eq!(opts.flush_interval(), Duration::from_millis(10));
    }
}
