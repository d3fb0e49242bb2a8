// Centralized constants for memoexec to avoid magic numbers

/// Default timeout for a remote action when the command sets none (10 minutes)
pub const DEFAULT_REMOTE_EXECUTION_TIMEOUT_SECS: u64 = 600;

/// Buffer size for streamed digesting and file reads (64 KB)
pub const DEFAULT_IO_BUFFER_SIZE: usize = 64 * 1024;

/// Default maximum number of attempts for a transient transport failure
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default initial backoff for requests in milliseconds
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Default maximum backoff limit in milliseconds
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 5000;

/// Upper bound on the summed blob size of one batch request (4 MB, the REAPI default)
pub const DEFAULT_MAX_BATCH_BYTES: usize = 4 * 1024 * 1024;

/// Upper bound on the number of blobs in one batch request
pub const DEFAULT_MAX_BATCH_BLOBS: usize = 50;

/// Chunk size for streamed blob reads and writes (1 MB)
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 1024 * 1024;

/// Number of digests sent per existence query
pub const DEFAULT_FIND_MISSING_BATCH: usize = 1000;

/// Cap on concurrent transfer requests made through one client and its clones
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 16;

/// Interval between operation status polls in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Default port for `memoexec serve`
pub const DEFAULT_SERVER_PORT: u16 = 8980;
