//! Global constants used throughout the stackplan codebase.
//!
//! Retry parameters, concurrency defaults and naming defaults live here so the
//! numbers are discoverable in one place.

/// Starting delay for exponential backoff between provisioning retries (200ms).
pub const STARTING_BACKOFF_DELAY_MS: u64 = 200;

/// Maximum backoff delay between provisioning retries (30 seconds).
///
/// Throttled control planes often ask callers to back off for tens of seconds.
pub const MAX_BACKOFF_DELAY_MS: u64 = 30_000;

/// Default number of attempts for a retryable provisioning error, including the first.
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Minimum number of parallel node applies regardless of CPU count.
///
/// Provisioning calls are long-running network operations, so parallelism is not
/// bound by local cores.
pub const MIN_PARALLELISM: usize = 10;

/// Multiplier applied to CPU core count for default parallelism.
pub const PARALLELISM_CORE_MULTIPLIER: usize = 2;

/// Default CPU core count when detection fails.
pub const FALLBACK_CORE_COUNT: usize = 4;

/// Default number of hex characters of the scope hash appended to computed names.
pub const DEFAULT_NAME_HASH_LENGTH: usize = 8;

/// Default maximum length of a computed resource name.
pub const DEFAULT_NAME_MAX_LENGTH: usize = 63;

/// Name of the root module scope.
pub const ROOT_SCOPE: &str = "main";

/// Separator between a module instance id and its child ids in qualified node ids.
pub const SCOPE_SEPARATOR: char = '/';

/// Default parallelism: `max(MIN_PARALLELISM, cores * PARALLELISM_CORE_MULTIPLIER)`.
#[must_use]
pub fn default_max_concurrency() -> usize {
    let cores = std::thread::available_parallelism().map_or(FALLBACK_CORE_COUNT, usize::from);
    std::cmp::max(MIN_PARALLELISM, cores * PARALLELISM_CORE_MULTIPLIER)
}
