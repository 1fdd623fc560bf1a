//! Server configuration.
//!
//! The CLI-facing knobs (`port`, `worker_threads`) are a `clap::Parser`
//! derive in `kvcached-cli`. The cache-tuning knobs that have no CLI
//! surface (`inline_keylen`, `inline_vallen`, `pqueue_size`,
//! `swiper_interval`) are read from environment variables with the
//! `std::env::var(..).ok().and_then(|v| v.parse().ok()).unwrap_or(default)`
//! idiom.

use std::time::Duration;

/// Default inline key region size (bytes). Keys up to this length are
/// stored in the bucket body; longer keys go to the heap.
pub const DEFAULT_INLINE_KEYLEN: usize = 24;

/// Default inline value region size (bytes).
pub const DEFAULT_INLINE_VALLEN: usize = 48;

/// Default histogram width for per-probe-distance accounting.
pub const DEFAULT_PROBE_STATS_SIZE: usize = 512;

/// Default swiper pqueue size (bounded min-heap capacity for eviction
/// candidates).
pub const DEFAULT_PQUEUE_SIZE: usize = 256;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// TCP port to listen on. CLI `-p`, default 7500.
    pub port: u16,
    /// Number of worker threads in the accept-dispatch pool. CLI `-t`, default 1.
    pub worker_threads: usize,
    /// Target number of distinct objects; table capacity is derived from
    /// this as `round_up(num_objects * 10 / 7)`.
    pub num_objects: usize,
    /// Inline key region size in bytes.
    pub inline_keylen: usize,
    /// Inline value region size in bytes.
    pub inline_vallen: usize,
    /// Interval between swiper passes.
    pub swiper_interval: Duration,
    /// Bounded min-heap capacity used by the swiper's eviction pass.
    pub pqueue_size: usize,
}

impl ServerConfig {
    /// Builds a config from CLI-supplied port/worker_threads plus env-var
    /// overrides for the cache-tuning knobs, falling back to defaults.
    pub fn new(port: u16, worker_threads: usize) -> Self {
        ServerConfig {
            port,
            worker_threads: worker_threads.max(1),
            num_objects: env_usize("KVCACHED_NUM_OBJECTS", 1 << 20),
            inline_keylen: env_usize("KVCACHED_INLINE_KEYLEN", DEFAULT_INLINE_KEYLEN),
            inline_vallen: env_usize("KVCACHED_INLINE_VALLEN", DEFAULT_INLINE_VALLEN),
            swiper_interval: Duration::from_millis(env_u64(
                "KVCACHED_SWIPER_INTERVAL_MS",
                1_000,
            )),
            pqueue_size: env_usize("KVCACHED_PQUEUE_SIZE", DEFAULT_PQUEUE_SIZE),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::new(7500, 1)
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_spec_cli_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 7500);
        assert_eq!(cfg.worker_threads, 1);
    }

    #[test]
    fn test_worker_threads_floor_is_one() {
        let cfg = ServerConfig::new(7500, 0);
        assert_eq!(cfg.worker_threads, 1);
    }
}
