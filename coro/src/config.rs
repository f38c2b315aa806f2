//! Host configuration.
//!
//! [`HostConfig`] controls the thread layout of the reference [`World`](crate::World)
//! host. Fields are public; start from [`Default::default()`] or
//! [`HostConfig::from_env()`] and override what you need.

/// Environment variable overriding [`HostConfig::worker_threads`].
pub const WORKERS_ENV: &str = "REDLILIUM_CORO_WORKERS";
/// Environment variable overriding [`HostConfig::io_worker_threads`].
pub const IO_WORKERS_ENV: &str = "REDLILIUM_CORO_IO_WORKERS";

/// Thread layout of a host environment.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Number of worker pool threads. `None` uses
    /// [`std::thread::available_parallelism`]. Default: `None`.
    pub worker_threads: Option<usize>,
    /// Number of tokio worker threads driving [`IoRuntime`](crate::IoRuntime)
    /// futures. Default: 1.
    pub io_worker_threads: usize,
    /// Prefix for names of threads spawned by the host. Default: `"coro"`.
    pub thread_name_prefix: String,
    /// How many times shutdown drains the game-thread queue and the latent
    /// action list while tearing down coroutines. Default: 8.
    pub shutdown_drain_rounds: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            io_worker_threads: 1,
            thread_name_prefix: "coro".to_owned(),
            shutdown_drain_rounds: 8,
        }
    }
}

impl HostConfig {
    /// Defaults overlaid with [`WORKERS_ENV`] and [`IO_WORKERS_ENV`].
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(workers) = read_count(WORKERS_ENV) {
            config.worker_threads = Some(workers);
        }
        if let Some(io_workers) = read_count(IO_WORKERS_ENV) {
            config.io_worker_threads = io_workers;
        }
        config
    }

    /// Sets a fixed worker pool size.
    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    /// Sets the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub(crate) fn effective_workers(&self) -> usize {
        self.worker_threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }
}

fn read_count(var: &str) -> Option<usize> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => {
            log::warn!("Ignoring invalid {var}={raw:?}, expected a positive integer");
            None
        }
        Ok(n) => Some(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = HostConfig::default();
        assert_eq!(config.worker_threads, None);
        assert_eq!(config.io_worker_threads, 1);
        assert!(config.effective_workers() >= 1);
    }

    #[test]
    fn builder_overrides() {
        let config = HostConfig::default()
            .with_worker_threads(3)
            .with_thread_name_prefix("test");
        assert_eq!(config.effective_workers(), 3);
        assert_eq!(config.thread_name_prefix, "test");
    }

    #[test]
    fn zero_workers_clamped() {
        let config = HostConfig::default().with_worker_threads(0);
        assert_eq!(config.effective_workers(), 1);
    }
}
