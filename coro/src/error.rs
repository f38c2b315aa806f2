use thiserror::Error;

/// Why a finished coroutine has no result.
///
/// Returned by [`Coroutine::result`](crate::Coroutine::result) and
/// [`Coroutine::take_result`](crate::Coroutine::take_result). Cancellation
/// is an ordinary way for a coroutine to end; it only shows up here because
/// a canceled coroutine never produced a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoroutineError {
    /// The coroutine was destroyed at a suspension point before returning.
    #[error("coroutine was canceled")]
    Canceled,
    /// The coroutine body panicked. The payload message is kept.
    #[error("coroutine panicked: {0}")]
    Panicked(String),
    /// The coroutine refused to start (invalid owner or duplicate latent action).
    #[error("coroutine was not started")]
    NotStarted,
    /// The result was already moved out with `take_result`.
    #[error("coroutine result was already taken")]
    ResultTaken,
}

/// Errors raised while building a host environment.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Failed to spawn thread '{name}': {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to create IO runtime: {0}")]
    IoRuntime(#[source] std::io::Error),
}

pub type HostResult<T> = Result<T, HostError>;
