/// Returned on a job's result channel when the factory shut down before the
/// job could be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, thiserror::Error)]
#[error("factory closed before job could be handled")]
pub struct ClosedFactoryError;

/// Outcome of a dispatched job other than success.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum JobError<E> {
    #[error(transparent)]
    Closed(#[from] ClosedFactoryError),
    #[error("job failed: {0}")]
    Failed(E),
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error("job was dropped before reporting a result")]
    Abandoned,
    #[error("timed out waiting for job result")]
    Timeout,
}

impl<E> JobError<E> {
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, JobError::Closed(_))
    }

    /// The job's own error, if that is what was reported.
    pub fn into_failure(self) -> Option<E> {
        match self {
            JobError::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Construction failures.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("factory needs at least one worker")]
    NoWorkers,
    #[error("thread name {0:?} contains a NUL byte")]
    InvalidThreadName(String),
    #[error("failed to spawn factory thread: {0}")]
    Spawn(#[from] std::io::Error),
}
