use super::{
    errors::JobError,
    result::JobResult,
};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll}
};
use tokio::{
    sync::oneshot::{self, error::TryRecvError},
    time::Duration,
};


/// Single-use handle on the outcome of a dispatched job.
///
/// Resolves exactly once: `Ok(())` when the job processed successfully,
/// otherwise the [`JobError`] describing why it did not.
#[must_use = "a dispatched job reports its outcome only through its handle"]
pub struct JobHandle<E> {
    receiver: oneshot::Receiver<JobResult<E>>,
}

impl<E> JobHandle<E> {

    pub(crate) fn new(receiver: oneshot::Receiver<JobResult<E>>) -> Self {
        Self { receiver }
    }

    /// Blocks the current thread until the job reports.
    ///
    /// # Panics
    /// Panics when called from within an asynchronous execution context;
    /// `.await` the handle there instead.
    pub fn wait(self) -> JobResult<E> {
        self.receiver.blocking_recv().unwrap_or(Err(JobError::Abandoned))
    }

    /// Returns the outcome if the job has already reported.
    pub fn try_result(&mut self) -> Option<JobResult<E>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(JobError::Abandoned)),
        }
    }

    pub async fn await_timeout(self, timeout: Duration) -> JobResult<E> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(JobError::Abandoned),
            Err(_) => Err(JobError::Timeout),
        }
    }
}

impl<E> Future for JobHandle<E> {
    type Output = JobResult<E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(res) => Poll::Ready(res.unwrap_or(Err(JobError::Abandoned))),
            Poll::Pending => Poll::Pending,
        }
    }
}
