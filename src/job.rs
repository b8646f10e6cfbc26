use super::{
    errors::{ClosedFactoryError, JobError},
    handle::JobHandle,
    model::Counters,
    result::JobResult,
};
use std::sync::Arc;
use tokio::sync::oneshot;


/// A unit of work handed to a [`Factory`](crate::Factory).
///
/// Registered callbacks receive the job by mutable reference before
/// [`process`](Job::process) runs, so pre-processing is done by mutating the
/// job in place.
pub trait Job: Send + 'static {
    type Error: Send + 'static;

    fn process(&mut self) -> Result<(), Self::Error>;
}

/// Pre-processing hook applied to every job before it is processed.
pub type Callback<J> = Arc<dyn Fn(&mut J) + Send + Sync + 'static>;


/// A job paired with the channel its outcome is reported on.
pub(crate) struct Envelope<J: Job> {
    pub(crate) job: J,
    result: oneshot::Sender<JobResult<J::Error>>,
}

impl<J: Job> Envelope<J> {
    pub(crate) fn new(job: J) -> (Self, JobHandle<J::Error>) {
        let (tx, rx) = oneshot::channel();
        (Self { job, result: tx }, JobHandle::new(rx))
    }

    /// Reports the outcome. Consumes the envelope so a result is sent once.
    pub(crate) fn complete(self, result: JobResult<J::Error>) {
        // The caller may have dropped its handle; nobody is left to tell.
        let _ = self.result.send(result);
    }

    pub(crate) fn reject(self, counters: &Counters) {
        counters.record_rejected();
        self.complete(Err(JobError::Closed(ClosedFactoryError)));
    }
}
