use super::job::{Callback, Envelope, Job};
use crossbeam::channel::Receiver;
use std::sync::Arc;


/// One published version of the state every worker runs against.
///
/// Versions are never mutated once built. `with_callback` produces the next
/// version; the queue receiver is carried over so every version drains the
/// same queue.
pub(crate) struct State<J: Job> {
    pub(crate) callbacks: Vec<Callback<J>>,
    pub(crate) queue: Receiver<Envelope<J>>,
}

impl<J: Job> State<J> {
    pub(crate) fn new(queue: Receiver<Envelope<J>>) -> Arc<Self> {
        Arc::new(Self {
            callbacks: Vec::new(),
            queue,
        })
    }

    pub(crate) fn with_callback(&self, callback: Callback<J>) -> Arc<Self> {
        let mut callbacks = Vec::with_capacity(self.callbacks.len() + 1);
        callbacks.extend(self.callbacks.iter().cloned());
        callbacks.push(callback);
        Arc::new(Self {
            callbacks,
            queue: self.queue.clone(),
        })
    }

    /// Runs every callback on `job`, in registration order.
    #[inline]
    pub(crate) fn prepare(&self, job: &mut J) {
        for callback in &self.callbacks {
            callback(job);
        }
    }
}
