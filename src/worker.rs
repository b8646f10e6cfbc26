use super::{
    errors::JobError,
    job::{Envelope, Job},
    model::Counters,
    state::State,
};
use crossbeam::channel::{self, select, Receiver, Sender};
use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};


/// Manager-side handle used to stop a worker and wait for it to exit.
pub(crate) struct WorkerHandle {
    id: usize,
    stop: Option<Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Manager-side half of the update handshake.
///
/// An update is a request rendezvous followed by a data rendezvous. The
/// worker only accepts the request while idle at the top of its loop, so a
/// job never runs against a half-installed callback list.
pub(crate) struct WorkerUpdater<J: Job> {
    id: usize,
    request: Sender<()>,
    data: Sender<Arc<State<J>>>,
}

struct Worker<J: Job> {
    id: usize,
    state: Arc<State<J>>,
    update: Receiver<()>,
    data: Receiver<Arc<State<J>>>,
    stop: Receiver<()>,
    counters: Arc<Counters>,
}


pub(crate) fn spawn<J: Job>(
    id: usize,
    name: String,
    state: Arc<State<J>>,
    counters: Arc<Counters>,
) -> io::Result<(WorkerHandle, WorkerUpdater<J>)> {
    let (request_tx, request_rx) = channel::bounded(0);
    let (data_tx, data_rx) = channel::bounded(0);
    let (stop_tx, stop_rx) = channel::bounded(0);

    let worker = Worker {
        id,
        state,
        update: request_rx,
        data: data_rx,
        stop: stop_rx,
        counters,
    };
    let thread = thread::Builder::new()
        .name(name)
        .spawn(move || worker.run())?;

    let handle = WorkerHandle {
        id,
        stop: Some(stop_tx),
        thread: Some(thread),
    };
    let updater = WorkerUpdater {
        id,
        request: request_tx,
        data: data_tx,
    };
    Ok((handle, updater))
}


impl<J: Job> Worker<J> {
    fn run(self) {
        let Worker { id, mut state, update, data, stop, counters } = self;
        // Every version shares this receiver.
        let queue = state.queue.clone();
        tracing::debug!("Worker {id} started");

        loop {
            select! {
                recv(queue) -> msg => match msg {
                    Ok(envelope) => execute(id, &state, envelope, &counters),
                    Err(_) => break,
                },
                recv(update) -> msg => match msg {
                    Ok(()) => {
                        if let Ok(next) = data.recv() {
                            state = next;
                            tracing::debug!(
                                "Worker {id} installed {} callbacks",
                                state.callbacks.len()
                            );
                        }
                    }
                    // Updater dropped: the factory is gone, same as a stop.
                    Err(_) => {
                        drain_one(&queue, &counters);
                        break;
                    }
                },
                recv(stop) -> _ => {
                    drain_one(&queue, &counters);
                    break;
                },
            }
        }

        tracing::debug!("Worker {id} stopped");
    }
}

fn execute<J: Job>(id: usize, state: &State<J>, mut envelope: Envelope<J>, counters: &Counters) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        state.prepare(&mut envelope.job);
        envelope.job.process()
    }));

    let result = match outcome {
        Ok(Ok(())) => {
            counters.record_succeeded();
            Ok(())
        }
        Ok(Err(e)) => {
            counters.record_failed();
            Err(JobError::Failed(e))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::warn!("Worker {id} caught panic in job: {message}");
            counters.record_failed();
            Err(JobError::Panicked(message))
        }
    };
    envelope.complete(result);
}

/// Fails a job that is already sitting in the queue when a worker stops.
fn drain_one<J: Job>(queue: &Receiver<Envelope<J>>, counters: &Counters) {
    if let Ok(envelope) = queue.try_recv() {
        tracing::debug!("Rejecting job queued at stop");
        envelope.reject(counters);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}


impl WorkerHandle {
    #[inline]
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.is_none()
    }

    /// Asks the worker to stop after its current job. Idempotent.
    pub(crate) fn stop(&mut self) {
        // Disconnecting the channel is the signal.
        self.stop.take();
    }

    /// Waits for the worker thread to exit. Idempotent.
    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Worker {} terminated abnormally", self.id);
            }
        }
    }
}

impl<J: Job> WorkerUpdater<J> {
    /// Drives the handshake. Returns `false` when the worker has already
    /// exited, in which case the update is dropped.
    pub(crate) fn update(&self, state: Arc<State<J>>) -> bool {
        if self.request.send(()).is_err() {
            tracing::debug!("Worker {} gone, skipping update", self.id);
            return false;
        }
        self.data.send(state).is_ok()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        value: i64,
        seen: Arc<Mutex<Vec<i64>>>,
    }

    impl Job for Recorder {
        type Error = String;

        fn process(&mut self) -> Result<(), String> {
            self.seen.lock().unwrap().push(self.value);
            Ok(())
        }
    }

    fn recorder(value: i64, seen: &Arc<Mutex<Vec<i64>>>) -> Recorder {
        Recorder { value, seen: seen.clone() }
    }

    #[test]
    fn update_is_applied_before_next_job() {
        let (queue_tx, queue_rx) = channel::bounded(1);
        let state = State::<Recorder>::new(queue_rx);
        let counters = Arc::new(Counters::default());
        let (mut handle, updater) =
            spawn(0, "test-worker".into(), state.clone(), counters).unwrap();

        let next = state.with_callback(Arc::new(|job: &mut Recorder| job.value += 5));
        assert!(updater.update(next));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (envelope, job_handle) = Envelope::new(recorder(2, &seen));
        queue_tx.send(envelope).unwrap();
        assert_eq!(job_handle.wait(), Ok(()));
        assert_eq!(*seen.lock().unwrap(), vec![7]);

        handle.stop();
        handle.join();
    }

    #[test]
    fn stopped_worker_ignores_update_and_stop() {
        let (_queue_tx, queue_rx) = channel::bounded::<Envelope<Recorder>>(1);
        let state = State::new(queue_rx);
        let counters = Arc::new(Counters::default());
        let (mut handle, updater) =
            spawn(3, "test-worker".into(), state.clone(), counters).unwrap();

        assert_eq!(handle.id(), 3);
        assert!(!handle.is_stopped());
        handle.stop();
        assert!(handle.is_stopped());
        handle.join();

        // Would block forever without the disconnect guard.
        assert!(!updater.update(state));
        // Neither call may panic on an exited worker.
        handle.stop();
        handle.join();
    }

    #[test]
    fn drain_rejects_queued_job() {
        let (queue_tx, queue_rx) = channel::bounded(1);
        let counters = Counters::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (envelope, job_handle) = Envelope::new(recorder(1, &seen));
        queue_tx.send(envelope).unwrap();

        drain_one(&queue_rx, &counters);
        assert!(queue_rx.is_empty());
        // A second drain on an empty queue rejects nothing.
        drain_one(&queue_rx, &counters);
        assert!(job_handle.wait().unwrap_err().is_closed());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(counters.snapshot(1, 0).rejected, 1);
    }

    #[test]
    fn panicking_job_is_reported() {
        struct Boom;
        impl Job for Boom {
            type Error = ();
            fn process(&mut self) -> Result<(), ()> {
                panic!("boom")
            }
        }

        let (queue_tx, queue_rx) = channel::bounded(1);
        let counters = Arc::new(Counters::default());
        let (mut handle, _updater) =
            spawn(0, "test-worker".into(), State::new(queue_rx), counters.clone()).unwrap();

        let (envelope, job_handle) = Envelope::new(Boom);
        queue_tx.send(envelope).unwrap();
        assert_eq!(job_handle.wait(), Err(JobError::Panicked("boom".into())));

        // The worker survives and keeps serving.
        let (envelope, job_handle) = Envelope::new(Boom);
        queue_tx.send(envelope).unwrap();
        assert!(matches!(job_handle.wait(), Err(JobError::Panicked(_))));
        assert_eq!(counters.snapshot(1, 0).failed, 2);

        handle.stop();
        handle.join();
    }
}
