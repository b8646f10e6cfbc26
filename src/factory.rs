use super::{
    errors::FactoryError,
    handle::JobHandle,
    job::{Envelope, Job},
    model::{Counters, FactoryMetrics},
    state::State,
    worker::{self, WorkerHandle, WorkerUpdater},
};
use crossbeam::channel::{self, select, Receiver, Select, SelectedOperation, SendError, Sender};
use futures::{
    executor::block_on,
    future::{select as first_of, Either},
};
use parking_lot::Mutex;
use std::{
    pin::pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};
use tokio_util::sync::CancellationToken;

/// Factory configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker threads, also the depth of the job queue.
    pub workers: usize,
    /// Prefix for the names of every thread the factory spawns.
    pub thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: num_cpus::get() * 2, // jobs that block on I/O
            thread_name: "job-factory".to_string(),
        }
    }
}

impl Config {
    pub fn cpu_bound() -> Self {
        Self {
            workers: num_cpus::get(),
            ..Default::default()
        }
    }

    pub fn io_bound() -> Self {
        Self {
            workers: num_cpus::get() * 2,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

/// Everything `register` and `close` serialize on.
struct Registry<J: Job> {
    closed: bool,
    state: Arc<State<J>>,
    updaters: Vec<WorkerUpdater<J>>,
    // Dropped exactly once to broadcast shutdown.
    quit: Option<Sender<()>>,
}

struct Shared<J: Job> {
    registry: Mutex<Registry<J>>,
    // Mirrors `quit` for the cancellation watcher, which waits on futures.
    closing: CancellationToken,
    // Disconnects once the manager has joined every worker.
    done: Receiver<()>,
    workers: usize,
    callbacks: AtomicUsize,
    counters: Arc<Counters>,
}

impl<J: Job> Shared<J> {
    fn close(&self) {
        let mut registry = self.registry.lock();
        if registry.closed {
            return;
        }
        registry.closed = true;

        tracing::info!("Closing factory ({} workers)", self.workers);
        self.closing.cancel();
        registry.quit.take();

        // The manager never sends; this returns once it drops its end.
        let _ = self.done.recv();
        tracing::info!("Factory closed");
    }
}

/// A fixed-size pool of worker threads processing [`Job`]s.
///
/// Jobs enter through [`dispatch`](Factory::dispatch), travel through the
/// management thread into a queue bounded by the worker count, and are picked
/// up by whichever worker is free. Callbacks added with
/// [`register`](Factory::register) run on every job before it is processed.
///
/// The factory shuts down on [`close`](Factory::close), when the cancellation
/// token passed at construction fires, or when it is dropped. Every job that
/// was handed over before shutdown reports either its own outcome or
/// [`ClosedFactoryError`](crate::ClosedFactoryError), exactly once.
pub struct Factory<J: Job> {
    shared: Arc<Shared<J>>,
    intake: Sender<Envelope<J>>,
    quit: Receiver<()>,
    dispatch_name: String,
}

impl<J: Job> Factory<J> {
    /// Starts `workers` worker threads. The factory closes itself when
    /// `token` is cancelled.
    pub fn new(token: CancellationToken, workers: usize) -> Result<Self, FactoryError> {
        Self::with_config(token, Config::default().with_workers(workers))
    }

    pub fn with_config(token: CancellationToken, config: Config) -> Result<Self, FactoryError> {
        if config.workers == 0 {
            return Err(FactoryError::NoWorkers);
        }
        // `thread::Builder::spawn` panics on these instead of failing.
        if config.thread_name.contains('\0') {
            return Err(FactoryError::InvalidThreadName(config.thread_name));
        }

        let (queue_tx, queue_rx) = channel::bounded(config.workers);
        let (intake_tx, intake_rx) = channel::bounded(0);
        let (quit_tx, quit_rx) = channel::bounded(0);
        let (done_tx, done_rx) = channel::bounded(0);
        let counters = Arc::new(Counters::default());
        let state = State::new(queue_rx.clone());

        // Workers spawned before a failure exit once their handles drop.
        let mut handles = Vec::with_capacity(config.workers);
        let mut updaters = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let (handle, updater) = worker::spawn(
                id,
                format!("{}-worker-{id}", config.thread_name),
                Arc::clone(&state),
                Arc::clone(&counters),
            )?;
            handles.push(handle);
            updaters.push(updater);
        }

        let manager = Manager {
            intake: intake_rx,
            queue: queue_tx,
            leftovers: queue_rx,
            quit: quit_rx.clone(),
            workers: handles,
            counters: Arc::clone(&counters),
            _done: done_tx,
        };
        thread::Builder::new()
            .name(format!("{}-manager", config.thread_name))
            .spawn(move || manager.run())?;

        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry {
                closed: false,
                state,
                updaters,
                quit: Some(quit_tx),
            }),
            closing: CancellationToken::new(),
            done: done_rx,
            workers: config.workers,
            callbacks: AtomicUsize::new(0),
            counters,
        });

        let watched = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("{}-watcher", config.thread_name))
            .spawn(move || watch(token, watched))?;

        tracing::info!("Factory started with {} workers", config.workers);

        Ok(Self {
            shared,
            intake: intake_tx,
            quit: quit_rx,
            dispatch_name: format!("{}-dispatch", config.thread_name),
        })
    }

    /// Appends `callback` to the callbacks run on every job, in registration
    /// order, before [`Job::process`].
    ///
    /// Returns once every worker has installed the new callback list, so any
    /// job dispatched afterwards sees it. Jobs a worker already holds may run
    /// without it. Registering after [`close`](Factory::close) has no effect.
    ///
    /// Like `close`, must not be called from inside a job or a callback: the
    /// handshake waits for every worker to go idle, including the caller.
    pub fn register<F>(&self, callback: F)
    where
        F: Fn(&mut J) + Send + Sync + 'static,
    {
        let mut registry = self.shared.registry.lock();
        let next = registry.state.with_callback(Arc::new(callback));
        registry.state = Arc::clone(&next);
        self.shared.callbacks.store(next.callbacks.len(), Ordering::Relaxed);

        if registry.closed {
            tracing::debug!("Factory closed, callback will never run");
            return;
        }

        // One worker at a time; each returns to its loop before the next.
        for updater in &registry.updaters {
            updater.update(Arc::clone(&next));
        }
        tracing::debug!("Installed callback #{} on all workers", next.callbacks.len());
    }

    /// Hands `job` to the first available worker.
    ///
    /// Never blocks. When the management thread is ready the hand-off happens
    /// right here; otherwise it moves to a short-lived helper thread, and
    /// backpressure from a saturated queue only delays the returned handle.
    /// The handle resolves to the job's own outcome, or to
    /// [`JobError::Closed`](crate::JobError::Closed) if the factory shut down
    /// before the job was handled or no helper thread could be started.
    pub fn dispatch(&self, job: J) -> JobHandle<J::Error> {
        let (envelope, handle) = Envelope::new(job);
        let counters = &self.shared.counters;
        counters.record_dispatched();

        if self.is_closed() {
            envelope.reject(counters);
            return handle;
        }

        let Some(envelope) = try_hand_off(envelope, &self.intake, &self.quit, counters) else {
            return handle;
        };

        // Shared with the helper so a failed spawn does not take the job with it.
        let slot = Arc::new(Mutex::new(Some(envelope)));
        let helper_slot = Arc::clone(&slot);
        let intake = self.intake.clone();
        let quit = self.quit.clone();
        let helper_counters = Arc::clone(counters);
        let spawned = thread::Builder::new()
            .name(self.dispatch_name.clone())
            .spawn(move || {
                if let Some(envelope) = helper_slot.lock().take() {
                    hand_off(envelope, &intake, &quit, &helper_counters);
                }
            });

        if let Err(e) = spawned {
            tracing::warn!("Failed to spawn dispatch helper, rejecting job: {e}");
            reclaim(&slot, counters);
        }
        handle
    }

    /// Stops every worker and blocks until all of them have exited.
    ///
    /// Idempotent and safe to call concurrently; every caller returns only
    /// after shutdown has completed. Must not be called from inside a job or
    /// a callback, since the calling worker would wait on itself.
    pub fn close(&self) {
        self.shared.close();
    }

    /// `true` once shutdown has begun.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closing.is_cancelled()
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.shared.workers
    }

    pub fn metrics(&self) -> FactoryMetrics {
        self.shared.counters.snapshot(
            self.shared.workers,
            self.shared.callbacks.load(Ordering::Relaxed),
        )
    }
}

impl<J: Job> Drop for Factory<J> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Hand-off attempted on the caller's thread. Gives the envelope back when
/// neither intake nor shutdown is ready.
fn try_hand_off<J: Job>(
    envelope: Envelope<J>,
    intake: &Sender<Envelope<J>>,
    quit: &Receiver<()>,
    counters: &Counters,
) -> Option<Envelope<J>> {
    let mut sel = Select::new();
    let send = sel.send(intake);
    let closed = sel.recv(quit);
    match sel.try_select() {
        Ok(oper) => {
            settle(oper, (send, closed), envelope, intake, quit, counters);
            None
        }
        Err(_) => Some(envelope),
    }
}

/// Runs on the per-dispatch helper thread: whichever of intake or shutdown
/// is ready first wins.
fn hand_off<J: Job>(
    envelope: Envelope<J>,
    intake: &Sender<Envelope<J>>,
    quit: &Receiver<()>,
    counters: &Counters,
) {
    let mut sel = Select::new();
    let send = sel.send(intake);
    let closed = sel.recv(quit);
    let oper = sel.select();
    settle(oper, (send, closed), envelope, intake, quit, counters);
}

fn settle<J: Job>(
    oper: SelectedOperation<'_>,
    (send, closed): (usize, usize),
    envelope: Envelope<J>,
    intake: &Sender<Envelope<J>>,
    quit: &Receiver<()>,
    counters: &Counters,
) {
    match oper.index() {
        i if i == send => {
            // Disconnected intake means the manager already exited.
            if let Err(SendError(envelope)) = oper.send(intake, envelope) {
                envelope.reject(counters);
            }
        }
        i if i == closed => {
            let _ = oper.recv(quit);
            envelope.reject(counters);
        }
        _ => unreachable!(),
    }
}

/// Rejects an envelope whose helper thread never started.
fn reclaim<J: Job>(slot: &Mutex<Option<Envelope<J>>>, counters: &Counters) {
    if let Some(envelope) = slot.lock().take() {
        envelope.reject(counters);
    }
}

/// Closes the factory if `token` fires before an explicit close.
fn watch<J: Job>(token: CancellationToken, shared: Arc<Shared<J>>) {
    let external = pin!(token.cancelled());
    let internal = pin!(shared.closing.cancelled());
    if let Either::Left(_) = block_on(first_of(external, internal)) {
        tracing::info!("Cancellation token fired");
        shared.close();
    }
}

struct Manager<J: Job> {
    intake: Receiver<Envelope<J>>,
    queue: Sender<Envelope<J>>,
    // Same queue, read once after the workers are gone.
    leftovers: Receiver<Envelope<J>>,
    quit: Receiver<()>,
    workers: Vec<WorkerHandle>,
    counters: Arc<Counters>,
    // Dropped on exit to release `close`.
    _done: Sender<()>,
}

impl<J: Job> Manager<J> {
    fn run(mut self) {
        loop {
            select! {
                recv(self.intake) -> msg => match msg {
                    Ok(envelope) => self.forward(envelope),
                    Err(_) => break,
                },
                recv(self.quit) -> _ => break,
            }
        }
        self.shutdown();
    }

    /// Blocks while the queue is full, which is what throttles intake.
    fn forward(&self, envelope: Envelope<J>) {
        let mut sel = Select::new();
        let send = sel.send(&self.queue);
        let closed = sel.recv(&self.quit);
        let oper = sel.select();
        match oper.index() {
            i if i == send => {
                if let Err(SendError(envelope)) = oper.send(&self.queue, envelope) {
                    envelope.reject(&self.counters);
                }
            }
            i if i == closed => {
                let _ = oper.recv(&self.quit);
                envelope.reject(&self.counters);
            }
            _ => unreachable!(),
        }
    }

    fn shutdown(&mut self) {
        tracing::debug!("Stopping {} workers", self.workers.len());
        for worker in self.workers.iter_mut().filter(|w| !w.is_stopped()) {
            worker.stop();
        }
        for worker in &mut self.workers {
            worker.join();
            tracing::trace!("Worker {} exit acknowledged", worker.id());
        }

        let mut rejected = 0;
        while let Ok(envelope) = self.leftovers.try_recv() {
            envelope.reject(&self.counters);
            rejected += 1;
        }
        if rejected > 0 {
            tracing::debug!("Rejected {rejected} queued jobs left after workers stopped");
        }
        tracing::debug!("All workers stopped");
    }
}
