#[cfg(test)]
mod tests {
    use job_factory::{
        CancellationToken,
        Config,
        Factory,
        Job,
        JobHandle,
    };
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        thread,
        time::{Duration, Instant},
    };

    fn measure<T>(name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        println!("✓ {}: {:?}", name, start.elapsed());
        result
    }

    /// Counts how many times it was processed and which callbacks touched it.
    struct Tally {
        applied: Vec<usize>,
        spin: Duration,
        processed: Arc<AtomicUsize>,
    }

    impl Tally {
        fn new(processed: &Arc<AtomicUsize>) -> Self {
            Self {
                applied: Vec::new(),
                spin: Duration::ZERO,
                processed: processed.clone(),
            }
        }
    }

    impl Job for Tally {
        type Error = Vec<usize>;

        fn process(&mut self) -> Result<(), Vec<usize>> {
            if !self.spin.is_zero() {
                thread::sleep(self.spin);
            }
            self.processed.fetch_add(1, Ordering::Relaxed);
            // Callbacks must have run as a prefix of registration order.
            let prefix = self.applied.iter().enumerate().all(|(i, &id)| i == id);
            if prefix {
                Ok(())
            } else {
                Err(std::mem::take(&mut self.applied))
            }
        }
    }

    fn wait_all<E: std::fmt::Debug>(handles: Vec<JobHandle<E>>) -> (usize, usize) {
        let mut ok = 0;
        let mut closed = 0;
        for handle in handles {
            match handle.wait() {
                Ok(()) => ok += 1,
                Err(e) if e.is_closed() => closed += 1,
                Err(e) => panic!("unexpected outcome: {e:?}"),
            }
        }
        (ok, closed)
    }

    #[test]
    fn load_test_1_many_fast_jobs() {
        println!("\n=== LOAD TEST 1: 2k fast jobs on 8 workers ===");
        let factory = Factory::with_config(
            CancellationToken::new(),
            Config::io_bound().with_workers(8),
        )
        .unwrap();
        let processed = Arc::new(AtomicUsize::new(0));

        let (ok, closed) = measure("2k jobs", || {
            let handles: Vec<_> = (0..2_000)
                .map(|_| factory.dispatch(Tally::new(&processed)))
                .collect();
            wait_all(handles)
        });

        assert_eq!(ok, 2_000);
        assert_eq!(closed, 0);
        assert_eq!(processed.load(Ordering::Relaxed), 2_000);
        let metrics = factory.metrics();
        assert_eq!(metrics.succeeded, 2_000);
        assert_eq!(metrics.in_flight(), 0);
        println!("  success rate: {:.1}%", metrics.success_rate() * 100.0);
    }

    #[test]
    fn load_test_2_register_while_dispatching() {
        println!("\n=== LOAD TEST 2: callbacks swapped under load ===");
        const CALLBACKS: usize = 20;
        let factory = Arc::new(Factory::new(CancellationToken::new(), 4).unwrap());
        let processed = Arc::new(AtomicUsize::new(0));

        let dispatcher = {
            let factory = factory.clone();
            let processed = processed.clone();
            thread::spawn(move || {
                let handles: Vec<_> = (0..1_000)
                    .map(|_| factory.dispatch(Tally::new(&processed)))
                    .collect();
                wait_all(handles)
            })
        };

        for id in 0..CALLBACKS {
            factory.register(move |job: &mut Tally| job.applied.push(id));

            // Anything dispatched after register returns sees every callback
            // registered so far.
            let seen = Arc::new(AtomicUsize::new(0));
            let probe = seen.clone();
            factory.register(move |job: &mut Tally| probe.store(job.applied.len(), Ordering::SeqCst));
            assert!(factory.dispatch(Tally::new(&processed)).wait().is_ok());
            assert!(seen.load(Ordering::SeqCst) >= id + 1);
        }

        let (ok, closed) = dispatcher.join().unwrap();
        assert_eq!(ok + closed, 1_000);
        assert_eq!(closed, 0);
        assert_eq!(factory.metrics().callbacks, CALLBACKS * 2);
    }

    #[test]
    fn load_test_3_close_under_load() {
        println!("\n=== LOAD TEST 3: close while 4 threads dispatch ===");
        let factory = Arc::new(Factory::new(CancellationToken::new(), 4).unwrap());
        let processed = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(5));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let factory = factory.clone();
                let processed = processed.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let handles: Vec<_> = (0..250)
                        .map(|_| {
                            let mut job = Tally::new(&processed);
                            job.spin = Duration::from_micros(200);
                            factory.dispatch(job)
                        })
                        .collect();
                    wait_all(handles)
                })
            })
            .collect();

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        measure("close under load", || factory.close());

        let (mut ok, mut closed) = (0, 0);
        for producer in producers {
            let (o, c) = producer.join().unwrap();
            ok += o;
            closed += c;
        }

        println!("  processed {ok}, rejected {closed}");
        assert_eq!(ok + closed, 1_000);
        assert_eq!(processed.load(Ordering::Relaxed), ok);
        let metrics = factory.metrics();
        assert_eq!(metrics.dispatched, 1_000);
        assert_eq!(metrics.succeeded + metrics.rejected, 1_000);
    }

    #[test]
    fn load_test_4_token_cancel_under_load() {
        println!("\n=== LOAD TEST 4: external cancellation under load ===");
        let token = CancellationToken::new();
        let factory = Factory::new(token.clone(), 2).unwrap();
        let processed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let mut job = Tally::new(&processed);
                job.spin = Duration::from_micros(500);
                factory.dispatch(job)
            })
            .collect();
        thread::sleep(Duration::from_millis(5));
        token.cancel();

        let (ok, closed) = wait_all(handles);
        assert_eq!(ok + closed, 200);
        assert_eq!(processed.load(Ordering::Relaxed), ok);
        assert!(factory.is_closed());
    }
}
