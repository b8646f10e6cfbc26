use job_factory::{CancellationToken, Factory, Job};
use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Instant,
};
use tracing_subscriber::EnvFilter;


struct Sum {
    value: i64,
    total: Arc<AtomicI64>,
}

impl Job for Sum {
    type Error = String;

    fn process(&mut self) -> Result<(), String> {
        if self.value < 0 {
            return Err(format!("negative value {}", self.value));
        }
        self.total.fetch_add(self.value, Ordering::Relaxed);
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let now = Instant::now();
    let token = CancellationToken::new();
    let factory = Factory::new(token.clone(), num_cpus::get())?;
    factory.register(|job: &mut Sum| job.value += 5);

    let total = Arc::new(AtomicI64::new(0));
    let handles: Vec<_> = (0..1_000)
        .map(|i| factory.dispatch(Sum { value: i, total: total.clone() }))
        .collect();

    let failed = handles
        .into_iter()
        .map(|h| h.wait())
        .filter(Result::is_err)
        .count();

    token.cancel();
    factory.close();

    println!("total: {}", total.load(Ordering::Relaxed));
    println!("failed: {failed}");
    println!("metrics: {:?}", factory.metrics());
    println!("elapsed: {:?}", now.elapsed());
    Ok(())
}
