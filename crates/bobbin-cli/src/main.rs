use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bobbin_core::{
    BobbinConfig, ConfigError, Handler, HandlerError, JobRecord, MemoryStore, Resetter,
    ResetterMetrics, Store, WorkerGroup,
};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const NUM_WORKERS: usize = 2;
const NUM_JOBS: usize = 20;

#[derive(Debug, Deserialize)]
struct GreetPayload {
    name: String,
}

/// Sleeps a little, then greets. Fails now and then so failed records show up.
struct GreetHandler {
    failure_rate: f64,
}

#[async_trait]
impl Handler<JobRecord<serde_json::Value>> for GreetHandler {
    async fn handle(&self, record: JobRecord<serde_json::Value>) -> Result<(), HandlerError> {
        let payload: GreetPayload = serde_json::from_value(record.payload)
            .map_err(|e| HandlerError::new(format!("json decode: {e}")))?;

        let (delay_ms, fail) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(20..200), rng.gen_bool(self.failure_rate))
        };
        sleep(Duration::from_millis(delay_ms)).await;

        if fail {
            return Err(HandlerError::new(format!(
                "intentional failure for {}",
                payload.name
            )));
        }
        info!(record_id = %record.id, "hello, {}!", payload.name);
        Ok(())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config_path: Option<PathBuf>) -> Result<(), ConfigError> {
    let cfg = BobbinConfig::load(config_path.as_deref())?;

    let reset_metrics = Arc::new(ResetterMetrics::default());
    let store = Arc::new(
        MemoryStore::<serde_json::Value>::new(cfg.store_options())
            .with_metrics(Arc::clone(&reset_metrics)),
    );
    for n in 0..NUM_JOBS {
        let payload = serde_json::json!({ "name": format!("bobbin-{n}") });
        if let Err(err) = store.insert(payload).await {
            warn!(error = %err, "failed to enqueue demo job");
        }
    }
    info!(jobs = NUM_JOBS, workers = NUM_WORKERS, "enqueued demo jobs");

    let (resetter_tx, resetter_rx) = watch::channel(false);
    let resetter = Resetter::new(Arc::clone(&store), cfg.resetter_options())
        .with_metrics(Arc::clone(&reset_metrics))
        .spawn(resetter_rx);
    let workers = WorkerGroup::spawn(
        NUM_WORKERS,
        Arc::clone(&store),
        Arc::new(GreetHandler { failure_rate: 0.2 }),
        cfg.worker_options(),
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            _ = sleep(Duration::from_millis(100)) => {
                match store.counts_by_state().await {
                    Ok(counts) if counts.pending() == 0 => break,
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "failed to read queue counts"),
                }
            }
        }
    }

    let worker_metrics = Arc::clone(workers.metrics());
    workers.shutdown_and_join().await;
    let _ = resetter_tx.send(true);
    if let Err(err) = resetter.await {
        warn!(error = %err, "resetter task ended abnormally");
    }

    match store.counts_by_state().await {
        Ok(counts) => println!(
            "{}",
            serde_json::json!({
                "counts": counts,
                "workers": worker_metrics.snapshot(),
                "resets": reset_metrics.snapshot(),
            })
        ),
        Err(err) => warn!(error = %err, "failed to read final counts"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    if let Err(err) = run(config_path).await {
        error!(error = %err, "bobbin failed");
        std::process::exit(1);
    }
}
