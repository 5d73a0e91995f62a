use std::io;

use anyhow::Context;

use enforcement_infra::config;
use enforcement_worker::app::Worker;

fn main() -> anyhow::Result<()> {
    enforcement_observability::init();

    let settings = config::load_settings().context("loading notification settings")?;
    let worker_config = config::load_worker_config().context("loading worker config")?;
    tracing::info!(?settings, ?worker_config, "starting notification worker");

    let worker = Worker::start(settings, &worker_config)?;

    let scheduled = worker.process(io::stdin().lock(), io::stdout())?;
    tracing::info!(scheduled, "input closed; waiting for outstanding tasks");

    worker.wait_idle()?;
    let stats = worker.shutdown();
    tracing::info!(
        processed = stats.tasks_processed,
        dead_lettered = stats.tasks_dead_lettered,
        "notification worker stopped"
    );
    Ok(())
}
