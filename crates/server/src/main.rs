use anyhow::Context;

use folio_infra::config::FolioConfig;
use folio_server::app::{self, Services};

fn main() -> anyhow::Result<()> {
    let config = FolioConfig::from_env().context("invalid configuration; refusing to start")?;
    folio_observability::init_with(&app::tracing_settings(&config.logging));

    // Store calls block on this runtime from the dispatcher's worker threads.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("folio-io")
        .build()
        .context("failed to build tokio runtime")?;

    let services = Services::build(&config, runtime.handle()).context("startup failed")?;
    let scheduler = services.start().context("failed to start the job scheduler")?;
    tracing::info!(instance = %services.instance, "folio server running");

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown requested");
    scheduler.stop();
    Ok(())
}
